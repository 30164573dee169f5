use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use dbus_interface::{GuidanceService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("podiumd starting");

    let config = config::Config::load()?;
    let engine = engine::Engine::start(&config)?;

    let connection = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, GuidanceService::new(engine.control()))?
        .build()
        .await?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "podiumd ready");

    let signals = dbus_interface::emit_property_changes(connection.clone(), engine.control());
    tokio::spawn(async move {
        if let Err(e) = signals.await {
            tracing::warn!(error = %e, "property change signals stopped");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("podiumd shutting down");
    engine.shutdown().await;

    Ok(())
}
