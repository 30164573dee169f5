use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use podium_core::{
    DisplayOrientation, GuidanceSnapshot, LoopState, ModelFileProbe, Negotiator, OnnxBackendFactory,
    SchedulerConfig,
};
use podium_hw::{Camera, CameraFeed};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[zbus::proxy(
    interface = "org.podium.Guidance1",
    default_service = "org.podium.Guidance1",
    default_path = "/org/podium/Guidance1"
)]
trait Guidance {
    async fn set_enabled(&self, enabled: bool) -> zbus::Result<()>;
    async fn verdict(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn save_overlay(&self, path: &str) -> zbus::Result<bool>;
}

#[derive(Parser)]
#[command(name = "podium", about = "Podium framing guidance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Turn framing guidance on
    Enable,
    /// Turn framing guidance off
    Disable,
    /// Show daemon status
    Status,
    /// Print verdicts from the daemon as they change
    Watch {
        /// Poll interval in milliseconds
        #[arg(long, default_value_t = 250)]
        interval_ms: u64,
    },
    /// Ask the daemon to write its current overlay to a PNG
    Snapshot {
        /// Output file (absolute path recommended; the daemon writes it)
        path: PathBuf,
    },
    /// List V4L2 capture devices
    Devices,
    /// Run guidance directly against a camera, bypassing the daemon
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Directory containing det_10g.onnx
        #[arg(long)]
        model_dir: Option<PathBuf>,
        /// Number of analyzed frames to print
        #[arg(short, long, default_value_t = 30)]
        frames: u64,
        /// mirrored (self-view) or raw
        #[arg(long, default_value = "mirrored")]
        orientation: DisplayOrientation,
        /// Save the last overlay to this PNG
        #[arg(long)]
        overlay: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enable => {
            proxy().await?.set_enabled(true).await?;
            println!("Framing guidance enabled");
        }
        Commands::Disable => {
            proxy().await?.set_enabled(false).await?;
            println!("Framing guidance disabled");
        }
        Commands::Status => {
            let status = proxy().await?.status().await?;
            let value: serde_json::Value = serde_json::from_str(&status)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Watch { interval_ms } => watch(interval_ms).await?,
        Commands::Snapshot { path } => {
            let path = path.to_string_lossy().into_owned();
            if proxy().await?.save_overlay(&path).await? {
                println!("Overlay written to {path}");
            } else {
                println!("No overlay drawn yet");
            }
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
        Commands::Test {
            device,
            model_dir,
            frames,
            orientation,
            overlay,
        } => test(&device, model_dir, frames, orientation, overlay).await?,
    }

    Ok(())
}

async fn proxy() -> Result<GuidanceProxy<'static>> {
    let connection = zbus::Connection::session()
        .await
        .context("connecting to the session bus")?;
    tracing::debug!("connected to session bus");
    GuidanceProxy::new(&connection)
        .await
        .context("podiumd not reachable on the session bus")
}

async fn watch(interval_ms: u64) -> Result<()> {
    let proxy = proxy().await?;
    let mut last = String::new();
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(10)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = ticker.tick() => {
                let verdict = proxy.verdict().await?;
                if verdict != last {
                    let v: serde_json::Value = serde_json::from_str(&verdict)?;
                    println!("{}", describe_json(&v));
                    last = verdict;
                }
            }
        }
    }
}

fn describe_json(v: &serde_json::Value) -> String {
    let message = v["message"].as_str().unwrap_or_default();
    let severity = v["severity"].as_str().unwrap_or_default();
    let mut line = if message.is_empty() {
        "(guidance off)".to_string()
    } else {
        format!("[{severity}] {message}")
    };
    if let Some(secondary) = v["secondary"].as_str() {
        line.push_str(&format!(" | {secondary}"));
    }
    if let Some(notice) = v["notice"].as_str() {
        line.push_str(&format!(" ({notice})"));
    }
    line
}

fn describe(snap: &GuidanceSnapshot) -> String {
    let mut line = format!("[{}] {}", snap.verdict.severity.as_str(), snap.verdict.message);
    if let Some(face) = &snap.face {
        line.push_str(&format!(
            " face=({:.0},{:.0} {:.0}x{:.0} conf {:.2})",
            face.x, face.y, face.width, face.height, face.confidence
        ));
    }
    if let Some(secondary) = snap.caption.secondary {
        line.push_str(&format!(" | {secondary}"));
    }
    if let Some(notice) = &snap.notice {
        line.push_str(&format!(" ({notice})"));
    }
    line
}

async fn test(
    device: &str,
    model_dir: Option<PathBuf>,
    frames: u64,
    orientation: DisplayOrientation,
    overlay: Option<PathBuf>,
) -> Result<()> {
    println!("Running framing diagnostics on {device}...");
    let feed = CameraFeed::start(device, 1280, 720)?;
    println!("Camera: {}x{}", feed.width, feed.height);

    let model_path = model_dir
        .unwrap_or_else(podium_core::default_model_dir)
        .join(podium_core::detector::SCRFD_MODEL_FILE);
    tracing::debug!(model = %model_path.display(), ?orientation, "starting direct guidance loop");
    let negotiator = Negotiator::new(
        Arc::new(ModelFileProbe::new(&model_path)),
        Arc::new(OnnxBackendFactory::new(&model_path)),
    );
    let handle = podium_core::spawn(
        feed.source(),
        negotiator,
        SchedulerConfig {
            orientation,
            ..SchedulerConfig::default()
        },
    );

    let mut rx = handle.subscribe();
    let mut seen = 0u64;
    let mut last: Option<GuidanceSnapshot> = None;
    let outcome = loop {
        if rx.changed().await.is_err() {
            break Err(anyhow::anyhow!("guidance loop exited"));
        }
        let snap = rx.borrow_and_update().clone();
        match snap.loop_state {
            LoopState::BackendPending if snap.backend == podium_core::BackendState::Failed => {
                println!("{}", snap.verdict.message);
                break Err(anyhow::anyhow!("no inference backend (model: {})", model_path.display()));
            }
            LoopState::Running if snap.notice.as_deref() == Some(podium_core::scheduler::SOURCE_CLOSED_NOTICE) => {
                break Err(anyhow::anyhow!("camera feed ended after {seen} analyzed frames"));
            }
            LoopState::Running if snap.frames_analyzed > seen => {
                seen = snap.frames_analyzed;
                println!("{:>4} {}", seen, describe(&snap));
                last = Some(snap);
                if seen >= frames {
                    break Ok(());
                }
            }
            _ => {}
        }
    };

    handle.shutdown().await;
    feed.shutdown().await;

    if let Err(e) = outcome {
        bail!(e);
    }
    if let (Some(path), Some(snap)) = (overlay, last) {
        match snap.overlay {
            Some(img) => {
                img.save(&path)
                    .with_context(|| format!("writing overlay to {}", path.display()))?;
                println!("Overlay written to {}", path.display());
            }
            None => println!("No overlay drawn"),
        }
    }
    Ok(())
}
