use podium_core::{GuidanceControl, GuidanceProperty};
use zbus::interface;

pub const BUS_NAME: &str = "org.podium.Guidance1";
pub const OBJECT_PATH: &str = "/org/podium/Guidance1";

/// D-Bus interface for the Podium framing guidance daemon.
///
/// Bus name: org.podium.Guidance1
/// Object path: /org/podium/Guidance1
pub struct GuidanceService {
    control: GuidanceControl,
}

impl GuidanceService {
    pub fn new(control: GuidanceControl) -> Self {
        Self { control }
    }
}

#[interface(name = "org.podium.Guidance1")]
impl GuidanceService {
    /// Turn framing guidance on or off.
    async fn set_enabled(&self, enabled: bool) -> zbus::fdo::Result<()> {
        tracing::info!(enabled, "set_enabled requested");
        self.control.set_enabled(enabled);
        Ok(())
    }

    /// Latest verdict and caption as JSON.
    async fn verdict(&self) -> zbus::fdo::Result<String> {
        let snap = self.control.snapshot();
        Ok(serde_json::json!({
            "message": snap.verdict.message,
            "severity": snap.verdict.severity,
            "show_guide": snap.verdict.show_guide,
            "compatibility_mode": snap.compatibility_mode,
            "secondary": snap.caption.secondary,
            "notice": snap.notice,
        })
        .to_string())
    }

    /// Full guidance snapshot (minus overlay pixels) as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let snap = self.control.snapshot();
        let mut value = serde_json::to_value(&snap).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        value["version"] = env!("CARGO_PKG_VERSION").into();
        value["enabled"] = self.control.is_enabled().into();
        Ok(value.to_string())
    }

    /// Write the current overlay to a PNG at `path`. Returns false when no
    /// overlay has been drawn yet.
    async fn save_overlay(&self, path: &str) -> zbus::fdo::Result<bool> {
        let Some(overlay) = self.control.snapshot().overlay else {
            return Ok(false);
        };
        let path = path.to_string();
        tokio::task::spawn_blocking(move || overlay.save(&path))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?
            .map_err(|e| zbus::fdo::Error::IOError(e.to_string()))?;
        Ok(true)
    }

    #[zbus(property)]
    async fn enabled(&self) -> bool {
        self.control.is_enabled()
    }

    #[zbus(property)]
    async fn backend(&self) -> String {
        serde_json::to_value(self.control.backend_state())
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    }
}

/// Emit PropertiesChanged for `Enabled` and `Backend` as they change. Runs
/// until the guidance controls are dropped.
pub async fn emit_property_changes(connection: zbus::Connection, control: GuidanceControl) -> zbus::Result<()> {
    let iface = connection
        .object_server()
        .interface::<_, GuidanceService>(OBJECT_PATH)
        .await?;
    let mut changes = control.property_changes();
    drop(control);

    while let Some(property) = changes.next().await {
        let service = iface.get().await;
        let emitter = iface.signal_emitter();
        match property {
            GuidanceProperty::Enabled => service.enabled_changed(emitter).await?,
            GuidanceProperty::Backend => service.backend_changed(emitter).await?,
        }
        tracing::debug!(?property, "property change emitted");
    }
    Ok(())
}
