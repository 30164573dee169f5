use anyhow::Context;
use podium_core::{DisplayOrientation, RetryPolicy, SchedulerConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration: defaults, then an optional TOML file named by
/// `PODIUM_CONFIG`, then `PODIUM_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Requested capture size; the driver may pick another.
    pub capture_width: u32,
    pub capture_height: u32,
    /// Directory containing the SCRFD ONNX model.
    pub model_dir: PathBuf,
    /// Guidance ticks per second.
    pub refresh_hz: u32,
    /// How the host displays the feed; decides Move Left/Right.
    pub orientation: DisplayOrientation,
    /// Whether guidance starts enabled.
    pub guidance_enabled: bool,
    /// Polls for the model/runtime before giving up on guidance.
    pub library_polls: u32,
    pub library_poll_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            capture_width: 1280,
            capture_height: 720,
            model_dir: podium_core::default_model_dir(),
            refresh_hz: podium_core::scheduler::DEFAULT_REFRESH_HZ,
            orientation: DisplayOrientation::Mirrored,
            guidance_enabled: true,
            library_polls: podium_core::negotiator::LIBRARY_POLL_ATTEMPTS,
            library_poll_ms: podium_core::negotiator::LIBRARY_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let base = match std::env::var("PODIUM_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        Ok(base.with_env_overrides())
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("PODIUM_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Ok(v) = std::env::var("PODIUM_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PODIUM_ORIENTATION") {
            match v.parse() {
                Ok(o) => self.orientation = o,
                Err(e) => tracing::warn!(error = %e, "ignoring PODIUM_ORIENTATION"),
            }
        }
        if let Ok(v) = std::env::var("PODIUM_GUIDANCE_ENABLED") {
            self.guidance_enabled = parse_flag(&v);
        }
        self.capture_width = env_parse("PODIUM_CAPTURE_WIDTH", self.capture_width);
        self.capture_height = env_parse("PODIUM_CAPTURE_HEIGHT", self.capture_height);
        self.refresh_hz = env_parse("PODIUM_REFRESH_HZ", self.refresh_hz);
        self.library_polls = env_parse("PODIUM_LIBRARY_POLLS", self.library_polls);
        self.library_poll_ms = env_parse("PODIUM_LIBRARY_POLL_MS", self.library_poll_ms);
        self
    }

    /// Path to the SCRFD detection model.
    pub fn model_path(&self) -> PathBuf {
        self.model_dir.join(podium_core::detector::SCRFD_MODEL_FILE)
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            refresh_hz: self.refresh_hz.max(1),
            orientation: self.orientation,
            enabled: self.guidance_enabled,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.library_polls.max(1),
            interval: Duration::from_millis(self.library_poll_ms),
        }
    }
}

fn parse_flag(v: &str) -> bool {
    !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off")
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
