use crate::config::Config;
use podium_core::{DetectionLoopHandle, GuidanceControl, ModelFileProbe, Negotiator, OnnxBackendFactory};
use podium_hw::{CameraError, CameraFeed};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
}

/// Camera feed plus the guidance loop reading it.
pub struct Engine {
    feed: CameraFeed,
    guidance: DetectionLoopHandle,
}

impl Engine {
    /// Open the camera (fail fast), then start backend negotiation and the
    /// detection loop. A missing model does not fail startup: guidance
    /// reports itself unavailable instead.
    pub fn start(config: &Config) -> Result<Self, EngineError> {
        let feed = CameraFeed::start(&config.camera_device, config.capture_width, config.capture_height)?;
        tracing::info!(
            device = %config.camera_device,
            width = feed.width,
            height = feed.height,
            "camera feed started"
        );

        let model_path = config.model_path();
        let negotiator = Negotiator::new(
            Arc::new(ModelFileProbe::new(&model_path)),
            Arc::new(OnnxBackendFactory::new(&model_path)),
        )
        .with_policy(config.retry_policy());

        let scheduler = config.scheduler();
        tracing::info!(
            model = %model_path.display(),
            refresh_hz = scheduler.refresh_hz,
            orientation = ?scheduler.orientation,
            enabled = scheduler.enabled,
            "starting guidance loop"
        );
        let guidance = podium_core::spawn(feed.source(), negotiator, scheduler);

        Ok(Self { feed, guidance })
    }

    pub fn control(&self) -> GuidanceControl {
        self.guidance.control()
    }

    pub async fn shutdown(self) {
        self.guidance.shutdown().await;
        self.feed.shutdown().await;
        tracing::info!("engine stopped");
    }
}
