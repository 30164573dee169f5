//! podium-core — Real-time framing guidance engine.
//!
//! Locates the presenter's face with SCRFD (ONNX Runtime, CUDA with CPU
//! fallback), classifies it against a centered sweet spot and drives the
//! per-frame detection loop that publishes verdicts and overlay pixels.

pub mod backend;
pub mod classifier;
pub mod detector;
pub mod geometry;
pub mod negotiator;
pub mod overlay;
pub mod scheduler;
pub mod types;

pub use backend::{BackendFactory, BackendState, BackendStatus, BackendTier, FaceEstimator, LibraryProbe};
pub use classifier::{classify, Classifier, DisplayOrientation};
pub use detector::{default_model_dir, DetectorError, ModelFileProbe, OnnxBackendFactory, ScrfdDetector};
pub use geometry::{compute_sweet_spot, SweetSpot};
pub use negotiator::{NegotiationError, Negotiator, ReadyBackend, RetryPolicy};
pub use overlay::{Caption, OverlayRenderer};
pub use scheduler::{
    spawn, DetectionLoop, DetectionLoopHandle, GuidanceControl, GuidanceProperty, GuidanceSnapshot,
    LoopState, PropertyWatch, SchedulerConfig, VideoSource,
};
pub use types::{BoundingBox, Frame, FramingVerdict, Severity};
