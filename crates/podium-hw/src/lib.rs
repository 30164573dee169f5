//! podium-hw — Camera capture for the framing guidance loop.
//!
//! Opens a V4L2 capture device, converts buffers to 8-bit luma and publishes
//! the latest frame from a background thread.

pub mod camera;
pub mod feed;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use feed::{CameraFeed, FeedSource};
