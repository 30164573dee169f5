//! Sweet-spot geometry: the region a well-framed face should occupy.

use serde::{Deserialize, Serialize};

/// Sweet-spot width as a fraction of frame width.
pub const SWEET_SPOT_WIDTH_FRACTION: f32 = 0.35;
/// Sweet-spot height as a fraction of frame height.
pub const SWEET_SPOT_HEIGHT_FRACTION: f32 = 0.50;

/// Ideal face region, centered in the frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweetSpot {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl SweetSpot {
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    /// Strict containment on the horizontal axis.
    pub fn spans_x(&self, x: f32) -> bool {
        x > self.x && x < self.right()
    }

    /// Strict containment on the vertical axis.
    pub fn spans_y(&self, y: f32) -> bool {
        y > self.y && y < self.bottom()
    }
}

/// Compute the sweet spot for a `frame_width` × `frame_height` frame.
///
/// A zero dimension yields a zero-extent region at the origin of that axis.
pub fn compute_sweet_spot(frame_width: u32, frame_height: u32) -> SweetSpot {
    let w = frame_width as f32;
    let h = frame_height as f32;
    let width = w * SWEET_SPOT_WIDTH_FRACTION;
    let height = h * SWEET_SPOT_HEIGHT_FRACTION;

    SweetSpot {
        x: (w - width) / 2.0,
        y: (h - height) / 2.0,
        width,
        height,
    }
}
