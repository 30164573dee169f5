use serde::{Deserialize, Serialize};
use std::time::Instant;

pub const MSG_PERFECT: &str = "Perfect Framing!";
pub const MSG_ALMOST: &str = "Almost There!";
pub const MSG_NO_FACE: &str = "No Face Detected";
pub const MSG_LOADING: &str = "Loading AI Model...";
pub const MSG_UNAVAILABLE: &str =
    "AI guidance unavailable: face detection could not be initialized";

/// A decoded camera frame (8-bit luma, row-major, `width * height` bytes).
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Self {
        Self {
            data,
            width,
            height,
            timestamp: Instant::now(),
            sequence,
        }
    }

    /// A uniform gray frame, handy for diagnostics and tests.
    pub fn blank(width: u32, height: u32) -> Self {
        Self::new(vec![128; (width * height) as usize], width, height, 0)
    }
}

/// Bounding box for a detected face in source-frame pixels (top-left origin).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// A box with full confidence and no landmarks.
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence: 1.0,
            landmarks: None,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }
}

/// Coarse framing quality bucket, drives overlay color and caption urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Good,
    Warn,
    Bad,
    Neutral,
}

impl Severity {
    /// RGBA stroke color used by the overlay.
    pub fn color(self) -> [u8; 4] {
        match self {
            Severity::Good => [34, 197, 94, 255],
            Severity::Warn => [250, 204, 21, 255],
            Severity::Bad => [239, 68, 68, 255],
            Severity::Neutral => [156, 163, 175, 255],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Good => "good",
            Severity::Warn => "warn",
            Severity::Bad => "bad",
            Severity::Neutral => "neutral",
        }
    }
}

/// Result of analyzing one frame. Superseded by the next frame's verdict.
///
/// `message` is empty only for [`FramingVerdict::disabled`], and `show_guide`
/// is never set together with [`Severity::Good`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramingVerdict {
    pub message: String,
    pub severity: Severity,
    pub show_guide: bool,
}

impl FramingVerdict {
    fn new(message: impl Into<String>, severity: Severity, show_guide: bool) -> Self {
        Self {
            message: message.into(),
            severity,
            show_guide,
        }
    }

    pub fn perfect() -> Self {
        Self::new(MSG_PERFECT, Severity::Good, false)
    }

    pub fn almost() -> Self {
        Self::new(MSG_ALMOST, Severity::Warn, true)
    }

    /// Composite correction, e.g. "Move Left & Move Closer".
    pub fn correction(tokens: &[&str]) -> Self {
        Self::new(tokens.join(" & "), Severity::Bad, true)
    }

    pub fn no_face() -> Self {
        Self::new(MSG_NO_FACE, Severity::Neutral, true)
    }

    pub fn loading() -> Self {
        Self::new(MSG_LOADING, Severity::Neutral, false)
    }

    pub fn unavailable() -> Self {
        Self::new(MSG_UNAVAILABLE, Severity::Neutral, false)
    }

    /// Guidance switched off: empty message, nothing drawn.
    pub fn disabled() -> Self {
        Self::new("", Severity::Neutral, false)
    }

    pub fn is_disabled(&self) -> bool {
        self.message.is_empty()
    }
}
