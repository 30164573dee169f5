//! Framing classifier: face box + sweet spot → verdict.
//!
//! Evaluation order is fixed: centering and size first, then correction
//! tokens in horizontal, vertical, size order. All defects are reported in a
//! single message.

use crate::geometry::SweetSpot;
use crate::types::{BoundingBox, FramingVerdict};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Size ratio (face area / sweet-spot area) must be strictly above this.
pub const MIN_SIZE_RATIO: f32 = 0.4;
/// Size ratio must be strictly below this.
pub const MAX_SIZE_RATIO: f32 = 1.2;
/// Center displacement, as a fraction of sweet-spot extent, tolerated per axis.
pub const DISPLACEMENT_TOLERANCE: f32 = 0.1;

const MOVE_LEFT: &str = "Move Left";
const MOVE_RIGHT: &str = "Move Right";
const MOVE_UP: &str = "Move Up";
const MOVE_DOWN: &str = "Move Down";
const MOVE_CLOSER: &str = "Move Closer";
const MOVE_FURTHER: &str = "Move Further";

/// How the host displays the camera feed.
///
/// With `Mirrored` (a self-view), a face right of center in source pixels
/// yields "Move Left". `Raw` swaps the horizontal directives. Vertical
/// directives do not depend on orientation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayOrientation {
    #[default]
    Mirrored,
    Raw,
}

impl FromStr for DisplayOrientation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mirrored" | "mirror" => Ok(Self::Mirrored),
            "raw" | "unmirrored" => Ok(Self::Raw),
            other => Err(format!("unknown display orientation: {other} (expected mirrored or raw)")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Classifier {
    orientation: DisplayOrientation,
}

impl Classifier {
    pub fn new(orientation: DisplayOrientation) -> Self {
        Self { orientation }
    }

    pub fn orientation(&self) -> DisplayOrientation {
        self.orientation
    }

    /// Classify a single face against the sweet spot.
    pub fn classify(&self, face: &BoundingBox, spot: &SweetSpot) -> FramingVerdict {
        let (fcx, fcy) = face.center();
        let (scx, scy) = spot.center();

        let centered = spot.spans_x(fcx) && spot.spans_y(fcy);
        let ratio = face.area() / spot.area();
        let good_size = ratio > MIN_SIZE_RATIO && ratio < MAX_SIZE_RATIO;

        if centered && good_size {
            return FramingVerdict::perfect();
        }

        let dx = (fcx - scx) / spot.width;
        let dy = (fcy - scy) / spot.height;

        let mut tokens = Vec::with_capacity(3);
        if dx.abs() > DISPLACEMENT_TOLERANCE {
            tokens.push(self.horizontal(dx));
        }
        if dy.abs() > DISPLACEMENT_TOLERANCE {
            tokens.push(if dy > 0.0 { MOVE_UP } else { MOVE_DOWN });
        }
        if !good_size {
            if ratio <= MIN_SIZE_RATIO {
                tokens.push(MOVE_CLOSER);
            } else if ratio >= MAX_SIZE_RATIO {
                tokens.push(MOVE_FURTHER);
            }
        }

        if tokens.is_empty() {
            FramingVerdict::almost()
        } else {
            FramingVerdict::correction(&tokens)
        }
    }

    /// Classify a frame's detections. Uses the most confident face; an empty
    /// slice is the "No Face Detected" verdict.
    pub fn classify_faces(&self, faces: &[BoundingBox], spot: &SweetSpot) -> FramingVerdict {
        match primary_face(faces) {
            Some(face) => self.classify(face, spot),
            None => FramingVerdict::no_face(),
        }
    }

    fn horizontal(&self, dx: f32) -> &'static str {
        let face_right_of_center = dx > 0.0;
        match (self.orientation, face_right_of_center) {
            (DisplayOrientation::Mirrored, true) | (DisplayOrientation::Raw, false) => MOVE_LEFT,
            (DisplayOrientation::Mirrored, false) | (DisplayOrientation::Raw, true) => MOVE_RIGHT,
        }
    }
}

/// Classify with the default (mirrored self-view) orientation.
pub fn classify(face: &BoundingBox, spot: &SweetSpot) -> FramingVerdict {
    Classifier::default().classify(face, spot)
}

/// The face guidance is computed for: highest confidence, first on ties.
pub fn primary_face(faces: &[BoundingBox]) -> Option<&BoundingBox> {
    faces.iter().reduce(|best, f| if f.confidence > best.confidence { f } else { best })
}
