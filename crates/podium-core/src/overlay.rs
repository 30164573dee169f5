//! Overlay renderer: face box in the verdict color, dashed sweet-spot guide.
//!
//! The surface is transparent RGBA at source-frame resolution and is fully
//! cleared before every redraw.

use crate::backend::BackendState;
use crate::geometry::SweetSpot;
use crate::types::{BoundingBox, FramingVerdict};
use image::{Rgba, RgbaImage};
use serde::Serialize;
use std::sync::Arc;

const FACE_STROKE: u32 = 3;
const GUIDE_STROKE: u32 = 2;
const GUIDE_DASH: u32 = 12;
const GUIDE_GAP: u32 = 8;
pub(crate) const GUIDE_COLOR: Rgba<u8> = Rgba([255, 255, 255, 200]);
const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

pub const COMPATIBILITY_LABEL: &str = "Compatibility Mode";

/// Text the host shows next to the video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Caption {
    pub message: String,
    /// Set while running on the fallback tier.
    pub secondary: Option<&'static str>,
}

impl Caption {
    pub fn new(verdict: &FramingVerdict, backend: BackendState) -> Self {
        Self {
            message: verdict.message.clone(),
            secondary: backend.is_compatibility_mode().then_some(COMPATIBILITY_LABEL),
        }
    }
}

pub struct OverlayRenderer {
    surface: RgbaImage,
}

impl OverlayRenderer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            surface: RgbaImage::from_pixel(width, height, TRANSPARENT),
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.surface.dimensions()
    }

    /// Match the surface to a new source resolution. Clears on change.
    pub fn resize(&mut self, width: u32, height: u32) {
        if self.surface.dimensions() != (width, height) {
            self.surface = RgbaImage::from_pixel(width, height, TRANSPARENT);
        }
    }

    pub fn clear(&mut self) {
        for p in self.surface.pixels_mut() {
            *p = TRANSPARENT;
        }
    }

    /// Redraw from scratch for the latest verdict.
    pub fn render(&mut self, verdict: &FramingVerdict, face: Option<&BoundingBox>, spot: &SweetSpot) {
        self.clear();
        if verdict.show_guide {
            stroke_rect(
                &mut self.surface,
                (spot.x, spot.y, spot.right(), spot.bottom()),
                GUIDE_COLOR,
                GUIDE_STROKE,
                Some((GUIDE_DASH, GUIDE_GAP)),
            );
        }
        if let Some(f) = face {
            stroke_rect(
                &mut self.surface,
                (f.x, f.y, f.x + f.width, f.y + f.height),
                Rgba(verdict.severity.color()),
                FACE_STROKE,
                None,
            );
        }
    }

    pub fn surface(&self) -> &RgbaImage {
        &self.surface
    }

    /// Copy of the current surface for publishing to the host.
    pub fn snapshot(&self) -> Arc<RgbaImage> {
        Arc::new(self.surface.clone())
    }
}

/// Stroke a rectangle given as (x0, y0, x1, y1). Each edge is clipped on
/// its own, so edges lying outside the image are never drawn.
/// `dash` is (on, off) run lengths measured from the unclipped corner.
fn stroke_rect(
    img: &mut RgbaImage,
    rect: (f32, f32, f32, f32),
    color: Rgba<u8>,
    thickness: u32,
    dash: Option<(u32, u32)>,
) {
    let (w, h) = (i64::from(img.width()), i64::from(img.height()));
    let (x0, y0, x1, y1) = rect;
    if !(x0.is_finite() && y0.is_finite() && x1.is_finite() && y1.is_finite()) {
        return;
    }
    // inclusive pixel bounds
    let (x0, x1) = (x0.round() as i64, (x1 - 1.0).round() as i64);
    let (y0, y1) = (y0.round() as i64, (y1 - 1.0).round() as i64);
    if x0 > x1 || y0 > y1 {
        return;
    }

    let on = |i: i64| match dash {
        Some((len, gap)) => i.rem_euclid(i64::from(len + gap)) < i64::from(len),
        None => true,
    };
    let mut put = |x: i64, y: i64| {
        if (0..w).contains(&x) && (0..h).contains(&y) {
            img.put_pixel(x as u32, y as u32, color);
        }
    };

    let (cx0, cx1) = (x0.max(0), x1.min(w - 1));
    let (cy0, cy1) = (y0.max(0), y1.min(h - 1));
    for t in 0..i64::from(thickness) {
        let (top, bottom) = ((y0 + t).min(y1), (y1 - t).max(y0));
        let (left, right) = ((x0 + t).min(x1), (x1 - t).max(x0));
        for x in (cx0..=cx1).filter(|&x| on(x - x0)) {
            put(x, top);
            put(x, bottom);
        }
        for y in (cy0..=cy1).filter(|&y| on(y - y0)) {
            put(left, y);
            put(right, y);
        }
    }
}
