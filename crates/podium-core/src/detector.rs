//! SCRFD face localization via ONNX Runtime.
//!
//! Only face *location* is used; landmarks are decoded for diagnostics and no
//! embedding or identity is ever computed.

use crate::backend::{BackendFactory, BackendTier, FaceEstimator, LibraryProbe};
use crate::types::{BoundingBox, Frame};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma};
use ndarray::Array4;
use ort::execution_providers::{CPU as CPUExecutionProvider, CUDA as CUDAExecutionProvider};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the SCRFD model inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [u32; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Default model directory: `$XDG_DATA_HOME/podium/models`
/// (falls back to `~/.local/share/podium/models`).
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("podium/models")
}

/// Letterbox mapping between source-frame and model-input coordinates.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
    scaled_w: u32,
    scaled_h: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, target: u32) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let scaled_w = ((width as f32 * scale).round() as u32).clamp(1, target);
        let scaled_h = ((height as f32 * scale).round() as u32).clamp(1, target);
        Self {
            scale,
            pad_x: (target - scaled_w) / 2,
            pad_y: (target - scaled_h) / 2,
            scaled_w,
            scaled_h,
        }
    }

    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputs = (usize, usize, usize);

/// SCRFD detector bound to one execution tier.
pub struct ScrfdDetector {
    session: Session,
    tier: BackendTier,
    stride_outputs: [StrideOutputs; 3],
}

impl ScrfdDetector {
    /// Load the model for `tier`.
    ///
    /// The accelerated tier requires the CUDA execution provider to register;
    /// if it cannot, loading fails instead of silently running on CPU.
    pub fn load(model_path: &Path, tier: BackendTier) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let builder = Session::builder()?.with_intra_threads(2).map_err(ort::Error::from)?;
        let mut builder = match tier {
            BackendTier::Accelerated => builder
                .with_execution_providers([CUDAExecutionProvider::default().build().error_on_failure()])
                .map_err(ort::Error::from)?,
            BackendTier::Fallback => {
                builder
                .with_execution_providers([CPUExecutionProvider::default().build()])
                .map_err(ort::Error::from)?
            }
        };
        let session = builder.commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps for 3 strides), model has {}",
                output_names.len()
            )));
        }
        let stride_outputs = map_outputs(&output_names);

        tracing::info!(
            path = %model_path.display(),
            tier = tier.as_str(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        Ok(Self {
            session,
            tier,
            stride_outputs,
        })
    }

    pub fn tier(&self) -> BackendTier {
        self.tier
    }

    /// Detect faces, most confident first.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = preprocess(frame)?;
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, &(score_idx, bbox_idx, kps_idx)) in SCRFD_STRIDES.iter().zip(&self.stride_outputs) {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(score_idx, "scores")?;
            let bboxes = extract(bbox_idx, "bboxes")?;
            let kps = extract(kps_idx, "kps")?;
            candidates.extend(decode_stride(scores, bboxes, kps, stride, &letterbox));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
    }
}

impl FaceEstimator for ScrfdDetector {
    fn estimate_faces(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
        self.detect(frame)
    }
}

/// Production backend factory: one SCRFD session per requested tier.
pub struct OnnxBackendFactory {
    model_path: PathBuf,
}

impl OnnxBackendFactory {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
        }
    }
}

impl BackendFactory for OnnxBackendFactory {
    fn create(&self, tier: BackendTier) -> Result<Box<dyn FaceEstimator>, DetectorError> {
        Ok(Box::new(ScrfdDetector::load(&self.model_path, tier)?))
    }
}

/// Treats the model file as the externally provisioned dependency.
pub struct ModelFileProbe {
    path: PathBuf,
}

impl ModelFileProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl LibraryProbe for ModelFileProbe {
    fn libraries_available(&self) -> bool {
        self.path.is_file()
    }
}

/// Letterbox a luma frame into a NCHW tensor normalized for SCRFD.
fn preprocess(frame: &Frame) -> Result<(Array4<f32>, Letterbox), DetectorError> {
    let expected = (frame.width as usize) * (frame.height as usize);
    if frame.width == 0 || frame.height == 0 || frame.data.len() < expected {
        return Err(DetectorError::InvalidFrame(format!(
            "{}x{} frame with {} bytes",
            frame.width,
            frame.height,
            frame.data.len()
        )));
    }

    let view: ImageBuffer<Luma<u8>, &[u8]> =
        ImageBuffer::from_raw(frame.width, frame.height, &frame.data[..expected])
            .ok_or_else(|| DetectorError::InvalidFrame("buffer does not match dimensions".into()))?;

    let letterbox = Letterbox::fit(frame.width, frame.height, SCRFD_INPUT_SIZE);
    let resized = imageops::resize(&view, letterbox.scaled_w, letterbox.scaled_h, FilterType::Triangle);

    // Padding stays at 0.0, which is SCRFD_MEAN after normalization.
    let size = SCRFD_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, Luma([v])) in resized.enumerate_pixels() {
        let ty = (y + letterbox.pad_y) as usize;
        let tx = (x + letterbox.pad_x) as usize;
        let normalized = (*v as f32 - SCRFD_MEAN) / SCRFD_STD;
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = normalized;
        }
    }

    Ok((tensor, letterbox))
}

/// Map output tensors to strides by name ("score_8", "bbox_16", ...), or fall
/// back to the standard positional layout [scores×3, bboxes×3, kps×3].
fn map_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: u32| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named {
        Some(v) => {
            tracing::debug!(mapping = ?v, "SCRFD outputs mapped by name");
            [v[0], v[1], v[2]]
        }
        None => {
            tracing::debug!(?names, "SCRFD output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Decode anchor-free detections for one stride into frame coordinates.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: u32,
    letterbox: &Letterbox,
) -> Vec<BoundingBox> {
    let grid_w = (SCRFD_INPUT_SIZE / stride) as usize;
    let grid_h = grid_w;
    let step = stride as f32;

    (0..grid_w * grid_h * SCRFD_ANCHORS_PER_CELL)
        .filter_map(|idx| {
            let score = *scores.get(idx)?;
            if score <= SCRFD_CONFIDENCE_THRESHOLD {
                return None;
            }
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % grid_w) as f32 * step;
            let ay = (cell / grid_w) as f32 * step;

            let d = bboxes.get(idx * 4..idx * 4 + 4)?;
            let (x1, y1) = letterbox.to_frame(ax - d[0] * step, ay - d[1] * step);
            let (x2, y2) = letterbox.to_frame(ax + d[2] * step, ay + d[3] * step);

            let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
                std::array::from_fn(|i| letterbox.to_frame(ax + k[i * 2] * step, ay + k[i * 2 + 1] * step))
            });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: (x2 - x1).max(0.0),
                height: (y2 - y1).max(0.0),
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; output is sorted by confidence.
fn nms(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        if keep.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
