//! SCRFD (`det_10g`) detector: boxes and five-point landmarks in one pass.
//!
//! The frame is letterboxed to 640×640, each of the three stride heads is
//! decoded against its anchor grid, then candidates are capped and NMS'd.

use super::{load_session, nms, top_k, DetectedFace, DetectorError, DetectorKind, Detections, FaceDetector};
use crate::buffer::ImageBuffer;
use image::imageops::{self, FilterType};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use parking_lot::Mutex;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
pub const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.6;
pub const SCRFD_NMS_THRESHOLD: f32 = 0.3;
pub const SCRFD_TOP_K: usize = 5000;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Uniform scale plus centering pad used to fit a frame into the square input.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: f32, height: f32, size: usize) -> Self {
        let scale = (size as f32 / width).min(size as f32 / height);
        let scaled_w = ((width * scale).round() as usize).clamp(1, size);
        let scaled_h = ((height * scale).round() as usize).clamp(1, size);
        Self {
            scale,
            pad_x: (size - scaled_w) as f32 / 2.0,
            pad_y: (size - scaled_h) as f32 / 2.0,
        }
    }

    fn map(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (x * self.scale + self.pad_x, y * self.scale + self.pad_y)
    }

    /// Network input coordinates back to frame pixels.
    fn unmap(&self, (x, y): (f32, f32)) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions for one stride: (score, bbox, kps).
type StrideOutputs = (usize, usize, usize);

/// SCRFD-based face + landmark detector.
pub struct LandmarkDetector {
    session: Mutex<Session>,
    input_size: usize,
    /// Per stride in `SCRFD_STRIDES` order.
    stride_outputs: [StrideOutputs; 3],
    confidence_threshold: f32,
    nms_threshold: f32,
    top_k: usize,
}

impl LandmarkDetector {
    /// Needs the nine stride heads (score, bbox, kps for strides 8/16/32).
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        let (session, output_names) = load_session(model_path, "scrfd", 9)?;
        let stride_outputs = stride_outputs(&output_names);
        tracing::debug!(?stride_outputs, "scrfd stride heads");

        Ok(Self {
            session: Mutex::new(session),
            input_size: SCRFD_INPUT_SIZE,
            stride_outputs,
            confidence_threshold: SCRFD_CONFIDENCE_THRESHOLD,
            nms_threshold: SCRFD_NMS_THRESHOLD,
            top_k: SCRFD_TOP_K,
        })
    }

    pub fn with_thresholds(mut self, confidence: f32, nms: f32, top_k: usize) -> Self {
        self.confidence_threshold = confidence;
        self.nms_threshold = nms;
        self.top_k = top_k;
        self
    }

    /// NCHW tensor of the letterboxed frame; padding is zero after normalization.
    fn preprocess(&self, image: &ImageBuffer) -> (Array4<f32>, Letterbox) {
        let size = self.input_size;
        let letterbox = Letterbox::fit(image.width() as f32, image.height() as f32, size);
        let scaled_w = size - (letterbox.pad_x * 2.0).round() as usize;
        let scaled_h = size - (letterbox.pad_y * 2.0).round() as usize;
        let resized = imageops::resize(
            image.rgb(),
            scaled_w.max(1) as u32,
            scaled_h.max(1) as u32,
            FilterType::Triangle,
        );

        let (ox, oy) = (letterbox.pad_x.floor() as usize, letterbox.pad_y.floor() as usize);
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in resized.enumerate_pixels() {
            let (tx, ty) = (x as usize + ox, y as usize + oy);
            if tx >= size || ty >= size {
                continue;
            }
            for (c, v) in pixel.0.iter().enumerate() {
                tensor[[0, c, ty, tx]] = (*v as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }

        (tensor, letterbox)
    }
}

impl FaceDetector for LandmarkDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Landmark
    }

    fn detect(&self, image: &ImageBuffer) -> Result<Detections, DetectorError> {
        let (input, letterbox) = self.preprocess(image);

        let mut all_detections = Vec::new();
        {
            let mut session = self.session.lock();
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

            for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
                let (score_at, bbox_at, kps_at) = self.stride_outputs[stride_pos];
                let tensor = |at: usize, what: &str| {
                    outputs[at]
                        .try_extract_tensor::<f32>()
                        .map(|(_, data)| data)
                        .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
                };
                let scores = tensor(score_at, "scores")?;
                let bboxes = tensor(bbox_at, "bboxes")?;
                let kps = tensor(kps_at, "kps")?;

                all_detections.extend(decode_stride(
                    scores,
                    bboxes,
                    kps,
                    stride,
                    self.input_size,
                    &letterbox,
                    self.confidence_threshold,
                ));
            }
        }

        let candidates = top_k(all_detections, self.top_k);
        let faces = nms(candidates, self.nms_threshold);
        tracing::debug!(count = faces.len(), "SCRFD detection complete");

        Ok(Detections::new(
            faces,
            DetectorKind::Landmark,
            image.width(),
            image.height(),
        ))
    }
}

/// Map outputs named `score_8`, `bbox_16`, `kps_32`, ... to strides. Exports
/// with generic names use the stock layout: scores 0-2, boxes 3-5, kps 6-8.
fn stride_outputs(names: &[String]) -> [StrideOutputs; 3] {
    const POSITIONAL: [StrideOutputs; 3] = [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
    let position = |head: &str, stride: usize| {
        let wanted = format!("{head}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((position("score", s)?, position("bbox", s)?, position("kps", s)?)))
        .collect();

    match named.as_deref() {
        Some(&[a, b, c]) => [a, b, c],
        _ => {
            tracing::info!(?names, "SCRFD outputs are unnamed, using positional layout");
            POSITIONAL
        }
    }
}

/// Decode detections for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<DetectedFace> {
    let grid = input_size / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    scores
        .iter()
        .take(anchors)
        .enumerate()
        .filter(|&(_, &score)| score > threshold)
        .filter_map(|(idx, &score)| {
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let (cx, cy) = ((cell % grid) as f32 * step, (cell / grid) as f32 * step);

            // left, top, right, bottom distances in stride units
            let d = bboxes.get(idx * 4..idx * 4 + 4)?;
            let (x1, y1) = letterbox.unmap((cx - d[0] * step, cy - d[1] * step));
            let (x2, y2) = letterbox.unmap((cx + d[2] * step, cy + d[3] * step));

            let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
                std::array::from_fn(|i| letterbox.unmap((cx + k[i * 2] * step, cy + k[i * 2 + 1] * step)))
            });

            Some(DetectedFace {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}
