//! Lightweight single-shot CNN face detector (UltraFace RFB-320 layout).
//!
//! The model emits per-prior class scores `[1, N, 2]` and normalized corner
//! boxes `[1, N, 4]`. Candidates above the confidence threshold are
//! de-duplicated with greedy NMS.

use super::{load_session, nms, DetectedFace, DetectorError, DetectorKind, Detections, FaceDetector};
use crate::buffer::ImageBuffer;
use image::imageops::{self, FilterType};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use parking_lot::Mutex;

const CNN_INPUT_WIDTH: usize = 320;
const CNN_INPUT_HEIGHT: usize = 240;
const CNN_MEAN: f32 = 127.0;
const CNN_STD: f32 = 128.0;
pub const CNN_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const CNN_NMS_THRESHOLD: f32 = 0.4;

pub struct CnnDetector {
    session: Mutex<Session>,
    /// (scores, boxes) output indices.
    outputs: (usize, usize),
    confidence_threshold: f32,
    nms_threshold: f32,
}

impl CnnDetector {
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        let (session, output_names) = load_session(model_path, "ultraface", 2)?;
        let outputs = discover_outputs(&output_names);
        tracing::debug!(mapping = ?outputs, "ultraface score/box outputs");

        Ok(Self {
            session: Mutex::new(session),
            outputs,
            confidence_threshold: CNN_CONFIDENCE_THRESHOLD,
            nms_threshold: CNN_NMS_THRESHOLD,
        })
    }

    pub fn with_thresholds(mut self, confidence: f32, nms: f32) -> Self {
        self.confidence_threshold = confidence;
        self.nms_threshold = nms;
        self
    }

    /// Resize to the fixed network input and normalize into NCHW.
    fn preprocess(image: &ImageBuffer) -> Array4<f32> {
        let resized = imageops::resize(
            image.rgb(),
            CNN_INPUT_WIDTH as u32,
            CNN_INPUT_HEIGHT as u32,
            FilterType::Triangle,
        );
        let mut tensor = Array4::<f32>::zeros((1, 3, CNN_INPUT_HEIGHT, CNN_INPUT_WIDTH));
        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - CNN_MEAN) / CNN_STD;
            }
        }
        tensor
    }
}

impl FaceDetector for CnnDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Cnn
    }

    fn detect(&self, image: &ImageBuffer) -> Result<Detections, DetectorError> {
        let input = Self::preprocess(image);

        let candidates = {
            let mut session = self.session.lock();
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

            let (_, scores) = outputs[self.outputs.0]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores: {e}")))?;
            let (_, boxes) = outputs[self.outputs.1]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("boxes: {e}")))?;

            decode_priors(
                scores,
                boxes,
                image.width() as f32,
                image.height() as f32,
                self.confidence_threshold,
            )
        };

        let faces = nms(candidates, self.nms_threshold);
        tracing::debug!(count = faces.len(), "CNN detection complete");
        Ok(Detections::new(
            faces,
            DetectorKind::Cnn,
            image.width(),
            image.height(),
        ))
    }
}

/// Find the score and box tensors by name, falling back to [scores, boxes].
fn discover_outputs(names: &[String]) -> (usize, usize) {
    let scores = names.iter().position(|n| n.contains("score"));
    let boxes = names.iter().position(|n| n.contains("box"));
    match (scores, boxes) {
        (Some(s), Some(b)) if s != b => (s, b),
        _ => (0, 1),
    }
}

/// Decode per-prior outputs into boxes in original-image pixels.
fn decode_priors(
    scores: &[f32],
    boxes: &[f32],
    image_width: f32,
    image_height: f32,
    threshold: f32,
) -> Vec<DetectedFace> {
    let num_priors = (scores.len() / 2).min(boxes.len() / 4);
    let mut detections = Vec::new();

    for i in 0..num_priors {
        let confidence = scores[i * 2 + 1];
        if !(confidence > threshold) {
            continue;
        }
        let x1 = boxes[i * 4] * image_width;
        let y1 = boxes[i * 4 + 1] * image_height;
        let x2 = boxes[i * 4 + 2] * image_width;
        let y2 = boxes[i * 4 + 3] * image_height;
        if x2 <= x1 || y2 <= y1 {
            continue;
        }
        detections.push(DetectedFace::new(x1, y1, x2 - x1, y2 - y1, confidence));
    }

    detections
}
