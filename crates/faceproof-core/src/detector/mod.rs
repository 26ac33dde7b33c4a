//! Face detection backends.
//!
//! Every backend implements [`FaceDetector`]: the cascade detector (SeetaFace
//! funnel cascade via `rustface`), a lightweight single-shot CNN, and SCRFD
//! which also returns five-point landmarks. [`HybridDetector`] chains two of
//! them with an optional fallback.

mod cascade;
mod cnn;
mod hybrid;
mod scrfd;

pub use cascade::{CascadeDetector, CascadeParams};
pub use cnn::CnnDetector;
pub use hybrid::HybridDetector;
pub use scrfd::LandmarkDetector;

use crate::buffer::ImageBuffer;
use crate::error::FailureReason;
use crate::types::DetectedFace;
use ort::session::Session;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("model failed to load: {0}")]
    ModelLoad(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl DetectorError {
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::ModelNotFound(_) | Self::ModelLoad(_) => FailureReason::ModelNotLoaded,
            Self::InferenceFailed(_) | Self::Ort(_) => FailureReason::ProcessingError,
        }
    }
}

/// Which detection backend produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Cascade,
    Cnn,
    Landmark,
}

impl DetectorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cascade => "cascade",
            Self::Cnn => "cnn",
            Self::Landmark => "landmark",
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Faces found in one image, sorted by descending confidence.
#[derive(Debug, Clone)]
pub struct Detections {
    pub faces: Vec<DetectedFace>,
    /// Backend that produced `faces`.
    pub method: DetectorKind,
    /// True when a hybrid detector had to use its secondary backend.
    pub used_fallback: bool,
}

impl Detections {
    /// Clip every box to the image, drop empty ones and sort by confidence.
    pub fn new(faces: Vec<DetectedFace>, method: DetectorKind, width: u32, height: u32) -> Self {
        let mut faces: Vec<DetectedFace> = faces
            .into_iter()
            .filter_map(|f| f.clamp_to(width, height))
            .collect();
        sort_by_confidence(&mut faces);
        Self {
            faces,
            method,
            used_fallback: false,
        }
    }

    pub fn has_landmarks(&self) -> bool {
        self.faces.iter().any(|f| f.landmarks.is_some())
    }
}

/// A face detection backend.
///
/// Implementations synchronise their own inference state, so one loaded
/// detector can serve concurrent pipelines.
pub trait FaceDetector: Send + Sync {
    /// Backend identifier; for composite detectors, the preferred backend.
    fn kind(&self) -> DetectorKind;

    fn detect(&self, image: &ImageBuffer) -> Result<Detections, DetectorError>;
}

pub(crate) fn sort_by_confidence(faces: &mut [DetectedFace]) {
    faces.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Keep at most `k` highest-confidence candidates.
pub(crate) fn top_k(mut detections: Vec<DetectedFace>, k: usize) -> Vec<DetectedFace> {
    sort_by_confidence(&mut detections);
    detections.truncate(k);
    detections
}

/// Open an ONNX detector and check it exposes at least `min_outputs` heads.
/// Returns the session with its output names in model order.
pub(crate) fn load_session(
    model_path: &str,
    label: &str,
    min_outputs: usize,
) -> Result<(Session, Vec<String>), DetectorError> {
    if !Path::new(model_path).exists() {
        return Err(DetectorError::ModelNotFound(model_path.to_string()));
    }
    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(model_path)?;

    let outputs: Vec<String> = session
        .outputs()
        .iter()
        .map(|o| o.name().to_string())
        .collect();
    if outputs.len() < min_outputs {
        return Err(DetectorError::ModelLoad(format!(
            "{label} model exposes {} outputs, expected at least {min_outputs}",
            outputs.len()
        )));
    }
    tracing::info!(path = model_path, model = label, ?outputs, "detector model loaded");
    Ok((session, outputs))
}

/// Greedy non-maximum suppression: walk candidates best-first and keep each
/// one that overlaps no already kept face by more than `iou_threshold`.
pub fn nms(mut candidates: Vec<DetectedFace>, iou_threshold: f32) -> Vec<DetectedFace> {
    sort_by_confidence(&mut candidates);
    candidates
        .into_iter()
        .fold(Vec::new(), |mut kept: Vec<DetectedFace>, face| {
            if kept.iter().all(|k| iou(k, &face) <= iou_threshold) {
                kept.push(face);
            }
            kept
        })
}

/// Intersection over union of two boxes; 0 for degenerate pairs.
pub fn iou(a: &DetectedFace, b: &DetectedFace) -> f32 {
    let span = |a0: f32, a1: f32, b0: f32, b1: f32| (a1.min(b1) - a0.max(b0)).max(0.0);
    let inter = span(a.x, a.x + a.width, b.x, b.x + b.width)
        * span(a.y, a.y + a.height, b.y, b.y + b.height);
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x: f32, y: f32, side: f32, confidence: f32) -> DetectedFace {
        DetectedFace::new(x, y, side, side, confidence)
    }

    #[test]
    fn test_iou_bounds() {
        let face = square(40.0, 40.0, 80.0, 0.9);
        assert!((iou(&face, &face) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&face, &square(200.0, 40.0, 80.0, 0.9)), 0.0);
        // Touching edges share no area.
        assert_eq!(iou(&face, &square(120.0, 40.0, 80.0, 0.9)), 0.0);
        assert_eq!(iou(&square(0.0, 0.0, 0.0, 0.9), &square(0.0, 0.0, 0.0, 0.9)), 0.0);
    }

    #[test]
    fn test_iou_nested_box() {
        // A 40px box inside an 80px one: 1600 / 6400.
        let outer = square(0.0, 0.0, 80.0, 0.9);
        let inner = square(20.0, 20.0, 40.0, 0.6);
        assert!((iou(&outer, &inner) - 0.25).abs() < 1e-6);
        assert_eq!(iou(&outer, &inner), iou(&inner, &outer));
    }

    #[test]
    fn test_nms_keeps_best_of_each_cluster() {
        // Two overlapping hits on one face, one separate face; the winner
        // keeps its landmarks.
        let mut best = square(102.0, 98.0, 60.0, 0.93);
        best.landmarks = Some([(120.0, 118.0), (144.0, 118.0), (132.0, 130.0), (122.0, 145.0), (142.0, 145.0)]);
        let candidates = vec![
            square(100.0, 100.0, 60.0, 0.71),
            square(300.0, 40.0, 30.0, 0.64),
            best,
        ];
        let kept = nms(candidates, 0.3);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.93);
        assert!(kept[0].landmarks.is_some());
        assert_eq!(kept[1].confidence, 0.64);
    }

    #[test]
    fn test_nms_overlap_at_cutoff_survives() {
        let candidates = vec![square(0.0, 0.0, 80.0, 0.9), square(20.0, 20.0, 40.0, 0.8)];
        assert_eq!(nms(candidates.clone(), 0.25).len(), 2);
        assert_eq!(nms(candidates.clone(), 0.2).len(), 1);
        assert!(nms(Vec::new(), 0.3).is_empty());
    }

    #[test]
    fn test_top_k_keeps_best() {
        let detections = vec![
            square(0.0, 0.0, 1.0, 0.2),
            square(0.0, 0.0, 1.0, 0.9),
            square(0.0, 0.0, 1.0, 0.5),
        ];
        let kept = top_k(detections, 2);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.5);
    }

    #[test]
    fn test_detections_clip_and_sort() {
        let faces = vec![
            square(-5.0, -5.0, 20.0, 0.4),
            square(500.0, 500.0, 20.0, 0.99),
            square(10.0, 10.0, 20.0, 0.8),
        ];
        let d = Detections::new(faces, DetectorKind::Cnn, 100, 100);
        assert_eq!(d.faces.len(), 2);
        assert_eq!(d.faces[0].confidence, 0.8);
        assert_eq!(d.faces[1].x, 0.0);
        assert!(!d.used_fallback);
    }
}
