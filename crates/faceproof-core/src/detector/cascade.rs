//! Multi-scale sliding-window cascade detector (SeetaFace funnel cascade).
//!
//! Runs on a histogram-equalized grayscale copy. A strict pass runs first;
//! if it finds nothing, a relaxed pass with a finer pyramid and lower
//! acceptance score is tried.

use super::{DetectedFace, DetectorError, DetectorKind, Detections, FaceDetector};
use crate::buffer::ImageBuffer;
use image::GrayImage;
use imageproc::contrast::equalize_histogram;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

// Cascade window scores above this map to ~0.6 confidence.
const SCORE_SQUASH: f64 = 2.0;
// Each "neighbor" of evidence maps onto this much classifier score.
const SCORE_PER_NEIGHBOR: f64 = 0.7;
const WINDOW_STEP: u32 = 4;
// rustface rejects smaller minimum window sizes.
const MIN_SUPPORTED_FACE_SIZE: u32 = 20;

/// Parameters of one detection pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeParams {
    /// Ratio between consecutive pyramid levels (> 1.0).
    pub scale_factor: f32,
    /// Evidence required before a window is accepted.
    pub min_neighbors: u32,
    /// Smallest face side, in pixels.
    pub min_size: u32,
}

impl CascadeParams {
    pub const STRICT: Self = Self {
        scale_factor: 1.1,
        min_neighbors: 3,
        min_size: 30,
    };
    pub const RELAXED: Self = Self {
        scale_factor: 1.05,
        min_neighbors: 2,
        min_size: 20,
    };

    fn score_threshold(&self) -> f64 {
        SCORE_PER_NEIGHBOR * self.min_neighbors as f64
    }

    fn pyramid_scale(&self) -> f32 {
        (1.0 / self.scale_factor.max(1.01)).clamp(0.5, 0.99)
    }
}

pub struct CascadeDetector {
    model: rustface::Model,
    strict: CascadeParams,
    relaxed: CascadeParams,
}

impl CascadeDetector {
    /// Load a SeetaFace `.bin` cascade model.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }
        let file = File::open(model_path).map_err(|e| DetectorError::ModelLoad(e.to_string()))?;
        let model = rustface::read_model(BufReader::new(file))
            .map_err(|e| DetectorError::ModelLoad(e.to_string()))?;

        tracing::info!(path = model_path, "loaded cascade face model");

        Ok(Self {
            model,
            strict: CascadeParams::STRICT,
            relaxed: CascadeParams::RELAXED,
        })
    }

    pub fn with_params(mut self, strict: CascadeParams, relaxed: CascadeParams) -> Self {
        self.strict = strict;
        self.relaxed = relaxed;
        self
    }

    fn run_pass(&self, gray: &GrayImage, params: &CascadeParams) -> Vec<DetectedFace> {
        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(params.min_size.max(MIN_SUPPORTED_FACE_SIZE));
        detector.set_score_thresh(params.score_threshold());
        detector.set_pyramid_scale_factor(params.pyramid_scale());
        detector.set_slide_window_step(WINDOW_STEP, WINDOW_STEP);

        let image = rustface::ImageData::new(gray.as_raw(), gray.width(), gray.height());
        detector
            .detect(&image)
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                DetectedFace::new(
                    bbox.x() as f32,
                    bbox.y() as f32,
                    bbox.width() as f32,
                    bbox.height() as f32,
                    squash_score(face.score()),
                )
            })
            .collect()
    }
}

impl FaceDetector for CascadeDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Cascade
    }

    fn detect(&self, image: &ImageBuffer) -> Result<Detections, DetectorError> {
        let gray = equalize_histogram(&image.to_gray());

        let mut faces = self.run_pass(&gray, &self.strict);
        if faces.is_empty() {
            tracing::debug!("cascade: strict pass found no faces, retrying relaxed");
            faces = self.run_pass(&gray, &self.relaxed);
        }

        tracing::debug!(count = faces.len(), "cascade detection complete");
        Ok(Detections::new(
            faces,
            DetectorKind::Cascade,
            image.width(),
            image.height(),
        ))
    }
}

/// Map an unbounded cascade score onto [0, 1).
fn squash_score(score: f64) -> f32 {
    if !score.is_finite() || score <= 0.0 {
        return 0.0;
    }
    (score / (score + SCORE_SQUASH)) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_is_stricter_than_relaxed() {
        let strict = CascadeParams::STRICT;
        let relaxed = CascadeParams::RELAXED;
        assert!(strict.score_threshold() > relaxed.score_threshold());
        assert!(strict.min_size > relaxed.min_size);
        // Coarser pyramid for the strict pass.
        assert!(strict.pyramid_scale() < relaxed.pyramid_scale());
    }

    #[test]
    fn test_pyramid_scale_inverts_scale_factor() {
        assert!((CascadeParams::STRICT.pyramid_scale() - 1.0 / 1.1).abs() < 1e-6);
    }

    #[test]
    fn test_squash_score() {
        assert_eq!(squash_score(-1.0), 0.0);
        assert_eq!(squash_score(f64::NAN), 0.0);
        assert!((squash_score(2.0) - 0.5).abs() < 1e-6);
        assert!(squash_score(100.0) < 1.0);
    }

    #[test]
    fn test_missing_model() {
        let err = CascadeDetector::load("/nonexistent/seeta_fd_frontal_v1.0.bin").err();
        assert!(matches!(err, Some(DetectorError::ModelNotFound(_))));
    }
}
