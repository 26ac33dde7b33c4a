//! ArcFace face recognizer via ONNX Runtime.
//!
//! Extracts 512-dimensional face embeddings from aligned face crops,
//! using the w600k_r50 ArcFace model.

use super::{load_session, run_embedding, to_nchw, Recognizer, RecognizerError, RecognizerKind};
use crate::alignment::{self, ALIGNED_SIZE};
use crate::buffer::ImageBuffer;
use crate::types::{DetectedFace, FaceEmbedding};
use ort::session::Session;

// --- Named constants (different from SCRFD!) ---
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric: (x - 127.5) / 127.5
pub const ARCFACE_EMBEDDING_DIM: usize = 512;
pub const ARCFACE_MODEL_VERSION: &str = "w600k_r50";
// Context kept around a landmark-less box before resizing.
const UNALIGNED_CROP_MARGIN: f32 = 0.1;

/// ArcFace-based face recognizer.
pub struct ArcFaceRecognizer {
    session: Session,
}

impl ArcFaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        let session = load_session(model_path, ARCFACE_MODEL_VERSION)?;
        Ok(Self { session })
    }

    /// Canonical 112×112 face: landmark-aligned when landmarks exist,
    /// otherwise a padded box crop resized to the network input.
    fn face_input(image: &ImageBuffer, face: &DetectedFace) -> Result<ImageBuffer, RecognizerError> {
        match &face.landmarks {
            Some(landmarks) => Ok(alignment::align_face(image, landmarks)),
            None => {
                tracing::debug!("ArcFace: no landmarks, using unaligned box crop");
                Ok(image
                    .crop_with_margin(face, UNALIGNED_CROP_MARGIN)?
                    .resized(ALIGNED_SIZE, ALIGNED_SIZE))
            }
        }
    }
}

impl Recognizer for ArcFaceRecognizer {
    fn kind(&self) -> RecognizerKind {
        RecognizerKind::ArcFace
    }

    fn dim(&self) -> usize {
        ARCFACE_EMBEDDING_DIM
    }

    fn embed(
        &mut self,
        image: &ImageBuffer,
        face: &DetectedFace,
    ) -> Result<FaceEmbedding, RecognizerError> {
        let aligned = Self::face_input(image, face)?;
        let input = to_nchw(&aligned, ARCFACE_MEAN, ARCFACE_STD);
        run_embedding(&mut self.session, &input, ARCFACE_EMBEDDING_DIM, ARCFACE_MODEL_VERSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn gray_image(w: u32, h: u32) -> ImageBuffer {
        ImageBuffer::from_rgb(RgbImage::from_pixel(w, h, Rgb([128, 128, 128])))
    }

    #[test]
    fn test_face_input_aligned_size() {
        let mut face = DetectedFace::new(40.0, 30.0, 80.0, 100.0, 0.9);
        face.landmarks = Some(alignment::REFERENCE_LANDMARKS_112);
        let input = ArcFaceRecognizer::face_input(&gray_image(200, 200), &face).unwrap();
        assert_eq!((input.width(), input.height()), (ALIGNED_SIZE, ALIGNED_SIZE));
    }

    #[test]
    fn test_face_input_without_landmarks() {
        let face = DetectedFace::new(40.0, 30.0, 80.0, 100.0, 0.9);
        let input = ArcFaceRecognizer::face_input(&gray_image(200, 200), &face).unwrap();
        assert_eq!((input.width(), input.height()), (ALIGNED_SIZE, ALIGNED_SIZE));
    }

    #[test]
    fn test_face_input_outside_image() {
        let face = DetectedFace::new(400.0, 300.0, 80.0, 100.0, 0.9);
        let result = ArcFaceRecognizer::face_input(&gray_image(200, 200), &face);
        assert!(matches!(result, Err(RecognizerError::Region(_))));
    }

    #[test]
    fn test_preprocess_normalization() {
        let input = to_nchw(&gray_image(ALIGNED_SIZE, ALIGNED_SIZE), ARCFACE_MEAN, ARCFACE_STD);
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((input[[0, 0, 0, 0]] - expected).abs() < 1e-6);
        assert_eq!(input[[0, 0, 5, 5]], input[[0, 2, 5, 5]]);
    }

    #[test]
    fn test_missing_model() {
        let err = ArcFaceRecognizer::load("/nonexistent/w600k_r50.onnx").err();
        assert!(matches!(err, Some(RecognizerError::ModelNotFound(_))));
    }
}
