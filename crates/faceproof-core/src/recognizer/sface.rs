//! SFace recognizer: 128-dimensional embeddings from a box crop.

use super::{load_session, run_embedding, to_nchw, Recognizer, RecognizerError, RecognizerKind};
use crate::buffer::ImageBuffer;
use crate::types::{DetectedFace, FaceEmbedding};
use ort::session::Session;

const SFACE_INPUT_SIZE: u32 = 112;
// SFace consumes raw 0–255 RGB.
const SFACE_MEAN: f32 = 0.0;
const SFACE_STD: f32 = 1.0;
pub const SFACE_EMBEDDING_DIM: usize = 128;
pub const SFACE_MODEL_VERSION: &str = "sface_2021dec";
const SFACE_CROP_MARGIN: f32 = 0.05;

pub struct SFaceRecognizer {
    session: Session,
}

impl SFaceRecognizer {
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        let session = load_session(model_path, SFACE_MODEL_VERSION)?;
        Ok(Self { session })
    }

    fn face_input(image: &ImageBuffer, face: &DetectedFace) -> Result<ImageBuffer, RecognizerError> {
        Ok(image
            .crop_with_margin(face, SFACE_CROP_MARGIN)?
            .resized(SFACE_INPUT_SIZE, SFACE_INPUT_SIZE))
    }
}

impl Recognizer for SFaceRecognizer {
    fn kind(&self) -> RecognizerKind {
        RecognizerKind::SFace
    }

    fn dim(&self) -> usize {
        SFACE_EMBEDDING_DIM
    }

    fn embed(
        &mut self,
        image: &ImageBuffer,
        face: &DetectedFace,
    ) -> Result<FaceEmbedding, RecognizerError> {
        let crop = Self::face_input(image, face)?;
        let input = to_nchw(&crop, SFACE_MEAN, SFACE_STD);
        run_embedding(&mut self.session, &input, SFACE_EMBEDDING_DIM, SFACE_MODEL_VERSION)
    }
}
