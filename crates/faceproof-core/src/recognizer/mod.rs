//! Face recognition backends.
//!
//! A [`Recognizer`] turns one face into a fixed-length, L2-normalized
//! [`FaceEmbedding`]. Inference state is not assumed reentrant, so `embed`
//! takes `&mut self`; callers serialize access to a shared instance.

mod arcface;
mod sface;

pub use arcface::ArcFaceRecognizer;
pub use sface::SFaceRecognizer;

use crate::buffer::{ImageBuffer, RegionError};
use crate::error::FailureReason;
use crate::types::{DetectedFace, FaceEmbedding};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face region: {0}")]
    Region(#[from] RegionError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl RecognizerError {
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::ModelNotFound(_) => FailureReason::ModelNotLoaded,
            Self::InferenceFailed(_) | Self::Region(_) | Self::Ort(_) => {
                FailureReason::ProcessingError
            }
        }
    }
}

/// Recognizer variant identifiers, as used in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecognizerKind {
    #[serde(rename = "arcface")]
    ArcFace,
    #[serde(rename = "sface")]
    SFace,
}

impl RecognizerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ArcFace => "arcface",
            Self::SFace => "sface",
        }
    }

    /// Normalized-similarity cutoff the variant was tuned for.
    pub fn baseline_threshold(self) -> f32 {
        match self {
            Self::ArcFace => 0.91,
            Self::SFace => 0.70,
        }
    }
}

/// A face embedding backend.
pub trait Recognizer: Send {
    fn kind(&self) -> RecognizerKind;

    /// Output dimensionality (fixed per variant).
    fn dim(&self) -> usize;

    /// Extract an embedding for `face` inside `image`.
    fn embed(
        &mut self,
        image: &ImageBuffer,
        face: &DetectedFace,
    ) -> Result<FaceEmbedding, RecognizerError>;
}

pub(crate) fn load_session(model_path: &str, label: &str) -> Result<Session, RecognizerError> {
    if !Path::new(model_path).exists() {
        return Err(RecognizerError::ModelNotFound(model_path.to_string()));
    }

    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(model_path)?;

    tracing::info!(
        path = model_path,
        model = label,
        inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded recognition model"
    );

    Ok(session)
}

/// Run a single-input, single-output embedding network and normalize the result.
pub(crate) fn run_embedding(
    session: &mut Session,
    input: &Array4<f32>,
    expected_dim: usize,
    model: &str,
) -> Result<FaceEmbedding, RecognizerError> {
    let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

    let (_, raw_data) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

    if raw_data.len() != expected_dim {
        return Err(RecognizerError::InferenceFailed(format!(
            "expected {expected_dim}-dim embedding, got {}",
            raw_data.len()
        )));
    }
    if raw_data.iter().any(|v| !v.is_finite()) {
        return Err(RecognizerError::InferenceFailed(
            "embedding contains non-finite values".into(),
        ));
    }

    Ok(FaceEmbedding::normalized(raw_data.to_vec(), model))
}

/// Pack an RGB image into a NCHW float tensor with `(p - mean) / std`.
pub(crate) fn to_nchw(image: &ImageBuffer, mean: f32, std: f32) -> Array4<f32> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in image.rgb().enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - mean) / std;
        }
    }
    tensor
}
