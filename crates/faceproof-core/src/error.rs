//! Failure taxonomy shared by every layer.
//!
//! Module-level errors (`LoadError`, `DetectorError`, ...) stay rich for
//! logging; at the service boundary each one collapses to a [`FailureReason`]
//! plus a fixed user-facing message.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised failure reported across the service boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Bad input shape, size or encoding.
    Validation,
    /// Download timeout or non-2xx response. Retryable.
    NetworkError,
    CorruptedImage,
    UnsupportedImageFormat,
    ImageTooLarge,
    ImageTooSmall,
    NoFaceDetected,
    /// Soft warning; never fatal on its own.
    MultipleFaces,
    /// Configuration error: a backend could not be loaded.
    ModelNotLoaded,
    /// Unexpected fault at the pixel/inference boundary.
    ProcessingError,
    Timeout,
    ChallengeNotFound,
    ChallengeExpired,
    ChallengeAlreadyUsed,
}

impl FailureReason {
    /// Stable machine-readable identifier (matches the serde representation).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NetworkError => "network_error",
            Self::CorruptedImage => "corrupted_image",
            Self::UnsupportedImageFormat => "unsupported_image_format",
            Self::ImageTooLarge => "image_too_large",
            Self::ImageTooSmall => "image_too_small",
            Self::NoFaceDetected => "no_face_detected",
            Self::MultipleFaces => "multiple_faces",
            Self::ModelNotLoaded => "model_not_loaded",
            Self::ProcessingError => "processing_error",
            Self::Timeout => "timeout",
            Self::ChallengeNotFound => "challenge_not_found",
            Self::ChallengeExpired => "challenge_expired",
            Self::ChallengeAlreadyUsed => "challenge_already_used",
        }
    }

    /// Human-readable message safe to show to an end user.
    pub fn user_message(self) -> &'static str {
        match self {
            Self::Validation => "invalid image input",
            Self::NetworkError => "could not download image, please try again",
            Self::CorruptedImage => "image is corrupted or could not be decoded",
            Self::UnsupportedImageFormat => "unsupported image format (use JPEG, PNG, BMP or WebP)",
            Self::ImageTooLarge => "image too large",
            Self::ImageTooSmall => "image too small",
            Self::NoFaceDetected => "no face detected in image",
            Self::MultipleFaces => "multiple faces detected in image",
            Self::ModelNotLoaded => "face models are not loaded",
            Self::ProcessingError => "image could not be processed",
            Self::Timeout => "processing timed out",
            Self::ChallengeNotFound => "challenge not found",
            Self::ChallengeExpired => "challenge expired",
            Self::ChallengeAlreadyUsed => "challenge already used",
        }
    }

    /// Whether the caller may reasonably retry the same input.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::NetworkError | Self::Timeout)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
