//! faceproof-core — face verification and liveness engine.
//!
//! Decodes and validates untrusted images, detects faces through pluggable
//! backends (SeetaFace cascade, UltraFace CNN, SCRFD with landmarks),
//! embeds them with ArcFace or SFace via ONNX Runtime, and scores
//! single-frame liveness. Everything here is synchronous and I/O-free
//! apart from model loading; orchestration lives in `faceproofd`.

pub mod alignment;
pub mod buffer;
pub mod detector;
pub mod error;
pub mod liveness;
pub mod loader;
pub mod matching;
pub mod plane;
pub mod pose;
pub mod quality;
pub mod recognizer;
pub mod types;

pub use buffer::ImageBuffer;
pub use detector::{Detections, DetectorKind, FaceDetector};
pub use error::FailureReason;
pub use liveness::{LivenessAnalyzer, LivenessReport, LivenessThresholds};
pub use matching::{MatchDecision, MatchThresholds};
pub use pose::{HeadDirection, HeadPose};
pub use recognizer::{Recognizer, RecognizerKind};
pub use types::{DetectedFace, FaceEmbedding};
