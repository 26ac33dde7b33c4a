use super::{DetectorError, DetectorKind, Detections, FaceDetector};
use crate::buffer::ImageBuffer;

/// Two detectors chained: the preferred one runs first, and the secondary
/// one runs when the preferred finds nothing (or fails) and fallback is on.
pub struct HybridDetector {
    preferred: Box<dyn FaceDetector>,
    secondary: Box<dyn FaceDetector>,
    fallback_enabled: bool,
}

impl HybridDetector {
    pub fn new(
        preferred: Box<dyn FaceDetector>,
        secondary: Box<dyn FaceDetector>,
        fallback_enabled: bool,
    ) -> Self {
        Self {
            preferred,
            secondary,
            fallback_enabled,
        }
    }

    fn run_secondary(&self, image: &ImageBuffer) -> Result<Detections, DetectorError> {
        let mut detections = self.secondary.detect(image)?;
        detections.used_fallback = true;
        tracing::info!(
            method = %detections.method,
            faces = detections.faces.len(),
            "hybrid detector used fallback backend"
        );
        Ok(detections)
    }
}

impl FaceDetector for HybridDetector {
    fn kind(&self) -> DetectorKind {
        self.preferred.kind()
    }

    fn detect(&self, image: &ImageBuffer) -> Result<Detections, DetectorError> {
        match self.preferred.detect(image) {
            Ok(detections) if !detections.faces.is_empty() || !self.fallback_enabled => {
                Ok(detections)
            }
            Ok(_) => {
                tracing::debug!(
                    preferred = %self.preferred.kind(),
                    "preferred detector found no faces"
                );
                self.run_secondary(image)
            }
            Err(err) if self.fallback_enabled => {
                tracing::warn!(
                    preferred = %self.preferred.kind(),
                    error = %err,
                    "preferred detector failed, falling back"
                );
                self.run_secondary(image)
            }
            Err(err) => Err(err),
        }
    }
}
