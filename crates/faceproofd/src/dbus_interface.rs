use crate::engine::Engine;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.faceproof.Faceproof1";
pub const OBJECT_PATH: &str = "/org/faceproof/Faceproof1";

/// D-Bus interface for the faceproof daemon.
///
/// Every method returns a JSON `ServiceResponse`; failures are reported
/// inside the envelope, never as D-Bus errors. Image arguments are http(s)
/// URLs, data URLs or bare base64. An empty `request_id` gets a fresh one.
pub struct FaceproofService {
    engine: Arc<Engine>,
}

impl FaceproofService {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

fn optional(s: &str) -> Option<&str> {
    (!s.trim().is_empty()).then_some(s)
}

#[interface(name = "org.faceproof.Faceproof1")]
impl FaceproofService {
    /// Compare the faces in two images.
    async fn compare_faces(
        &self,
        image1: &str,
        image2: &str,
        request_id: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!("compare_faces requested");
        Ok(self
            .engine
            .compare_faces(image1, image2, optional(request_id))
            .await
            .to_json())
    }

    /// Single-frame liveness. A negative `threshold` keeps the mode default.
    async fn check_liveness(
        &self,
        image: &str,
        lenient: bool,
        threshold: f64,
        request_id: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(lenient, "check_liveness requested");
        let threshold = (threshold >= 0.0).then_some(threshold as f32);
        Ok(self
            .engine
            .check_liveness(image, lenient, threshold, optional(request_id))
            .await
            .to_json())
    }

    /// Issue a head-turn challenge.
    async fn generate_challenge(&self, request_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!("generate_challenge requested");
        Ok(self
            .engine
            .generate_challenge(optional(request_id))
            .await
            .to_json())
    }

    /// Verify one frame per challenge direction, in order. Frames may also
    /// be storage paths when a file store is configured.
    async fn verify_challenge(
        &self,
        challenge_id: &str,
        frames: Vec<String>,
        request_id: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(challenge_id, frames = frames.len(), "verify_challenge requested");
        Ok(self
            .engine
            .verify_challenge(challenge_id, &frames, optional(request_id))
            .await
            .to_json())
    }

    /// Return daemon health and request counters.
    async fn status(&self) -> zbus::fdo::Result<String> {
        serde_json::to_string(&self.engine.health())
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }
}
