//! Frame-by-frame challenge verification: each frame must show a live face
//! turned in the requested direction.

use crate::challenge::{
    Challenge, ChallengeError, ChallengeVerification, ChallengeVerifier, DirectionCheck,
};
use crate::fetch::ImageFetcher;
use async_trait::async_trait;
use faceproof_core::loader::decode_bytes;
use faceproof_core::pose::PoseThresholds;
use faceproof_core::types::largest_face;
use faceproof_core::{FaceDetector, FailureReason, HeadDirection, HeadPose, LivenessAnalyzer};
use std::sync::Arc;

struct FrameReading {
    observed: Option<HeadDirection>,
    is_live: bool,
    liveness_score: f32,
}

pub struct FrameChallengeVerifier {
    fetcher: ImageFetcher,
    detector: Arc<dyn FaceDetector>,
    analyzer: Arc<LivenessAnalyzer>,
    pose: PoseThresholds,
}

impl FrameChallengeVerifier {
    pub fn new(
        fetcher: ImageFetcher,
        detector: Arc<dyn FaceDetector>,
        analyzer: Arc<LivenessAnalyzer>,
        pose: PoseThresholds,
    ) -> Self {
        Self {
            fetcher,
            detector,
            analyzer,
            pose,
        }
    }

    async fn check(&self, requested: HeadDirection, frame: &str) -> DirectionCheck {
        match self.read_frame(frame).await {
            Ok(reading) => DirectionCheck {
                requested,
                observed: reading.observed,
                direction_matched: reading.observed == Some(requested),
                is_live: reading.is_live,
                liveness_score: reading.liveness_score,
                failure_reason: None,
            },
            Err(reason) => DirectionCheck {
                requested,
                observed: None,
                direction_matched: false,
                is_live: false,
                liveness_score: 0.0,
                failure_reason: Some(reason),
            },
        }
    }

    async fn read_frame(&self, frame: &str) -> Result<FrameReading, FailureReason> {
        let bytes = self.fetcher.fetch(frame).await.map_err(|e| e.reason())?;

        let detector = self.detector.clone();
        let analyzer = self.analyzer.clone();
        let pose = self.pose.clone();
        tokio::task::spawn_blocking(move || {
            let image = decode_bytes(&bytes).map_err(|e| e.reason())?;
            let detections = detector.detect(&image).map_err(|e| e.reason())?;
            let face = largest_face(&detections.faces).ok_or(FailureReason::NoFaceDetected)?;

            let observed = face
                .landmarks
                .as_ref()
                .and_then(HeadPose::estimate)
                .map(|p| p.direction(&pose));

            let region = image
                .crop(face)
                .map_err(|_| FailureReason::ProcessingError)?;
            let report = analyzer.analyze(&region, &image);
            // Turned heads blur; frames are judged in lenient mode.
            let verdict = analyzer.decide(&report, true, None);

            Ok(FrameReading {
                observed,
                is_live: verdict.is_live,
                liveness_score: report.score,
            })
        })
        .await
        .map_err(|_| FailureReason::ProcessingError)?
    }
}

#[async_trait]
impl ChallengeVerifier for FrameChallengeVerifier {
    async fn verify(
        &self,
        challenge: &Challenge,
        frames: &[String],
    ) -> Result<ChallengeVerification, ChallengeError> {
        if frames.len() != challenge.directions.len() {
            return Err(ChallengeError::FrameCount {
                expected: challenge.directions.len(),
                got: frames.len(),
            });
        }

        let mut checks = Vec::with_capacity(frames.len());
        for (requested, frame) in challenge.directions.iter().zip(frames) {
            let check = self.check(*requested, frame).await;
            tracing::debug!(
                requested = requested.as_str(),
                observed = ?check.observed,
                live = check.is_live,
                "challenge frame checked"
            );
            checks.push(check);
        }

        Ok(ChallengeVerification {
            challenge_id: challenge.id.clone(),
            passed: !checks.is_empty() && checks.iter().all(|c| c.direction_matched && c.is_live),
            checks,
        })
    }
}
