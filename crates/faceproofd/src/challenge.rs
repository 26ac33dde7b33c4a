//! Head-turn challenge/response flow for video liveness.
//!
//! A challenge is a random ordered subset of {up, down, left, right} with a
//! TTL, kept in a [`KeyValueCache`]. Verification is single use and is
//! delegated to a [`ChallengeVerifier`] once the challenge is claimed.

use crate::cache::{CacheError, KeyValueCache};
use crate::store::{FileStore, Permission, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use faceproof_core::loader::ImageSource;
use faceproof_core::{FailureReason, HeadDirection};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const KEY_PREFIX: &str = "faceproof:challenge:";

/// Extra cache lifetime past expiry, so late verifications report
/// "expired" rather than "not found".
const EXPIRY_GRACE: Duration = Duration::from_secs(60);

/// Longest challenge lifetime accepted by configuration.
pub const MAX_CHALLENGE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Error, Debug)]
pub enum ChallengeError {
    #[error("challenge {0} not found")]
    NotFound(String),
    #[error("challenge {0} expired")]
    Expired(String),
    #[error("challenge {0} already used")]
    AlreadyUsed(String),
    #[error("expected {expected} frames, got {got}")]
    FrameCount { expected: usize, got: usize },
    #[error("frame {index} cannot be resolved: {detail}")]
    UnresolvableFrame { index: usize, detail: String },
    #[error("cache: {0}")]
    Cache(#[from] CacheError),
    #[error("file store: {0}")]
    Store(#[from] StoreError),
    #[error("stored challenge is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("verifier: {0}")]
    Verifier(String),
}

impl ChallengeError {
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::NotFound(_) => FailureReason::ChallengeNotFound,
            Self::Expired(_) => FailureReason::ChallengeExpired,
            Self::AlreadyUsed(_) => FailureReason::ChallengeAlreadyUsed,
            Self::FrameCount { .. } | Self::UnresolvableFrame { .. } => FailureReason::Validation,
            Self::Cache(_) | Self::Store(_) | Self::Corrupt(_) | Self::Verifier(_) => {
                FailureReason::ProcessingError
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub id: String,
    pub directions: Vec<HeadDirection>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

impl Challenge {
    pub fn new(directions: Vec<HeadDirection>, ttl: Duration) -> Self {
        let created_at = Utc::now();
        let ttl = chrono::Duration::milliseconds(ttl.min(MAX_CHALLENGE_TTL).as_millis() as i64);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            directions,
            created_at,
            expires_at: created_at + ttl,
            used: false,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn cache_key(id: &str) -> String {
        format!("{KEY_PREFIX}{id}")
    }

    /// Cache TTL for this entry as of `now`, including the grace period.
    fn cache_ttl(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO) + EXPIRY_GRACE
    }
}

/// What the caller receives when a challenge is issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeTicket {
    pub challenge_id: String,
    pub directions: Vec<HeadDirection>,
    pub ttl_seconds: u64,
    pub expires_at: DateTime<Utc>,
}

impl From<&Challenge> for ChallengeTicket {
    fn from(c: &Challenge) -> Self {
        Self {
            challenge_id: c.id.clone(),
            directions: c.directions.clone(),
            ttl_seconds: (c.expires_at - c.created_at).num_seconds().max(0) as u64,
            expires_at: c.expires_at,
        }
    }
}

/// Per-direction outcome of a verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectionCheck {
    pub requested: HeadDirection,
    /// `None` when the frame had no usable landmarks.
    pub observed: Option<HeadDirection>,
    pub direction_matched: bool,
    pub is_live: bool,
    pub liveness_score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeVerification {
    pub challenge_id: String,
    pub passed: bool,
    pub checks: Vec<DirectionCheck>,
}

/// Decides whether the supplied frames satisfy a claimed challenge.
/// `frames[i]` answers `challenge.directions[i]`; every frame is a URL or
/// inline image by the time it gets here.
#[async_trait]
pub trait ChallengeVerifier: Send + Sync {
    async fn verify(
        &self,
        challenge: &Challenge,
        frames: &[String],
    ) -> Result<ChallengeVerification, ChallengeError>;
}

/// Random ordered subset of the four challenge directions.
pub fn random_directions<R: Rng + ?Sized>(count: usize, rng: &mut R) -> Vec<HeadDirection> {
    let mut directions = HeadDirection::CHALLENGE.to_vec();
    directions.shuffle(rng);
    directions.truncate(count.clamp(1, HeadDirection::CHALLENGE.len()));
    directions
}

pub struct ChallengeManager {
    cache: Arc<dyn KeyValueCache>,
    verifier: Arc<dyn ChallengeVerifier>,
    files: Option<Arc<dyn FileStore>>,
    ttl: Duration,
    direction_count: usize,
    signed_url_ttl: Duration,
    /// Serializes claim (read + mark used) within this process.
    claim: tokio::sync::Mutex<()>,
}

impl ChallengeManager {
    pub fn new(
        cache: Arc<dyn KeyValueCache>,
        verifier: Arc<dyn ChallengeVerifier>,
        ttl: Duration,
        direction_count: usize,
    ) -> Self {
        Self {
            cache,
            verifier,
            files: None,
            ttl,
            direction_count,
            signed_url_ttl: Duration::from_secs(300),
            claim: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_file_store(mut self, files: Arc<dyn FileStore>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn with_signed_url_ttl(mut self, ttl: Duration) -> Self {
        self.signed_url_ttl = ttl;
        self
    }

    pub async fn generate(&self) -> Result<Challenge, ChallengeError> {
        let directions = random_directions(self.direction_count, &mut rand::thread_rng());
        let challenge = Challenge::new(directions, self.ttl);

        let value = serde_json::to_string(&challenge)?;
        self.cache
            .set(
                &Challenge::cache_key(&challenge.id),
                &value,
                challenge.cache_ttl(challenge.created_at),
            )
            .await?;

        tracing::info!(
            challenge_id = %challenge.id,
            directions = ?challenge.directions,
            "challenge issued"
        );
        Ok(challenge)
    }

    /// Claim the challenge (single use) and hand it to the verifier.
    ///
    /// A frame-count mismatch is rejected before the challenge is claimed.
    pub async fn verify(
        &self,
        id: &str,
        frames: &[String],
    ) -> Result<ChallengeVerification, ChallengeError> {
        let challenge = self.claim(id, frames.len()).await?;
        let resolved = self.resolve_frames(frames).await?;
        let verification = self.verifier.verify(&challenge, &resolved).await?;

        tracing::info!(
            challenge_id = %challenge.id,
            passed = verification.passed,
            "challenge verified"
        );
        Ok(verification)
    }

    async fn claim(&self, id: &str, frame_count: usize) -> Result<Challenge, ChallengeError> {
        let key = Challenge::cache_key(id);
        let _guard = self.claim.lock().await;

        let raw = self
            .cache
            .get(&key)
            .await?
            .ok_or_else(|| ChallengeError::NotFound(id.to_string()))?;
        let mut challenge: Challenge = serde_json::from_str(&raw)?;

        let now = Utc::now();
        if challenge.is_expired_at(now) {
            self.cache.delete(&key).await?;
            return Err(ChallengeError::Expired(id.to_string()));
        }
        if challenge.used {
            return Err(ChallengeError::AlreadyUsed(id.to_string()));
        }
        if frame_count != challenge.directions.len() {
            return Err(ChallengeError::FrameCount {
                expected: challenge.directions.len(),
                got: frame_count,
            });
        }

        challenge.used = true;
        self.cache
            .set(&key, &serde_json::to_string(&challenge)?, challenge.cache_ttl(now))
            .await?;
        Ok(challenge)
    }

    /// URLs and inline images pass through; anything else is a storage
    /// path that must be signed by the file store.
    async fn resolve_frames(&self, frames: &[String]) -> Result<Vec<String>, ChallengeError> {
        let mut resolved = Vec::with_capacity(frames.len());
        for (index, frame) in frames.iter().enumerate() {
            let trimmed = frame.trim();
            let is_direct = trimmed.starts_with("data:")
                || matches!(ImageSource::classify(trimmed), Ok(ImageSource::Url(_)));
            if is_direct {
                resolved.push(trimmed.to_string());
                continue;
            }
            let files = self.files.as_ref().ok_or_else(|| ChallengeError::UnresolvableFrame {
                index,
                detail: "not a URL and no file store is configured".into(),
            })?;
            resolved.push(
                files
                    .signed_url(trimmed, Permission::Read, self.signed_url_ttl)
                    .await?,
            );
        }
        Ok(resolved)
    }
}
