use crate::cache::{KeyValueCache, MemoryCache, SqliteCache};
use crate::challenge::{ChallengeError, ChallengeManager, ChallengeTicket, ChallengeVerification};
use crate::config::{Config, DetectorBackend};
use crate::fetch::{FetchPolicy, ImageFetcher};
use crate::response::ServiceResponse;
use crate::stats::{ProcessingStats, StatsSink, StatsSnapshot, TracingStatsSink};
use crate::store::BaseUrlFileStore;
use crate::verifier::FrameChallengeVerifier;
use faceproof_core::buffer::RegionError;
use faceproof_core::detector::{
    CascadeDetector, CnnDetector, DetectorError, HybridDetector, LandmarkDetector,
};
use faceproof_core::liveness::LivenessBreakdown;
use faceproof_core::loader::{decode_bytes, LoadError};
use faceproof_core::matching::MatchInput;
use faceproof_core::pose::PoseThresholds;
use faceproof_core::recognizer::{
    ArcFaceRecognizer, RecognizerError, SFaceRecognizer,
};
use faceproof_core::types::largest_face;
use faceproof_core::{
    quality, DetectedFace, DetectorKind, FaceDetector, FaceEmbedding, FailureReason, ImageBuffer,
    LivenessAnalyzer, LivenessThresholds, MatchThresholds, Recognizer, RecognizerKind,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{which}: {source}")]
    Image {
        which: &'static str,
        #[source]
        source: LoadError,
    },
    #[error("no face detected in {which}")]
    NoFace { which: &'static str },
    #[error("{which}: {source}")]
    Region {
        which: &'static str,
        #[source]
        source: RegionError,
    },
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("challenge error: {0}")]
    Challenge(#[from] ChallengeError),
    #[error("challenge verification is not configured")]
    ChallengesDisabled,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("worker task failed: {0}")]
    Worker(String),
    #[error("recognizer thread exited")]
    ChannelClosed,
    #[error("engine setup failed: {0}")]
    Setup(String),
}

impl EngineError {
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::Image { source, .. } => source.reason(),
            Self::NoFace { .. } => FailureReason::NoFaceDetected,
            Self::Detector(e) => e.reason(),
            Self::Recognizer(e) => e.reason(),
            Self::Challenge(e) => e.reason(),
            Self::Timeout(_) => FailureReason::Timeout,
            Self::ChannelClosed | Self::Setup(_) => FailureReason::ModelNotLoaded,
            Self::Region { .. } | Self::ChallengesDisabled | Self::Worker(_) => {
                FailureReason::ProcessingError
            }
        }
    }

    /// Message safe to show the caller. Per-image failures name the image.
    pub fn user_message(&self) -> String {
        match self {
            Self::Image { which, source } => format!("{which}: {}", source.reason().user_message()),
            Self::NoFace { which } => format!("no face detected in {which}"),
            Self::Challenge(ChallengeError::FrameCount { expected, got }) => {
                format!("expected {expected} frames, got {got}")
            }
            Self::ChallengesDisabled => self.to_string(),
            other => other.reason().user_message().to_string(),
        }
    }
}

struct EmbedRequest {
    jobs: Vec<(Arc<ImageBuffer>, DetectedFace)>,
    reply: oneshot::Sender<Result<Vec<FaceEmbedding>, RecognizerError>>,
}

/// Clone-safe handle to the recognizer thread. The recognizer is not
/// reentrant, so every embedding goes through this one thread in order.
#[derive(Clone)]
pub struct RecognizerHandle {
    tx: mpsc::Sender<EmbedRequest>,
    kind: RecognizerKind,
    dim: usize,
}

impl RecognizerHandle {
    pub fn spawn(mut recognizer: Box<dyn Recognizer>) -> Result<Self, EngineError> {
        let kind = recognizer.kind();
        let dim = recognizer.dim();
        let (tx, mut rx) = mpsc::channel::<EmbedRequest>(4);

        std::thread::Builder::new()
            .name("faceproof-recognizer".into())
            .spawn(move || {
                tracing::info!(recognizer = kind.as_str(), dim, "recognizer thread started");
                while let Some(EmbedRequest { jobs, reply }) = rx.blocking_recv() {
                    let result = jobs
                        .iter()
                        .map(|(image, face)| recognizer.embed(image, face))
                        .collect::<Result<Vec<_>, _>>();
                    let _ = reply.send(result);
                }
                tracing::info!("recognizer thread exiting");
            })
            .map_err(|e| EngineError::Setup(format!("spawn recognizer thread: {e}")))?;

        Ok(Self { tx, kind, dim })
    }

    pub fn kind(&self) -> RecognizerKind {
        self.kind
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Embed every `(image, face)` pair, in order, in one round trip.
    pub async fn embed(
        &self,
        jobs: Vec<(Arc<ImageBuffer>, DetectedFace)>,
    ) -> Result<Vec<FaceEmbedding>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EmbedRequest {
                jobs,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareOutcome {
    pub is_match: bool,
    /// Normalized to [0, 1].
    pub similarity: f32,
    /// Cosine similarity in [-1, 1].
    pub raw_similarity: f32,
    pub confidence: f32,
    pub threshold_used: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geometric_similarity: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hybrid_score: Option<f32>,
    pub quality: [f32; 2],
    /// Informational texture/edge/reflection check; never gates the match.
    pub quick_liveness: [bool; 2],
    pub face_counts: [usize; 2],
    pub detection_methods: [DetectorKind; 2],
    pub used_fallback: [bool; 2],
    pub recognizer: RecognizerKind,
    pub processing_time_ms: u64,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessOutcome {
    pub is_live: bool,
    pub liveness_score: f32,
    pub threshold_used: f32,
    pub confidence: f32,
    pub lenient: bool,
    pub quality_score: f32,
    pub analysis_breakdown: LivenessBreakdown,
    pub spoof_reasons: Vec<String>,
    pub face_count: usize,
    pub detection_method: DetectorKind,
    pub used_fallback: bool,
    pub processing_time_ms: u64,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub healthy: bool,
    pub version: String,
    pub models_loaded: bool,
    pub detector: String,
    pub recognizer: RecognizerKind,
    pub embedding_dim: usize,
    pub challenges_enabled: bool,
    pub stats: StatsSnapshot,
}

/// Tunables the engine needs beyond its loaded models.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub matching: MatchThresholds,
    pub liveness: LivenessThresholds,
    pub fetch: FetchPolicy,
    pub request_timeout: Option<Duration>,
}

impl EngineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            matching: config.matching.clone(),
            liveness: config.liveness.clone(),
            fetch: FetchPolicy {
                timeout: config.download_timeout(),
                max_bytes: config.max_download_bytes,
                allow_private_hosts: config.allow_private_hosts,
                ..FetchPolicy::default()
            },
            request_timeout: Some(config.request_timeout()),
        }
    }
}

/// One image after fetch, decode, detection and cropping.
struct PreparedImage {
    image: Arc<ImageBuffer>,
    region: ImageBuffer,
    face: DetectedFace,
    face_count: usize,
    method: DetectorKind,
    used_fallback: bool,
    quality: f32,
    quick_live: bool,
}

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Face comparison, liveness and challenge orchestration.
///
/// Models are loaded once at construction and shared by every request.
/// Detection runs on the blocking pool; embedding goes through the
/// recognizer thread.
pub struct Engine {
    detector: Arc<dyn FaceDetector>,
    detector_name: String,
    recognizer: RecognizerHandle,
    analyzer: Arc<LivenessAnalyzer>,
    matching: MatchThresholds,
    fetcher: ImageFetcher,
    request_timeout: Duration,
    stats: ProcessingStats,
    sink: Arc<dyn StatsSink>,
    challenges: Option<ChallengeManager>,
}

impl Engine {
    pub fn new(
        detector: Arc<dyn FaceDetector>,
        detector_name: impl Into<String>,
        recognizer: Box<dyn Recognizer>,
        options: EngineOptions,
    ) -> Result<Self, EngineError> {
        let fetcher =
            ImageFetcher::new(options.fetch).map_err(|e| EngineError::Setup(e.to_string()))?;
        Ok(Self {
            detector,
            detector_name: detector_name.into(),
            recognizer: RecognizerHandle::spawn(recognizer)?,
            analyzer: Arc::new(LivenessAnalyzer::new(options.liveness)),
            matching: options.matching,
            fetcher,
            request_timeout: options.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            stats: ProcessingStats::new(),
            sink: Arc::new(TracingStatsSink),
            challenges: None,
        })
    }

    /// Load every configured model and wire the challenge store.
    /// Fails fast if any model is missing.
    pub async fn from_config(config: &Config) -> Result<Self, EngineError> {
        let detector: Arc<dyn FaceDetector> = Arc::from(build_detector(config)?);
        tracing::info!(backend = config.detector.as_str(), "detector ready");

        let recognizer_path = config.recognizer_model_path();
        let recognizer: Box<dyn Recognizer> = match config.recognizer {
            RecognizerKind::ArcFace => Box::new(ArcFaceRecognizer::load(&recognizer_path)?),
            RecognizerKind::SFace => Box::new(SFaceRecognizer::load(&recognizer_path)?),
        };
        tracing::info!(path = %recognizer_path, recognizer = config.recognizer.as_str(), "recognizer loaded");

        let engine = Self::new(
            detector,
            config.detector.as_str(),
            recognizer,
            EngineOptions::from_config(config),
        )?;

        let cache: Arc<dyn KeyValueCache> = match &config.cache_path {
            Some(path) => {
                tracing::info!(path = %path.display(), "using sqlite challenge cache");
                Arc::new(
                    SqliteCache::open(path)
                        .await
                        .map_err(|e| EngineError::Setup(e.to_string()))?,
                )
            }
            None => Arc::new(MemoryCache::new()),
        };

        let verifier = Arc::new(engine.frame_verifier(config.pose.clone()));
        let mut challenges = ChallengeManager::new(
            cache,
            verifier,
            config.challenge_ttl(),
            config.challenge_directions,
        )
        .with_signed_url_ttl(Duration::from_secs(config.signed_url_ttl_secs));
        if let Some(base) = &config.file_store_url {
            let store = BaseUrlFileStore::new(base).map_err(|e| EngineError::Setup(e.to_string()))?;
            challenges = challenges.with_file_store(Arc::new(store));
        }

        Ok(engine.with_challenges(challenges))
    }

    pub fn with_challenges(mut self, challenges: ChallengeManager) -> Self {
        self.challenges = Some(challenges);
        self
    }

    pub fn with_stats_sink(mut self, sink: Arc<dyn StatsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// A challenge verifier sharing this engine's detector, analyzer and fetcher.
    pub fn frame_verifier(&self, pose: PoseThresholds) -> FrameChallengeVerifier {
        FrameChallengeVerifier::new(
            self.fetcher.clone(),
            self.detector.clone(),
            self.analyzer.clone(),
            pose,
        )
    }

    /// Compare the faces in two images.
    pub async fn compare_faces(
        &self,
        image1: &str,
        image2: &str,
        request_id: Option<&str>,
    ) -> ServiceResponse<CompareOutcome> {
        self.run("compare_faces", request_id, "faces compared", self.run_compare(image1, image2))
            .await
    }

    /// Single-frame liveness. `threshold` replaces the mode threshold.
    pub async fn check_liveness(
        &self,
        image: &str,
        lenient: bool,
        threshold: Option<f32>,
        request_id: Option<&str>,
    ) -> ServiceResponse<LivenessOutcome> {
        self.run(
            "check_liveness",
            request_id,
            "liveness checked",
            self.run_liveness(image, lenient, threshold),
        )
        .await
    }

    pub async fn generate_challenge(
        &self,
        request_id: Option<&str>,
    ) -> ServiceResponse<ChallengeTicket> {
        self.run("generate_challenge", request_id, "challenge issued", async {
            let manager = self.challenges.as_ref().ok_or(EngineError::ChallengesDisabled)?;
            let challenge = manager.generate().await?;
            Ok(ChallengeTicket::from(&challenge))
        })
        .await
    }

    pub async fn verify_challenge(
        &self,
        challenge_id: &str,
        frames: &[String],
        request_id: Option<&str>,
    ) -> ServiceResponse<ChallengeVerification> {
        self.run("verify_challenge", request_id, "challenge verified", async {
            let manager = self.challenges.as_ref().ok_or(EngineError::ChallengesDisabled)?;
            Ok(manager.verify(challenge_id, frames).await?)
        })
        .await
    }

    pub fn health(&self) -> Health {
        let running = self.recognizer.is_running();
        Health {
            healthy: running && !self.detector_name.is_empty(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            models_loaded: running,
            detector: self.detector_name.clone(),
            recognizer: self.recognizer.kind(),
            embedding_dim: self.recognizer.dim(),
            challenges_enabled: self.challenges.is_some(),
            stats: self.stats.snapshot(),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Timeout, span, stats and envelope shared by every operation.
    async fn run<T, F>(
        &self,
        operation: &'static str,
        request_id: Option<&str>,
        message: &str,
        work: F,
    ) -> ServiceResponse<T>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        let request_id = request_id_or_new(request_id);
        let span = tracing::info_span!("request", operation, request_id = %request_id);
        let started = Instant::now();

        let result = match tokio::time::timeout(self.request_timeout, work)
            .instrument(span.clone())
            .await
        {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(self.request_timeout)),
        };

        let elapsed = started.elapsed();
        self.stats.record(result.is_ok(), elapsed);
        self.sink.record(operation, result.is_ok(), elapsed);

        span.in_scope(|| match result {
            Ok(data) => ServiceResponse::ok(&request_id, message, data),
            Err(err) => {
                let reason = err.reason();
                if reason == FailureReason::ProcessingError || reason == FailureReason::ModelNotLoaded {
                    tracing::error!(error = %err, reason = reason.as_str(), "request failed");
                } else {
                    tracing::warn!(error = %err, reason = reason.as_str(), "request rejected");
                }
                ServiceResponse::fail(&request_id, &err)
            }
        })
    }

    async fn run_compare(&self, image1: &str, image2: &str) -> Result<CompareOutcome, EngineError> {
        let started = Instant::now();

        let (first, second) = tokio::join!(
            self.prepare(image1, "image 1", true),
            self.prepare(image2, "image 2", true),
        );
        let (first, second) = (first?, second?);

        let embeddings = self
            .recognizer
            .embed(vec![
                (first.image.clone(), first.face.clone()),
                (second.image.clone(), second.face.clone()),
            ])
            .await?;
        let [e1, e2]: [FaceEmbedding; 2] = embeddings
            .try_into()
            .map_err(|_| EngineError::Worker("recognizer returned the wrong number of embeddings".into()))?;

        let decision = self.matching.decide(&MatchInput {
            cosine: e1.similarity(&e2),
            base_threshold: self.recognizer.kind().baseline_threshold(),
            quality: [first.quality, second.quality],
            face_counts: [first.face_count, second.face_count],
            faces: [&first.face, &second.face],
        });

        let warnings = [("image 1", &first), ("image 2", &second)]
            .iter()
            .filter(|(_, p)| p.face_count > 1)
            .map(|(which, p)| {
                format!("{} faces detected in {which}; using the largest", p.face_count)
            })
            .collect();

        tracing::info!(
            is_match = decision.is_match,
            similarity = decision.similarity,
            threshold = decision.threshold_used,
            "faces compared"
        );

        Ok(CompareOutcome {
            is_match: decision.is_match,
            similarity: decision.similarity,
            raw_similarity: decision.raw_similarity,
            confidence: decision.confidence,
            threshold_used: decision.threshold_used,
            geometric_similarity: decision.geometric_similarity,
            hybrid_score: decision.hybrid_score,
            quality: [first.quality, second.quality],
            quick_liveness: [first.quick_live, second.quick_live],
            face_counts: [first.face_count, second.face_count],
            detection_methods: [first.method, second.method],
            used_fallback: [first.used_fallback, second.used_fallback],
            recognizer: self.recognizer.kind(),
            processing_time_ms: elapsed_ms(started),
            warnings,
        })
    }

    async fn run_liveness(
        &self,
        image: &str,
        lenient: bool,
        threshold: Option<f32>,
    ) -> Result<LivenessOutcome, EngineError> {
        let started = Instant::now();
        let prepared = self.prepare(image, "image", false).await?;

        let analyzer = self.analyzer.clone();
        let full = prepared.image.clone();
        let region = prepared.region;
        let report = tokio::task::spawn_blocking(move || analyzer.analyze(&region, &full))
            .await
            .map_err(|e| EngineError::Worker(e.to_string()))?;
        let verdict = self.analyzer.decide(&report, lenient, threshold);

        tracing::info!(
            is_live = verdict.is_live,
            score = report.score,
            threshold = verdict.threshold_used,
            spoof_reasons = report.spoof_reasons.len(),
            "liveness checked"
        );

        let mut warnings = Vec::new();
        if prepared.face_count > 1 {
            warnings.push(format!(
                "{} faces detected; using the largest",
                prepared.face_count
            ));
        }

        Ok(LivenessOutcome {
            is_live: verdict.is_live,
            liveness_score: report.score,
            threshold_used: verdict.threshold_used,
            confidence: verdict.confidence,
            lenient,
            quality_score: prepared.quality,
            analysis_breakdown: report.breakdown,
            spoof_reasons: report.spoof_reasons,
            face_count: prepared.face_count,
            detection_method: prepared.method,
            used_fallback: prepared.used_fallback,
            processing_time_ms: elapsed_ms(started),
            warnings,
        })
    }

    /// Fetch, then decode, detect and crop on the blocking pool.
    async fn prepare(
        &self,
        input: &str,
        which: &'static str,
        quick_check: bool,
    ) -> Result<PreparedImage, EngineError> {
        let bytes = self
            .fetcher
            .fetch(input)
            .await
            .map_err(|source| EngineError::Image { which, source })?;

        let detector = self.detector.clone();
        let analyzer = self.analyzer.clone();
        tokio::task::spawn_blocking(move || {
            prepare_blocking(&bytes, detector.as_ref(), &analyzer, which, quick_check)
        })
        .await
        .map_err(|e| EngineError::Worker(e.to_string()))?
    }
}

fn prepare_blocking(
    bytes: &[u8],
    detector: &dyn FaceDetector,
    analyzer: &LivenessAnalyzer,
    which: &'static str,
    quick_check: bool,
) -> Result<PreparedImage, EngineError> {
    let image = decode_bytes(bytes).map_err(|source| EngineError::Image { which, source })?;
    let detections = detector.detect(&image)?;
    let face = largest_face(&detections.faces)
        .cloned()
        .ok_or(EngineError::NoFace { which })?;

    let quality = quality::score(&image, &detections.faces);
    let region = image
        .crop(&face)
        .map_err(|source| EngineError::Region { which, source })?;
    let quick_live = quick_check && analyzer.quick_check(&region);

    tracing::debug!(
        which,
        faces = detections.faces.len(),
        method = detections.method.as_str(),
        fallback = detections.used_fallback,
        quality,
        "image prepared"
    );

    Ok(PreparedImage {
        image: Arc::new(image),
        region,
        face,
        face_count: detections.faces.len(),
        method: detections.method,
        used_fallback: detections.used_fallback,
        quality,
        quick_live,
    })
}

fn build_detector(config: &Config) -> Result<Box<dyn FaceDetector>, DetectorError> {
    match config.detector {
        DetectorBackend::Cascade => load_detector(config, DetectorKind::Cascade),
        DetectorBackend::Cnn => load_detector(config, DetectorKind::Cnn),
        DetectorBackend::Landmark => load_detector(config, DetectorKind::Landmark),
        DetectorBackend::Hybrid => Ok(Box::new(HybridDetector::new(
            load_detector(config, config.hybrid.preferred)?,
            load_detector(config, config.hybrid.secondary)?,
            config.hybrid.fallback,
        ))),
    }
}

fn load_detector(config: &Config, kind: DetectorKind) -> Result<Box<dyn FaceDetector>, DetectorError> {
    let path = config.detector_model_path(kind);
    let detector: Box<dyn FaceDetector> = match kind {
        DetectorKind::Cascade => Box::new(CascadeDetector::load(&path)?),
        DetectorKind::Cnn => Box::new(CnnDetector::load(&path)?),
        DetectorKind::Landmark => Box::new(LandmarkDetector::load(&path)?),
    };
    tracing::info!(path = %path, backend = kind.as_str(), "detector model loaded");
    Ok(detector)
}

fn request_id_or_new(id: Option<&str>) -> String {
    match id.map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => uuid::Uuid::new_v4().to_string(),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_kept_or_generated() {
        assert_eq!(request_id_or_new(Some("abc")), "abc");
        let generated = request_id_or_new(Some("  "));
        assert!(uuid::Uuid::parse_str(&generated).is_ok());
        assert_ne!(request_id_or_new(None), request_id_or_new(None));
    }

    #[test]
    fn test_error_reasons() {
        let err = EngineError::Image {
            which: "image 2",
            source: LoadError::InvalidDataUrl,
        };
        assert_eq!(err.reason(), FailureReason::Validation);
        assert!(err.user_message().starts_with("image 2: "));

        assert_eq!(
            EngineError::Timeout(Duration::from_secs(1)).reason(),
            FailureReason::Timeout
        );
        assert_eq!(EngineError::ChannelClosed.reason(), FailureReason::ModelNotLoaded);
        assert_eq!(
            EngineError::Challenge(ChallengeError::Expired("x".into())).reason(),
            FailureReason::ChallengeExpired
        );
    }

    #[test]
    fn test_missing_models_fail_fast() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            model_dir: dir.path().to_path_buf(),
            detector: DetectorBackend::Landmark,
            ..Config::default()
        };
        assert!(matches!(build_detector(&config), Err(DetectorError::ModelNotFound(_))));
    }
}
