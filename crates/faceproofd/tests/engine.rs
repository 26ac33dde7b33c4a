use base64::Engine as _;
use faceproof_core::detector::DetectorError;
use faceproof_core::recognizer::RecognizerError;
use faceproof_core::{
    DetectedFace, Detections, DetectorKind, FaceDetector, FaceEmbedding, FailureReason,
    ImageBuffer, MatchThresholds, Recognizer, RecognizerKind,
};
use faceproofd::cache::MemoryCache;
use faceproofd::challenge::ChallengeManager;
use faceproofd::{Engine, EngineOptions};
use image::{Rgb, RgbImage};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

/// Reports `count` frontal faces; the first is centered and largest.
struct FixedDetector {
    count: usize,
    delay: Duration,
}

impl FixedDetector {
    fn faces(count: usize) -> Self {
        Self {
            count,
            delay: Duration::ZERO,
        }
    }
}

impl FaceDetector for FixedDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Landmark
    }

    fn detect(&self, image: &ImageBuffer) -> Result<Detections, DetectorError> {
        std::thread::sleep(self.delay);
        let (w, h) = (image.width() as f32, image.height() as f32);
        let faces = (0..self.count)
            .map(|i| {
                let size = w / (2.0 + i as f32 * 2.0);
                let x = if i == 0 { w / 4.0 } else { 4.0 };
                let y = if i == 0 { h / 4.0 } else { 4.0 };
                let mut face = DetectedFace::new(x, y, size, size, 0.95 - i as f32 * 0.1);
                face.landmarks = Some([
                    (x + 0.3 * size, y + 0.35 * size),
                    (x + 0.7 * size, y + 0.35 * size),
                    (x + 0.5 * size, y + 0.55 * size),
                    (x + 0.35 * size, y + 0.75 * size),
                    (x + 0.65 * size, y + 0.75 * size),
                ]);
                face
            })
            .collect();
        Ok(Detections::new(
            faces,
            DetectorKind::Landmark,
            image.width(),
            image.height(),
        ))
    }
}

/// Embeds a face as its 16-bin gray histogram.
struct HistogramRecognizer;

impl Recognizer for HistogramRecognizer {
    fn kind(&self) -> RecognizerKind {
        RecognizerKind::ArcFace
    }

    fn dim(&self) -> usize {
        16
    }

    fn embed(
        &mut self,
        image: &ImageBuffer,
        face: &DetectedFace,
    ) -> Result<FaceEmbedding, RecognizerError> {
        let region = image.crop(face)?;
        let mut bins = vec![0f32; 16];
        for p in region.to_gray().pixels() {
            bins[p.0[0] as usize / 16] += 1.0;
        }
        Ok(FaceEmbedding::normalized(bins, "histogram"))
    }
}

fn textured(seed: u32) -> RgbImage {
    RgbImage::from_fn(256, 256, |x, y| {
        let v = ((x * 31 + y * 17 + seed) ^ (x * y)) % 256;
        let v = v as u8;
        Rgb([v, v.wrapping_add(20), v.wrapping_sub(15)])
    })
}

fn flat(value: u8) -> RgbImage {
    RgbImage::from_pixel(256, 256, Rgb([value, value, value]))
}

fn data_url(img: &RgbImage) -> String {
    let mut png = Vec::new();
    img.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .unwrap();
    format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(png)
    )
}

fn options() -> EngineOptions {
    EngineOptions {
        matching: MatchThresholds {
            base_threshold: Some(0.6),
            ..MatchThresholds::default()
        },
        ..EngineOptions::default()
    }
}

fn engine_with(detector: FixedDetector, options: EngineOptions) -> Engine {
    Engine::new(
        Arc::new(detector),
        "landmark",
        Box::new(HistogramRecognizer),
        options,
    )
    .unwrap()
}

fn engine() -> Engine {
    engine_with(FixedDetector::faces(1), options())
}

#[tokio::test]
async fn test_self_match() {
    let engine = engine();
    let image = data_url(&textured(0));
    let resp = engine.compare_faces(&image, &image, Some("req-7")).await;

    assert!(resp.success, "{}", resp.message);
    assert_eq!(resp.request_id, "req-7");
    let data = resp.data.unwrap();
    assert!(data.is_match);
    assert!(data.similarity >= 0.99);
    assert_eq!(data.face_counts, [1, 1]);
    assert_eq!(data.recognizer, RecognizerKind::ArcFace);
    assert!(data.warnings.is_empty());
}

#[tokio::test]
async fn test_compare_is_symmetric() {
    let engine = engine();
    let a = data_url(&textured(0));
    let b = data_url(&textured(90));

    let ab = engine.compare_faces(&a, &b, None).await.data.unwrap();
    let ba = engine.compare_faces(&b, &a, None).await.data.unwrap();
    assert_eq!(ab.similarity, ba.similarity);
    assert_eq!(ab.threshold_used, ba.threshold_used);
    assert_eq!(ab.is_match, ba.is_match);
}

#[tokio::test]
async fn test_no_face_names_the_image() {
    let engine = engine_with(FixedDetector::faces(0), options());
    let image = data_url(&textured(0));
    let resp = engine.compare_faces(&image, &image, None).await;

    assert!(!resp.success);
    assert_eq!(resp.failure_reason, Some(FailureReason::NoFaceDetected));
    assert!(resp.message.contains("image 1"));
    assert!(resp.data.is_none());
}

#[tokio::test]
async fn test_malformed_base64_is_validation_error() {
    let engine = engine();
    let good = data_url(&textured(0));
    let bad = format!("data:image/png;base64,{}", "!!!!".repeat(40));
    let resp = engine.compare_faces(&good, &bad, None).await;

    assert!(!resp.success);
    assert_eq!(resp.failure_reason, Some(FailureReason::Validation));
    assert!(resp.message.starts_with("image 2"));
}

#[tokio::test]
async fn test_multiple_faces_warn() {
    let engine = engine_with(FixedDetector::faces(2), options());
    let image = data_url(&textured(3));
    let data = engine.compare_faces(&image, &image, None).await.data.unwrap();
    assert_eq!(data.face_counts, [2, 2]);
    assert_eq!(data.warnings.len(), 2);
}

#[tokio::test]
async fn test_flat_image_is_not_live() {
    let engine = engine();
    let resp = engine
        .check_liveness(&data_url(&flat(128)), false, None, None)
        .await;

    assert!(resp.success, "{}", resp.message);
    let data = resp.data.unwrap();
    assert!(!data.is_live);
    assert!((0.0..=1.0).contains(&data.liveness_score));
    assert!((data.threshold_used - 0.495).abs() < 1e-6);
}

#[tokio::test]
async fn test_extreme_images_stay_finite() {
    let engine = engine();
    for value in [0u8, 255] {
        let data = engine
            .check_liveness(&data_url(&flat(value)), true, None, None)
            .await
            .data
            .unwrap();
        assert!(data.liveness_score.is_finite());
        assert!(data.confidence.is_finite());
        let breakdown = serde_json::to_value(data.analysis_breakdown).unwrap();
        for (name, v) in breakdown.as_object().unwrap() {
            let v = v.as_f64().unwrap();
            assert!(v.is_finite() && (0.0..=1.0).contains(&v), "{name} = {v}");
        }
    }
}

#[tokio::test]
async fn test_threshold_override() {
    let engine = engine();
    let data = engine
        .check_liveness(&data_url(&textured(5)), true, Some(0.8), None)
        .await
        .data
        .unwrap();
    assert!((data.threshold_used - 0.795).abs() < 1e-6);
    assert!(data.lenient);
}

#[tokio::test]
async fn test_stats_count_every_request() {
    let engine = engine();
    let image = data_url(&textured(0));
    engine.compare_faces(&image, &image, None).await;
    engine.check_liveness(&image, false, None, None).await;
    engine.check_liveness("not-an-image", false, None, None).await;

    let stats = engine.stats();
    assert_eq!(stats.total_requests, 3);
    assert_eq!(stats.successful_requests, 2);
    assert_eq!(stats.failed_requests, 1);
}

#[tokio::test]
async fn test_timeout() {
    let detector = FixedDetector {
        count: 1,
        delay: Duration::from_millis(300),
    };
    let engine = engine_with(
        detector,
        EngineOptions {
            request_timeout: Some(Duration::from_millis(50)),
            ..options()
        },
    );
    let resp = engine
        .check_liveness(&data_url(&textured(0)), false, None, None)
        .await;
    assert_eq!(resp.failure_reason, Some(FailureReason::Timeout));
}

#[tokio::test]
async fn test_challenges_disabled() {
    let resp = engine().generate_challenge(None).await;
    assert!(!resp.success);
    assert_eq!(resp.failure_reason, Some(FailureReason::ProcessingError));
}

#[tokio::test]
async fn test_challenge_lifecycle() {
    let engine = engine();
    let verifier = Arc::new(engine.frame_verifier(Default::default()));
    let manager = ChallengeManager::new(
        Arc::new(MemoryCache::new()),
        verifier,
        Duration::from_secs(300),
        2,
    );
    let engine = engine.with_challenges(manager);

    let ticket = engine.generate_challenge(None).await.data.unwrap();
    assert_eq!(ticket.directions.len(), 2);
    assert_eq!(ticket.ttl_seconds, 300);

    let frame = data_url(&textured(0));
    let short = engine
        .verify_challenge(&ticket.challenge_id, &[frame.clone()], None)
        .await;
    assert_eq!(short.failure_reason, Some(FailureReason::Validation));

    let frames = vec![frame.clone(), frame.clone()];
    let result = engine
        .verify_challenge(&ticket.challenge_id, &frames, None)
        .await
        .data
        .unwrap();
    // Frontal frames never satisfy a head-turn request.
    assert!(!result.passed);
    assert_eq!(result.checks.len(), 2);
    assert!(result.checks.iter().all(|c| !c.direction_matched));

    let again = engine
        .verify_challenge(&ticket.challenge_id, &frames, None)
        .await;
    assert_eq!(again.failure_reason, Some(FailureReason::ChallengeAlreadyUsed));

    let unknown = engine.verify_challenge("nope", &frames, None).await;
    assert_eq!(unknown.failure_reason, Some(FailureReason::ChallengeNotFound));
}

#[tokio::test]
async fn test_health() {
    let health = engine().health();
    assert!(health.healthy);
    assert!(health.models_loaded);
    assert_eq!(health.embedding_dim, 16);
    assert!(!health.challenges_enabled);
    assert_eq!(health.stats.total_requests, 0);
}

#[tokio::test]
async fn test_health_needs_detector_backend() {
    let engine = Engine::new(
        Arc::new(FixedDetector::faces(1)),
        "",
        Box::new(HistogramRecognizer),
        options(),
    )
    .unwrap();
    let health = engine.health();
    assert!(health.models_loaded);
    assert!(!health.healthy);
}

#[tokio::test]
async fn test_envelope_json() {
    let engine = engine();
    let json = engine
        .compare_faces("", "", Some("r"))
        .await
        .to_json();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["success"], false);
    assert_eq!(value["failureReason"], "validation");
    assert_eq!(value["requestId"], "r");
}
