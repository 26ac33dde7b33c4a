use crate::challenge::MAX_CHALLENGE_TTL;
use faceproof_core::detector::DetectorKind;
use faceproof_core::liveness::LivenessThresholds;
use faceproof_core::matching::MatchThresholds;
use faceproof_core::pose::PoseThresholds;
use faceproof_core::recognizer::RecognizerKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Detection backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorBackend {
    Cascade,
    Cnn,
    Landmark,
    Hybrid,
}

impl DetectorBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cascade => "cascade",
            Self::Cnn => "cnn",
            Self::Landmark => "landmark",
            Self::Hybrid => "hybrid",
        }
    }
}

impl FromStr for DetectorBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cascade" => Ok(Self::Cascade),
            "cnn" => Ok(Self::Cnn),
            "landmark" => Ok(Self::Landmark),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(ConfigError::Invalid(format!("unknown detector backend {other:?}"))),
        }
    }
}

fn parse_detector_kind(s: &str) -> Result<DetectorKind, ConfigError> {
    match DetectorBackend::from_str(s)? {
        DetectorBackend::Cascade => Ok(DetectorKind::Cascade),
        DetectorBackend::Cnn => Ok(DetectorKind::Cnn),
        DetectorBackend::Landmark => Ok(DetectorKind::Landmark),
        DetectorBackend::Hybrid => Err(ConfigError::Invalid(
            "a hybrid detector cannot wrap another hybrid".into(),
        )),
    }
}

fn parse_recognizer_kind(s: &str) -> Result<RecognizerKind, ConfigError> {
    match s.trim().to_ascii_lowercase().as_str() {
        "arcface" => Ok(RecognizerKind::ArcFace),
        "sface" => Ok(RecognizerKind::SFace),
        other => Err(ConfigError::Invalid(format!("unknown recognizer {other:?}"))),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    pub preferred: DetectorKind,
    pub secondary: DetectorKind,
    pub fallback: bool,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            preferred: DetectorKind::Landmark,
            secondary: DetectorKind::Cascade,
            fallback: true,
        }
    }
}

/// Model filenames, resolved against `model_dir`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelFiles {
    pub cascade: String,
    pub cnn: String,
    pub landmark: String,
    pub arcface: String,
    pub sface: String,
}

impl Default for ModelFiles {
    fn default() -> Self {
        Self {
            cascade: "seeta_fd_frontal_v1.0.bin".into(),
            cnn: "version-RFB-320.onnx".into(),
            landmark: "det_10g.onnx".into(),
            arcface: "w600k_r50.onnx".into(),
            sface: "face_recognition_sface.onnx".into(),
        }
    }
}

/// Daemon configuration: defaults, then an optional TOML file named by
/// `FACEPROOF_CONFIG`, then `FACEPROOF_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing model files.
    pub model_dir: PathBuf,
    pub models: ModelFiles,
    pub detector: DetectorBackend,
    pub hybrid: HybridConfig,
    pub recognizer: RecognizerKind,
    /// Upper bound for a whole compare/liveness call.
    pub request_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub max_download_bytes: usize,
    /// Permit downloads from loopback/private hosts (development only).
    pub allow_private_hosts: bool,
    pub challenge_ttl_secs: u64,
    /// Directions per challenge, 1–4.
    pub challenge_directions: usize,
    /// SQLite file for challenge state; in-memory when unset.
    pub cache_path: Option<PathBuf>,
    /// Base URL used to sign storage paths in challenge frames.
    pub file_store_url: Option<String>,
    pub signed_url_ttl_secs: u64,
    pub matching: MatchThresholds,
    pub liveness: LivenessThresholds,
    pub pose: PoseThresholds,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            models: ModelFiles::default(),
            detector: DetectorBackend::Hybrid,
            hybrid: HybridConfig::default(),
            recognizer: RecognizerKind::ArcFace,
            request_timeout_secs: 60,
            download_timeout_secs: 30,
            max_download_bytes: faceproof_core::loader::MAX_IMAGE_BYTES,
            allow_private_hosts: false,
            challenge_ttl_secs: 300,
            challenge_directions: 3,
            cache_path: None,
            file_store_url: None,
            signed_url_ttl_secs: 300,
            matching: MatchThresholds::default(),
            liveness: LivenessThresholds::default(),
            pose: PoseThresholds::default(),
        }
    }
}

impl Config {
    /// Load from `FACEPROOF_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("FACEPROOF_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    /// Apply `FACEPROOF_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(dir) = lookup("FACEPROOF_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(v) = lookup("FACEPROOF_DETECTOR") {
            self.detector = v.parse()?;
        }
        if let Some(v) = lookup("FACEPROOF_HYBRID_PREFERRED") {
            self.hybrid.preferred = parse_detector_kind(&v)?;
        }
        if let Some(v) = lookup("FACEPROOF_HYBRID_SECONDARY") {
            self.hybrid.secondary = parse_detector_kind(&v)?;
        }
        if let Some(v) = lookup("FACEPROOF_HYBRID_FALLBACK") {
            self.hybrid.fallback = v != "0";
        }
        if let Some(v) = lookup("FACEPROOF_RECOGNIZER") {
            self.recognizer = parse_recognizer_kind(&v)?;
        }

        self.request_timeout_secs =
            env_u64(&lookup, "FACEPROOF_REQUEST_TIMEOUT_SECS", self.request_timeout_secs);
        self.download_timeout_secs =
            env_u64(&lookup, "FACEPROOF_DOWNLOAD_TIMEOUT_SECS", self.download_timeout_secs);
        self.max_download_bytes =
            env_usize(&lookup, "FACEPROOF_MAX_DOWNLOAD_BYTES", self.max_download_bytes);
        if let Some(v) = lookup("FACEPROOF_ALLOW_PRIVATE_HOSTS") {
            self.allow_private_hosts = v == "1";
        }
        self.challenge_ttl_secs =
            env_u64(&lookup, "FACEPROOF_CHALLENGE_TTL_SECS", self.challenge_ttl_secs);
        self.challenge_directions =
            env_usize(&lookup, "FACEPROOF_CHALLENGE_DIRECTIONS", self.challenge_directions);
        if let Some(path) = lookup("FACEPROOF_CACHE_PATH") {
            self.cache_path = Some(PathBuf::from(path));
        }
        if let Some(url) = lookup("FACEPROOF_FILE_STORE_URL") {
            self.file_store_url = Some(url);
        }

        if let Some(t) = lookup("FACEPROOF_MATCH_THRESHOLD").and_then(|v| v.parse().ok()) {
            self.matching.base_threshold = Some(t);
        }
        self.liveness.normal = env_f32(&lookup, "FACEPROOF_LIVENESS_THRESHOLD", self.liveness.normal);
        self.liveness.lenient =
            env_f32(&lookup, "FACEPROOF_LIVENESS_LENIENT_THRESHOLD", self.liveness.lenient);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=4).contains(&self.challenge_directions) {
            return Err(ConfigError::Invalid(format!(
                "challenge_directions must be 1-4, got {}",
                self.challenge_directions
            )));
        }
        if self.challenge_ttl_secs == 0 || self.challenge_ttl() > MAX_CHALLENGE_TTL {
            return Err(ConfigError::Invalid(format!(
                "challenge_ttl_secs must be 1-{}, got {}",
                MAX_CHALLENGE_TTL.as_secs(),
                self.challenge_ttl_secs
            )));
        }
        if self.request_timeout_secs == 0 || self.download_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        if self.detector == DetectorBackend::Hybrid && self.hybrid.preferred == self.hybrid.secondary {
            return Err(ConfigError::Invalid(
                "hybrid preferred and secondary detectors must differ".into(),
            ));
        }
        for (name, t) in [
            ("liveness.normal", self.liveness.normal),
            ("liveness.lenient", self.liveness.lenient),
        ] {
            if !(0.0..=1.0).contains(&t) {
                return Err(ConfigError::Invalid(format!("{name} must be within [0, 1]")));
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn challenge_ttl(&self) -> Duration {
        Duration::from_secs(self.challenge_ttl_secs)
    }

    pub fn detector_model_path(&self, kind: DetectorKind) -> String {
        let file = match kind {
            DetectorKind::Cascade => &self.models.cascade,
            DetectorKind::Cnn => &self.models.cnn,
            DetectorKind::Landmark => &self.models.landmark,
        };
        self.model_path(file)
    }

    pub fn recognizer_model_path(&self) -> String {
        let file = match self.recognizer {
            RecognizerKind::ArcFace => &self.models.arcface,
            RecognizerKind::SFace => &self.models.sface,
        };
        self.model_path(file)
    }

    fn model_path(&self, file: &str) -> String {
        self.model_dir.join(file).to_string_lossy().into_owned()
    }
}

fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("faceproof/models")
}

fn env_f32(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
        assert_eq!(config.challenge_directions, 3);
        assert!(config.recognizer_model_path().ends_with("w600k_r50.onnx"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(lookup(&[
                ("FACEPROOF_MODEL_DIR", "/opt/models"),
                ("FACEPROOF_DETECTOR", "cnn"),
                ("FACEPROOF_RECOGNIZER", "sface"),
                ("FACEPROOF_REQUEST_TIMEOUT_SECS", "15"),
                ("FACEPROOF_CHALLENGE_DIRECTIONS", "4"),
                ("FACEPROOF_MATCH_THRESHOLD", "0.8"),
                ("FACEPROOF_HYBRID_FALLBACK", "0"),
            ]))
            .unwrap();
        assert_eq!(config.detector, DetectorBackend::Cnn);
        assert_eq!(config.recognizer, RecognizerKind::SFace);
        assert_eq!(config.request_timeout_secs, 15);
        assert_eq!(config.challenge_directions, 4);
        assert_eq!(config.matching.base_threshold, Some(0.8));
        assert!(!config.hybrid.fallback);
        assert_eq!(
            config.recognizer_model_path(),
            "/opt/models/face_recognition_sface.onnx"
        );
        assert_eq!(
            config.detector_model_path(DetectorKind::Cnn),
            "/opt/models/version-RFB-320.onnx"
        );
    }

    #[test]
    fn test_unparseable_numbers_keep_defaults() {
        let mut config = Config::default();
        config
            .apply_env(lookup(&[("FACEPROOF_REQUEST_TIMEOUT_SECS", "soon")]))
            .unwrap();
        assert_eq!(config.request_timeout_secs, 60);
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let mut config = Config::default();
        assert!(config
            .apply_env(lookup(&[("FACEPROOF_DETECTOR", "magic")]))
            .is_err());
        assert!(config
            .apply_env(lookup(&[("FACEPROOF_HYBRID_PREFERRED", "hybrid")]))
            .is_err());
    }

    #[test]
    fn test_validate_rejects_bad_direction_count() {
        let config = Config {
            challenge_directions: 5,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_challenge_ttl() {
        for secs in [0, MAX_CHALLENGE_TTL.as_secs() + 1, u64::MAX] {
            let config = Config {
                challenge_ttl_secs: secs,
                ..Config::default()
            };
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "{secs}"
            );
        }
        let config = Config {
            challenge_ttl_secs: MAX_CHALLENGE_TTL.as_secs(),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faceproof.toml");
        std::fs::write(
            &path,
            r#"
detector = "landmark"
recognizer = "sface"
challenge_ttl_secs = 120

[matching]
hybrid_cutoff = 0.75

[liveness]
lenient = 0.55
"#,
        )
        .unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.detector, DetectorBackend::Landmark);
        assert_eq!(config.recognizer, RecognizerKind::SFace);
        assert_eq!(config.challenge_ttl(), Duration::from_secs(120));
        assert!((config.matching.hybrid_cutoff - 0.75).abs() < 1e-6);
        assert!((config.liveness.lenient - 0.55).abs() < 1e-6);
        assert!((config.liveness.normal - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        assert!(matches!(
            Config::from_file(Path::new("/nonexistent/faceproof.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
