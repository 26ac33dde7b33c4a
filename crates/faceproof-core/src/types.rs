use serde::{Deserialize, Serialize};

/// Five-point facial landmarks in image coordinates:
/// [left_eye, right_eye, nose, left_mouth, right_mouth] (image-left first).
pub type Landmarks = [(f32, f32); 5];

/// A detected face: bounding box, detector confidence and optional landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
    pub landmarks: Option<Landmarks>,
}

impl DetectedFace {
    pub fn new(x: f32, y: f32, width: f32, height: f32, confidence: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence,
            landmarks: None,
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Clip the box to `[0, width) × [0, height)` and the confidence to [0, 1].
    ///
    /// Returns `None` if nothing of the box remains inside the image.
    pub fn clamp_to(mut self, width: u32, height: u32) -> Option<Self> {
        let (w, h) = (width as f32, height as f32);
        let x1 = self.x.clamp(0.0, w);
        let y1 = self.y.clamp(0.0, h);
        let x2 = (self.x + self.width).clamp(0.0, w);
        let y2 = (self.y + self.height).clamp(0.0, h);
        if !(x2 - x1 >= 1.0 && y2 - y1 >= 1.0) {
            return None;
        }
        self.x = x1;
        self.y = y1;
        self.width = x2 - x1;
        self.height = y2 - y1;
        self.confidence = if self.confidence.is_finite() {
            self.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Some(self)
    }
}

/// Pick the face with the largest bounding-box area.
///
/// Ties keep the earlier (higher-confidence, since detectors sort) face.
pub fn largest_face(faces: &[DetectedFace]) -> Option<&DetectedFace> {
    faces.iter().fold(None, |best: Option<&DetectedFace>, face| match best {
        Some(b) if b.area() >= face.area() => Some(b),
        _ => Some(face),
    })
}

/// Identity embedding produced by one recognizer variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEmbedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g. "w600k_r50").
    pub model: String,
}

impl FaceEmbedding {
    /// Build an embedding from a raw model output, L2-normalizing it.
    pub fn normalized(raw: Vec<f32>, model: impl Into<String>) -> Self {
        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 && norm.is_finite() {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw
        };
        Self {
            values,
            model: model.into(),
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1].
    ///
    /// Embeddings from different models or of different dimensionality are
    /// not comparable and yield 0.0.
    pub fn similarity(&self, other: &FaceEmbedding) -> f32 {
        if self.model != other.model || self.values.len() != other.values.len() {
            tracing::warn!(
                left_model = %self.model,
                right_model = %other.model,
                left_dim = self.values.len(),
                right_dim = other.values.len(),
                "embedding mismatch, similarity forced to 0"
            );
            return 0.0;
        }

        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;
        for (a, b) in self.values.iter().zip(other.values.iter()) {
            let (a, b) = (*a as f64, *b as f64);
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        let sim = if denom > 0.0 { dot / denom } else { 0.0 };
        if sim.is_finite() {
            (sim as f32).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }
}

/// Map a cosine similarity in [-1, 1] to [0, 1].
pub fn normalize_similarity(cosine: f32) -> f32 {
    if cosine.is_finite() {
        ((cosine + 1.0) / 2.0).clamp(0.0, 1.0)
    } else {
        0.5
    }
}

/// Replace NaN/∞ with the neutral 0.5 and clamp to [0, 1].
pub fn unit(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.5
    }
}
