//! Pairwise match decision.
//!
//! Embedding similarity alone lets through look-alike false positives, so a
//! match must clear three gates: normalized similarity above a
//! quality-adjusted threshold, decision confidence, and (when both faces
//! carry landmarks) a hybrid embedding + landmark-geometry score.

use crate::types::{normalize_similarity, unit, DetectedFace, Landmarks};
use serde::{Deserialize, Serialize};

/// Tunable constants of the match decision. Defaults are empirically tuned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchThresholds {
    /// Overrides the recognizer's baseline normalized threshold.
    pub base_threshold: Option<f32>,
    pub low_quality: f32,
    pub low_quality_penalty: f32,
    pub high_quality: f32,
    pub high_quality_bonus_min: f32,
    pub high_quality_bonus_max: f32,
    /// Added when either image does not contain exactly one face.
    pub face_count_penalty: f32,
    pub quality_gap: f32,
    pub quality_gap_penalty_min: f32,
    pub quality_gap_penalty_max: f32,
    pub threshold_floor: f32,
    pub threshold_ceiling: f32,
    pub min_confidence: f32,
    pub hybrid_cutoff: f32,
    pub embedding_weight: f32,
    pub geometric_weight: f32,
    /// Relative landmark-ratio difference at which geometric similarity hits 0.
    pub landmark_tolerance: f32,
}

impl Default for MatchThresholds {
    fn default() -> Self {
        Self {
            base_threshold: None,
            low_quality: 0.3,
            low_quality_penalty: 0.05,
            high_quality: 0.7,
            high_quality_bonus_min: 0.01,
            high_quality_bonus_max: 0.05,
            face_count_penalty: 0.05,
            quality_gap: 0.4,
            quality_gap_penalty_min: 0.03,
            quality_gap_penalty_max: 0.08,
            threshold_floor: 0.5,
            threshold_ceiling: 0.99,
            min_confidence: 0.5,
            hybrid_cutoff: 0.79,
            embedding_weight: 0.65,
            geometric_weight: 0.35,
            landmark_tolerance: 0.30,
        }
    }
}

impl MatchThresholds {
    /// Quality/face-count adjusted decision threshold on the normalized scale.
    pub fn adjusted_threshold(&self, base: f32, quality: [f32; 2], face_counts: [usize; 2]) -> f32 {
        let q = [unit(quality[0]), unit(quality[1])];
        let avg = (q[0] + q[1]) / 2.0;
        let mut threshold = self.base_threshold.unwrap_or(base);

        if avg < self.low_quality {
            threshold += self.low_quality_penalty;
        } else if avg > self.high_quality {
            let t = ((avg - self.high_quality) / (1.0 - self.high_quality)).clamp(0.0, 1.0);
            threshold -= self.high_quality_bonus_min
                + t * (self.high_quality_bonus_max - self.high_quality_bonus_min);
        }

        if face_counts.iter().any(|&n| n != 1) {
            threshold += self.face_count_penalty;
        }

        let gap = (q[0] - q[1]).abs();
        if gap > self.quality_gap {
            let t = ((gap - self.quality_gap) / (1.0 - self.quality_gap)).clamp(0.0, 1.0);
            threshold += self.quality_gap_penalty_min
                + t * (self.quality_gap_penalty_max - self.quality_gap_penalty_min);
        }

        threshold.clamp(self.threshold_floor, self.threshold_ceiling)
    }

    /// Landmark-geometry similarity in [0, 1]; `None` unless both faces have landmarks.
    pub fn geometric_similarity(&self, a: &DetectedFace, b: &DetectedFace) -> Option<f32> {
        let ra = landmark_ratios(a.landmarks.as_ref()?, a.width)?;
        let rb = landmark_ratios(b.landmarks.as_ref()?, b.width)?;

        let total: f32 = ra
            .iter()
            .zip(rb.iter())
            .map(|(&x, &y)| {
                let denom = x.max(y);
                let rel_diff = if denom > 0.0 { (x - y).abs() / denom } else { 0.0 };
                (1.0 - rel_diff / self.landmark_tolerance).max(0.0)
            })
            .sum();
        Some(unit(total / ra.len() as f32))
    }

    pub fn hybrid_score(&self, normalized_similarity: f32, geometric: f32) -> f32 {
        unit(self.embedding_weight * normalized_similarity + self.geometric_weight * geometric)
    }

    /// Margin-over-threshold confidence. Quality only scales the distance
    /// from 0.5, so the result is above 0.5 exactly when the similarity
    /// clears the threshold.
    pub fn confidence(&self, normalized_similarity: f32, threshold: f32, avg_quality: f32) -> f32 {
        let margin = unit(0.5 + 2.5 * (normalized_similarity - threshold)) - 0.5;
        unit(0.5 + margin * (0.7 + 0.3 * unit(avg_quality)))
    }

    /// Full decision for one pair of faces.
    pub fn decide(&self, input: &MatchInput<'_>) -> MatchDecision {
        let raw = if input.cosine.is_finite() {
            input.cosine.clamp(-1.0, 1.0)
        } else {
            0.0
        };
        let normalized = normalize_similarity(raw);
        let threshold = self.adjusted_threshold(input.base_threshold, input.quality, input.face_counts);
        let avg_quality = (unit(input.quality[0]) + unit(input.quality[1])) / 2.0;
        let confidence = self.confidence(normalized, threshold, avg_quality);

        let geometric = self.geometric_similarity(input.faces[0], input.faces[1]);
        let hybrid = geometric.map(|g| self.hybrid_score(normalized, g));

        let similarity_ok = normalized > threshold;
        let confidence_ok = confidence > self.min_confidence;
        let hybrid_ok = hybrid.map_or(true, |h| h > self.hybrid_cutoff);

        MatchDecision {
            is_match: similarity_ok && confidence_ok && hybrid_ok,
            raw_similarity: raw,
            similarity: normalized,
            confidence,
            threshold_used: threshold,
            geometric_similarity: geometric,
            hybrid_score: hybrid,
        }
    }
}

/// Everything the decision needs about one compared pair.
#[derive(Debug, Clone)]
pub struct MatchInput<'a> {
    /// Raw cosine similarity of the two embeddings.
    pub cosine: f32,
    /// Recognizer baseline threshold (normalized scale).
    pub base_threshold: f32,
    pub quality: [f32; 2],
    pub face_counts: [usize; 2],
    /// The selected face per image.
    pub faces: [&'a DetectedFace; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchDecision {
    pub is_match: bool,
    /// Cosine similarity in [-1, 1].
    pub raw_similarity: f32,
    /// `(cos + 1) / 2` in [0, 1].
    pub similarity: f32,
    pub confidence: f32,
    pub threshold_used: f32,
    pub geometric_similarity: Option<f32>,
    pub hybrid_score: Option<f32>,
}

/// Inter-landmark distances normalized by face width:
/// eye distance, nose-to-eyes, mouth width, nose-to-mouth, eyes-to-mouth.
fn landmark_ratios(lm: &Landmarks, face_width: f32) -> Option<[f32; 5]> {
    if !(face_width > 0.0) {
        return None;
    }
    let dist = |a: (f32, f32), b: (f32, f32)| ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt();
    let mid = |a: (f32, f32), b: (f32, f32)| ((a.0 + b.0) / 2.0, (a.1 + b.1) / 2.0);

    let [left_eye, right_eye, nose, left_mouth, right_mouth] = *lm;
    let eye_mid = mid(left_eye, right_eye);
    let mouth_mid = mid(left_mouth, right_mouth);

    let ratios = [
        dist(left_eye, right_eye),
        dist(nose, eye_mid),
        dist(left_mouth, right_mouth),
        dist(nose, mouth_mid),
        dist(eye_mid, mouth_mid),
    ]
    .map(|d| d / face_width);

    ratios.iter().all(|r| r.is_finite()).then_some(ratios)
}
