//! Single-frame liveness / anti-spoofing analysis.
//!
//! [`LivenessAnalyzer::analyze`] runs every signal over a face region,
//! blends them into a base score and subtracts the spoof penalty. The
//! verdict against a threshold is a separate step so that the same report
//! can be judged in normal or lenient mode.

mod signals;
mod spoof;

pub use signals::SignalScores;
pub use spoof::{SpoofAssessment, SpoofRules};

use crate::buffer::ImageBuffer;
use crate::plane::Plane;
use crate::types::unit;
use serde::{Deserialize, Serialize};

/// Faces smaller than this are upsampled before analysis.
const MIN_ANALYSIS_SIDE: u32 = 16;

/// Base-score weights: texture, edge, color, reflection, frequency,
/// structure, compression, micro-movement, brightness quality.
const BASE_WEIGHTS: [f32; 9] = [0.18, 0.15, 0.15, 0.15, 0.10, 0.10, 0.05, 0.05, 0.12];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessThresholds {
    pub normal: f32,
    /// Blur-tolerant mode requested by the caller.
    pub lenient: f32,
    /// Subtracted from the threshold to absorb rounding at the boundary.
    pub tolerance: f32,
    /// Cutoff for the cheap texture/edge/reflection check.
    pub quick: f32,
    pub spoof: SpoofRules,
}

impl Default for LivenessThresholds {
    fn default() -> Self {
        Self {
            normal: 0.5,
            lenient: 0.52,
            tolerance: 0.005,
            quick: 0.25,
            spoof: SpoofRules::default(),
        }
    }
}

/// The named metrics reported with every liveness result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LivenessBreakdown {
    pub texture: f32,
    pub edge: f32,
    pub color: f32,
    pub reflection: f32,
    pub frequency: f32,
    pub structure: f32,
    pub compression: f32,
    pub micro_movement: f32,
    pub brightness_quality: f32,
    pub lbp: f32,
    pub symmetry: f32,
    pub depth: f32,
    pub skin_ratio: f32,
    pub lighting_consistency: f32,
    pub base_score: f32,
    pub spoof_penalty: f32,
}

impl LivenessBreakdown {
    fn new(s: &SignalScores, base_score: f32, spoof_penalty: f32) -> Self {
        Self {
            texture: unit(s.texture),
            edge: unit(s.edge),
            color: unit(s.color),
            reflection: unit(s.reflection),
            frequency: unit(s.frequency),
            structure: unit(s.structure),
            compression: unit(s.compression),
            micro_movement: unit(s.micro_movement),
            brightness_quality: unit(s.brightness_quality),
            lbp: unit(s.lbp),
            symmetry: unit(s.symmetry),
            depth: unit(s.depth),
            skin_ratio: unit(s.skin_ratio),
            lighting_consistency: unit(s.lighting_consistency),
            base_score: unit(base_score),
            spoof_penalty: unit(spoof_penalty),
        }
    }

    /// `(name, value)` pairs in reporting order.
    pub fn entries(&self) -> [(&'static str, f32); 16] {
        [
            ("texture", self.texture),
            ("edge", self.edge),
            ("color", self.color),
            ("reflection", self.reflection),
            ("frequency", self.frequency),
            ("structure", self.structure),
            ("compression", self.compression),
            ("micro_movement", self.micro_movement),
            ("brightness_quality", self.brightness_quality),
            ("lbp", self.lbp),
            ("symmetry", self.symmetry),
            ("depth", self.depth),
            ("skin_ratio", self.skin_ratio),
            ("lighting_consistency", self.lighting_consistency),
            ("base_score", self.base_score),
            ("spoof_penalty", self.spoof_penalty),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessReport {
    /// `clamp(base - penalty, 0, 1)`.
    pub score: f32,
    pub base_score: f32,
    pub spoof_penalty: f32,
    pub breakdown: LivenessBreakdown,
    pub spoof_reasons: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LivenessVerdict {
    pub is_live: bool,
    pub threshold_used: f32,
    pub confidence: f32,
}

#[derive(Debug, Clone, Default)]
pub struct LivenessAnalyzer {
    thresholds: LivenessThresholds,
}

impl LivenessAnalyzer {
    pub fn new(thresholds: LivenessThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &LivenessThresholds {
        &self.thresholds
    }

    /// Score one face region. `full` is the frame the face was cut from.
    pub fn analyze(&self, face: &ImageBuffer, full: &ImageBuffer) -> LivenessReport {
        let signals = SignalScores::compute(&analysis_region(face, full), full);

        let weighted = [
            signals.texture,
            signals.edge,
            signals.color,
            signals.reflection,
            signals.frequency,
            signals.structure,
            signals.compression,
            signals.micro_movement,
            signals.brightness_quality,
        ];
        let base_score = unit(
            weighted
                .iter()
                .zip(BASE_WEIGHTS.iter())
                .map(|(s, w)| unit(*s) * w)
                .sum(),
        );

        let spoof = self.thresholds.spoof.assess(&signals);
        let score = unit(base_score - spoof.penalty);

        tracing::debug!(
            score,
            base_score,
            spoof_penalty = spoof.penalty,
            "liveness analyzed"
        );

        LivenessReport {
            score,
            base_score,
            spoof_penalty: spoof.penalty,
            breakdown: LivenessBreakdown::new(&signals, base_score, spoof.penalty),
            spoof_reasons: spoof.reasons,
        }
    }

    /// Threshold in effect for the requested mode. An explicit override
    /// replaces the mode threshold; the rounding tolerance always applies.
    pub fn effective_threshold(&self, lenient: bool, threshold_override: Option<f32>) -> f32 {
        let base = match threshold_override {
            Some(t) if t.is_finite() => t.clamp(0.0, 1.0),
            _ if lenient => self.thresholds.lenient,
            _ => self.thresholds.normal,
        };
        (base - self.thresholds.tolerance).max(0.0)
    }

    pub fn decide(
        &self,
        report: &LivenessReport,
        lenient: bool,
        threshold_override: Option<f32>,
    ) -> LivenessVerdict {
        let threshold = self.effective_threshold(lenient, threshold_override);
        LivenessVerdict {
            is_live: report.score > threshold,
            threshold_used: threshold,
            confidence: unit(0.5 + (report.score - threshold).abs()),
        }
    }

    /// Cheap informational check: mean of texture, edge and reflection.
    pub fn quick_check(&self, face: &ImageBuffer) -> bool {
        quick_score(face) > self.thresholds.quick
    }
}

/// Mean of the texture, edge and reflection signals for `face`.
pub fn quick_score(face: &ImageBuffer) -> f32 {
    let face = analysis_region(face, face);
    let gray = face.to_gray();
    let plane = Plane::from_gray(&gray);
    let texture = signals::texture(&plane);
    let edge = signals::edge(&gray, &plane);
    let (reflection, _) = signals::reflection(&plane);
    unit((texture + edge + reflection) / 3.0)
}

fn analysis_region(face: &ImageBuffer, full: &ImageBuffer) -> ImageBuffer {
    let source = if face.width() == 0 || face.height() == 0 {
        full
    } else {
        face
    };
    if source.width() < MIN_ANALYSIS_SIDE || source.height() < MIN_ANALYSIS_SIDE {
        source.resized(
            source.width().max(MIN_ANALYSIS_SIDE),
            source.height().max(MIN_ANALYSIS_SIDE),
        )
    } else {
        source.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn flat(v: u8) -> ImageBuffer {
        ImageBuffer::from_rgb(RgbImage::from_pixel(96, 96, Rgb([v, v, v])))
    }

    /// Skin-toned face-like image with shading and fine texture.
    fn textured_face() -> ImageBuffer {
        ImageBuffer::from_rgb(RgbImage::from_fn(96, 96, |x, y| {
            let h = x.wrapping_mul(2_654_435_761) ^ y.wrapping_mul(40_503);
            let grain = ((h >> 7) % 40) as i32 - 20;
            let shade = (y as i32 - 48) / 2;
            let c = |base: i32| (base + grain - shade).clamp(0, 255) as u8;
            Rgb([c(190), c(135), c(105)])
        }))
    }

    #[test]
    fn test_weights_sum_to_one() {
        assert!((BASE_WEIGHTS.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_flat_print_is_not_live() {
        let analyzer = LivenessAnalyzer::default();
        let img = flat(128);
        let report = analyzer.analyze(&img, &img);
        let verdict = analyzer.decide(&report, false, None);
        assert!(!verdict.is_live);
        assert!(!report.spoof_reasons.is_empty());
        assert!(report.spoof_penalty > 0.0);
    }

    #[test]
    fn test_degenerate_images_have_finite_breakdown() {
        let analyzer = LivenessAnalyzer::default();
        for v in [0u8, 255] {
            let img = flat(v);
            let report = analyzer.analyze(&img, &img);
            assert!((0.0..=1.0).contains(&report.score));
            for (name, value) in report.breakdown.entries() {
                assert!(value.is_finite() && (0.0..=1.0).contains(&value), "{name} = {value}");
            }
        }
    }

    #[test]
    fn test_breakdown_has_sixteen_named_metrics() {
        let analyzer = LivenessAnalyzer::default();
        let img = textured_face();
        let report = analyzer.analyze(&img, &img);
        let json = serde_json::to_value(report.breakdown).unwrap();
        assert_eq!(json.as_object().map(|o| o.len()), Some(16));
        assert!(json.get("micro_movement").is_some());
    }

    #[test]
    fn test_textured_scores_above_flat() {
        let analyzer = LivenessAnalyzer::default();
        let face = textured_face();
        let flat = flat(128);
        assert!(analyzer.analyze(&face, &face).score > analyzer.analyze(&flat, &flat).score);
    }

    #[test]
    fn test_analyze_is_deterministic() {
        let analyzer = LivenessAnalyzer::default();
        let img = textured_face();
        let a = analyzer.analyze(&img, &img);
        let b = analyzer.analyze(&img, &img);
        assert_eq!(a.score.to_bits(), b.score.to_bits());
        assert_eq!(a, b);
    }

    #[test]
    fn test_effective_thresholds() {
        let analyzer = LivenessAnalyzer::default();
        assert!((analyzer.effective_threshold(false, None) - 0.495).abs() < 1e-6);
        assert!((analyzer.effective_threshold(true, None) - 0.515).abs() < 1e-6);
        assert!((analyzer.effective_threshold(true, Some(0.3)) - 0.295).abs() < 1e-6);
        assert!((analyzer.effective_threshold(false, Some(f32::NAN)) - 0.495).abs() < 1e-6);
    }

    #[test]
    fn test_boundary_score_passes_with_tolerance() {
        let analyzer = LivenessAnalyzer::default();
        let report = LivenessReport {
            score: 0.5,
            base_score: 0.5,
            spoof_penalty: 0.0,
            breakdown: LivenessBreakdown::new(
                &SignalScores::compute(&flat(128), &flat(128)),
                0.5,
                0.0,
            ),
            spoof_reasons: vec![],
        };
        let verdict = analyzer.decide(&report, false, None);
        assert!(verdict.is_live);
        assert!(!analyzer.decide(&report, true, None).is_live);
        assert!(verdict.confidence >= 0.5 && verdict.confidence <= 1.0);
    }

    #[test]
    fn test_quick_check() {
        let analyzer = LivenessAnalyzer::default();
        assert!(!analyzer.quick_check(&flat(128)));
        assert!(analyzer.quick_check(&textured_face()));
    }

    #[test]
    fn test_tiny_face_is_upsampled() {
        let analyzer = LivenessAnalyzer::default();
        let tiny = ImageBuffer::from_rgb(RgbImage::from_pixel(4, 3, Rgb([120, 90, 80])));
        let report = analyzer.analyze(&tiny, &flat(128));
        assert!(report.score.is_finite());
    }
}
