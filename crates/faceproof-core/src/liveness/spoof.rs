use super::signals::SignalScores;
use serde::{Deserialize, Serialize};

/// Presentation-attack heuristics. Each rule adds its penalty when it fires;
/// the sum is capped at 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoofRules {
    pub low_texture: f32,
    pub low_texture_penalty: f32,
    pub low_edge: f32,
    pub low_edge_penalty: f32,
    pub low_color: f32,
    pub low_color_penalty: f32,
    pub high_reflection: f32,
    pub high_reflection_penalty: f32,
    pub low_frequency: f32,
    pub low_frequency_penalty: f32,
    /// High LBP with low raw texture.
    pub screen_lbp: f32,
    pub screen_texture: f32,
    pub screen_penalty: f32,
    /// High LBP, reflection and edge together.
    pub display_lbp: f32,
    pub display_reflection: f32,
    pub display_edge: f32,
    pub display_penalty: f32,
    pub extreme_lbp: f32,
    pub extreme_lbp_penalty: f32,
}

impl Default for SpoofRules {
    fn default() -> Self {
        Self {
            low_texture: 0.15,
            low_texture_penalty: 0.15,
            low_edge: 0.1,
            low_edge_penalty: 0.1,
            low_color: 0.1,
            low_color_penalty: 0.1,
            high_reflection: 0.9,
            high_reflection_penalty: 0.2,
            low_frequency: 0.1,
            low_frequency_penalty: 0.15,
            screen_lbp: 0.8,
            screen_texture: 0.3,
            screen_penalty: 0.3,
            display_lbp: 0.85,
            display_reflection: 0.7,
            display_edge: 0.6,
            display_penalty: 0.7,
            extreme_lbp: 0.95,
            extreme_lbp_penalty: 0.6,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpoofAssessment {
    pub penalty: f32,
    pub reasons: Vec<String>,
}

impl SpoofRules {
    pub fn assess(&self, s: &SignalScores) -> SpoofAssessment {
        let checks = [
            (
                s.texture < self.low_texture,
                self.low_texture_penalty,
                "very low texture variation (flat surface)",
            ),
            (
                s.edge < self.low_edge,
                self.low_edge_penalty,
                "very low edge detail",
            ),
            (
                s.color < self.low_color,
                self.low_color_penalty,
                "very low color variation",
            ),
            (
                s.reflection > self.high_reflection,
                self.high_reflection_penalty,
                "unnaturally uniform reflection",
            ),
            (
                s.frequency < self.low_frequency,
                self.low_frequency_penalty,
                "missing high-frequency detail",
            ),
            (
                s.lbp > self.screen_lbp && s.texture < self.screen_texture,
                self.screen_penalty,
                "pattern texture without surface texture (screen signature)",
            ),
            (
                s.lbp > self.display_lbp
                    && s.reflection > self.display_reflection
                    && s.edge > self.display_edge,
                self.display_penalty,
                "high pattern texture, reflection and sharp edges (display signature)",
            ),
            (
                s.lbp > self.extreme_lbp,
                self.extreme_lbp_penalty,
                "extreme local binary pattern score",
            ),
        ];

        let mut assessment = SpoofAssessment::default();
        for (fired, penalty, reason) in checks {
            if fired {
                assessment.penalty += penalty;
                assessment.reasons.push(reason.to_string());
            }
        }
        assessment.penalty = assessment.penalty.min(1.0);

        if !assessment.reasons.is_empty() {
            tracing::debug!(
                penalty = assessment.penalty,
                reasons = ?assessment.reasons,
                "spoof heuristics fired"
            );
        }
        assessment
    }
}
