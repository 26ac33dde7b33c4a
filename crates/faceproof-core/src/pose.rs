//! Coarse head pose from five-point landmarks.
//!
//! Yaw is the nose offset from the eye midpoint in units of eye distance;
//! pitch is where the nose sits between the eye line and the mouth line,
//! centered so that a frontal face reads roughly 0 on both axes. Directions
//! are in image coordinates: `Left` means the nose moved toward the image's
//! left edge.

use crate::types::Landmarks;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Nose position between eyes (0) and mouth (1) on the canonical template.
const NEUTRAL_PITCH: f32 = 0.49;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadDirection {
    Up,
    Down,
    Left,
    Right,
    Center,
}

impl HeadDirection {
    /// The directions a challenge may ask for.
    pub const CHALLENGE: [HeadDirection; 4] = [Self::Up, Self::Down, Self::Left, Self::Right];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Left => "left",
            Self::Right => "right",
            Self::Center => "center",
        }
    }
}

impl fmt::Display for HeadDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HeadDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            "left" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            "center" => Ok(Self::Center),
            other => Err(format!("unknown head direction: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseThresholds {
    /// Minimum |yaw| for left/right.
    pub yaw: f32,
    /// Minimum |pitch| for up/down.
    pub pitch: f32,
}

impl Default for PoseThresholds {
    fn default() -> Self {
        Self {
            yaw: 0.15,
            pitch: 0.12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeadPose {
    /// Negative: nose toward image-left.
    pub yaw: f32,
    /// Negative: nose toward the eye line (head tilted up).
    pub pitch: f32,
}

impl HeadPose {
    /// `None` for degenerate landmark sets (coincident eyes, or mouth not below eyes).
    pub fn estimate(lm: &Landmarks) -> Option<Self> {
        let [left_eye, right_eye, nose, left_mouth, right_mouth] = *lm;

        let eye_mid = ((left_eye.0 + right_eye.0) / 2.0, (left_eye.1 + right_eye.1) / 2.0);
        let mouth_y = (left_mouth.1 + right_mouth.1) / 2.0;
        let eye_dist = ((right_eye.0 - left_eye.0).powi(2) + (right_eye.1 - left_eye.1).powi(2)).sqrt();
        let vertical = mouth_y - eye_mid.1;

        if !(eye_dist > 1e-3 && vertical > 1e-3) {
            return None;
        }

        let yaw = (nose.0 - eye_mid.0) / eye_dist;
        let pitch = (nose.1 - eye_mid.1) / vertical - NEUTRAL_PITCH;
        (yaw.is_finite() && pitch.is_finite()).then_some(Self { yaw, pitch })
    }

    /// Dominant direction, or `Center` when neither axis clears its threshold.
    pub fn direction(&self, t: &PoseThresholds) -> HeadDirection {
        let yaw_excess = self.yaw.abs() / t.yaw;
        let pitch_excess = self.pitch.abs() / t.pitch;

        if yaw_excess < 1.0 && pitch_excess < 1.0 {
            HeadDirection::Center
        } else if yaw_excess >= pitch_excess {
            if self.yaw < 0.0 {
                HeadDirection::Left
            } else {
                HeadDirection::Right
            }
        } else if self.pitch < 0.0 {
            HeadDirection::Up
        } else {
            HeadDirection::Down
        }
    }
}
