//! Pure trust projections: decay over idle time and the escalation step function.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Linear decay never pushes a score below this floor.
pub const LINEAR_FLOOR: f64 = 0.3;

/// Step decay: (idle hours, cumulative drop).
const STEP_DROPS: [(f64, f64); 3] = [(168.0, 0.30), (72.0, 0.15), (24.0, 0.05)];

/// Escalation thresholds: minimum score for levels 0, 1 and 2.
const LEVEL_THRESHOLDS: [f64; 3] = [0.7, 0.5, 0.3];

/// How trust erodes while an agent has no successful actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecayModel {
    /// `score * e^(-rate * hours)`.
    Exponential,
    /// `score - rate * hours`, floored at [`LINEAR_FLOOR`].
    Linear,
    /// Fixed drops after 24h, 72h and 168h.
    Step,
}

impl DecayModel {
    /// Storage form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exponential => "exponential",
            Self::Linear => "linear",
            Self::Step => "step",
        }
    }

    /// Parse the storage form.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "exponential" => Some(Self::Exponential),
            "linear" => Some(Self::Linear),
            "step" => Some(Self::Step),
            _ => None,
        }
    }
}

/// Supervision tier derived from trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    /// Level 0: normal operation.
    Normal,
    /// Level 1: nothing is approved silently.
    Logged,
    /// Level 2: every permitted action needs a human.
    Supervised,
    /// Level 3: all actions denied until re-certified.
    Suspended,
}

impl EscalationLevel {
    /// Numeric level 0..=3.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Logged => 1,
            Self::Supervised => 2,
            Self::Suspended => 3,
        }
    }

    /// Parse a numeric level.
    pub fn from_u8(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::Normal),
            1 => Some(Self::Logged),
            2 => Some(Self::Supervised),
            3 => Some(Self::Suspended),
            _ => None,
        }
    }

    /// Step function of the trust score.
    pub fn for_score(score: f64) -> Self {
        if score >= LEVEL_THRESHOLDS[0] {
            Self::Normal
        } else if score >= LEVEL_THRESHOLDS[1] {
            Self::Logged
        } else if score >= LEVEL_THRESHOLDS[2] {
            Self::Supervised
        } else {
            Self::Suspended
        }
    }
}

/// Clamp a trust score into `[0, 1]`.
pub fn clamp_trust(score: f64) -> f64 {
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Round to four decimals so sub-second idle time does not flip a threshold.
pub fn round_score(score: f64) -> f64 {
    (score * 10_000.0).round() / 10_000.0
}

/// Hours elapsed from `since` to `now`, never negative.
#[allow(clippy::cast_precision_loss)]
pub fn hours_between(since: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let millis = now.signed_duration_since(since).num_milliseconds().max(0);
    millis as f64 / 3_600_000.0
}

/// Project `score` forward by `hours` of inactivity.
pub fn decay(score: f64, model: DecayModel, rate: f64, hours: f64) -> f64 {
    let score = clamp_trust(score);
    let rate = if rate.is_finite() { rate.max(0.0) } else { 0.0 };
    let hours = hours.max(0.0);
    let projected = match model {
        DecayModel::Exponential => score * (-rate * hours).exp(),
        DecayModel::Linear => {
            // The floor limits decay; it never raises an already-low score.
            (score - rate * hours).max(LINEAR_FLOOR).min(score)
        }
        DecayModel::Step => {
            let drop = STEP_DROPS
                .iter()
                .find(|(threshold, _)| hours >= *threshold)
                .map_or(0.0, |(_, drop)| *drop);
            score - drop
        }
    };
    round_score(clamp_trust(projected))
}
