//! Per-action risk scoring.
//!
//! [`RiskScorer::score`] is a pure function of its input: a weighted linear
//! combination of six factors, three multiplicative adjustments, a clamp to
//! `[0, 1]` and a fixed five-band tier table. Identical inputs always give
//! identical results, which is what makes recorded decisions reproducible.

pub mod catalog;

use serde::{Deserialize, Serialize};

pub use self::catalog::{
    ActionCatalog, ActionCategory, ActionError, MutationScope, ResourceClass, Sensitivity,
    SensitivityTable,
};

// ---------------------------------------------------------------------------
// Tiers and decisions
// ---------------------------------------------------------------------------

/// Upper bounds (exclusive) of the first four tiers; the last tier is closed.
const TIER_BOUNDS: [f64; 4] = [0.2, 0.4, 0.6, 0.8];

/// Risk band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    /// `[0, 0.2)`
    Minimal,
    /// `[0.2, 0.4)`
    Low,
    /// `[0.4, 0.6)`
    Moderate,
    /// `[0.6, 0.8)`
    High,
    /// `[0.8, 1.0]`
    Critical,
}

impl RiskTier {
    /// Tier for a clamped score.
    pub fn for_score(score: f64) -> Self {
        if score < TIER_BOUNDS[0] {
            Self::Minimal
        } else if score < TIER_BOUNDS[1] {
            Self::Low
        } else if score < TIER_BOUNDS[2] {
            Self::Moderate
        } else if score < TIER_BOUNDS[3] {
            Self::High
        } else {
            Self::Critical
        }
    }

    /// Decision hint attached to the tier.
    pub fn decision(self) -> Decision {
        match self {
            Self::Minimal => Decision::AutoApprove,
            Self::Low | Self::Moderate => Decision::ApproveWithLogging,
            Self::High => Decision::RequireHitl,
            Self::Critical => Decision::Deny,
        }
    }

    /// String form used in storage.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Moderate => "moderate",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Parse the storage form.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "minimal" => Some(Self::Minimal),
            "low" => Some(Self::Low),
            "moderate" => Some(Self::Moderate),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// What should happen to an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Proceed silently.
    AutoApprove,
    /// Proceed, with the action logged for later review.
    ApproveWithLogging,
    /// A human must approve first.
    RequireHitl,
    /// Refuse.
    Deny,
}

impl Decision {
    /// String form used in logs and lineage payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AutoApprove => "auto_approve",
            Self::ApproveWithLogging => "approve_with_logging",
            Self::RequireHitl => "require_hitl",
            Self::Deny => "deny",
        }
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Factor weights; they must sum to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskWeights {
    /// Weight of `1 - trust`.
    pub trust: f64,
    /// Weight of resource sensitivity.
    pub sensitivity: f64,
    /// Weight of mutation scope.
    pub mutation: f64,
    /// Weight of the log-scaled record count.
    pub record_count: f64,
    /// Weight of the capped dollar exposure.
    pub dollar_exposure: f64,
    /// Weight of the deviation-from-pattern signal.
    pub deviation: f64,
}

impl RiskWeights {
    /// Sum of all weights.
    pub fn total(&self) -> f64 {
        self.trust
            + self.sensitivity
            + self.mutation
            + self.record_count
            + self.dollar_exposure
            + self.deviation
    }
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            trust: 0.30,
            sensitivity: 0.30,
            mutation: 0.25,
            record_count: 0.05,
            dollar_exposure: 0.05,
            deviation: 0.05,
        }
    }
}

/// Scorer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskParameters {
    /// Factor weights.
    pub weights: RiskWeights,
    /// Record count at which the record factor saturates.
    pub record_count_ceiling: u64,
    /// Dollar exposure at which the dollar factor saturates.
    pub dollar_exposure_cap: f64,
    /// Multiplier applied outside business hours.
    pub off_hours_multiplier: f64,
    /// Multiplier applied when recent errors reach the threshold.
    pub error_multiplier: f64,
    /// Multiplier applied for PHI / sensitive-data access.
    pub sensitive_data_multiplier: f64,
    /// Recent error count at which the error multiplier kicks in.
    pub error_count_threshold: u32,
}

impl Default for RiskParameters {
    fn default() -> Self {
        Self {
            weights: RiskWeights::default(),
            record_count_ceiling: 10_000,
            dollar_exposure_cap: 100_000.0,
            off_hours_multiplier: 1.30,
            error_multiplier: 1.50,
            sensitive_data_multiplier: 1.20,
            error_count_threshold: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Input and output
// ---------------------------------------------------------------------------

/// Features describing one requested action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskInput {
    /// Requesting agent's current (decayed) trust score.
    pub agent_trust: f64,
    /// Sensitivity of the target resource.
    pub sensitivity: Sensitivity,
    /// Mutation scope of the action.
    pub mutation: MutationScope,
    /// Number of records touched.
    pub record_count: u64,
    /// Dollar amount at stake.
    pub dollar_exposure: f64,
    /// Deviation from the agent's usual pattern, in `[0, 1]`.
    pub deviation: f64,
    /// Whether the action happens outside business hours.
    pub off_hours: bool,
    /// Errors the agent produced recently.
    pub recent_errors: u32,
    /// Whether the action touches protected health information.
    pub phi_access: bool,
}

/// One weighted factor of a score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskFactor {
    /// Factor name.
    pub name: String,
    /// Normalised factor value in `[0, 1]`.
    pub value: f64,
    /// Configured weight.
    pub weight: f64,
    /// `value * weight`.
    pub contribution: f64,
}

/// A multiplicative adjustment that fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAdjustment {
    /// Adjustment name.
    pub name: String,
    /// Multiplier applied.
    pub multiplier: f64,
}

/// Scorer output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskResult {
    /// Final score in `[0, 1]`.
    pub score: f64,
    /// Band of the score.
    pub tier: RiskTier,
    /// Decision hint for the band.
    pub decision: Decision,
    /// Human-readable explanation.
    pub justification: String,
    /// Factors ordered by contribution, largest first.
    pub factors: Vec<RiskFactor>,
    /// Adjustments that fired, in application order.
    pub adjustments: Vec<RiskAdjustment>,
}

// ---------------------------------------------------------------------------
// Scorer
// ---------------------------------------------------------------------------

/// Stateless risk scorer.
#[derive(Debug, Clone, Default)]
pub struct RiskScorer {
    params: RiskParameters,
}

impl RiskScorer {
    /// Create a scorer with the given parameters.
    pub fn new(params: RiskParameters) -> Self {
        Self { params }
    }

    /// Scorer parameters.
    pub fn params(&self) -> &RiskParameters {
        &self.params
    }

    /// Score one action.
    pub fn score(&self, input: &RiskInput) -> RiskResult {
        let w = &self.params.weights;
        let trust = if input.agent_trust.is_finite() {
            input.agent_trust.clamp(0.0, 1.0)
        } else {
            0.0
        };

        let raw = [
            ("trust_deficit", 1.0 - trust, w.trust),
            ("resource_sensitivity", input.sensitivity.value(), w.sensitivity),
            ("mutation_scope", input.mutation.value(), w.mutation),
            (
                "record_count",
                self.record_factor(input.record_count),
                w.record_count,
            ),
            (
                "dollar_exposure",
                self.dollar_factor(input.dollar_exposure),
                w.dollar_exposure,
            ),
            ("pattern_deviation", unit_or_worst(input.deviation), w.deviation),
        ];

        let mut factors: Vec<RiskFactor> = raw
            .iter()
            .map(|&(name, value, weight)| RiskFactor {
                name: name.to_owned(),
                value,
                weight,
                contribution: value * weight,
            })
            .collect();

        let base: f64 = factors.iter().map(|f| f.contribution).sum();

        let mut adjustments = Vec::new();
        if input.off_hours {
            adjustments.push(RiskAdjustment {
                name: "off_hours".to_owned(),
                multiplier: self.params.off_hours_multiplier,
            });
        }
        if input.recent_errors >= self.params.error_count_threshold {
            adjustments.push(RiskAdjustment {
                name: "elevated_errors".to_owned(),
                multiplier: self.params.error_multiplier,
            });
        }
        if input.phi_access || input.sensitivity.is_sensitive_data() {
            adjustments.push(RiskAdjustment {
                name: "sensitive_data".to_owned(),
                multiplier: self.params.sensitive_data_multiplier,
            });
        }

        let adjusted = adjustments.iter().fold(base, |acc, a| acc * a.multiplier);
        let score = unit_or_worst(adjusted);
        let tier = RiskTier::for_score(score);
        let decision = tier.decision();

        // Stable sort keeps declaration order on ties.
        factors.sort_by(|a, b| b.contribution.total_cmp(&a.contribution));

        let justification = justify(score, tier, &factors, &adjustments);

        RiskResult {
            score,
            tier,
            decision,
            justification,
            factors,
            adjustments,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_factor(&self, count: u64) -> f64 {
        // Precision loss above 2^53 records is irrelevant once saturated.
        let ceiling = self.params.record_count_ceiling.max(1) as f64;
        let count = count as f64;
        ((count + 1.0).ln() / (ceiling + 1.0).ln()).clamp(0.0, 1.0)
    }

    fn dollar_factor(&self, exposure: f64) -> f64 {
        if !exposure.is_finite() {
            return 1.0;
        }
        let cap = self.params.dollar_exposure_cap;
        if cap <= 0.0 {
            return 1.0;
        }
        (exposure.max(0.0).min(cap) / cap).clamp(0.0, 1.0)
    }
}

/// Clamp to `[0, 1]`, treating non-finite values as maximal risk.
fn unit_or_worst(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        1.0
    }
}

fn justify(
    score: f64,
    tier: RiskTier,
    factors: &[RiskFactor],
    adjustments: &[RiskAdjustment],
) -> String {
    let top = factors
        .iter()
        .take(2)
        .map(|f| format!("{} ({:.3})", f.name, f.contribution))
        .collect::<Vec<_>>()
        .join(", ");
    let adj = if adjustments.is_empty() {
        "none".to_owned()
    } else {
        adjustments
            .iter()
            .map(|a| format!("{} x{:.2}", a.name, a.multiplier))
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!(
        "risk {score:.3} ({}): top factors {top}; adjustments {adj}",
        tier.as_str()
    )
}
