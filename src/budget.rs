//! Cumulative session risk budget.
//!
//! Every evaluated action's risk score is charged to the caller's
//! [`SessionRiskBudget`]; once the running total passes the ceiling, further
//! actions in that session need a human regardless of their own tier. The
//! budget is owned by the caller and passed into each evaluation, so the
//! orchestrator itself holds no per-session state.
//!
//! Scores are accumulated in thousandths with lock-free atomics.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Fixed-point scale of the accumulator.
const MILLI: f64 = 1_000.0;

/// Session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Cumulative risk above which every action needs a human.
    pub risk_ceiling: f64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self { risk_ceiling: 5.0 }
    }
}

/// Outcome of charging one action to the budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetCharge {
    /// Score charged.
    pub charged: f64,
    /// Running total after the charge.
    pub total: f64,
    /// Configured ceiling.
    pub ceiling: f64,
    /// Whether the total now exceeds the ceiling.
    pub exceeded: bool,
}

/// Running risk total for one session.
#[derive(Debug)]
pub struct SessionRiskBudget {
    session_id: String,
    consumed: AtomicU64,
    evaluations: AtomicU32,
    ceiling: u64,
}

impl SessionRiskBudget {
    /// Create an empty budget.
    pub fn new(session_id: impl Into<String>, ceiling: f64) -> Self {
        Self {
            session_id: session_id.into(),
            consumed: AtomicU64::new(0),
            evaluations: AtomicU32::new(0),
            ceiling: to_milli(ceiling),
        }
    }

    /// Create an empty budget from settings.
    pub fn from_settings(session_id: impl Into<String>, settings: &SessionSettings) -> Self {
        Self::new(session_id, settings.risk_ceiling)
    }

    /// Session identifier.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Add `score` to the running total and report whether it is now over.
    ///
    /// The charge happens before the comparison, so the action that crosses
    /// the ceiling is itself the first one forced to HITL.
    pub fn charge(&self, score: f64) -> BudgetCharge {
        let amount = to_milli(score);
        let previous = self
            .consumed
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_add(amount))
            })
            .unwrap_or_else(|v| v);
        let total = previous.saturating_add(amount);
        self.evaluations
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_add(1))
            })
            .ok();
        BudgetCharge {
            charged: from_milli(amount),
            total: from_milli(total),
            ceiling: from_milli(self.ceiling),
            exceeded: total > self.ceiling,
        }
    }

    /// Number of actions charged.
    pub fn evaluations(&self) -> u32 {
        self.evaluations.load(Ordering::Relaxed)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_milli(value: f64) -> u64 {
    if value.is_nan() || value == f64::INFINITY {
        // Unscoreable actions charge the worst case.
        u64::MAX
    } else if value <= 0.0 {
        0
    } else {
        (value * MILLI).round() as u64
    }
}

#[allow(clippy::cast_precision_loss)]
fn from_milli(value: u64) -> f64 {
    value as f64 / MILLI
}
