//! Per-agent trust state.
//!
//! The [`TrustManager`] is the only writer of trust profiles. Reads project
//! the stored score through the profile's decay model without touching
//! storage; writes go through [`TrustManager::record_event`] or
//! [`TrustManager::reinstate`] and are serialized per agent so two concurrent
//! outcomes for the same agent never overwrite each other's delta.
//!
//! Suspension (level 3) is latched: once observed it only clears through
//! [`TrustManager::reinstate`], which restores supervised operation at a
//! reduced score rather than full trust.

pub mod decay;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::store::{format_ts, limit_param, parse_ts, Store, StoreError};

pub use self::decay::{DecayModel, EscalationLevel};

/// Score an agent is reset to by [`TrustManager::reinstate`].
pub const REINSTATED_TRUST: f64 = 0.4;

/// Errors from trust operations.
#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    /// Backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Reinstatement was requested for an agent that is not suspended.
    #[error("agent {agent_id} is not suspended (level {level})")]
    NotSuspended {
        /// Agent identifier.
        agent_id: String,
        /// Current escalation level.
        level: u8,
    },
}

impl From<sqlx::Error> for TrustError {
    fn from(e: sqlx::Error) -> Self {
        Self::Store(StoreError::Database(e))
    }
}

/// Events that move an agent's trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustEvent {
    /// An action completed successfully.
    SuccessfulAction,
    /// An action failed.
    ActionError,
    /// A human overrode the agent.
    HitlOverride,
    /// The agent violated policy.
    PolicyViolation,
    /// A human vouched for the agent.
    HumanEndorsement,
    /// A human-approved action completed successfully.
    HitlApprovedSuccess,
    /// A reviewer lifted a suspension.
    Reinstated,
}

impl TrustEvent {
    /// Fixed score delta of the event.
    pub fn delta(self) -> f64 {
        match self {
            Self::SuccessfulAction => 0.02,
            Self::ActionError => -0.05,
            Self::HitlOverride => -0.15,
            Self::PolicyViolation => -0.25,
            Self::HumanEndorsement => 0.15,
            Self::HitlApprovedSuccess => 0.03,
            Self::Reinstated => 0.0,
        }
    }

    /// Whether the event counts as a success for `last_success_at`.
    pub fn refreshes_decay(self) -> bool {
        matches!(
            self,
            Self::SuccessfulAction | Self::HitlApprovedSuccess | Self::HumanEndorsement
        )
    }

    /// Storage form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SuccessfulAction => "successful_action",
            Self::ActionError => "action_error",
            Self::HitlOverride => "hitl_override",
            Self::PolicyViolation => "policy_violation",
            Self::HumanEndorsement => "human_endorsement",
            Self::HitlApprovedSuccess => "hitl_approved_success",
            Self::Reinstated => "reinstated",
        }
    }

    /// Parse the storage form.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidEnum`] for unknown values.
    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "successful_action" => Ok(Self::SuccessfulAction),
            "action_error" => Ok(Self::ActionError),
            "hitl_override" => Ok(Self::HitlOverride),
            "policy_violation" => Ok(Self::PolicyViolation),
            "human_endorsement" => Ok(Self::HumanEndorsement),
            "hitl_approved_success" => Ok(Self::HitlApprovedSuccess),
            "reinstated" => Ok(Self::Reinstated),
            other => Err(StoreError::InvalidEnum {
                field: "event",
                value: other.to_owned(),
            }),
        }
    }
}

/// Defaults applied to newly seen agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustSettings {
    /// Trust assigned on first reference.
    pub default_trust: f64,
    /// Decay model for new profiles.
    pub decay_model: DecayModel,
    /// Decay rate per idle hour.
    pub decay_rate: f64,
    /// History entries kept per agent.
    pub history_cap: usize,
}

impl Default for TrustSettings {
    fn default() -> Self {
        Self {
            default_trust: 0.7,
            decay_model: DecayModel::Exponential,
            decay_rate: 0.005,
            history_cap: 100,
        }
    }
}

/// Stored trust state of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustProfile {
    /// Agent identifier.
    pub agent_id: String,
    /// Trust score as of `last_success_at`; decay is projected from here.
    pub trust_score: f64,
    /// Sum of the penalties recorded since `last_success_at`.
    pub penalty_since_success: f64,
    /// Score assigned at creation.
    pub initial_trust: f64,
    /// Decay model.
    pub decay_model: DecayModel,
    /// Decay rate per idle hour.
    pub decay_rate: f64,
    /// Level recorded at the last write.
    pub escalation_level: EscalationLevel,
    /// Why the level last changed.
    pub escalation_reason: Option<String>,
    /// Last successful action.
    pub last_success_at: DateTime<Utc>,
    /// Last write.
    pub updated_at: DateTime<Utc>,
    /// First reference.
    pub created_at: DateTime<Utc>,
}

impl TrustProfile {
    /// Trust score as of `now`.
    ///
    /// Idle time is measured from the last success; penalties recorded since
    /// then apply on top of the decayed score.
    pub fn decayed_score(&self, now: DateTime<Utc>) -> f64 {
        let decayed = decay::decay(
            self.trust_score,
            self.decay_model,
            self.decay_rate,
            decay::hours_between(self.last_success_at, now),
        );
        decay::round_score(decay::clamp_trust(decayed + self.penalty_since_success))
    }

    /// Escalation level as of `now`.
    ///
    /// A latched suspension wins over the score.
    pub fn effective_level(&self, now: DateTime<Utc>) -> EscalationLevel {
        if self.escalation_level == EscalationLevel::Suspended {
            return EscalationLevel::Suspended;
        }
        EscalationLevel::for_score(self.decayed_score(now))
    }
}

/// One entry of an agent's trust history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustHistoryEntry {
    /// When the change happened.
    pub timestamp: DateTime<Utc>,
    /// Score before.
    pub old_score: f64,
    /// Score after.
    pub new_score: f64,
    /// What caused it.
    pub event: TrustEvent,
    /// Free-form reason.
    pub reason: String,
}

/// Point-in-time view used by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustSnapshot {
    /// Agent identifier.
    pub agent_id: String,
    /// Decayed trust score.
    pub trust_score: f64,
    /// Effective escalation level.
    pub escalation_level: EscalationLevel,
}

/// Result of a trust write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustUpdate {
    /// Agent identifier.
    pub agent_id: String,
    /// Event applied.
    pub event: TrustEvent,
    /// Score before the event (decayed).
    pub old_score: f64,
    /// Score after the event.
    pub new_score: f64,
    /// Level before the event.
    pub old_level: EscalationLevel,
    /// Level after the event.
    pub new_level: EscalationLevel,
}

/// Owner of all trust profiles.
pub struct TrustManager {
    store: Store,
    clock: Arc<dyn Clock>,
    settings: TrustSettings,
    /// Per-agent write locks.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for TrustManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustManager")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl TrustManager {
    /// Create a trust manager over `store`.
    pub fn new(store: Store, clock: Arc<dyn Clock>, settings: TrustSettings) -> Self {
        Self {
            store,
            clock,
            settings,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Decayed trust score, creating the profile on first reference.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::Store`] on storage failure.
    pub async fn get_trust_score(&self, agent_id: &str) -> Result<f64, TrustError> {
        let profile = self.profile(agent_id).await?;
        Ok(profile.decayed_score(self.clock.now()))
    }

    /// Effective escalation level.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::Store`] on storage failure.
    pub async fn get_escalation_level(&self, agent_id: &str) -> Result<EscalationLevel, TrustError> {
        let profile = self.profile(agent_id).await?;
        Ok(profile.effective_level(self.clock.now()))
    }

    /// Score and level read at the same instant.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::Store`] on storage failure.
    pub async fn snapshot(&self, agent_id: &str) -> Result<TrustSnapshot, TrustError> {
        let profile = self.profile(agent_id).await?;
        let now = self.clock.now();
        Ok(TrustSnapshot {
            agent_id: agent_id.to_owned(),
            trust_score: profile.decayed_score(now),
            escalation_level: profile.effective_level(now),
        })
    }

    /// Stored profile, created with defaults if the agent is new.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::Store`] on storage failure.
    pub async fn profile(&self, agent_id: &str) -> Result<TrustProfile, TrustError> {
        let mut conn = self.store.pool().acquire().await?;
        self.ensure_profile(&mut *conn, agent_id).await?;
        Ok(load_profile(&mut *conn, agent_id).await?)
    }

    /// Apply an event's fixed delta.
    ///
    /// The delta is applied to the decayed score and the result clamped to
    /// `[0, 1]`. A success re-anchors decay at `now`; a penalty is carried
    /// alongside the anchor so later idle time is still measured from the
    /// last success. The level is recomputed from the new score unless the
    /// agent is already suspended.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::Store`] on storage failure.
    pub async fn record_event(
        &self,
        agent_id: &str,
        event: TrustEvent,
        reason: &str,
    ) -> Result<TrustUpdate, TrustError> {
        let lock = self.agent_lock(agent_id);
        let result = {
            let _guard = lock.lock().await;
            self.apply_event(agent_id, event, reason).await
        };
        self.release_lock(agent_id, lock);
        result
    }

    async fn apply_event(
        &self,
        agent_id: &str,
        event: TrustEvent,
        reason: &str,
    ) -> Result<TrustUpdate, TrustError> {
        let now = self.clock.now();
        let mut tx = self.store.pool().begin().await?;
        self.ensure_profile(&mut *tx, agent_id).await?;
        let profile = load_profile(&mut *tx, agent_id).await?;

        let old_score = profile.decayed_score(now);
        let old_level = profile.effective_level(now);
        let new_score = decay::round_score(decay::clamp_trust(old_score + event.delta()));
        let new_level = if old_level == EscalationLevel::Suspended {
            EscalationLevel::Suspended
        } else {
            EscalationLevel::for_score(new_score)
        };
        let (anchor, penalty, last_success) = if event.refreshes_decay() {
            (new_score, 0.0, now)
        } else {
            (
                profile.trust_score,
                decay::round_score((profile.penalty_since_success + event.delta()).max(-1.0)),
                profile.last_success_at,
            )
        };
        let escalation_reason = if new_level == old_level {
            profile.escalation_reason.clone()
        } else {
            Some(format!("{}: {reason}", event.as_str()))
        };

        sqlx::query(
            "UPDATE trust_profiles SET trust_score = ?1, penalty_since_success = ?2, \
             escalation_level = ?3, escalation_reason = ?4, last_success_at = ?5, updated_at = ?6 \
             WHERE agent_id = ?7",
        )
        .bind(anchor)
        .bind(penalty)
        .bind(i64::from(new_level.as_u8()))
        .bind(&escalation_reason)
        .bind(format_ts(&last_success))
        .bind(format_ts(&now))
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;

        self.append_history(&mut *tx, agent_id, now, old_score, new_score, event, reason)
            .await?;
        tx.commit().await?;

        if new_level > old_level {
            warn!(
                agent_id,
                event = event.as_str(),
                old_level = old_level.as_u8(),
                new_level = new_level.as_u8(),
                trust = new_score,
                "agent escalated"
            );
        } else {
            debug!(agent_id, event = event.as_str(), old_score, new_score, "trust updated");
        }

        Ok(TrustUpdate {
            agent_id: agent_id.to_owned(),
            event,
            old_score,
            new_score,
            old_level,
            new_level,
        })
    }

    /// Lift a suspension: level 2 at [`REINSTATED_TRUST`], never full trust.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::NotSuspended`] if the agent is below level 3,
    /// or [`TrustError::Store`] on storage failure.
    pub async fn reinstate(&self, agent_id: &str, reviewer: &str) -> Result<TrustUpdate, TrustError> {
        let lock = self.agent_lock(agent_id);
        let result = {
            let _guard = lock.lock().await;
            self.apply_reinstate(agent_id, reviewer).await
        };
        self.release_lock(agent_id, lock);
        result
    }

    async fn apply_reinstate(
        &self,
        agent_id: &str,
        reviewer: &str,
    ) -> Result<TrustUpdate, TrustError> {
        let now = self.clock.now();
        let mut tx = self.store.pool().begin().await?;
        self.ensure_profile(&mut *tx, agent_id).await?;
        let profile = load_profile(&mut *tx, agent_id).await?;

        let old_level = profile.effective_level(now);
        if old_level != EscalationLevel::Suspended {
            return Err(TrustError::NotSuspended {
                agent_id: agent_id.to_owned(),
                level: old_level.as_u8(),
            });
        }
        let old_score = profile.decayed_score(now);
        let reason = format!("reinstated by {reviewer}");

        sqlx::query(
            "UPDATE trust_profiles SET trust_score = ?1, penalty_since_success = 0, \
             escalation_level = ?2, escalation_reason = ?3, last_success_at = ?4, updated_at = ?4 \
             WHERE agent_id = ?5",
        )
        .bind(REINSTATED_TRUST)
        .bind(i64::from(EscalationLevel::Supervised.as_u8()))
        .bind(&reason)
        .bind(format_ts(&now))
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;

        self.append_history(
            &mut *tx,
            agent_id,
            now,
            old_score,
            REINSTATED_TRUST,
            TrustEvent::Reinstated,
            &reason,
        )
        .await?;
        tx.commit().await?;

        info!(agent_id, reviewer, "agent reinstated under supervision");

        Ok(TrustUpdate {
            agent_id: agent_id.to_owned(),
            event: TrustEvent::Reinstated,
            old_score,
            new_score: REINSTATED_TRUST,
            old_level,
            new_level: EscalationLevel::Supervised,
        })
    }

    /// Most recent history entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::Store`] on storage failure.
    pub async fn history(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<TrustHistoryEntry>, TrustError> {
        let rows = sqlx::query(
            "SELECT recorded_at, old_score, new_score, event, reason FROM trust_history \
             WHERE agent_id = ?1 ORDER BY id DESC LIMIT ?2",
        )
        .bind(agent_id)
        .bind(limit_param(limit))
        .fetch_all(self.store.pool())
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let ts: String = row.try_get("recorded_at")?;
            let event: String = row.try_get("event")?;
            entries.push(TrustHistoryEntry {
                timestamp: parse_ts(&ts)?,
                old_score: row.try_get("old_score")?,
                new_score: row.try_get("new_score")?,
                event: TrustEvent::parse(&event)?,
                reason: row.try_get("reason")?,
            });
        }
        Ok(entries)
    }

    /// Number of `action_error` events inside the trailing `window`.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::Store`] on storage failure.
    pub async fn recent_errors(&self, agent_id: &str, window: Duration) -> Result<u32, TrustError> {
        let now = self.clock.now();
        let since = now.checked_sub_signed(window).unwrap_or(now);
        let row: (i64,) = sqlx::query_as(
            "SELECT count(*) FROM trust_history \
             WHERE agent_id = ?1 AND event = ?2 AND recorded_at >= ?3",
        )
        .bind(agent_id)
        .bind(TrustEvent::ActionError.as_str())
        .bind(format_ts(&since))
        .fetch_one(self.store.pool())
        .await?;
        Ok(u32::try_from(row.0).unwrap_or(u32::MAX))
    }

    fn agent_lock(&self, agent_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(l) => l,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(
            locks
                .entry(agent_id.to_owned())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Drop the map entry once no other task holds or waits on the lock.
    fn release_lock(&self, agent_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = match self.locks.lock() {
            Ok(l) => l,
            Err(poisoned) => poisoned.into_inner(),
        };
        // One reference in the map, one here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(agent_id);
        }
    }

    async fn ensure_profile(
        &self,
        conn: &mut sqlx::SqliteConnection,
        agent_id: &str,
    ) -> Result<(), StoreError> {
        let now = format_ts(&self.clock.now());
        let trust = decay::clamp_trust(self.settings.default_trust);
        let result = sqlx::query(
            "INSERT OR IGNORE INTO trust_profiles (agent_id, trust_score, initial_trust, \
             decay_model, decay_rate, escalation_level, escalation_reason, last_success_at, \
             updated_at, created_at) VALUES (?1, ?2, ?2, ?3, ?4, ?5, NULL, ?6, ?6, ?6)",
        )
        .bind(agent_id)
        .bind(trust)
        .bind(self.settings.decay_model.as_str())
        .bind(self.settings.decay_rate)
        .bind(i64::from(EscalationLevel::for_score(trust).as_u8()))
        .bind(&now)
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() > 0 {
            info!(agent_id, trust, "trust profile created");
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn append_history(
        &self,
        conn: &mut sqlx::SqliteConnection,
        agent_id: &str,
        at: DateTime<Utc>,
        old_score: f64,
        new_score: f64,
        event: TrustEvent,
        reason: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO trust_history (agent_id, recorded_at, old_score, new_score, event, reason) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(agent_id)
        .bind(format_ts(&at))
        .bind(old_score)
        .bind(new_score)
        .bind(event.as_str())
        .bind(reason)
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "DELETE FROM trust_history WHERE agent_id = ?1 AND id NOT IN \
             (SELECT id FROM trust_history WHERE agent_id = ?1 ORDER BY id DESC LIMIT ?2)",
        )
        .bind(agent_id)
        .bind(limit_param(self.settings.history_cap))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

async fn load_profile(
    conn: &mut sqlx::SqliteConnection,
    agent_id: &str,
) -> Result<TrustProfile, StoreError> {
    let row = sqlx::query(
        "SELECT agent_id, trust_score, penalty_since_success, initial_trust, decay_model, \
         decay_rate, escalation_level, escalation_reason, last_success_at, updated_at, created_at \
         FROM trust_profiles WHERE agent_id = ?1",
    )
    .bind(agent_id)
    .fetch_one(&mut *conn)
    .await?;

    let model: String = row.try_get("decay_model")?;
    let level: i64 = row.try_get("escalation_level")?;
    let last_success: String = row.try_get("last_success_at")?;
    let updated: String = row.try_get("updated_at")?;
    let created: String = row.try_get("created_at")?;

    Ok(TrustProfile {
        agent_id: row.try_get("agent_id")?,
        trust_score: row.try_get("trust_score")?,
        penalty_since_success: row.try_get("penalty_since_success")?,
        initial_trust: row.try_get("initial_trust")?,
        decay_model: DecayModel::parse(&model).ok_or(StoreError::InvalidEnum {
            field: "decay_model",
            value: model.clone(),
        })?,
        decay_rate: row.try_get("decay_rate")?,
        escalation_level: u8::try_from(level)
            .ok()
            .and_then(EscalationLevel::from_u8)
            .ok_or(StoreError::InvalidEnum {
                field: "escalation_level",
                value: level.to_string(),
            })?,
        escalation_reason: row.try_get("escalation_reason")?,
        last_success_at: parse_ts(&last_success)?,
        updated_at: parse_ts(&updated)?,
        created_at: parse_ts(&created)?,
    })
}
