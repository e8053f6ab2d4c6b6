//! Time-boxed human-in-the-loop approval queue.
//!
//! When the orchestrator routes an action to a human, the [`HitlQueue`]
//! stores a pending request under a short review code and the
//! evaluation returns immediately. A reviewer later approves or denies it
//! through [`HitlQueue::resolve`]. A request nobody answers before its expiry
//! is treated as denied.
//!
//! Who answers is pluggable through [`HitlResolver`]. The default resolver
//! leaves every request pending for a human; [`AutoApproveResolver`] exists
//! for demos and must be switched on explicitly in configuration.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::risk::{RiskFactor, RiskResult, RiskTier};
use crate::store::{format_ts, limit_param, parse_ts, parse_ts_opt, storage_precision, Store, StoreError};
use crate::token::ResourceScope;

/// Length of a review code.
const REVIEW_CODE_LEN: usize = 8;

/// Review codes are typed by hand, so look-alikes (0/O/o, 1/I/l) are left out.
const REVIEW_CODE_ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnpqrstuvwxyz";

/// Fresh codes tried before giving up on a collision streak.
const REVIEW_CODE_ATTEMPTS: usize = 4;

/// Reviewer name recorded for automatic approvals.
pub const AUTO_REVIEWER: &str = "auto_approve";

/// Reviewer name recorded when a request times out.
pub const EXPIRY_REVIEWER: &str = "timeout";

/// Errors from the HITL queue.
#[derive(Debug, thiserror::Error)]
pub enum HitlError {
    /// Backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Every generated review code was already taken.
    #[error("no free review code after {0} attempts")]
    CodeExhausted(usize),
}

impl From<sqlx::Error> for HitlError {
    fn from(e: sqlx::Error) -> Self {
        Self::Store(StoreError::Database(e))
    }
}

impl From<serde_json::Error> for HitlError {
    fn from(e: serde_json::Error) -> Self {
        Self::Store(StoreError::Serialization(e))
    }
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitlStatus {
    /// Waiting for a reviewer.
    Pending,
    /// A human approved.
    Approved,
    /// A human denied.
    Denied,
    /// Approved without a human.
    AutoApproved,
    /// Nobody answered in time.
    Expired,
}

impl HitlStatus {
    /// Storage form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::AutoApproved => "auto_approved",
            Self::Expired => "expired",
        }
    }

    /// Parse the storage form.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidEnum`] for unknown values.
    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "denied" => Ok(Self::Denied),
            "auto_approved" => Ok(Self::AutoApproved),
            "expired" => Ok(Self::Expired),
            other => Err(StoreError::InvalidEnum {
                field: "status",
                value: other.to_owned(),
            }),
        }
    }

    /// Whether the action may proceed.
    pub fn is_approved(self) -> bool {
        matches!(self, Self::Approved | Self::AutoApproved)
    }
}

/// A request for human approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitlRequest {
    /// Short review code a human types to answer the request.
    pub request_id: String,
    /// Requesting agent.
    pub agent_id: String,
    /// Requested action.
    pub action: String,
    /// What the action would touch.
    pub resource_scope: ResourceScope,
    /// Risk score at request time.
    pub risk_score: f64,
    /// Risk tier at request time.
    pub risk_tier: RiskTier,
    /// Agent trust at request time.
    pub trust_score: f64,
    /// Why a human is needed.
    pub justification: String,
    /// Risk factors, largest first.
    pub factors: Vec<RiskFactor>,
    /// Free-form context.
    pub context: Value,
    /// Current state.
    pub status: HitlStatus,
    /// Who resolved it.
    pub reviewer: Option<String>,
    /// Reviewer's notes.
    pub reviewer_notes: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Resolution time.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Deadline after which the request counts as denied.
    pub expires_at: DateTime<Utc>,
}

/// Result of resolving a request.
#[derive(Debug, Clone, PartialEq)]
pub enum HitlResolution {
    /// Approved; the action may proceed.
    Approved(HitlRequest),
    /// Denied by the reviewer.
    Denied(HitlRequest),
    /// Expired before the reviewer answered.
    Expired(HitlRequest),
    /// No request with that id.
    NotFound,
    /// Already in a terminal state.
    AlreadyResolved(HitlRequest),
}

/// What a resolver decided about a fresh request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverOutcome {
    /// Leave it for a human; the caller polls or is called back later.
    Pending,
    /// Approve right away.
    Approve {
        /// Reviewer to record.
        reviewer: String,
        /// Notes to record.
        notes: Option<String>,
    },
    /// Deny right away.
    Deny {
        /// Reviewer to record.
        reviewer: String,
        /// Notes to record.
        notes: Option<String>,
    },
}

/// Decides what happens to a new HITL request.
///
/// Implementations must not block waiting for a human; they either answer
/// immediately or return [`ResolverOutcome::Pending`].
#[async_trait]
pub trait HitlResolver: Send + Sync {
    /// Inspect a freshly queued request.
    async fn on_request(&self, request: &HitlRequest) -> ResolverOutcome;
}

/// Leaves every request for a human reviewer.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualResolver;

#[async_trait]
impl HitlResolver for ManualResolver {
    async fn on_request(&self, _request: &HitlRequest) -> ResolverOutcome {
        ResolverOutcome::Pending
    }
}

/// Approves everything. Only installed when `hitl.auto_approve` is set.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApproveResolver;

#[async_trait]
impl HitlResolver for AutoApproveResolver {
    async fn on_request(&self, request: &HitlRequest) -> ResolverOutcome {
        warn!(
            request_id = %request.request_id,
            agent_id = %request.agent_id,
            action = %request.action,
            "HITL request auto-approved without a human"
        );
        ResolverOutcome::Approve {
            reviewer: AUTO_REVIEWER.to_owned(),
            notes: Some("auto-approved by configuration".to_owned()),
        }
    }
}

/// Queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HitlSettings {
    /// Seconds a request stays open.
    pub timeout_secs: u64,
    /// Approve every request without a human. Never on by default.
    pub auto_approve: bool,
}

impl Default for HitlSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            auto_approve: false,
        }
    }
}

impl HitlSettings {
    /// The resolver these settings call for.
    pub fn resolver(&self) -> Arc<dyn HitlResolver> {
        if self.auto_approve {
            warn!("HITL auto-approve is enabled; high-risk actions will proceed without review");
            Arc::new(AutoApproveResolver)
        } else {
            Arc::new(ManualResolver)
        }
    }
}

/// Persistent HITL request queue.
pub struct HitlQueue {
    store: Store,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl std::fmt::Debug for HitlQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HitlQueue")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HitlQueue {
    /// Create a queue whose requests expire after `settings.timeout_secs`.
    pub fn new(store: Store, clock: Arc<dyn Clock>, settings: &HitlSettings) -> Self {
        let secs = i64::try_from(settings.timeout_secs).unwrap_or(i64::MAX / 1_000);
        Self {
            store,
            clock,
            timeout: Duration::seconds(secs),
        }
    }

    /// Queue a pending request for a scored action.
    ///
    /// The request is stored under a fresh review code; a code that is
    /// already taken is redrawn.
    ///
    /// # Errors
    ///
    /// Returns [`HitlError::Store`] on storage failure, or
    /// [`HitlError::CodeExhausted`] if every drawn code collided.
    pub async fn create(
        &self,
        agent_id: &str,
        action: &str,
        resource_scope: &ResourceScope,
        risk: &RiskResult,
        trust_score: f64,
        context: Value,
    ) -> Result<HitlRequest, HitlError> {
        let now = storage_precision(self.clock.now());
        let expires_at = now.checked_add_signed(self.timeout).unwrap_or(now);
        let mut request = HitlRequest {
            request_id: String::new(),
            agent_id: agent_id.to_owned(),
            action: action.to_owned(),
            resource_scope: resource_scope.clone(),
            risk_score: risk.score,
            risk_tier: risk.tier,
            trust_score,
            justification: risk.justification.clone(),
            factors: risk.factors.clone(),
            context,
            status: HitlStatus::Pending,
            reviewer: None,
            reviewer_notes: None,
            created_at: now,
            resolved_at: None,
            expires_at,
        };

        let resource_scope = serde_json::to_string(&request.resource_scope)?;
        let factors = serde_json::to_string(&request.factors)?;
        let context = serde_json::to_string(&request.context)?;

        for _ in 0..REVIEW_CODE_ATTEMPTS {
            request.request_id = review_code(&mut rand::thread_rng());
            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO hitl_requests (request_id, agent_id, action, \
                 resource_scope, risk_score, risk_tier, trust_score, justification, factors, \
                 context, status, created_at, expires_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )
            .bind(&request.request_id)
            .bind(&request.agent_id)
            .bind(&request.action)
            .bind(&resource_scope)
            .bind(request.risk_score)
            .bind(request.risk_tier.as_str())
            .bind(request.trust_score)
            .bind(&request.justification)
            .bind(&factors)
            .bind(&context)
            .bind(request.status.as_str())
            .bind(format_ts(&request.created_at))
            .bind(format_ts(&request.expires_at))
            .execute(self.store.pool())
            .await?;

            if inserted.rows_affected() == 0 {
                warn!(request_id = %request.request_id, "review code collision, redrawing");
                continue;
            }
            info!(
                request_id = %request.request_id,
                agent_id,
                action,
                risk_score = request.risk_score,
                "HITL request queued"
            );
            return Ok(request);
        }
        Err(HitlError::CodeExhausted(REVIEW_CODE_ATTEMPTS))
    }

    /// Record a reviewer's answer.
    ///
    /// A pending request past its expiry is marked expired instead, and the
    /// answer is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`HitlError::Store`] on storage failure.
    pub async fn resolve(
        &self,
        request_id: &str,
        approved: bool,
        reviewer: &str,
        notes: Option<&str>,
    ) -> Result<HitlResolution, HitlError> {
        let status = if approved {
            HitlStatus::Approved
        } else {
            HitlStatus::Denied
        };
        self.transition(request_id, status, reviewer, notes).await
    }

    /// Record an automatic approval.
    ///
    /// # Errors
    ///
    /// Returns [`HitlError::Store`] on storage failure.
    pub async fn auto_approve(
        &self,
        request_id: &str,
        reviewer: &str,
        notes: Option<&str>,
    ) -> Result<HitlResolution, HitlError> {
        self.transition(request_id, HitlStatus::AutoApproved, reviewer, notes)
            .await
    }

    /// Mark every overdue pending request expired. Returns how many changed.
    ///
    /// # Errors
    ///
    /// Returns [`HitlError::Store`] on storage failure.
    pub async fn expire_stale(&self) -> Result<u64, HitlError> {
        let now = format_ts(&self.clock.now());
        let result = sqlx::query(
            "UPDATE hitl_requests SET status = ?1, reviewer = ?2, resolved_at = ?3 \
             WHERE status = ?4 AND expires_at <= ?3",
        )
        .bind(HitlStatus::Expired.as_str())
        .bind(EXPIRY_REVIEWER)
        .bind(&now)
        .bind(HitlStatus::Pending.as_str())
        .execute(self.store.pool())
        .await?;
        let count = result.rows_affected();
        if count > 0 {
            warn!(count, "stale HITL requests expired");
        }
        Ok(count)
    }

    /// Look a request up.
    ///
    /// # Errors
    ///
    /// Returns [`HitlError::Store`] on storage failure.
    pub async fn get(&self, request_id: &str) -> Result<Option<HitlRequest>, HitlError> {
        let row = sqlx::query("SELECT * FROM hitl_requests WHERE request_id = ?1")
            .bind(request_id)
            .fetch_optional(self.store.pool())
            .await?;
        row.as_ref().map(decode_request).transpose()
    }

    /// Pending requests, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`HitlError::Store`] on storage failure.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<HitlRequest>, HitlError> {
        let rows = sqlx::query(
            "SELECT * FROM hitl_requests WHERE status = ?1 ORDER BY created_at, rowid LIMIT ?2",
        )
        .bind(HitlStatus::Pending.as_str())
        .bind(limit_param(limit))
        .fetch_all(self.store.pool())
        .await?;
        rows.iter().map(decode_request).collect()
    }

    async fn transition(
        &self,
        request_id: &str,
        status: HitlStatus,
        reviewer: &str,
        notes: Option<&str>,
    ) -> Result<HitlResolution, HitlError> {
        let Some(request) = self.get(request_id).await? else {
            return Ok(HitlResolution::NotFound);
        };
        if request.status != HitlStatus::Pending {
            return Ok(HitlResolution::AlreadyResolved(request));
        }

        let now = storage_precision(self.clock.now());
        let (status, reviewer, notes) = if now >= request.expires_at {
            (HitlStatus::Expired, EXPIRY_REVIEWER, None)
        } else {
            (status, reviewer, notes)
        };

        // Only a still-pending row may move; a concurrent resolver loses.
        let result = sqlx::query(
            "UPDATE hitl_requests SET status = ?1, reviewer = ?2, reviewer_notes = ?3, \
             resolved_at = ?4 WHERE request_id = ?5 AND status = ?6",
        )
        .bind(status.as_str())
        .bind(reviewer)
        .bind(notes)
        .bind(format_ts(&now))
        .bind(request_id)
        .bind(HitlStatus::Pending.as_str())
        .execute(self.store.pool())
        .await?;

        let Some(updated) = self.get(request_id).await? else {
            return Ok(HitlResolution::NotFound);
        };
        if result.rows_affected() == 0 {
            return Ok(HitlResolution::AlreadyResolved(updated));
        }

        info!(
            request_id,
            status = status.as_str(),
            reviewer,
            "HITL request resolved"
        );
        Ok(match status {
            HitlStatus::Approved | HitlStatus::AutoApproved => HitlResolution::Approved(updated),
            HitlStatus::Expired => HitlResolution::Expired(updated),
            HitlStatus::Denied | HitlStatus::Pending => HitlResolution::Denied(updated),
        })
    }
}

fn decode_request(row: &sqlx::sqlite::SqliteRow) -> Result<HitlRequest, HitlError> {
    let scope: String = row.try_get("resource_scope")?;
    let tier: String = row.try_get("risk_tier")?;
    let factors: String = row.try_get("factors")?;
    let context: String = row.try_get("context")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let resolved_at: Option<String> = row.try_get("resolved_at")?;
    let expires_at: String = row.try_get("expires_at")?;
    Ok(HitlRequest {
        request_id: row.try_get("request_id")?,
        agent_id: row.try_get("agent_id")?,
        action: row.try_get("action")?,
        resource_scope: serde_json::from_str(&scope)?,
        risk_score: row.try_get("risk_score")?,
        risk_tier: RiskTier::parse(&tier).ok_or(StoreError::InvalidEnum {
            field: "risk_tier",
            value: tier.clone(),
        })?,
        trust_score: row.try_get("trust_score")?,
        justification: row.try_get("justification")?,
        factors: serde_json::from_str(&factors)?,
        context: serde_json::from_str(&context)?,
        status: HitlStatus::parse(&status)?,
        reviewer: row.try_get("reviewer")?,
        reviewer_notes: row.try_get("reviewer_notes")?,
        created_at: parse_ts(&created_at)?,
        resolved_at: parse_ts_opt(resolved_at.as_deref())?,
        expires_at: parse_ts(&expires_at)?,
    })
}

/// Draw a review code.
fn review_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..REVIEW_CODE_LEN)
        .filter_map(|_| REVIEW_CODE_ALPHABET.choose(rng).copied().map(char::from))
        .collect()
}
