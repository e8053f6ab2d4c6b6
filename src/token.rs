//! Ephemeral, scoped, signed capability tokens.
//!
//! A token authorizes exactly one action for one agent over a bounded
//! resource scope. It is valid iff it is not revoked, not expired, has uses
//! remaining and its signature matches its canonical fields. Validation
//! consumes a use with a single conditional `UPDATE`, so a single-use token
//! can never be spent twice, even under concurrent validation.
//!
//! Delegation narrows and never widens: a child token inherits the parent's
//! action, cannot outlive it, cannot have more uses than it has left, and its
//! constraints and scope are intersected with the parent's.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::risk::ActionCategory;
use crate::signing::{canonical_json, Signer, SigningError};
use crate::store::{format_ts, parse_ts, storage_precision, Store, StoreError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Token failures. Every validation failure has its own variant.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// No token with this id.
    #[error("token not found: {0}")]
    NotFound(String),

    /// Token was revoked.
    #[error("token revoked: {0}")]
    Revoked(String),

    /// Token is past its expiry.
    #[error("token expired: {0}")]
    Expired(String),

    /// Token has no uses left.
    #[error("token exhausted: {0}")]
    Exhausted(String),

    /// Token authorizes a different action.
    #[error("token action mismatch: expected {expected}, token grants {actual}")]
    ActionMismatch {
        /// Action the caller wanted.
        expected: String,
        /// Action the token grants.
        actual: String,
    },

    /// Stored fields no longer match the signature.
    #[error("token signature invalid: {0}")]
    SignatureInvalid(String),

    /// Delegation parent is missing or not active.
    #[error("parent token {parent_id} cannot delegate: {reason}")]
    ParentInactive {
        /// Parent token id.
        parent_id: String,
        /// Why the parent is unusable.
        reason: &'static str,
    },

    /// Delegation would change the action or resource type.
    #[error("delegation cannot widen parent token: {0}")]
    DelegationMismatch(String),

    /// Backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Signing or canonical encoding failed.
    #[error(transparent)]
    Signing(#[from] SigningError),
}

impl From<sqlx::Error> for TokenError {
    fn from(e: sqlx::Error) -> Self {
        Self::Store(StoreError::Database(e))
    }
}

impl From<serde_json::Error> for TokenError {
    fn from(e: serde_json::Error) -> Self {
        Self::Store(StoreError::Serialization(e))
    }
}

impl TokenError {
    /// Stable machine-readable reason code.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Revoked(_) => "revoked",
            Self::Expired(_) => "expired",
            Self::Exhausted(_) => "exhausted",
            Self::ActionMismatch { .. } => "action_mismatch",
            Self::SignatureInvalid(_) => "signature_invalid",
            Self::ParentInactive { .. } => "parent_inactive",
            Self::DelegationMismatch(_) => "delegation_mismatch",
            Self::Store(_) => "store_error",
            Self::Signing(_) => "signing_error",
        }
    }

    /// Whether the failure is infrastructure rather than policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What a token may touch.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceScope {
    /// Resource type (table, tool, collection).
    pub resource_type: String,
    /// Specific ids; empty means every id of the type.
    #[serde(default)]
    pub resource_ids: Vec<String>,
    /// Workspace boundary.
    #[serde(default)]
    pub workspace_id: Option<String>,
}

impl ResourceScope {
    /// Scope over every resource of a type.
    pub fn of_type(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_ids: Vec::new(),
            workspace_id: None,
        }
    }

    /// Intersect with a parent's scope.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::DelegationMismatch`] if the resource types or the
    /// workspaces differ.
    pub fn narrow(&self, parent: &ResourceScope) -> Result<ResourceScope, TokenError> {
        if self.resource_type != parent.resource_type {
            return Err(TokenError::DelegationMismatch(format!(
                "resource type {} outside parent type {}",
                self.resource_type, parent.resource_type
            )));
        }
        let workspace_id = match (&self.workspace_id, &parent.workspace_id) {
            (Some(child), Some(parent_ws)) if child != parent_ws => {
                return Err(TokenError::DelegationMismatch(format!(
                    "workspace {child} outside parent workspace {parent_ws}"
                )));
            }
            (_, Some(parent_ws)) => Some(parent_ws.clone()),
            (child, None) => child.clone(),
        };
        let resource_ids = if parent.resource_ids.is_empty() {
            self.resource_ids.clone()
        } else if self.resource_ids.is_empty() {
            parent.resource_ids.clone()
        } else {
            let kept: Vec<String> = self
                .resource_ids
                .iter()
                .filter(|id| parent.resource_ids.contains(id))
                .cloned()
                .collect();
            if kept.is_empty() {
                return Err(TokenError::DelegationMismatch(
                    "no requested resource id is covered by the parent".to_owned(),
                ));
            }
            kept
        };
        Ok(ResourceScope {
            resource_type: self.resource_type.clone(),
            resource_ids,
            workspace_id,
        })
    }

    /// Whether this scope is covered by `parent`.
    pub fn is_within(&self, parent: &ResourceScope) -> bool {
        self.resource_type == parent.resource_type
            && (parent.workspace_id.is_none() || self.workspace_id == parent.workspace_id)
            && (parent.resource_ids.is_empty()
                || (!self.resource_ids.is_empty()
                    && self.resource_ids.iter().all(|id| parent.resource_ids.contains(id))))
    }
}

/// Limits attached to a token.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TokenConstraints {
    /// No writes allowed.
    #[serde(default)]
    pub read_only: bool,
    /// Maximum records the action may touch.
    #[serde(default)]
    pub max_records: Option<u64>,
    /// Maximum dollar cost the action may incur.
    #[serde(default)]
    pub max_cost: Option<f64>,
}

impl TokenConstraints {
    /// Intersect with a parent's constraints.
    ///
    /// Read-only propagates down; numeric caps take the minimum, and a cap
    /// the child omits is inherited from the parent.
    pub fn narrow(&self, parent: &TokenConstraints) -> TokenConstraints {
        TokenConstraints {
            read_only: self.read_only || parent.read_only,
            max_records: min_cap(self.max_records, parent.max_records),
            max_cost: match (self.max_cost, parent.max_cost) {
                (Some(c), Some(p)) => Some(c.min(p)),
                (Some(c), None) => Some(c),
                (None, p) => p,
            },
        }
    }

    /// Whether these constraints are at least as strict as `parent`.
    pub fn is_within(&self, parent: &TokenConstraints) -> bool {
        (self.read_only || !parent.read_only)
            && parent
                .max_records
                .map_or(true, |p| self.max_records.is_some_and(|c| c <= p))
            && parent
                .max_cost
                .map_or(true, |p| self.max_cost.is_some_and(|c| c <= p))
    }
}

fn min_cap(child: Option<u64>, parent: Option<u64>) -> Option<u64> {
    match (child, parent) {
        (Some(c), Some(p)) => Some(c.min(p)),
        (c, None) => c,
        (None, p) => p,
    }
}

/// A capability token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityToken {
    /// Token id.
    pub token_id: String,
    /// Who issued it.
    pub issuer: String,
    /// Agent it was issued to.
    pub subject: String,
    /// The single action it authorizes.
    pub action: String,
    /// What it may touch.
    pub resource_scope: ResourceScope,
    /// Limits on the action.
    pub constraints: TokenConstraints,
    /// Issue time.
    pub issued_at: DateTime<Utc>,
    /// Expiry time.
    pub expires_at: DateTime<Utc>,
    /// Uses granted at issue.
    pub max_uses: u32,
    /// Uses left.
    pub uses_remaining: u32,
    /// Token this one was delegated from.
    pub parent_token_id: Option<String>,
    /// Revoked flag.
    pub revoked: bool,
    /// Signing key id.
    pub key_id: String,
    /// Hex MAC over the canonical fields.
    pub signature: String,
}

impl CapabilityToken {
    /// Not revoked, not expired and not exhausted at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && now < self.expires_at && self.uses_remaining > 0
    }

    /// Canonical bytes the signature covers.
    ///
    /// # Errors
    ///
    /// Returns [`SigningError::Canonical`] if encoding fails.
    pub fn signing_payload(&self) -> Result<Vec<u8>, SigningError> {
        canonical_json(&SignedFields {
            token_id: &self.token_id,
            issuer: &self.issuer,
            subject: &self.subject,
            action: &self.action,
            scope: &self.resource_scope,
            constraints: &self.constraints,
            issued_at: format_ts(&self.issued_at),
            expires_at: format_ts(&self.expires_at),
            max_uses: self.max_uses,
        })
    }
}

#[derive(Serialize)]
struct SignedFields<'a> {
    token_id: &'a str,
    issuer: &'a str,
    subject: &'a str,
    action: &'a str,
    scope: &'a ResourceScope,
    constraints: &'a TokenConstraints,
    issued_at: String,
    expires_at: String,
    max_uses: u32,
}

/// Default TTL per action category, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlSettings {
    /// Query TTL.
    pub query: u64,
    /// Evaluate TTL.
    pub evaluate: u64,
    /// Calculate TTL.
    pub calculate: u64,
    /// Create TTL.
    pub create: u64,
    /// Update TTL.
    pub update: u64,
    /// Delete TTL.
    pub delete: u64,
    /// Investigate TTL.
    pub investigate: u64,
    /// Chat TTL.
    pub chat: u64,
    /// Escalate TTL.
    pub escalate: u64,
}

impl TtlSettings {
    /// TTL for a category.
    pub fn for_category(&self, category: ActionCategory) -> Duration {
        let secs = match category {
            ActionCategory::Query => self.query,
            ActionCategory::Evaluate => self.evaluate,
            ActionCategory::Calculate => self.calculate,
            ActionCategory::Create => self.create,
            ActionCategory::Update => self.update,
            ActionCategory::Delete => self.delete,
            ActionCategory::Investigate => self.investigate,
            ActionCategory::Chat => self.chat,
            ActionCategory::Escalate => self.escalate,
        };
        Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1_000))
    }
}

impl Default for TtlSettings {
    fn default() -> Self {
        Self {
            query: 60,
            evaluate: 60,
            calculate: 60,
            create: 120,
            update: 120,
            delete: 60,
            investigate: 300,
            chat: 300,
            escalate: 60,
        }
    }
}

/// Token service settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenSettings {
    /// Issuer recorded when the caller does not name one.
    pub issuer: String,
    /// Uses granted when the caller does not say.
    pub default_max_uses: u32,
    /// Per-category TTLs.
    pub ttl: TtlSettings,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            issuer: "trustgate".to_owned(),
            default_max_uses: 1,
            ttl: TtlSettings::default(),
        }
    }
}

/// Parameters for [`CapabilityTokenService::issue`].
#[derive(Debug, Clone, PartialEq)]
pub struct IssueRequest {
    /// Agent the token is for.
    pub agent_id: String,
    /// Action it authorizes.
    pub action: String,
    /// Category of the action (drives the default TTL).
    pub category: ActionCategory,
    /// What it may touch.
    pub resource_scope: ResourceScope,
    /// Requested limits.
    pub constraints: TokenConstraints,
    /// Explicit TTL overriding the category default.
    pub ttl: Option<Duration>,
    /// Uses to grant; `None` uses the configured default.
    pub max_uses: Option<u32>,
    /// Issuer; `None` uses the configured issuer.
    pub issuer: Option<String>,
    /// Parent token to delegate from.
    pub parent_token_id: Option<String>,
}

impl IssueRequest {
    /// Request with default TTL, uses, issuer and no parent.
    pub fn new(
        agent_id: impl Into<String>,
        action: impl Into<String>,
        category: ActionCategory,
        resource_scope: ResourceScope,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            action: action.into(),
            category,
            resource_scope,
            constraints: TokenConstraints::default(),
            ttl: None,
            max_uses: None,
            issuer: None,
            parent_token_id: None,
        }
    }
}

/// Successful validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedToken {
    /// Token state after the use was consumed.
    pub token: CapabilityToken,
    /// Uses left after this one.
    pub uses_remaining: u32,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Issues, validates and revokes capability tokens.
pub struct CapabilityTokenService {
    store: Store,
    signer: Arc<dyn Signer>,
    clock: Arc<dyn Clock>,
    settings: TokenSettings,
}

impl std::fmt::Debug for CapabilityTokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityTokenService")
            .field("key_id", &self.signer.key_id())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl CapabilityTokenService {
    /// Create a token service.
    pub fn new(
        store: Store,
        signer: Arc<dyn Signer>,
        clock: Arc<dyn Clock>,
        settings: TokenSettings,
    ) -> Self {
        Self {
            store,
            signer,
            clock,
            settings,
        }
    }

    /// Issue a token, narrowing it against its parent when delegating.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::ParentInactive`] or [`TokenError::DelegationMismatch`]
    /// for bad delegations, or a store/signing error.
    pub async fn issue(&self, request: IssueRequest) -> Result<CapabilityToken, TokenError> {
        let now = storage_precision(self.clock.now());
        let ttl = request
            .ttl
            .unwrap_or_else(|| self.settings.ttl.for_category(request.category));
        let mut expires_at = storage_precision(now.checked_add_signed(ttl).unwrap_or(now));
        let mut max_uses = request
            .max_uses
            .unwrap_or(self.settings.default_max_uses)
            .max(1);
        let mut constraints = request.constraints.clone();
        let mut scope = request.resource_scope.clone();

        if let Some(parent_id) = &request.parent_token_id {
            let parent = self.load(parent_id).await?.ok_or_else(|| TokenError::ParentInactive {
                parent_id: parent_id.clone(),
                reason: "not found",
            })?;
            if let Some(reason) = self.inactive_reason(&parent, now) {
                return Err(TokenError::ParentInactive {
                    parent_id: parent_id.clone(),
                    reason,
                });
            }
            if parent.action != request.action {
                return Err(TokenError::DelegationMismatch(format!(
                    "action {} differs from parent action {}",
                    request.action, parent.action
                )));
            }
            constraints = constraints.narrow(&parent.constraints);
            scope = scope.narrow(&parent.resource_scope)?;
            expires_at = expires_at.min(parent.expires_at);
            max_uses = max_uses.min(parent.uses_remaining);
        }

        let mut token = CapabilityToken {
            token_id: Uuid::new_v4().to_string(),
            issuer: request
                .issuer
                .clone()
                .unwrap_or_else(|| self.settings.issuer.clone()),
            subject: request.agent_id.clone(),
            action: request.action.clone(),
            resource_scope: scope,
            constraints,
            issued_at: now,
            expires_at,
            max_uses,
            uses_remaining: max_uses,
            parent_token_id: request.parent_token_id.clone(),
            revoked: false,
            key_id: self.signer.key_id().to_owned(),
            signature: String::new(),
        };
        token.signature = self.signer.sign(&token.signing_payload()?);

        sqlx::query(
            "INSERT INTO capability_tokens (token_id, issuer, subject, action, resource_scope, \
             constraints, issued_at, expires_at, max_uses, uses_remaining, parent_token_id, \
             revoked, key_id, signature) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12, ?13)",
        )
        .bind(&token.token_id)
        .bind(&token.issuer)
        .bind(&token.subject)
        .bind(&token.action)
        .bind(serde_json::to_string(&token.resource_scope)?)
        .bind(serde_json::to_string(&token.constraints)?)
        .bind(format_ts(&token.issued_at))
        .bind(format_ts(&token.expires_at))
        .bind(i64::from(token.max_uses))
        .bind(i64::from(token.uses_remaining))
        .bind(&token.parent_token_id)
        .bind(&token.key_id)
        .bind(&token.signature)
        .execute(self.store.pool())
        .await?;

        info!(
            token_id = %token.token_id,
            agent_id = %token.subject,
            action = %token.action,
            expires_at = %token.expires_at,
            delegated = token.parent_token_id.is_some(),
            "capability token issued"
        );
        Ok(token)
    }

    /// Validate a token and consume one use.
    ///
    /// Checks run in order: not found, revoked, expired, exhausted, action
    /// mismatch, signature. A use is consumed only when every check passes.
    ///
    /// # Errors
    ///
    /// Returns the specific [`TokenError`] variant for the first failed check.
    pub async fn validate(
        &self,
        token_id: &str,
        expected_action: Option<&str>,
    ) -> Result<ValidatedToken, TokenError> {
        let now = self.clock.now();
        let token = self
            .load(token_id)
            .await?
            .ok_or_else(|| TokenError::NotFound(token_id.to_owned()))?;

        self.check_usable(&token, now)?;
        if let Some(expected) = expected_action {
            if expected != token.action {
                return Err(TokenError::ActionMismatch {
                    expected: expected.to_owned(),
                    actual: token.action.clone(),
                });
            }
        }
        if !self.verify_signature(&token)? {
            warn!(token_id, "capability token signature mismatch");
            return Err(TokenError::SignatureInvalid(token_id.to_owned()));
        }

        let result = sqlx::query(
            "UPDATE capability_tokens SET uses_remaining = uses_remaining - 1 \
             WHERE token_id = ?1 AND revoked = 0 AND uses_remaining > 0 AND expires_at > ?2",
        )
        .bind(token_id)
        .bind(format_ts(&now))
        .execute(self.store.pool())
        .await?;

        if result.rows_affected() == 0 {
            // Lost a race with another validation or a revocation.
            let current = self
                .load(token_id)
                .await?
                .ok_or_else(|| TokenError::NotFound(token_id.to_owned()))?;
            self.check_usable(&current, now)?;
            return Err(TokenError::Exhausted(token_id.to_owned()));
        }

        let mut token = token;
        token.uses_remaining = token.uses_remaining.saturating_sub(1);
        debug!(token_id, uses_remaining = token.uses_remaining, "capability token used");
        Ok(ValidatedToken {
            uses_remaining: token.uses_remaining,
            token,
        })
    }

    /// Revoke one token. Returns `false` if it was already revoked.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::NotFound`] if no such token exists.
    pub async fn revoke(&self, token_id: &str, reason: &str) -> Result<bool, TokenError> {
        let result = sqlx::query(
            "UPDATE capability_tokens SET revoked = 1, revoked_reason = ?2 \
             WHERE token_id = ?1 AND revoked = 0",
        )
        .bind(token_id)
        .bind(reason)
        .execute(self.store.pool())
        .await?;

        if result.rows_affected() == 0 {
            return match self.load(token_id).await? {
                Some(_) => Ok(false),
                None => Err(TokenError::NotFound(token_id.to_owned())),
            };
        }
        info!(token_id, reason, "capability token revoked");
        Ok(true)
    }

    /// Revoke every unrevoked token held by an agent. Returns the count.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Store`] on storage failure.
    pub async fn revoke_all_for_agent(&self, agent_id: &str, reason: &str) -> Result<u64, TokenError> {
        let result = sqlx::query(
            "UPDATE capability_tokens SET revoked = 1, revoked_reason = ?2 \
             WHERE subject = ?1 AND revoked = 0",
        )
        .bind(agent_id)
        .bind(reason)
        .execute(self.store.pool())
        .await?;
        let count = result.rows_affected();
        info!(agent_id, reason, count, "agent tokens revoked");
        Ok(count)
    }

    /// Look a token up without consuming it.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Store`] on storage failure.
    pub async fn get(&self, token_id: &str) -> Result<Option<CapabilityToken>, TokenError> {
        self.load(token_id).await
    }

    /// Tokens an agent could still use right now.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Store`] on storage failure.
    pub async fn active_for_agent(&self, agent_id: &str) -> Result<Vec<CapabilityToken>, TokenError> {
        let now = self.clock.now();
        let rows = sqlx::query(
            "SELECT * FROM capability_tokens WHERE subject = ?1 AND revoked = 0 \
             AND uses_remaining > 0 AND expires_at > ?2 ORDER BY issued_at",
        )
        .bind(agent_id)
        .bind(format_ts(&now))
        .fetch_all(self.store.pool())
        .await?;
        rows.iter().map(decode_token).collect()
    }

    /// Recompute the signature over the token's canonical fields.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Signing`] if the fields cannot be encoded.
    pub fn verify_signature(&self, token: &CapabilityToken) -> Result<bool, TokenError> {
        let payload = token.signing_payload()?;
        Ok(self
            .signer
            .verify(&token.key_id, &payload, &token.signature))
    }

    fn check_usable(&self, token: &CapabilityToken, now: DateTime<Utc>) -> Result<(), TokenError> {
        if token.revoked {
            return Err(TokenError::Revoked(token.token_id.clone()));
        }
        if now >= token.expires_at {
            return Err(TokenError::Expired(token.token_id.clone()));
        }
        if token.uses_remaining == 0 {
            return Err(TokenError::Exhausted(token.token_id.clone()));
        }
        Ok(())
    }

    fn inactive_reason(&self, token: &CapabilityToken, now: DateTime<Utc>) -> Option<&'static str> {
        match self.check_usable(token, now) {
            Err(e) => Some(e.reason()),
            Ok(()) => match self.verify_signature(token) {
                Ok(true) => None,
                _ => Some("signature_invalid"),
            },
        }
    }

    async fn load(&self, token_id: &str) -> Result<Option<CapabilityToken>, TokenError> {
        let row = sqlx::query("SELECT * FROM capability_tokens WHERE token_id = ?1")
            .bind(token_id)
            .fetch_optional(self.store.pool())
            .await?;
        row.as_ref().map(decode_token).transpose()
    }
}

fn decode_token(row: &sqlx::sqlite::SqliteRow) -> Result<CapabilityToken, TokenError> {
    let scope: String = row.try_get("resource_scope")?;
    let constraints: String = row.try_get("constraints")?;
    let issued_at: String = row.try_get("issued_at")?;
    let expires_at: String = row.try_get("expires_at")?;
    let max_uses: i64 = row.try_get("max_uses")?;
    let uses_remaining: i64 = row.try_get("uses_remaining")?;
    let revoked: i64 = row.try_get("revoked")?;
    Ok(CapabilityToken {
        token_id: row.try_get("token_id")?,
        issuer: row.try_get("issuer")?,
        subject: row.try_get("subject")?,
        action: row.try_get("action")?,
        resource_scope: serde_json::from_str(&scope)?,
        constraints: serde_json::from_str(&constraints)?,
        issued_at: parse_ts(&issued_at)?,
        expires_at: parse_ts(&expires_at)?,
        max_uses: u32::try_from(max_uses).unwrap_or(0),
        uses_remaining: u32::try_from(uses_remaining).unwrap_or(0),
        parent_token_id: row.try_get("parent_token_id")?,
        revoked: revoked != 0,
        key_id: row.try_get("key_id")?,
        signature: row.try_get("signature")?,
    })
}
