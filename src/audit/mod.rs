//! Tamper-evident audit receipt chain.
//!
//! Receipts form a strictly ordered, singly linked hash chain: each receipt
//! hashes its own fields together with the previous receipt's hash and signs
//! the result. Appends go through a single actor task (see [`appender`]) that
//! owns the chain tip, so concurrent callers can never fork the chain.
//!
//! [`AuditReceiptChain::verify_chain_integrity`] only detects tampering; it
//! does not prevent it.

mod appender;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

use crate::clock::Clock;
use crate::signing::{hash_canonical, Signer, SigningError, GENESIS_HASH};
use crate::store::{format_ts, limit_param, parse_ts, Store, StoreError};

use self::appender::{AppendOp, Appender, APPEND_QUEUE_DEPTH};

/// Errors from the receipt chain.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Hashing failed.
    #[error(transparent)]
    Signing(#[from] SigningError),

    /// The append actor is gone.
    #[error("audit appender is not running")]
    AppenderClosed,
}

impl From<sqlx::Error> for AuditError {
    fn from(e: sqlx::Error) -> Self {
        Self::Store(StoreError::Database(e))
    }
}

impl From<serde_json::Error> for AuditError {
    fn from(e: serde_json::Error) -> Self {
        Self::Store(StoreError::Serialization(e))
    }
}

/// A sealed audit receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReceipt {
    /// Position in the chain, starting at 1.
    pub seq: i64,
    /// Receipt id.
    pub receipt_id: String,
    /// Lineage node the receipt seals.
    pub lineage_node_id: Option<String>,
    /// What kind of action it records.
    pub action_type: String,
    /// Acting agent.
    pub agent_id: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Hash of the action's input.
    pub input_hash: Option<String>,
    /// Hash of the action's output.
    pub output_hash: Option<String>,
    /// Short description of the output.
    pub output_summary: Option<String>,
    /// Capability token used.
    pub token_id: Option<String>,
    /// Token scope at creation time.
    pub token_scope_snapshot: Option<Value>,
    /// HITL request involved.
    pub hitl_request_id: Option<String>,
    /// Risk score at creation time.
    pub risk_score: Option<f64>,
    /// Trust score at creation time.
    pub trust_score: Option<f64>,
    /// Arbitrary evidence.
    pub evidence: Value,
    /// Hash of the previous receipt, or [`GENESIS_HASH`].
    pub previous_receipt_hash: String,
    /// Hash over every other field except `key_id` and `signature`.
    pub receipt_hash: String,
    /// Signing key id.
    pub key_id: String,
    /// Signature over `receipt_hash`.
    pub signature: String,
}

#[derive(Serialize)]
struct HashedFields<'a> {
    seq: i64,
    receipt_id: &'a str,
    lineage_node_id: Option<&'a str>,
    action_type: &'a str,
    agent_id: &'a str,
    timestamp: String,
    input_hash: Option<&'a str>,
    output_hash: Option<&'a str>,
    output_summary: Option<&'a str>,
    token_id: Option<&'a str>,
    token_scope_snapshot: Option<&'a Value>,
    hitl_request_id: Option<&'a str>,
    risk_score: Option<f64>,
    trust_score: Option<f64>,
    evidence: &'a Value,
    previous_receipt_hash: &'a str,
}

/// Recompute a receipt's hash from its stored fields.
pub(crate) fn hash_receipt(receipt: &AuditReceipt) -> Result<String, SigningError> {
    hash_canonical(&HashedFields {
        seq: receipt.seq,
        receipt_id: &receipt.receipt_id,
        lineage_node_id: receipt.lineage_node_id.as_deref(),
        action_type: &receipt.action_type,
        agent_id: &receipt.agent_id,
        timestamp: format_ts(&receipt.timestamp),
        input_hash: receipt.input_hash.as_deref(),
        output_hash: receipt.output_hash.as_deref(),
        output_summary: receipt.output_summary.as_deref(),
        token_id: receipt.token_id.as_deref(),
        token_scope_snapshot: receipt.token_scope_snapshot.as_ref(),
        hitl_request_id: receipt.hitl_request_id.as_deref(),
        risk_score: receipt.risk_score,
        trust_score: receipt.trust_score,
        evidence: &receipt.evidence,
        previous_receipt_hash: &receipt.previous_receipt_hash,
    })
}

/// Parameters for [`AuditReceiptChain::create_receipt`].
///
/// Raw input/output payloads are hashed and then dropped; only the hashes
/// are stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReceiptRequest {
    /// What kind of action it records.
    pub action_type: String,
    /// Acting agent.
    pub agent_id: String,
    /// Lineage node sealed by the receipt.
    pub lineage_node_id: Option<String>,
    /// Input payload to hash.
    pub input_data: Option<Value>,
    /// Output payload to hash.
    pub output_data: Option<Value>,
    /// Short description of the output.
    pub output_summary: Option<String>,
    /// Capability token used.
    pub token_id: Option<String>,
    /// Token scope at creation time.
    pub token_scope_snapshot: Option<Value>,
    /// HITL request involved.
    pub hitl_request_id: Option<String>,
    /// Risk score at creation time.
    pub risk_score: Option<f64>,
    /// Trust score at creation time.
    pub trust_score: Option<f64>,
    /// Arbitrary evidence.
    pub evidence: Value,
}

impl ReceiptRequest {
    /// Request with only the required fields set.
    pub fn new(action_type: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            agent_id: agent_id.into(),
            ..Self::default()
        }
    }
}

/// Why verification stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainViolation {
    /// `previous_receipt_hash` does not match the prior receipt.
    LinkageBroken,
    /// Recomputed hash differs from the stored one.
    ContentTampered,
    /// Signature does not verify.
    SignatureInvalid,
}

impl ChainViolation {
    /// Stable reason string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LinkageBroken => "linkage_broken",
            Self::ContentTampered => "content_tampered",
            Self::SignatureInvalid => "signature_invalid",
        }
    }
}

/// Result of [`AuditReceiptChain::verify_chain_integrity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    /// Whether every checked receipt is intact.
    pub valid: bool,
    /// Receipts examined, including the failing one.
    pub receipts_checked: u64,
    /// First receipt that failed.
    pub first_invalid_id: Option<String>,
    /// Why it failed.
    pub reason: Option<ChainViolation>,
}

/// Current end of the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    /// Number of receipts.
    pub length: u64,
    /// Hash the next receipt will link to.
    pub receipt_hash: String,
}

/// Append-only, hash-chained, signed receipt log.
pub struct AuditReceiptChain {
    store: Store,
    signer: Arc<dyn Signer>,
    tx: mpsc::Sender<AppendOp>,
}

impl std::fmt::Debug for AuditReceiptChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditReceiptChain")
            .field("key_id", &self.signer.key_id())
            .finish_non_exhaustive()
    }
}

impl AuditReceiptChain {
    /// Create the chain and spawn its append actor.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(store: Store, signer: Arc<dyn Signer>, clock: Arc<dyn Clock>) -> Self {
        let (tx, rx) = mpsc::channel(APPEND_QUEUE_DEPTH);
        let appender = Appender::new(store.clone(), Arc::clone(&signer), clock);
        tokio::spawn(appender.run(rx));
        Self { store, signer, tx }
    }

    /// Seal an event into the chain.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::AppenderClosed`] if the actor has stopped, or the
    /// store/hashing error the actor hit.
    pub async fn create_receipt(&self, request: ReceiptRequest) -> Result<AuditReceipt, AuditError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AppendOp { request, reply })
            .await
            .map_err(|_| AuditError::AppenderClosed)?;
        rx.await.map_err(|_| AuditError::AppenderClosed)?
    }

    /// Walk the chain from the start and stop at the first bad receipt.
    ///
    /// `limit` caps how many receipts are checked; `None` checks them all.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Store`] if receipts cannot be read.
    pub async fn verify_chain_integrity(
        &self,
        limit: Option<usize>,
    ) -> Result<ChainVerification, AuditError> {
        let rows = sqlx::query("SELECT * FROM audit_receipts ORDER BY seq ASC LIMIT ?1")
            .bind(limit.map_or(-1, limit_param))
            .fetch_all(self.store.pool())
            .await?;

        let mut expected_previous = GENESIS_HASH.to_owned();
        let mut checked = 0_u64;
        for row in &rows {
            checked = checked.saturating_add(1);
            let receipt_id: String = row.try_get("receipt_id")?;
            let violation = match decode_receipt(row) {
                Ok(receipt) => self.check_receipt(&receipt, &expected_previous),
                // A row that no longer decodes has been edited.
                Err(_) => Some(ChainViolation::ContentTampered),
            };
            if let Some(reason) = violation {
                error!(
                    receipt_id = %receipt_id,
                    reason = reason.as_str(),
                    receipts_checked = checked,
                    "audit chain integrity violation"
                );
                return Ok(ChainVerification {
                    valid: false,
                    receipts_checked: checked,
                    first_invalid_id: Some(receipt_id),
                    reason: Some(reason),
                });
            }
            expected_previous = row.try_get("receipt_hash")?;
        }

        info!(receipts_checked = checked, "audit chain verified");
        Ok(ChainVerification {
            valid: true,
            receipts_checked: checked,
            first_invalid_id: None,
            reason: None,
        })
    }

    /// Look a receipt up.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Store`] on storage failure.
    pub async fn get(&self, receipt_id: &str) -> Result<Option<AuditReceipt>, AuditError> {
        let row = sqlx::query("SELECT * FROM audit_receipts WHERE receipt_id = ?1")
            .bind(receipt_id)
            .fetch_optional(self.store.pool())
            .await?;
        row.as_ref().map(decode_receipt).transpose()
    }

    /// An agent's receipts, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Store`] on storage failure.
    pub async fn receipts_for_agent(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<AuditReceipt>, AuditError> {
        let rows = sqlx::query(
            "SELECT * FROM audit_receipts WHERE agent_id = ?1 ORDER BY seq DESC LIMIT ?2",
        )
        .bind(agent_id)
        .bind(limit_param(limit))
        .fetch_all(self.store.pool())
        .await?;
        rows.iter().map(decode_receipt).collect()
    }

    /// Length and tip hash of the chain.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Store`] on storage failure.
    pub async fn chain_tip(&self) -> Result<ChainTip, AuditError> {
        let row: Option<(i64, String)> = sqlx::query_as(
            "SELECT seq, receipt_hash FROM audit_receipts ORDER BY seq DESC LIMIT 1",
        )
        .fetch_optional(self.store.pool())
        .await?;
        Ok(match row {
            Some((seq, hash)) => ChainTip {
                length: u64::try_from(seq).unwrap_or(0),
                receipt_hash: hash,
            },
            None => ChainTip {
                length: 0,
                receipt_hash: GENESIS_HASH.to_owned(),
            },
        })
    }

    fn check_receipt(&self, receipt: &AuditReceipt, expected_previous: &str) -> Option<ChainViolation> {
        if receipt.previous_receipt_hash != expected_previous {
            return Some(ChainViolation::LinkageBroken);
        }
        match hash_receipt(receipt) {
            Ok(hash) if hash == receipt.receipt_hash => {}
            _ => return Some(ChainViolation::ContentTampered),
        }
        if !self
            .signer
            .verify(&receipt.key_id, receipt.receipt_hash.as_bytes(), &receipt.signature)
        {
            return Some(ChainViolation::SignatureInvalid);
        }
        None
    }
}

fn decode_receipt(row: &sqlx::sqlite::SqliteRow) -> Result<AuditReceipt, AuditError> {
    let recorded_at: String = row.try_get("recorded_at")?;
    let snapshot: Option<String> = row.try_get("token_scope_snapshot")?;
    let evidence: String = row.try_get("evidence")?;
    Ok(AuditReceipt {
        seq: row.try_get("seq")?,
        receipt_id: row.try_get("receipt_id")?,
        lineage_node_id: row.try_get("lineage_node_id")?,
        action_type: row.try_get("action_type")?,
        agent_id: row.try_get("agent_id")?,
        timestamp: parse_ts(&recorded_at)?,
        input_hash: row.try_get("input_hash")?,
        output_hash: row.try_get("output_hash")?,
        output_summary: row.try_get("output_summary")?,
        token_id: row.try_get("token_id")?,
        token_scope_snapshot: snapshot.as_deref().map(serde_json::from_str).transpose()?,
        hitl_request_id: row.try_get("hitl_request_id")?,
        risk_score: row.try_get("risk_score")?,
        trust_score: row.try_get("trust_score")?,
        evidence: serde_json::from_str(&evidence)?,
        previous_receipt_hash: row.try_get("previous_receipt_hash")?,
        receipt_hash: row.try_get("receipt_hash")?,
        key_id: row.try_get("key_id")?,
        signature: row.try_get("signature")?,
    })
}
