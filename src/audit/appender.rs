//! Single-writer actor that owns the chain tip.
//!
//! Every receipt append flows through this actor via an
//! [`mpsc`](tokio::sync::mpsc) channel, so linkage is decided by exactly one
//! task and the chain can never fork. Reads go straight to the pool.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, trace};

use super::{hash_receipt, AuditError, AuditReceipt, ReceiptRequest};
use crate::clock::Clock;
use crate::signing::{hash_canonical, Signer, GENESIS_HASH};
use crate::store::{format_ts, storage_precision, Store};

/// Depth of the append queue.
pub(crate) const APPEND_QUEUE_DEPTH: usize = 256;

/// One append waiting for the actor.
pub(crate) struct AppendOp {
    pub(crate) request: ReceiptRequest,
    pub(crate) reply: oneshot::Sender<Result<AuditReceipt, AuditError>>,
}

/// Everything the actor needs to seal receipts.
pub(crate) struct Appender {
    store: Store,
    signer: Arc<dyn Signer>,
    clock: Arc<dyn Clock>,
    /// Hash of the newest persisted receipt; loaded on first use.
    tip: Option<(i64, String)>,
}

impl Appender {
    pub(crate) fn new(store: Store, signer: Arc<dyn Signer>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            signer,
            clock,
            tip: None,
        }
    }

    /// Run until every sender is dropped.
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<AppendOp>) {
        while let Some(op) = rx.recv().await {
            let result = self.append(op.request).await;
            if let Err(err) = &result {
                error!(error = %err, "audit append failed");
            }
            // The caller may have given up waiting; the receipt stands either way.
            let _ = op.reply.send(result);
        }
        trace!("audit appender stopped");
    }

    async fn append(&mut self, request: ReceiptRequest) -> Result<AuditReceipt, AuditError> {
        let (last_seq, previous_hash) = match &self.tip {
            Some(tip) => tip.clone(),
            None => self.load_tip().await?,
        };

        let mut receipt = AuditReceipt {
            seq: last_seq.saturating_add(1),
            receipt_id: uuid::Uuid::new_v4().to_string(),
            lineage_node_id: request.lineage_node_id,
            action_type: request.action_type,
            agent_id: request.agent_id,
            timestamp: storage_precision(self.clock.now()),
            input_hash: request.input_data.as_ref().map(hash_canonical).transpose()?,
            output_hash: request.output_data.as_ref().map(hash_canonical).transpose()?,
            output_summary: request.output_summary,
            token_id: request.token_id,
            token_scope_snapshot: request.token_scope_snapshot,
            hitl_request_id: request.hitl_request_id,
            risk_score: request.risk_score,
            trust_score: request.trust_score,
            evidence: request.evidence,
            previous_receipt_hash: previous_hash,
            receipt_hash: String::new(),
            key_id: self.signer.key_id().to_owned(),
            signature: String::new(),
        };
        receipt.receipt_hash = hash_receipt(&receipt)?;
        receipt.signature = self.signer.sign(receipt.receipt_hash.as_bytes());

        let snapshot = receipt
            .token_scope_snapshot
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "INSERT INTO audit_receipts (seq, receipt_id, lineage_node_id, action_type, agent_id, \
             recorded_at, input_hash, output_hash, output_summary, token_id, \
             token_scope_snapshot, hitl_request_id, risk_score, trust_score, evidence, \
             previous_receipt_hash, receipt_hash, key_id, signature) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
             ?17, ?18, ?19)",
        )
        .bind(receipt.seq)
        .bind(&receipt.receipt_id)
        .bind(&receipt.lineage_node_id)
        .bind(&receipt.action_type)
        .bind(&receipt.agent_id)
        .bind(format_ts(&receipt.timestamp))
        .bind(&receipt.input_hash)
        .bind(&receipt.output_hash)
        .bind(&receipt.output_summary)
        .bind(&receipt.token_id)
        .bind(&snapshot)
        .bind(&receipt.hitl_request_id)
        .bind(receipt.risk_score)
        .bind(receipt.trust_score)
        .bind(serde_json::to_string(&receipt.evidence)?)
        .bind(&receipt.previous_receipt_hash)
        .bind(&receipt.receipt_hash)
        .bind(&receipt.key_id)
        .bind(&receipt.signature)
        .execute(self.store.pool())
        .await
        .map_err(|e| {
            // Forget the cached tip so the next append re-reads the store.
            self.tip = None;
            e
        })?;

        self.tip = Some((receipt.seq, receipt.receipt_hash.clone()));
        trace!(
            receipt_id = %receipt.receipt_id,
            seq = receipt.seq,
            action_type = %receipt.action_type,
            "audit receipt appended"
        );
        Ok(receipt)
    }

    async fn load_tip(&mut self) -> Result<(i64, String), AuditError> {
        let row: Option<(i64, String)> = sqlx::query_as(
            "SELECT seq, receipt_hash FROM audit_receipts ORDER BY seq DESC LIMIT 1",
        )
        .fetch_optional(self.store.pool())
        .await?;
        let tip = row.unwrap_or_else(|| (0, GENESIS_HASH.to_owned()));
        self.tip = Some(tip.clone());
        Ok(tip)
    }
}
