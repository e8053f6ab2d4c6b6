//! Composition root.
//!
//! [`Engine`] wires every component over one store, one signer and one
//! clock. Binaries and integration tests build it once and share the
//! component handles it exposes.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::audit::AuditReceiptChain;
use crate::budget::SessionRiskBudget;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::hitl::HitlQueue;
use crate::lineage::LineageGraph;
use crate::orchestrator::{OrchestrationController, Policy};
use crate::risk::RiskScorer;
use crate::signing::Signer;
use crate::store::Store;
use crate::token::CapabilityTokenService;
use crate::trust::TrustManager;

/// Every engine component, built from one configuration.
pub struct Engine {
    config: EngineConfig,
    store: Store,
    trust: Arc<TrustManager>,
    tokens: Arc<CapabilityTokenService>,
    lineage: Arc<LineageGraph>,
    audit: Arc<AuditReceiptChain>,
    hitl: Arc<HitlQueue>,
    controller: Arc<OrchestrationController>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("database", &self.config.paths.database)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Open the configured database and build the engine on the system
    /// clock, reading signing keys from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the signing key is
    /// missing, or the database cannot be opened.
    pub async fn open(config: EngineConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let signer = config
            .signing
            .build_signer(|key| std::env::var(key).ok())?;
        let store = Store::open(&config.paths.database)
            .await
            .with_context(|| format!("failed to open {}", config.paths.database.display()))?;
        info!(path = %config.paths.database.display(), key_id = %signer.key_id(), "engine store opened");
        Ok(Self::build(config, store, Arc::new(signer), Arc::new(SystemClock)))
    }

    /// Build the engine over an existing store.
    ///
    /// Must be called inside a tokio runtime: the audit appender task is
    /// spawned here.
    pub fn build(
        config: EngineConfig,
        store: Store,
        signer: Arc<dyn Signer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let trust = Arc::new(TrustManager::new(
            store.clone(),
            Arc::clone(&clock),
            config.trust.clone(),
        ));
        let tokens = Arc::new(CapabilityTokenService::new(
            store.clone(),
            Arc::clone(&signer),
            Arc::clone(&clock),
            config.tokens.clone(),
        ));
        let lineage = Arc::new(LineageGraph::new(store.clone(), Arc::clone(&clock)));
        let audit = Arc::new(AuditReceiptChain::new(
            store.clone(),
            signer,
            Arc::clone(&clock),
        ));
        let hitl = Arc::new(HitlQueue::new(store.clone(), Arc::clone(&clock), &config.hitl));
        let controller = Arc::new(OrchestrationController::new(
            Policy::from_settings(&config.policy),
            RiskScorer::new(config.risk.clone()),
            Arc::clone(&trust),
            Arc::clone(&tokens),
            Arc::clone(&lineage),
            Arc::clone(&hitl),
            config.hitl.resolver(),
            clock,
        ));

        Self {
            config,
            store,
            trust,
            tokens,
            lineage,
            audit,
            hitl,
            controller,
        }
    }

    /// A fresh risk budget for a new session, using the configured ceiling.
    pub fn new_session(&self, session_id: impl Into<String>) -> SessionRiskBudget {
        SessionRiskBudget::from_settings(session_id, &self.config.session)
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Backing store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Trust manager.
    pub fn trust(&self) -> &Arc<TrustManager> {
        &self.trust
    }

    /// Capability token service.
    pub fn tokens(&self) -> &Arc<CapabilityTokenService> {
        &self.tokens
    }

    /// Lineage graph.
    pub fn lineage(&self) -> &Arc<LineageGraph> {
        &self.lineage
    }

    /// Audit receipt chain.
    pub fn audit(&self) -> &Arc<AuditReceiptChain> {
        &self.audit
    }

    /// HITL queue.
    pub fn hitl(&self) -> &Arc<HitlQueue> {
        &self.hitl
    }

    /// Orchestration controller.
    pub fn controller(&self) -> &Arc<OrchestrationController> {
        &self.controller
    }
}
