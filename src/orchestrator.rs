//! The orchestration controller: one decision per requested agent action.
//!
//! Evaluation runs these steps in order:
//!
//! 1. suspended agents are denied outright, before any scoring;
//! 2. the action is scored and the score is charged to the session budget;
//! 3. a critical score is denied;
//! 4. always-HITL actions go to a human;
//! 5. a session over its risk ceiling goes to a human;
//! 6. supervised agents (level 2) go to a human, logged agents (level 1)
//!    never auto-approve silently;
//! 7. approved actions get a capability token and a lineage node.
//!
//! Trust is not touched at decision time. Callers report what actually
//! happened through [`OrchestrationController::record_action_outcome`].

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::budget::{BudgetCharge, SessionRiskBudget};
use crate::clock::Clock;
use crate::config::PolicySettings;
use crate::hitl::{
    HitlError, HitlQueue, HitlRequest, HitlResolution, HitlResolver, HitlStatus, ResolverOutcome,
};
use crate::lineage::{LineageError, LineageGraph, NewNode, NodeType};
use crate::risk::{
    ActionCatalog, ActionCategory, ActionError, Decision, MutationScope, RiskInput, RiskResult,
    RiskScorer, SensitivityTable,
};
use crate::token::{
    CapabilityToken, CapabilityTokenService, IssueRequest, ResourceScope, TokenConstraints,
    TokenError,
};
use crate::trust::{
    EscalationLevel, TrustError, TrustEvent, TrustManager, TrustSnapshot, TrustUpdate,
};

/// Errors that stop an evaluation from reaching any decision.
///
/// Policy denials are not errors; they come back as an
/// [`OrchestrationDecision`] with `allowed == false`.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The action is not catalogued.
    #[error(transparent)]
    Action(#[from] ActionError),

    /// Trust lookup or update failed.
    #[error(transparent)]
    Trust(#[from] TrustError),

    /// Token issue failed.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// Lineage write failed.
    #[error(transparent)]
    Lineage(#[from] LineageError),

    /// HITL queue failed.
    #[error(transparent)]
    Hitl(#[from] HitlError),

    /// No HITL request with this id.
    #[error("HITL request not found: {0}")]
    HitlNotFound(String),

    /// The HITL request was already resolved.
    #[error("HITL request {request_id} already {status}")]
    HitlAlreadyResolved {
        /// Request id.
        request_id: String,
        /// Terminal status it is in.
        status: &'static str,
    },
}

impl OrchestratorError {
    /// Whether retrying the evaluation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Trust(TrustError::Store(_))
            | Self::Lineage(LineageError::Store(_))
            | Self::Hitl(HitlError::Store(_) | HitlError::CodeExhausted(_)) => true,
            Self::Token(e) => e.is_transient(),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// UTC hours considered normal working time, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessHours {
    /// First working hour.
    pub start_hour: u32,
    /// First hour after work.
    pub end_hour: u32,
}

impl BusinessHours {
    /// Whether `hour` falls outside working time.
    pub fn is_off_hours(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            hour < self.start_hour || hour >= self.end_hour
        } else {
            // Overnight shift, e.g. 22..06.
            hour < self.start_hour && hour >= self.end_hour
        }
    }
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            start_hour: 8,
            end_hour: 18,
        }
    }
}

/// Policy tables the controller decides with.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Action name → category.
    pub catalog: ActionCatalog,
    /// Resource → sensitivity.
    pub sensitivity: SensitivityTable,
    /// Actions that always need a human.
    pub always_hitl: HashSet<String>,
    /// Working hours for the off-hours signal.
    pub business_hours: BusinessHours,
    /// Window over which recent errors are counted.
    pub error_window: Duration,
}

impl Policy {
    /// Build policy tables from configuration.
    pub fn from_settings(settings: &PolicySettings) -> Self {
        Self {
            catalog: ActionCatalog::new(settings.actions.clone()),
            sensitivity: SensitivityTable::new(
                settings.sensitivity.clone(),
                settings.phi_resources.iter().cloned().collect(),
                settings.default_sensitivity,
            ),
            always_hitl: settings.always_hitl_actions.iter().cloned().collect(),
            business_hours: BusinessHours {
                start_hour: settings.business_hours_start,
                end_hour: settings.business_hours_end,
            },
            error_window: Duration::hours(i64::from(settings.error_window_hours)),
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::from_settings(&PolicySettings::default())
    }
}

// ---------------------------------------------------------------------------
// Request and decision
// ---------------------------------------------------------------------------

/// One action an agent wants to take.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    /// Requesting agent.
    pub agent_id: String,
    /// Catalogued action name.
    pub action: String,
    /// What the action touches.
    pub resource_scope: ResourceScope,
    /// Records touched.
    pub record_count: u64,
    /// Dollars at stake.
    pub dollar_exposure: f64,
    /// Deviation from the agent's usual pattern, in `[0, 1]`.
    pub deviation: f64,
    /// Extra limits for the token.
    pub constraints: TokenConstraints,
    /// Lineage nodes this action follows from.
    pub parent_node_ids: Vec<String>,
    /// Free-form context shown to reviewers.
    pub context: Value,
}

impl ActionRequest {
    /// A request touching one record with no dollar exposure.
    pub fn new(
        agent_id: impl Into<String>,
        action: impl Into<String>,
        resource_scope: ResourceScope,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            action: action.into(),
            resource_scope,
            record_count: 1,
            dollar_exposure: 0.0,
            deviation: 0.0,
            constraints: TokenConstraints::default(),
            parent_node_ids: Vec::new(),
            context: Value::Null,
        }
    }
}

/// Result of an evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationDecision {
    /// Whether the agent may act now.
    pub allowed: bool,
    /// Final decision after every override.
    pub decision: Decision,
    /// Whether the action waits on a human.
    pub pending_review: bool,
    /// Scorer output; `None` when denied before scoring.
    pub risk: Option<RiskResult>,
    /// Token to act with, when allowed.
    pub token: Option<CapabilityToken>,
    /// HITL request, when one was opened.
    pub hitl_request_id: Option<String>,
    /// Lineage node recording the decision.
    pub lineage_node_id: Option<String>,
    /// Agent trust at decision time.
    pub trust_score: f64,
    /// Agent escalation level at decision time.
    pub escalation_level: EscalationLevel,
    /// Session budget after this action was charged.
    pub budget: Option<BudgetCharge>,
    /// Why.
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Composes trust, risk, HITL, tokens and lineage into one decision.
///
/// Holds no per-session state; the caller passes its [`SessionRiskBudget`].
pub struct OrchestrationController {
    policy: Policy,
    scorer: RiskScorer,
    trust: Arc<TrustManager>,
    tokens: Arc<CapabilityTokenService>,
    lineage: Arc<LineageGraph>,
    hitl: Arc<HitlQueue>,
    resolver: Arc<dyn HitlResolver>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for OrchestrationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationController")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl OrchestrationController {
    /// Wire a controller from its components.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        policy: Policy,
        scorer: RiskScorer,
        trust: Arc<TrustManager>,
        tokens: Arc<CapabilityTokenService>,
        lineage: Arc<LineageGraph>,
        hitl: Arc<HitlQueue>,
        resolver: Arc<dyn HitlResolver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policy,
            scorer,
            trust,
            tokens,
            lineage,
            hitl,
            resolver,
            clock,
        }
    }

    /// Policy tables in use.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Decide whether an agent may perform an action.
    ///
    /// Never blocks on a human: when review is needed the request is queued
    /// and a pending decision is returned unless the resolver answers at once.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Action`] for uncatalogued actions, or a
    /// transient error if a store call fails.
    pub async fn evaluate_action(
        &self,
        request: &ActionRequest,
        session: &SessionRiskBudget,
    ) -> Result<OrchestrationDecision, OrchestratorError> {
        let category = self.policy.catalog.resolve(&request.action)?;
        let trust = self.trust.snapshot(&request.agent_id).await?;

        if trust.escalation_level == EscalationLevel::Suspended {
            let reason = "agent suspended; requires human re-certification".to_owned();
            return self
                .deny(request, &trust, None, None, None, reason)
                .await;
        }

        let risk = self.score(request, category, &trust).await?;
        let mut reasons = vec![risk.justification.clone()];
        let mut decision = risk.decision;

        let charge = session.charge(risk.score);
        debug!(
            session_id = session.session_id(),
            charged = charge.charged,
            total = charge.total,
            ceiling = charge.ceiling,
            "session risk charged"
        );

        if decision == Decision::Deny {
            let reason = format!("critical risk: {}", risk.justification);
            return self
                .deny(request, &trust, Some(risk), Some(charge), None, reason)
                .await;
        }
        if self.policy.always_hitl.contains(&request.action) {
            decision = Decision::RequireHitl;
            reasons.push(format!("{} always requires human approval", request.action));
        }
        if charge.exceeded {
            decision = Decision::RequireHitl;
            reasons.push(format!(
                "session risk {:.3} exceeds ceiling {:.3}",
                charge.total, charge.ceiling
            ));
        }
        match trust.escalation_level {
            EscalationLevel::Supervised if decision != Decision::RequireHitl => {
                decision = Decision::RequireHitl;
                reasons.push("agent under supervision (level 2)".to_owned());
            }
            EscalationLevel::Logged if decision == Decision::AutoApprove => {
                decision = Decision::ApproveWithLogging;
                reasons.push("reduced trust (level 1): action logged".to_owned());
            }
            _ => {}
        }
        let reason = reasons.join("; ");

        if decision == Decision::RequireHitl {
            return self
                .route_to_hitl(request, session, &trust, risk, charge, reason)
                .await;
        }
        self.approve(request, category, &trust, risk, Some(charge), decision, None, reason)
            .await
    }

    /// Apply a reviewer's answer to a queued request.
    ///
    /// Approval issues the token and records a `human_decision` node; denial
    /// records the node and a `hitl_override` trust event for the agent.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::HitlNotFound`] or
    /// [`OrchestratorError::HitlAlreadyResolved`] when there is nothing to
    /// resolve.
    pub async fn complete_hitl(
        &self,
        request_id: &str,
        approved: bool,
        reviewer: &str,
        notes: Option<&str>,
    ) -> Result<OrchestrationDecision, OrchestratorError> {
        let resolution = self.hitl.resolve(request_id, approved, reviewer, notes).await?;
        self.finish_hitl(resolution, request_id).await
    }

    /// Report what happened when the agent acted.
    ///
    /// Success raises trust (more for human-approved actions); failure lowers
    /// it.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Trust`] on storage failure.
    pub async fn record_action_outcome(
        &self,
        agent_id: &str,
        action: &str,
        success: bool,
        error: Option<&str>,
        hitl_approved: bool,
    ) -> Result<TrustUpdate, OrchestratorError> {
        let (event, reason) = match (success, hitl_approved) {
            (true, true) => (
                TrustEvent::HitlApprovedSuccess,
                format!("{action} succeeded after review"),
            ),
            (true, false) => (TrustEvent::SuccessfulAction, format!("{action} succeeded")),
            (false, _) => (
                TrustEvent::ActionError,
                format!("{action} failed: {}", error.unwrap_or("unspecified error")),
            ),
        };
        self.apply_trust_event(agent_id, event, &reason).await
    }

    /// Report a policy violation by an agent.
    ///
    /// # Errors
    ///
    /// Returns a transient error on storage failure.
    pub async fn record_policy_violation(
        &self,
        agent_id: &str,
        reason: &str,
    ) -> Result<TrustUpdate, OrchestratorError> {
        let update = self
            .apply_trust_event(agent_id, TrustEvent::PolicyViolation, reason)
            .await?;
        self.lineage
            .record_node(NewNode {
                trust_score: Some(update.new_score),
                ..NewNode::new(
                    NodeType::PolicyEnforcement,
                    agent_id,
                    "policy_violation",
                    json!({ "reason": reason, "new_level": update.new_level.as_u8() }),
                )
            })
            .await?;
        Ok(update)
    }

    async fn score(
        &self,
        request: &ActionRequest,
        category: ActionCategory,
        trust: &TrustSnapshot,
    ) -> Result<RiskResult, OrchestratorError> {
        let class = self
            .policy
            .sensitivity
            .classify(&request.resource_scope.resource_type);
        let hour = self.clock.now().hour();
        let recent_errors = self
            .trust
            .recent_errors(&request.agent_id, self.policy.error_window)
            .await?;
        let input = RiskInput {
            agent_trust: trust.trust_score,
            sensitivity: class.sensitivity,
            mutation: category.mutation_scope(),
            record_count: request.record_count,
            dollar_exposure: request.dollar_exposure,
            deviation: request.deviation,
            off_hours: self.policy.business_hours.is_off_hours(hour),
            recent_errors,
            phi_access: class.phi,
        };
        Ok(self.scorer.score(&input))
    }

    async fn route_to_hitl(
        &self,
        request: &ActionRequest,
        session: &SessionRiskBudget,
        trust: &TrustSnapshot,
        risk: RiskResult,
        charge: BudgetCharge,
        reason: String,
    ) -> Result<OrchestrationDecision, OrchestratorError> {
        let context = json!({
            "session_id": session.session_id(),
            "reason": reason,
            "record_count": request.record_count,
            "dollar_exposure": request.dollar_exposure,
            "constraints": request.constraints,
            "parent_node_ids": request.parent_node_ids,
            "request": request.context,
        });
        let queued = self
            .hitl
            .create(
                &request.agent_id,
                &request.action,
                &request.resource_scope,
                &risk,
                trust.trust_score,
                context,
            )
            .await?;

        let resolution = match self.resolver.on_request(&queued).await {
            ResolverOutcome::Pending => {
                info!(
                    agent_id = %request.agent_id,
                    action = %request.action,
                    request_id = %queued.request_id,
                    risk_score = risk.score,
                    "action awaiting human review"
                );
                return Ok(OrchestrationDecision {
                    allowed: false,
                    decision: Decision::RequireHitl,
                    pending_review: true,
                    risk: Some(risk),
                    token: None,
                    hitl_request_id: Some(queued.request_id),
                    lineage_node_id: None,
                    trust_score: trust.trust_score,
                    escalation_level: trust.escalation_level,
                    budget: Some(charge),
                    reason,
                });
            }
            ResolverOutcome::Approve { reviewer, notes } => {
                self.hitl
                    .auto_approve(&queued.request_id, &reviewer, notes.as_deref())
                    .await?
            }
            ResolverOutcome::Deny { reviewer, notes } => {
                self.hitl
                    .resolve(&queued.request_id, false, &reviewer, notes.as_deref())
                    .await?
            }
        };
        let mut decision = self.finish_hitl(resolution, &queued.request_id).await?;
        decision.budget = Some(charge);
        Ok(decision)
    }

    async fn finish_hitl(
        &self,
        resolution: HitlResolution,
        request_id: &str,
    ) -> Result<OrchestrationDecision, OrchestratorError> {
        match resolution {
            HitlResolution::Approved(req) => self.approve_reviewed(req).await,
            HitlResolution::Denied(req) => {
                let reason = format!(
                    "denied by {}",
                    req.reviewer.as_deref().unwrap_or("reviewer")
                );
                self.apply_trust_event(&req.agent_id, TrustEvent::HitlOverride, &reason)
                    .await?;
                self.deny_reviewed(req, reason).await
            }
            HitlResolution::Expired(req) => {
                self.deny_reviewed(req, "review window expired".to_owned())
                    .await
            }
            HitlResolution::NotFound => {
                Err(OrchestratorError::HitlNotFound(request_id.to_owned()))
            }
            HitlResolution::AlreadyResolved(req) => Err(OrchestratorError::HitlAlreadyResolved {
                request_id: req.request_id,
                status: req.status.as_str(),
            }),
        }
    }

    async fn approve_reviewed(
        &self,
        req: HitlRequest,
    ) -> Result<OrchestrationDecision, OrchestratorError> {
        let category = self.policy.catalog.resolve(&req.action)?;
        let trust = self.trust.snapshot(&req.agent_id).await?;
        if trust.escalation_level == EscalationLevel::Suspended {
            // Suspended while the request waited; approval does not override.
            return self
                .deny_reviewed(req, "agent suspended before approval took effect".to_owned())
                .await;
        }
        let request = request_from_hitl(&req);
        let reason = format!(
            "{} by {}",
            if req.status == HitlStatus::AutoApproved {
                "auto-approved"
            } else {
                "approved"
            },
            req.reviewer.as_deref().unwrap_or("reviewer")
        );
        let risk = risk_from_hitl(&req);
        self.approve(
            &request,
            category,
            &trust,
            risk,
            None,
            Decision::RequireHitl,
            Some(&req),
            reason,
        )
        .await
    }

    async fn deny_reviewed(
        &self,
        req: HitlRequest,
        reason: String,
    ) -> Result<OrchestrationDecision, OrchestratorError> {
        let trust = self.trust.snapshot(&req.agent_id).await?;
        let request = request_from_hitl(&req);
        let risk = risk_from_hitl(&req);
        self.deny(&request, &trust, Some(risk), None, Some(&req), reason)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn approve(
        &self,
        request: &ActionRequest,
        category: ActionCategory,
        trust: &TrustSnapshot,
        risk: RiskResult,
        charge: Option<BudgetCharge>,
        decision: Decision,
        reviewed: Option<&HitlRequest>,
        reason: String,
    ) -> Result<OrchestrationDecision, OrchestratorError> {
        let mut constraints = request.constraints.clone();
        if category.mutation_scope() == MutationScope::Read {
            constraints.read_only = true;
        }
        if constraints.max_records.is_none() {
            constraints.max_records = Some(request.record_count);
        }
        if constraints.max_cost.is_none() && request.dollar_exposure > 0.0 {
            constraints.max_cost = Some(request.dollar_exposure);
        }
        let token = self
            .tokens
            .issue(IssueRequest {
                constraints,
                ..IssueRequest::new(
                    &request.agent_id,
                    &request.action,
                    category,
                    request.resource_scope.clone(),
                )
            })
            .await?;

        let node_type = if reviewed.is_some() {
            NodeType::HumanDecision
        } else {
            NodeType::AgentAction
        };
        let hitl_request_id = reviewed.map(|r| r.request_id.clone());
        let node = self
            .lineage
            .record_node(NewNode {
                trust_score: Some(trust.trust_score),
                token_id: Some(token.token_id.clone()),
                workspace_id: request.resource_scope.workspace_id.clone(),
                parent_node_ids: request.parent_node_ids.clone(),
                ..NewNode::new(
                    node_type,
                    &request.agent_id,
                    &request.action,
                    json!({
                        "allowed": true,
                        "decision": decision.as_str(),
                        "risk_score": risk.score,
                        "risk_tier": risk.tier.as_str(),
                        "trust_score": trust.trust_score,
                        "escalation_level": trust.escalation_level.as_u8(),
                        "token_id": token.token_id,
                        "hitl_request_id": hitl_request_id,
                        "reviewer": reviewed.and_then(|r| r.reviewer.clone()),
                        "reason": reason,
                    }),
                )
            })
            .await?;

        info!(
            agent_id = %request.agent_id,
            action = %request.action,
            decision = decision.as_str(),
            risk_score = risk.score,
            token_id = %token.token_id,
            "action approved"
        );
        Ok(OrchestrationDecision {
            allowed: true,
            decision,
            pending_review: false,
            risk: Some(risk),
            token: Some(token),
            hitl_request_id,
            lineage_node_id: Some(node.node_id),
            trust_score: trust.trust_score,
            escalation_level: trust.escalation_level,
            budget: charge,
            reason,
        })
    }

    async fn deny(
        &self,
        request: &ActionRequest,
        trust: &TrustSnapshot,
        risk: Option<RiskResult>,
        charge: Option<BudgetCharge>,
        reviewed: Option<&HitlRequest>,
        reason: String,
    ) -> Result<OrchestrationDecision, OrchestratorError> {
        let hitl_request_id = reviewed.map(|r| r.request_id.clone());
        let node_type = if reviewed.is_some() {
            NodeType::HumanDecision
        } else {
            NodeType::PolicyEnforcement
        };
        let node = self
            .lineage
            .record_node(NewNode {
                trust_score: Some(trust.trust_score),
                workspace_id: request.resource_scope.workspace_id.clone(),
                parent_node_ids: request.parent_node_ids.clone(),
                ..NewNode::new(
                    node_type,
                    &request.agent_id,
                    &request.action,
                    json!({
                        "allowed": false,
                        "decision": Decision::Deny.as_str(),
                        "risk_score": risk.as_ref().map(|r| r.score),
                        "trust_score": trust.trust_score,
                        "escalation_level": trust.escalation_level.as_u8(),
                        "hitl_request_id": hitl_request_id,
                        "reason": reason,
                    }),
                )
            })
            .await?;

        warn!(
            agent_id = %request.agent_id,
            action = %request.action,
            level = trust.escalation_level.as_u8(),
            reason = %reason,
            "action denied"
        );
        Ok(OrchestrationDecision {
            allowed: false,
            decision: Decision::Deny,
            pending_review: false,
            risk,
            token: None,
            hitl_request_id,
            lineage_node_id: Some(node.node_id),
            trust_score: trust.trust_score,
            escalation_level: trust.escalation_level,
            budget: charge,
            reason,
        })
    }

    /// Record a trust event; a fresh suspension revokes the agent's tokens.
    async fn apply_trust_event(
        &self,
        agent_id: &str,
        event: TrustEvent,
        reason: &str,
    ) -> Result<TrustUpdate, OrchestratorError> {
        let update = self.trust.record_event(agent_id, event, reason).await?;
        if update.new_level == EscalationLevel::Suspended
            && update.old_level != EscalationLevel::Suspended
        {
            let revoked = self
                .tokens
                .revoke_all_for_agent(agent_id, "agent suspended")
                .await?;
            warn!(agent_id, revoked, "agent suspended; outstanding tokens revoked");
        }
        Ok(update)
    }
}

/// Rebuild the action request from what the HITL queue stored.
fn request_from_hitl(req: &HitlRequest) -> ActionRequest {
    let ctx = &req.context;
    ActionRequest {
        agent_id: req.agent_id.clone(),
        action: req.action.clone(),
        resource_scope: req.resource_scope.clone(),
        record_count: ctx.get("record_count").and_then(Value::as_u64).unwrap_or(1),
        dollar_exposure: ctx
            .get("dollar_exposure")
            .and_then(Value::as_f64)
            .unwrap_or(0.0),
        deviation: 0.0,
        constraints: ctx
            .get("constraints")
            .and_then(|c| serde_json::from_value(c.clone()).ok())
            .unwrap_or_default(),
        parent_node_ids: ctx
            .get("parent_node_ids")
            .and_then(|p| serde_json::from_value(p.clone()).ok())
            .unwrap_or_default(),
        context: ctx.get("request").cloned().unwrap_or(Value::Null),
    }
}

fn risk_from_hitl(req: &HitlRequest) -> RiskResult {
    RiskResult {
        score: req.risk_score,
        tier: req.risk_tier,
        decision: req.risk_tier.decision(),
        justification: req.justification.clone(),
        factors: req.factors.clone(),
        adjustments: Vec::new(),
    }
}
