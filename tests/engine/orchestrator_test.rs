//! End-to-end decision flow through the orchestration controller.

use chrono::{Duration, TimeZone, Utc};
use trustgate::hitl::HitlStatus;
use trustgate::lineage::{NewNode, NodeType};
use trustgate::orchestrator::{ActionRequest, OrchestratorError};
use trustgate::risk::{
    Decision, MutationScope, RiskInput, RiskParameters, RiskScorer, RiskTier, Sensitivity,
};
use trustgate::token::ResourceScope;
use trustgate::trust::EscalationLevel;

use crate::support::{config_with_trust, harness, harness_with};

fn public_query(agent: &str) -> ActionRequest {
    ActionRequest::new(agent, "query_claims", ResourceScope::of_type("public_reference"))
}

/// Scores 0.495 for an agent at trust 0.7: moderate, approved with logging.
fn moderate_update(agent: &str) -> ActionRequest {
    ActionRequest {
        record_count: 10_000,
        dollar_exposure: 60_000.0,
        deviation: 1.0,
        ..ActionRequest::new(agent, "update_case", ResourceScope::of_type("cases"))
    }
}

#[tokio::test]
async fn trusted_public_read_is_auto_approved() {
    let h = harness_with(config_with_trust(0.8)).await;
    let session = h.engine.new_session("s1");

    let decision = h
        .engine
        .controller()
        .evaluate_action(&public_query("agent-a"), &session)
        .await
        .expect("evaluation should succeed");

    let risk = decision.risk.as_ref().expect("scored");
    assert_eq!(risk.tier, RiskTier::Minimal);
    assert_eq!(decision.decision, Decision::AutoApprove);
    assert!(decision.allowed);
    assert!(!decision.pending_review);

    let token = decision.token.expect("approved actions carry a token");
    assert_eq!(token.action, "query_claims");
    assert!(token.constraints.read_only);
    assert_eq!(token.constraints.max_records, Some(1));

    let node_id = decision.lineage_node_id.expect("approval is recorded");
    let node = h
        .engine
        .lineage()
        .get_node(&node_id)
        .await
        .expect("lookup")
        .expect("node exists");
    assert_eq!(node.node_type, NodeType::AgentAction);
    assert_eq!(node.token_id.as_deref(), Some(token.token_id.as_str()));
}

#[tokio::test]
async fn classified_delete_by_low_trust_agent_is_denied() {
    // Pure scorer: critical regardless of suspension state.
    let scorer = RiskScorer::new(RiskParameters::default());
    let result = scorer.score(&RiskInput {
        agent_trust: 0.2,
        sensitivity: Sensitivity::Classified,
        mutation: MutationScope::Delete,
        record_count: 1,
        dollar_exposure: 0.0,
        deviation: 0.0,
        off_hours: false,
        recent_errors: 0,
        phi_access: false,
    });
    assert!(result.score >= 0.8);
    assert_eq!(result.decision, Decision::Deny);

    // Through the controller the agent is also suspended; still a denial.
    let h = harness_with(config_with_trust(0.2)).await;
    let session = h.engine.new_session("s1");
    let request =
        ActionRequest::new("agent-low", "delete_case", ResourceScope::of_type("investigations"));
    let decision = h
        .engine
        .controller()
        .evaluate_action(&request, &session)
        .await
        .expect("denial is not an error");
    assert!(!decision.allowed);
    assert_eq!(decision.decision, Decision::Deny);
    assert!(decision.token.is_none());
}

#[tokio::test]
async fn critical_score_beats_always_hitl() {
    // Trust 0.35 is supervised, not suspended, so the action is scored.
    let h = harness_with(config_with_trust(0.35)).await;
    let session = h.engine.new_session("s1");
    let request =
        ActionRequest::new("agent-b", "delete_case", ResourceScope::of_type("investigations"));

    let decision = h
        .engine
        .controller()
        .evaluate_action(&request, &session)
        .await
        .expect("evaluation should succeed");

    let risk = decision.risk.as_ref().expect("scored");
    assert_eq!(risk.tier, RiskTier::Critical);
    assert_eq!(decision.decision, Decision::Deny);
    assert!(decision.hitl_request_id.is_none());

    let node_id = decision.lineage_node_id.expect("denials are recorded");
    let node = h
        .engine
        .lineage()
        .get_node(&node_id)
        .await
        .expect("lookup")
        .expect("node exists");
    assert_eq!(node.node_type, NodeType::PolicyEnforcement);
}

#[tokio::test]
async fn always_hitl_action_needs_review_even_when_minimal() {
    let h = harness_with(config_with_trust(0.8)).await;
    let session = h.engine.new_session("s1");
    let request =
        ActionRequest::new("agent-a", "export_data", ResourceScope::of_type("public_reference"));

    let decision = h
        .engine
        .controller()
        .evaluate_action(&request, &session)
        .await
        .expect("evaluation should succeed");

    assert_eq!(decision.risk.as_ref().map(|r| r.tier), Some(RiskTier::Minimal));
    assert_eq!(decision.decision, Decision::RequireHitl);
    assert!(!decision.allowed);
    assert!(decision.pending_review);
    assert!(decision.token.is_none());

    let request_id = decision.hitl_request_id.expect("request queued");
    let queued = h
        .engine
        .hitl()
        .get(&request_id)
        .await
        .expect("lookup")
        .expect("request exists");
    assert_eq!(queued.status, HitlStatus::Pending);
    assert_eq!(queued.action, "export_data");
}

#[tokio::test]
async fn session_budget_forces_eleventh_action_to_hitl() {
    let h = harness().await;
    let session = h.engine.new_session("busy-session");
    let controller = h.engine.controller();

    for i in 0..10 {
        let decision = controller
            .evaluate_action(&moderate_update("agent-m"), &session)
            .await
            .expect("evaluation should succeed");
        let risk = decision.risk.as_ref().expect("scored");
        assert_eq!(risk.tier, RiskTier::Moderate, "action {i}");
        assert_eq!(decision.decision, Decision::ApproveWithLogging, "action {i}");
        assert!(decision.allowed, "action {i}");
        assert!(!decision.budget.expect("charged").exceeded, "action {i}");
    }

    let decision = controller
        .evaluate_action(&public_query("agent-m"), &session)
        .await
        .expect("evaluation should succeed");
    let risk = decision.risk.as_ref().expect("scored");
    assert_eq!(risk.decision, Decision::AutoApprove);
    assert_eq!(decision.decision, Decision::RequireHitl);
    assert!(decision.pending_review);
    assert!(decision.budget.expect("charged").exceeded);
    assert!(decision.reason.contains("session risk"));
    assert_eq!(session.evaluations(), 11);

    // A separate session is unaffected.
    let fresh = h.engine.new_session("quiet-session");
    let decision = controller
        .evaluate_action(&public_query("agent-m"), &fresh)
        .await
        .expect("evaluation should succeed");
    assert!(decision.allowed);
}

#[tokio::test]
async fn unknown_action_is_an_error_not_a_denial() {
    let h = harness().await;
    let session = h.engine.new_session("s1");
    let request = ActionRequest::new("agent-a", "launch_rockets", ResourceScope::of_type("cases"));

    let err = h
        .engine
        .controller()
        .evaluate_action(&request, &session)
        .await
        .expect_err("uncatalogued actions are rejected");
    assert!(matches!(err, OrchestratorError::Action(_)));
    assert!(!err.is_transient());
    assert_eq!(session.evaluations(), 0);
}

#[tokio::test]
async fn suspended_agent_is_denied_without_scoring() {
    let h = harness_with(config_with_trust(0.1)).await;
    let session = h.engine.new_session("s1");

    let decision = h
        .engine
        .controller()
        .evaluate_action(&public_query("agent-s"), &session)
        .await
        .expect("denial is not an error");

    assert!(!decision.allowed);
    assert_eq!(decision.decision, Decision::Deny);
    assert_eq!(decision.escalation_level, EscalationLevel::Suspended);
    assert!(decision.risk.is_none());
    assert!(decision.budget.is_none());
    assert_eq!(session.evaluations(), 0);
}

#[tokio::test]
async fn supervised_agent_goes_to_review() {
    let h = harness_with(config_with_trust(0.4)).await;
    let session = h.engine.new_session("s1");

    let decision = h
        .engine
        .controller()
        .evaluate_action(&public_query("agent-sup"), &session)
        .await
        .expect("evaluation should succeed");

    assert_eq!(decision.escalation_level, EscalationLevel::Supervised);
    assert_eq!(decision.decision, Decision::RequireHitl);
    assert!(decision.hitl_request_id.is_some());
    assert!(decision.reason.contains("level 2"));
}

#[tokio::test]
async fn logged_agent_is_never_silently_approved() {
    let h = harness_with(config_with_trust(0.6)).await;
    let session = h.engine.new_session("s1");

    let decision = h
        .engine
        .controller()
        .evaluate_action(&public_query("agent-log"), &session)
        .await
        .expect("evaluation should succeed");

    assert_eq!(decision.escalation_level, EscalationLevel::Logged);
    assert_eq!(decision.risk.as_ref().map(|r| r.decision), Some(Decision::AutoApprove));
    assert_eq!(decision.decision, Decision::ApproveWithLogging);
    assert!(decision.allowed);
}

#[tokio::test]
async fn reviewer_approval_issues_token_and_records_human_decision() {
    let h = harness_with(config_with_trust(0.8)).await;
    let session = h.engine.new_session("s1");
    let controller = h.engine.controller();
    let request = ActionRequest {
        record_count: 25,
        ..ActionRequest::new("agent-a", "export_data", ResourceScope::of_type("claims"))
    };

    let pending = controller
        .evaluate_action(&request, &session)
        .await
        .expect("evaluation should succeed");
    let request_id = pending.hitl_request_id.expect("queued");

    let approved = controller
        .complete_hitl(&request_id, true, "alice", Some("looks fine"))
        .await
        .expect("resolution should succeed");
    assert!(approved.allowed);
    assert_eq!(approved.hitl_request_id.as_deref(), Some(request_id.as_str()));
    let token = approved.token.expect("token after approval");
    assert_eq!(token.subject, "agent-a");
    assert_eq!(token.constraints.max_records, Some(25));

    let node = h
        .engine
        .lineage()
        .get_node(&approved.lineage_node_id.expect("recorded"))
        .await
        .expect("lookup")
        .expect("node exists");
    assert_eq!(node.node_type, NodeType::HumanDecision);
    assert_eq!(node.payload["reviewer"], "alice");

    let again = controller
        .complete_hitl(&request_id, false, "bob", None)
        .await
        .expect_err("a resolved request cannot be resolved again");
    assert!(matches!(again, OrchestratorError::HitlAlreadyResolved { .. }));

    let missing = controller
        .complete_hitl("nope1234", true, "bob", None)
        .await
        .expect_err("unknown request");
    assert!(matches!(missing, OrchestratorError::HitlNotFound(_)));
}

#[tokio::test]
async fn reviewer_denial_lowers_trust() {
    let h = harness_with(config_with_trust(0.8)).await;
    let session = h.engine.new_session("s1");
    let controller = h.engine.controller();
    let request = ActionRequest::new("agent-a", "export_data", ResourceScope::of_type("claims"));

    let pending = controller
        .evaluate_action(&request, &session)
        .await
        .expect("evaluation should succeed");
    let denied = controller
        .complete_hitl(&pending.hitl_request_id.expect("queued"), false, "alice", None)
        .await
        .expect("resolution should succeed");

    assert!(!denied.allowed);
    assert_eq!(denied.decision, Decision::Deny);
    assert!(denied.token.is_none());
    let trust = h.engine.trust().get_trust_score("agent-a").await.expect("trust");
    assert!((trust - 0.65).abs() < 1e-9);
}

#[tokio::test]
async fn unanswered_review_expires_as_denial() {
    let h = harness_with(config_with_trust(0.8)).await;
    let session = h.engine.new_session("s1");
    let controller = h.engine.controller();
    let request = ActionRequest::new("agent-a", "export_data", ResourceScope::of_type("claims"));

    let pending = controller
        .evaluate_action(&request, &session)
        .await
        .expect("evaluation should succeed");
    let request_id = pending.hitl_request_id.expect("queued");

    h.clock.advance(Duration::seconds(301));
    let late = controller
        .complete_hitl(&request_id, true, "alice", None)
        .await
        .expect("resolution should succeed");
    assert!(!late.allowed);
    assert_eq!(late.decision, Decision::Deny);
    assert!(late.reason.contains("expired"));

    let stored = h
        .engine
        .hitl()
        .get(&request_id)
        .await
        .expect("lookup")
        .expect("request exists");
    assert_eq!(stored.status, HitlStatus::Expired);
}

#[tokio::test]
async fn auto_approve_flag_resolves_immediately() {
    let mut config = config_with_trust(0.8);
    config.hitl.auto_approve = true;
    let h = harness_with(config).await;
    let session = h.engine.new_session("s1");
    let request = ActionRequest::new("agent-a", "export_data", ResourceScope::of_type("claims"));

    let decision = h
        .engine
        .controller()
        .evaluate_action(&request, &session)
        .await
        .expect("evaluation should succeed");

    assert!(decision.allowed);
    assert!(!decision.pending_review);
    assert!(decision.token.is_some());
    assert!(decision.budget.is_some());
    let stored = h
        .engine
        .hitl()
        .get(&decision.hitl_request_id.expect("request recorded"))
        .await
        .expect("lookup")
        .expect("request exists");
    assert_eq!(stored.status, HitlStatus::AutoApproved);
}

#[tokio::test]
async fn suspension_revokes_outstanding_tokens() {
    let h = harness_with(config_with_trust(0.8)).await;
    let session = h.engine.new_session("s1");
    let controller = h.engine.controller();

    let approved = controller
        .evaluate_action(&public_query("agent-x"), &session)
        .await
        .expect("evaluation should succeed");
    let token = approved.token.expect("token issued");

    for _ in 0..3 {
        controller
            .record_policy_violation("agent-x", "touched a forbidden table")
            .await
            .expect("violation recorded");
    }
    assert_eq!(
        h.engine.trust().get_escalation_level("agent-x").await.expect("level"),
        EscalationLevel::Suspended
    );

    let err = h
        .engine
        .tokens()
        .validate(&token.token_id, Some("query_claims"))
        .await
        .expect_err("revoked on suspension");
    assert_eq!(err.reason(), "revoked");

    let denied = controller
        .evaluate_action(&public_query("agent-x"), &session)
        .await
        .expect("denial is not an error");
    assert!(!denied.allowed);
    assert!(denied.risk.is_none());
}

#[tokio::test]
async fn reported_errors_raise_later_risk() {
    let h = harness_with(config_with_trust(0.8)).await;
    let session = h.engine.new_session("s1");
    let controller = h.engine.controller();

    let ok = controller
        .record_action_outcome("agent-e", "query_claims", true, None, false)
        .await
        .expect("outcome recorded");
    assert!((ok.new_score - 0.82).abs() < 1e-9);

    for _ in 0..3 {
        controller
            .record_action_outcome("agent-e", "query_claims", false, Some("timeout"), false)
            .await
            .expect("outcome recorded");
    }

    let decision = controller
        .evaluate_action(&public_query("agent-e"), &session)
        .await
        .expect("evaluation should succeed");
    let risk = decision.risk.expect("scored");
    assert!(risk.adjustments.iter().any(|a| a.name == "elevated_errors"));
}

#[tokio::test]
async fn off_hours_raise_risk() {
    let h = harness_with(config_with_trust(0.8)).await;
    let session = h.engine.new_session("s1");
    h.clock.set(
        Utc.with_ymd_and_hms(2025, 3, 4, 23, 30, 0)
            .single()
            .expect("valid instant"),
    );

    let decision = h
        .engine
        .controller()
        .evaluate_action(&public_query("agent-n"), &session)
        .await
        .expect("evaluation should succeed");
    let risk = decision.risk.expect("scored");
    assert!(risk.adjustments.iter().any(|a| a.name == "off_hours"));
}

#[tokio::test]
async fn decisions_link_to_parent_nodes() {
    let h = harness_with(config_with_trust(0.8)).await;
    let session = h.engine.new_session("s1");
    let ingest = h
        .engine
        .lineage()
        .record_node(NewNode::new(
            NodeType::Ingestion,
            "loader",
            "ingest_claims",
            serde_json::json!({ "rows": 120 }),
        ))
        .await
        .expect("node recorded");

    let request = ActionRequest {
        parent_node_ids: vec![ingest.node_id.clone()],
        ..public_query("agent-a")
    };
    let decision = h
        .engine
        .controller()
        .evaluate_action(&request, &session)
        .await
        .expect("evaluation should succeed");
    let node_id = decision.lineage_node_id.expect("recorded");

    let upstream = h
        .engine
        .lineage()
        .backward_trace(&node_id, 10)
        .await
        .expect("trace");
    assert!(upstream.iter().any(|n| n.node_id == ingest.node_id));
}
