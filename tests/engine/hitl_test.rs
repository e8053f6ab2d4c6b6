//! HITL queue: creation, resolution, expiry.

use chrono::Duration;
use serde_json::json;
use trustgate::hitl::{HitlRequest, HitlResolution, HitlStatus, EXPIRY_REVIEWER};
use trustgate::risk::{
    MutationScope, RiskInput, RiskParameters, RiskResult, RiskScorer, RiskTier, Sensitivity,
};
use trustgate::token::ResourceScope;

use crate::support::{harness, Harness};

fn risky() -> RiskResult {
    RiskScorer::new(RiskParameters::default()).score(&RiskInput {
        agent_trust: 0.5,
        sensitivity: Sensitivity::Restricted,
        mutation: MutationScope::Write,
        record_count: 500,
        dollar_exposure: 20_000.0,
        deviation: 0.3,
        off_hours: false,
        recent_errors: 0,
        phi_access: false,
    })
}

async fn queue_one(h: &Harness, agent: &str) -> HitlRequest {
    h.engine
        .hitl()
        .create(
            agent,
            "update_case",
            &ResourceScope::of_type("cases"),
            &risky(),
            0.5,
            json!({ "session_id": "s1" }),
        )
        .await
        .expect("request queued")
}

#[tokio::test]
async fn new_request_is_pending_with_a_short_id() {
    let h = harness().await;
    let request = queue_one(&h, "agent-a").await;

    assert_eq!(request.status, HitlStatus::Pending);
    assert_eq!(request.request_id.len(), 8);
    assert!(request.request_id.chars().all(|c| c.is_ascii_alphanumeric()));
    assert_eq!(request.expires_at - request.created_at, Duration::seconds(300));
    assert!(request.risk_tier >= RiskTier::Moderate);
    assert!(!request.factors.is_empty());

    let stored = h
        .engine
        .hitl()
        .get(&request.request_id)
        .await
        .expect("lookup")
        .expect("request exists");
    assert_eq!(stored, request);
}

#[tokio::test]
async fn review_codes_are_distinct_and_unambiguous() {
    let h = harness().await;
    let mut codes = std::collections::HashSet::new();
    for i in 0..200 {
        let request = queue_one(&h, &format!("agent-{i}")).await;
        assert!(!request.request_id.contains(['0', 'O', 'o', '1', 'I', 'l']));
        assert!(codes.insert(request.request_id));
    }
    let pending = h.engine.hitl().list_pending(500).await.expect("pending");
    assert_eq!(pending.len(), 200);
}

#[tokio::test]
async fn reviewer_answers_are_recorded_once() {
    let h = harness().await;
    let hitl = h.engine.hitl();
    let approved = queue_one(&h, "agent-a").await;
    let denied = queue_one(&h, "agent-b").await;

    h.clock.advance(Duration::seconds(30));
    let resolution = hitl
        .resolve(&approved.request_id, true, "alice", Some("looks fine"))
        .await
        .expect("resolved");
    let HitlResolution::Approved(request) = resolution else {
        panic!("expected approval, got {resolution:?}");
    };
    assert_eq!(request.status, HitlStatus::Approved);
    assert_eq!(request.reviewer.as_deref(), Some("alice"));
    assert_eq!(request.reviewer_notes.as_deref(), Some("looks fine"));
    assert!(request.resolved_at.is_some());

    let resolution = hitl
        .resolve(&denied.request_id, false, "bob", None)
        .await
        .expect("resolved");
    assert!(matches!(resolution, HitlResolution::Denied(_)));

    // Terminal states do not move.
    let again = hitl
        .resolve(&approved.request_id, false, "mallory", None)
        .await
        .expect("resolved");
    let HitlResolution::AlreadyResolved(request) = again else {
        panic!("expected already resolved, got {again:?}");
    };
    assert_eq!(request.status, HitlStatus::Approved);
    assert_eq!(request.reviewer.as_deref(), Some("alice"));

    let missing = hitl.resolve("zzzzzzzz", true, "alice", None).await.expect("resolved");
    assert_eq!(missing, HitlResolution::NotFound);
}

#[tokio::test]
async fn late_answer_expires_the_request() {
    let h = harness().await;
    let request = queue_one(&h, "agent-a").await;

    h.clock.advance(Duration::seconds(300));
    let resolution = h
        .engine
        .hitl()
        .resolve(&request.request_id, true, "alice", None)
        .await
        .expect("resolved");
    let HitlResolution::Expired(expired) = resolution else {
        panic!("expected expiry, got {resolution:?}");
    };
    assert_eq!(expired.status, HitlStatus::Expired);
    assert_eq!(expired.reviewer.as_deref(), Some(EXPIRY_REVIEWER));
}

#[tokio::test]
async fn sweep_expires_only_overdue_requests() {
    let h = harness().await;
    let hitl = h.engine.hitl();
    let old = queue_one(&h, "agent-a").await;
    h.clock.advance(Duration::seconds(200));
    let fresh = queue_one(&h, "agent-b").await;
    let answered = queue_one(&h, "agent-c").await;
    hitl.resolve(&answered.request_id, true, "alice", None)
        .await
        .expect("resolved");

    h.clock.advance(Duration::seconds(150));
    assert_eq!(hitl.expire_stale().await.expect("swept"), 1);
    assert_eq!(hitl.expire_stale().await.expect("swept"), 0);

    let old = hitl.get(&old.request_id).await.expect("lookup").expect("exists");
    assert_eq!(old.status, HitlStatus::Expired);
    let pending = hitl.list_pending(10).await.expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].request_id, fresh.request_id);
}

#[tokio::test]
async fn auto_approval_is_distinguishable() {
    let h = harness().await;
    let request = queue_one(&h, "agent-a").await;
    let resolution = h
        .engine
        .hitl()
        .auto_approve(&request.request_id, "auto_approve", None)
        .await
        .expect("resolved");
    let HitlResolution::Approved(request) = resolution else {
        panic!("expected approval, got {resolution:?}");
    };
    assert_eq!(request.status, HitlStatus::AutoApproved);
    assert!(request.status.is_approved());
}

#[tokio::test]
async fn pending_list_is_oldest_first_and_limited() {
    let h = harness().await;
    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(queue_one(&h, &format!("agent-{i}")).await.request_id);
        h.clock.advance(Duration::seconds(1));
    }
    let pending = h.engine.hitl().list_pending(3).await.expect("pending");
    let listed: Vec<_> = pending.iter().map(|r| r.request_id.clone()).collect();
    assert_eq!(listed, ids[..3].to_vec());
}
