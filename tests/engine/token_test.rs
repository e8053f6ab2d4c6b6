//! Capability token lifecycle: issue, validate, revoke, delegate.

use std::sync::Arc;

use chrono::Duration;
use trustgate::risk::ActionCategory;
use trustgate::token::{IssueRequest, ResourceScope, TokenConstraints, TokenError};

use crate::support::harness;

fn claims_scope() -> ResourceScope {
    ResourceScope {
        resource_type: "claims".to_owned(),
        resource_ids: vec!["c1".to_owned(), "c2".to_owned()],
        workspace_id: Some("ws1".to_owned()),
    }
}

fn query_request(agent: &str) -> IssueRequest {
    IssueRequest::new(agent, "query_claims", ActionCategory::Query, claims_scope())
}

#[tokio::test]
async fn single_use_token_validates_exactly_once() {
    let h = harness().await;
    let tokens = h.engine.tokens();
    let token = tokens.issue(query_request("agent-a")).await.expect("issued");
    assert_eq!(token.max_uses, 1);
    assert_eq!(token.signature.len(), 64);
    assert!(tokens.verify_signature(&token).expect("verifiable"));

    let first = tokens
        .validate(&token.token_id, Some("query_claims"))
        .await
        .expect("first use succeeds");
    assert_eq!(first.uses_remaining, 0);

    let second = tokens
        .validate(&token.token_id, Some("query_claims"))
        .await
        .expect_err("second use fails");
    assert!(matches!(second, TokenError::Exhausted(_)));
    assert_eq!(second.reason(), "exhausted");
}

#[tokio::test]
async fn concurrent_validation_never_double_spends() {
    let h = harness().await;
    let tokens = Arc::clone(h.engine.tokens());
    let token = tokens.issue(query_request("agent-a")).await.expect("issued");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let tokens = Arc::clone(&tokens);
        let id = token.token_id.clone();
        handles.push(tokio::spawn(async move { tokens.validate(&id, None).await }));
    }
    let mut successes = 0;
    for handle in handles {
        match handle.await.expect("task joined") {
            Ok(_) => successes += 1,
            Err(e) => assert_eq!(e.reason(), "exhausted"),
        }
    }
    assert_eq!(successes, 1);
}

#[tokio::test]
async fn each_validation_failure_has_its_own_reason() {
    let h = harness().await;
    let tokens = h.engine.tokens();

    let missing = tokens.validate("no-such-token", None).await.expect_err("missing");
    assert_eq!(missing.reason(), "not_found");

    let mismatched = tokens.issue(query_request("agent-a")).await.expect("issued");
    let err = tokens
        .validate(&mismatched.token_id, Some("delete_case"))
        .await
        .expect_err("wrong action");
    assert!(matches!(err, TokenError::ActionMismatch { .. }));
    // A mismatch does not consume the use.
    tokens
        .validate(&mismatched.token_id, Some("query_claims"))
        .await
        .expect("still usable");

    let revoked = tokens.issue(query_request("agent-a")).await.expect("issued");
    assert!(tokens.revoke(&revoked.token_id, "test").await.expect("revoked"));
    assert!(!tokens.revoke(&revoked.token_id, "again").await.expect("idempotent"));
    let err = tokens.validate(&revoked.token_id, None).await.expect_err("revoked");
    assert_eq!(err.reason(), "revoked");

    let expiring = tokens.issue(query_request("agent-a")).await.expect("issued");
    h.clock.advance(Duration::seconds(61));
    let err = tokens.validate(&expiring.token_id, None).await.expect_err("expired");
    assert_eq!(err.reason(), "expired");
}

#[tokio::test]
async fn tampered_token_fails_signature_check() {
    let h = harness().await;
    let tokens = h.engine.tokens();
    let token = tokens.issue(query_request("agent-a")).await.expect("issued");

    sqlx::query(
        "UPDATE capability_tokens SET max_uses = 99, uses_remaining = 99 WHERE token_id = ?1",
    )
    .bind(&token.token_id)
    .execute(h.store().pool())
    .await
    .expect("tamper");

    let err = tokens.validate(&token.token_id, None).await.expect_err("tampered");
    assert!(matches!(err, TokenError::SignatureInvalid(_)));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn ttl_follows_action_category() {
    let h = harness().await;
    let tokens = h.engine.tokens();

    let query = tokens.issue(query_request("agent-a")).await.expect("issued");
    assert_eq!(query.expires_at - query.issued_at, Duration::seconds(60));

    let investigate = tokens
        .issue(IssueRequest::new(
            "agent-a",
            "investigate_claim",
            ActionCategory::Investigate,
            claims_scope(),
        ))
        .await
        .expect("issued");
    assert_eq!(investigate.expires_at - investigate.issued_at, Duration::seconds(300));
}

#[tokio::test]
async fn delegation_only_narrows() {
    let h = harness().await;
    let tokens = h.engine.tokens();
    let parent = tokens
        .issue(IssueRequest {
            max_uses: Some(5),
            ttl: Some(Duration::seconds(300)),
            constraints: TokenConstraints {
                read_only: true,
                max_records: Some(100),
                max_cost: None,
            },
            ..query_request("agent-a")
        })
        .await
        .expect("parent issued");

    let child = tokens
        .issue(IssueRequest {
            max_uses: Some(10),
            ttl: Some(Duration::seconds(600)),
            constraints: TokenConstraints {
                read_only: false,
                max_records: Some(1_000),
                max_cost: Some(50.0),
            },
            resource_scope: ResourceScope {
                resource_type: "claims".to_owned(),
                resource_ids: vec!["c2".to_owned(), "c3".to_owned()],
                workspace_id: None,
            },
            parent_token_id: Some(parent.token_id.clone()),
            ..query_request("agent-b")
        })
        .await
        .expect("child issued");

    assert!(child.constraints.is_within(&parent.constraints));
    assert!(child.resource_scope.is_within(&parent.resource_scope));
    assert!(child.constraints.read_only);
    assert_eq!(child.constraints.max_records, Some(100));
    assert_eq!(child.resource_scope.resource_ids, vec!["c2".to_owned()]);
    assert_eq!(child.resource_scope.workspace_id.as_deref(), Some("ws1"));
    assert!(child.max_uses <= parent.max_uses);
    assert!(child.expires_at <= parent.expires_at);
    assert_eq!(child.parent_token_id.as_deref(), Some(parent.token_id.as_str()));
}

#[tokio::test]
async fn delegation_cannot_change_action_or_resource() {
    let h = harness().await;
    let tokens = h.engine.tokens();
    let parent = tokens.issue(query_request("agent-a")).await.expect("parent issued");

    let other_action = tokens
        .issue(IssueRequest {
            parent_token_id: Some(parent.token_id.clone()),
            ..IssueRequest::new("agent-b", "update_case", ActionCategory::Update, claims_scope())
        })
        .await
        .expect_err("different action");
    assert_eq!(other_action.reason(), "delegation_mismatch");

    let other_type = tokens
        .issue(IssueRequest {
            parent_token_id: Some(parent.token_id.clone()),
            ..IssueRequest::new(
                "agent-b",
                "query_claims",
                ActionCategory::Query,
                ResourceScope::of_type("members"),
            )
        })
        .await
        .expect_err("different resource type");
    assert_eq!(other_type.reason(), "delegation_mismatch");
}

#[tokio::test]
async fn inactive_parent_cannot_delegate() {
    let h = harness().await;
    let tokens = h.engine.tokens();
    let parent = tokens.issue(query_request("agent-a")).await.expect("parent issued");
    tokens.revoke(&parent.token_id, "compromised").await.expect("revoked");

    let err = tokens
        .issue(IssueRequest {
            parent_token_id: Some(parent.token_id.clone()),
            ..query_request("agent-b")
        })
        .await
        .expect_err("revoked parent");
    assert!(matches!(err, TokenError::ParentInactive { .. }));

    let err = tokens
        .issue(IssueRequest {
            parent_token_id: Some("missing".to_owned()),
            ..query_request("agent-b")
        })
        .await
        .expect_err("missing parent");
    assert_eq!(err.reason(), "parent_inactive");
}

#[tokio::test]
async fn revoke_all_only_touches_active_tokens_of_the_agent() {
    let h = harness().await;
    let tokens = h.engine.tokens();
    for _ in 0..3 {
        tokens.issue(query_request("agent-a")).await.expect("issued");
    }
    let other = tokens.issue(query_request("agent-b")).await.expect("issued");

    assert_eq!(tokens.active_for_agent("agent-a").await.expect("list").len(), 3);
    let revoked = tokens
        .revoke_all_for_agent("agent-a", "suspended")
        .await
        .expect("revoked");
    assert_eq!(revoked, 3);
    assert!(tokens.active_for_agent("agent-a").await.expect("list").is_empty());

    let still = tokens.get(&other.token_id).await.expect("lookup").expect("exists");
    assert!(!still.revoked);

    let err = tokens.revoke("missing", "nope").await.expect_err("not found");
    assert_eq!(err.reason(), "not_found");
}
