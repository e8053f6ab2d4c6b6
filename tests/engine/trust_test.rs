//! Trust manager: clamping, decay on read, escalation and reinstatement.

use chrono::Duration;
use trustgate::trust::{DecayModel, EscalationLevel, TrustError, TrustEvent, REINSTATED_TRUST};

use crate::support::{config_with_trust, harness, harness_with};

#[tokio::test]
async fn new_agents_start_at_default_trust() {
    let h = harness().await;
    let snapshot = h.engine.trust().snapshot("fresh").await.expect("snapshot");
    assert!((snapshot.trust_score - 0.7).abs() < 1e-9);
    assert_eq!(snapshot.escalation_level, EscalationLevel::Normal);

    let profile = h.engine.trust().profile("fresh").await.expect("profile");
    assert!((profile.initial_trust - 0.7).abs() < 1e-9);
    assert!(h.engine.trust().history("fresh", 10).await.expect("history").is_empty());
}

#[tokio::test]
async fn trust_stays_clamped_for_every_decay_model() {
    for model in [DecayModel::Exponential, DecayModel::Linear, DecayModel::Step] {
        let mut config = config_with_trust(0.95);
        config.trust.decay_model = model;
        let h = harness_with(config).await;
        let trust = h.engine.trust();

        for _ in 0..10 {
            let update = trust
                .record_event("climber", TrustEvent::HumanEndorsement, "vouched")
                .await
                .expect("event recorded");
            assert!((0.0..=1.0).contains(&update.new_score), "{model:?}");
        }
        assert!((trust.get_trust_score("climber").await.expect("score") - 1.0).abs() < 1e-9);

        for _ in 0..10 {
            h.clock.advance(Duration::hours(50));
            let update = trust
                .record_event("climber", TrustEvent::PolicyViolation, "violation")
                .await
                .expect("event recorded");
            assert!((0.0..=1.0).contains(&update.new_score), "{model:?}");
        }
        assert!(trust.get_trust_score("climber").await.expect("score") >= 0.0);
    }
}

#[tokio::test]
async fn idle_agents_decay_on_read() {
    let h = harness().await;
    let trust = h.engine.trust();
    trust
        .record_event("idle", TrustEvent::SuccessfulAction, "ok")
        .await
        .expect("event recorded");
    let before = trust.get_trust_score("idle").await.expect("score");

    h.clock.advance(Duration::hours(48));
    let after = trust.get_trust_score("idle").await.expect("score");
    assert!(after < before);

    // Stored score is untouched; decay is computed on read.
    let profile = trust.profile("idle").await.expect("profile");
    assert!((profile.trust_score - before).abs() < 1e-9);
}

#[tokio::test]
async fn escalation_walks_down_one_gate_at_a_time() {
    let h = harness_with(config_with_trust(0.8)).await;
    let trust = h.engine.trust();

    let mut seen = vec![trust.get_escalation_level("drifter").await.expect("level")];
    loop {
        let update = trust
            .record_event("drifter", TrustEvent::ActionError, "failed")
            .await
            .expect("event recorded");
        assert!(update.new_level >= update.old_level, "levels only rise on penalties");
        assert!(
            update.new_level.as_u8() <= update.old_level.as_u8().saturating_add(1),
            "skipped a gate: {:?} -> {:?}",
            update.old_level,
            update.new_level
        );
        if seen.last() != Some(&update.new_level) {
            seen.push(update.new_level);
        }
        if update.new_level == EscalationLevel::Suspended {
            break;
        }
    }
    assert_eq!(
        seen,
        vec![
            EscalationLevel::Normal,
            EscalationLevel::Logged,
            EscalationLevel::Supervised,
            EscalationLevel::Suspended,
        ]
    );
}

#[tokio::test]
async fn suspension_latches_until_reinstated() {
    let h = harness_with(config_with_trust(0.35)).await;
    let trust = h.engine.trust();

    let update = trust
        .record_event("rogue", TrustEvent::PolicyViolation, "exfiltration attempt")
        .await
        .expect("event recorded");
    assert_eq!(update.new_level, EscalationLevel::Suspended);

    // Good behaviour alone does not lift a suspension.
    for _ in 0..5 {
        trust
            .record_event("rogue", TrustEvent::HumanEndorsement, "vouched")
            .await
            .expect("event recorded");
    }
    assert_eq!(
        trust.get_escalation_level("rogue").await.expect("level"),
        EscalationLevel::Suspended
    );

    let reinstated = trust.reinstate("rogue", "security-lead").await.expect("reinstated");
    assert_eq!(reinstated.new_level, EscalationLevel::Supervised);
    assert!((reinstated.new_score - REINSTATED_TRUST).abs() < 1e-9);
    assert_eq!(
        trust.get_escalation_level("rogue").await.expect("level"),
        EscalationLevel::Supervised
    );

    let err = trust
        .reinstate("rogue", "security-lead")
        .await
        .expect_err("only suspended agents can be reinstated");
    assert!(matches!(err, TrustError::NotSuspended { .. }));

    let history = trust.history("rogue", 1).await.expect("history");
    assert_eq!(history[0].event, TrustEvent::Reinstated);
}

#[tokio::test]
async fn history_is_capped_and_newest_first() {
    let mut config = config_with_trust(0.7);
    config.trust.history_cap = 5;
    let h = harness_with(config).await;
    let trust = h.engine.trust();

    for i in 0..8 {
        trust
            .record_event("chatty", TrustEvent::SuccessfulAction, &format!("run {i}"))
            .await
            .expect("event recorded");
    }
    let history = trust.history("chatty", 100).await.expect("history");
    assert_eq!(history.len(), 5);
    assert_eq!(history[0].reason, "run 7");
    assert_eq!(history[4].reason, "run 3");
}

#[tokio::test]
async fn recent_errors_respect_the_window() {
    let h = harness().await;
    let trust = h.engine.trust();

    trust
        .record_event("flaky", TrustEvent::ActionError, "old failure")
        .await
        .expect("event recorded");
    h.clock.advance(Duration::hours(30));
    trust
        .record_event("flaky", TrustEvent::ActionError, "new failure")
        .await
        .expect("event recorded");
    trust
        .record_event("flaky", TrustEvent::SuccessfulAction, "recovered")
        .await
        .expect("event recorded");

    let count = trust
        .recent_errors("flaky", Duration::hours(24))
        .await
        .expect("count");
    assert_eq!(count, 1);
}

#[tokio::test]
async fn concurrent_events_for_one_agent_are_not_lost() {
    let h = harness_with(config_with_trust(0.5)).await;
    let trust = h.engine.trust();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let trust = std::sync::Arc::clone(trust);
        handles.push(tokio::spawn(async move {
            trust
                .record_event("busy", TrustEvent::SuccessfulAction, "parallel")
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("task joined").expect("event recorded");
    }

    let score = trust.get_trust_score("busy").await.expect("score");
    assert!((score - 0.7).abs() < 1e-9);
}

#[tokio::test]
async fn step_decay_is_measured_from_the_last_success() {
    let mut config = config_with_trust(0.7);
    config.trust.decay_model = DecayModel::Step;
    let h = harness_with(config).await;
    let trust = h.engine.trust();

    let update = trust
        .record_event("sleeper", TrustEvent::SuccessfulAction, "ok")
        .await
        .expect("event recorded");
    assert!((update.new_score - 0.72).abs() < 1e-9);

    h.clock.advance(Duration::hours(30));
    let update = trust
        .record_event("sleeper", TrustEvent::ActionError, "failed")
        .await
        .expect("event recorded");
    assert!((update.old_score - 0.67).abs() < 1e-9);
    assert!((update.new_score - 0.62).abs() < 1e-9);

    // 200h since the success: the full 168h drop, plus the one error.
    h.clock.advance(Duration::hours(170));
    let score = trust.get_trust_score("sleeper").await.expect("score");
    assert!((score - 0.37).abs() < 1e-9, "got {score}");
    assert_eq!(
        trust.get_escalation_level("sleeper").await.expect("level"),
        EscalationLevel::Supervised
    );
}

#[tokio::test]
async fn penalties_do_not_restart_the_idle_clock() {
    let mut config = config_with_trust(0.9);
    config.trust.decay_model = DecayModel::Step;
    let h = harness_with(config).await;
    let trust = h.engine.trust();

    trust
        .record_event("steady", TrustEvent::SuccessfulAction, "ok")
        .await
        .expect("event recorded");
    for _ in 0..2 {
        h.clock.advance(Duration::hours(20));
        trust
            .record_event("steady", TrustEvent::ActionError, "failed")
            .await
            .expect("event recorded");
    }

    // 40h since the success crosses the 24h step even though no write was 24h apart.
    let score = trust.get_trust_score("steady").await.expect("score");
    assert!((score - 0.77).abs() < 1e-9, "got {score}");

    let profile = trust.profile("steady").await.expect("profile");
    assert!((profile.trust_score - 0.92).abs() < 1e-9);
    assert!((profile.penalty_since_success + 0.10).abs() < 1e-9);

    // A success folds decay and penalties into a new anchor.
    let update = trust
        .record_event("steady", TrustEvent::SuccessfulAction, "ok")
        .await
        .expect("event recorded");
    assert!((update.new_score - 0.79).abs() < 1e-9);
    let profile = trust.profile("steady").await.expect("profile");
    assert!((profile.trust_score - 0.79).abs() < 1e-9);
    assert!(profile.penalty_since_success.abs() < 1e-9);
}
