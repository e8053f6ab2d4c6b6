//! Lineage DAG recording, traversal and edge integrity.

use serde_json::json;
use trustgate::lineage::{EdgeCheck, LineageError, LineageNode, NewNode, NodeType, Relationship};

use crate::support::harness;

async fn node(
    graph: &trustgate::lineage::LineageGraph,
    node_type: NodeType,
    action: &str,
    parents: &[&LineageNode],
) -> LineageNode {
    graph
        .record_node(
            NewNode::new(node_type, "pipeline", action, json!({ "step": action }))
                .with_parents(parents.iter().map(|p| p.node_id.clone())),
        )
        .await
        .expect("node recorded")
}

#[tokio::test]
async fn forward_then_backward_returns_to_origin() {
    let h = harness().await;
    let graph = h.engine.lineage();

    let ingest = node(graph, NodeType::Ingestion, "ingest", &[]).await;
    let enrich = node(graph, NodeType::Enrichment, "enrich", &[&ingest]).await;
    let rules = node(graph, NodeType::RuleEvaluation, "rules", &[&enrich]).await;
    let score = node(graph, NodeType::ScoreCalculation, "score", &[&rules]).await;
    let case = node(graph, NodeType::CaseCreation, "case", &[&score, &enrich]).await;

    let downstream = graph
        .forward_trace(&ingest.node_id, 100)
        .await
        .expect("forward trace");
    assert_eq!(downstream.len(), 4);
    assert!(downstream.iter().all(|n| n.node_id != ingest.node_id));

    for reached in &downstream {
        let upstream = graph
            .backward_trace(&reached.node_id, 100)
            .await
            .expect("backward trace");
        assert!(
            upstream.iter().any(|n| n.node_id == ingest.node_id),
            "origin not reachable from {}",
            reached.action
        );
    }

    // Diamond paths do not duplicate nodes.
    let upstream_of_case = graph
        .backward_trace(&case.node_id, 100)
        .await
        .expect("backward trace");
    assert_eq!(upstream_of_case.len(), 4);
}

#[tokio::test]
async fn traces_stop_at_the_node_limit() {
    let h = harness().await;
    let graph = h.engine.lineage();
    let root = node(graph, NodeType::Ingestion, "root", &[]).await;
    for i in 0..5 {
        node(graph, NodeType::Enrichment, &format!("child-{i}"), &[&root]).await;
    }
    let limited = graph.forward_trace(&root.node_id, 3).await.expect("trace");
    assert_eq!(limited.len(), 3);
}

#[tokio::test]
async fn impact_analysis_counts_affected_decisions() {
    let h = harness().await;
    let graph = h.engine.lineage();
    let ingest = node(graph, NodeType::Ingestion, "ingest", &[]).await;
    let score_a = node(graph, NodeType::ScoreCalculation, "score-a", &[&ingest]).await;
    node(graph, NodeType::ScoreCalculation, "score-b", &[&ingest]).await;
    node(graph, NodeType::CaseCreation, "case", &[&score_a]).await;
    node(graph, NodeType::AgentAction, "notify", &[&score_a]).await;

    let impact = graph.impact_analysis(&ingest.node_id).await.expect("impact");
    assert_eq!(impact.origin, ingest.node_id);
    assert_eq!(impact.downstream_nodes, 4);
    assert_eq!(impact.score_calculations, 2);
    assert_eq!(impact.case_creations, 1);
    assert_eq!(impact.affected.len(), 3);
    assert!(!impact.truncated);
}

#[tokio::test]
async fn missing_nodes_are_reported() {
    let h = harness().await;
    let graph = h.engine.lineage();

    let err = graph
        .forward_trace("missing", 10)
        .await
        .expect_err("unknown origin");
    assert!(matches!(err, LineageError::NodeNotFound(_)));

    let err = graph
        .record_node(
            NewNode::new(NodeType::AgentAction, "agent", "act", json!({}))
                .with_parents(["ghost".to_owned()]),
        )
        .await
        .expect_err("unknown parent");
    assert!(matches!(err, LineageError::NodeNotFound(_)));

    // The failed write left nothing behind.
    let accountability = graph
        .agent_accountability("agent", 10)
        .await
        .expect("accountability");
    assert_eq!(accountability.total_nodes, 0);
}

#[tokio::test]
async fn explicit_edges_reject_self_loops() {
    let h = harness().await;
    let graph = h.engine.lineage();
    let a = node(graph, NodeType::Ingestion, "a", &[]).await;
    let b = node(graph, NodeType::Enrichment, "b", &[]).await;

    let edge = graph
        .add_edge(&a.node_id, &b.node_id, Relationship::Triggered, None)
        .await
        .expect("edge added");
    assert_eq!(graph.verify_edge(&edge.edge_id).await.expect("check"), EdgeCheck::Unhashed);

    let err = graph
        .add_edge(&a.node_id, &a.node_id, Relationship::Triggered, None)
        .await
        .expect_err("self loop");
    assert!(matches!(err, LineageError::SelfLoop(_)));
}

#[tokio::test]
async fn edge_hash_detects_payload_tampering() {
    let h = harness().await;
    let graph = h.engine.lineage();
    let parent = node(graph, NodeType::Ingestion, "ingest", &[]).await;
    let child = node(graph, NodeType::Enrichment, "enrich", &[&parent]).await;

    let edges = graph.edges_from(&parent.node_id).await.expect("edges");
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].relationship, Relationship::Produced);
    assert_eq!(graph.verify_edge(&edges[0].edge_id).await.expect("check"), EdgeCheck::Intact);

    sqlx::query("UPDATE lineage_nodes SET payload = ?1 WHERE node_id = ?2")
        .bind(r#"{"step":"forged"}"#)
        .bind(&child.node_id)
        .execute(h.store().pool())
        .await
        .expect("tamper");
    assert_eq!(
        graph.verify_edge(&edges[0].edge_id).await.expect("check"),
        EdgeCheck::Mismatch
    );
}

#[tokio::test]
async fn accountability_summarises_an_agent() {
    let h = harness().await;
    let graph = h.engine.lineage();
    for (i, node_type) in [NodeType::AgentAction, NodeType::AgentAction, NodeType::HumanDecision]
        .into_iter()
        .enumerate()
    {
        graph
            .record_node(NewNode {
                trust_score: Some(if i == 0 { 0.6 } else { 0.8 }),
                ..NewNode::new(node_type, "agent-z", "act", json!({ "i": i }))
            })
            .await
            .expect("node recorded");
    }

    let summary = graph.agent_accountability("agent-z", 2).await.expect("summary");
    assert_eq!(summary.total_nodes, 3);
    assert_eq!(summary.by_type.get("agent_action"), Some(&2));
    assert_eq!(summary.by_type.get("human_decision"), Some(&1));
    assert_eq!(summary.recent.len(), 2);
    let average = summary.average_trust.expect("trust recorded");
    assert!((average - (0.6 + 0.8 + 0.8) / 3.0).abs() < 1e-9);
}
