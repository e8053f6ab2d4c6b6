//! Append-only causal lineage DAG.
//!
//! Nodes are recorded events; edges are directed relationships between them.
//! A node and the edges from its parents are written in one transaction, so
//! an edge is never visible before both of its endpoints. Traversals are
//! breadth-first and capped by the number of visited nodes, which keeps them
//! finite even if a cycle is ever introduced through [`LineageGraph::add_edge`].

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::signing::{hash_canonical, SigningError};
use crate::store::{format_ts, limit_param, parse_ts, Store, StoreError};

/// Visited-node cap used by [`LineageGraph::impact_analysis`].
pub const IMPACT_TRACE_LIMIT: usize = 1_000;

/// Errors from lineage operations.
#[derive(Debug, thiserror::Error)]
pub enum LineageError {
    /// Referenced node does not exist.
    #[error("lineage node not found: {0}")]
    NodeNotFound(String),

    /// Referenced edge does not exist.
    #[error("lineage edge not found: {0}")]
    EdgeNotFound(String),

    /// Edge would connect a node to itself.
    #[error("lineage edge from {0} to itself")]
    SelfLoop(String),

    /// Backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Payload could not be hashed.
    #[error(transparent)]
    Signing(#[from] SigningError),
}

impl From<sqlx::Error> for LineageError {
    fn from(e: sqlx::Error) -> Self {
        Self::Store(StoreError::Database(e))
    }
}

impl From<serde_json::Error> for LineageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Store(StoreError::Serialization(e))
    }
}

/// Kind of recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Data entered the system.
    Ingestion,
    /// Data was enriched.
    Enrichment,
    /// A rule was evaluated.
    RuleEvaluation,
    /// A score was computed.
    ScoreCalculation,
    /// A case was opened.
    CaseCreation,
    /// An agent acted.
    AgentAction,
    /// A human decided.
    HumanDecision,
    /// Policy was enforced.
    PolicyEnforcement,
}

impl NodeType {
    /// Storage form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingestion => "ingestion",
            Self::Enrichment => "enrichment",
            Self::RuleEvaluation => "rule_evaluation",
            Self::ScoreCalculation => "score_calculation",
            Self::CaseCreation => "case_creation",
            Self::AgentAction => "agent_action",
            Self::HumanDecision => "human_decision",
            Self::PolicyEnforcement => "policy_enforcement",
        }
    }

    /// Parse the storage form.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidEnum`] for unknown values.
    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "ingestion" => Ok(Self::Ingestion),
            "enrichment" => Ok(Self::Enrichment),
            "rule_evaluation" => Ok(Self::RuleEvaluation),
            "score_calculation" => Ok(Self::ScoreCalculation),
            "case_creation" => Ok(Self::CaseCreation),
            "agent_action" => Ok(Self::AgentAction),
            "human_decision" => Ok(Self::HumanDecision),
            "policy_enforcement" => Ok(Self::PolicyEnforcement),
            other => Err(StoreError::InvalidEnum {
                field: "node_type",
                value: other.to_owned(),
            }),
        }
    }
}

/// Kind of relationship between two nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relationship {
    /// Source produced target.
    Produced,
    /// Source consumed target.
    Consumed,
    /// Source triggered target.
    Triggered,
    /// Source overrode target.
    Overrode,
    /// Source was escalated to target.
    EscalatedTo,
}

impl Relationship {
    /// Storage form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Produced => "produced",
            Self::Consumed => "consumed",
            Self::Triggered => "triggered",
            Self::Overrode => "overrode",
            Self::EscalatedTo => "escalated_to",
        }
    }

    /// Parse the storage form.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidEnum`] for unknown values.
    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "produced" => Ok(Self::Produced),
            "consumed" => Ok(Self::Consumed),
            "triggered" => Ok(Self::Triggered),
            "overrode" => Ok(Self::Overrode),
            "escalated_to" => Ok(Self::EscalatedTo),
            other => Err(StoreError::InvalidEnum {
                field: "relationship",
                value: other.to_owned(),
            }),
        }
    }
}

/// A recorded event. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageNode {
    /// Node id.
    pub node_id: String,
    /// Event kind.
    pub node_type: NodeType,
    /// Acting agent.
    pub agent_id: String,
    /// What happened.
    pub action: String,
    /// Opaque structured data.
    pub payload: Value,
    /// Agent trust at the time.
    pub trust_score: Option<f64>,
    /// Capability token used.
    pub token_id: Option<String>,
    /// How long it took.
    pub duration_ms: Option<u64>,
    /// Workspace boundary.
    pub workspace_id: Option<String>,
    /// Write time.
    pub created_at: DateTime<Utc>,
}

/// A directed relationship. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageEdge {
    /// Edge id.
    pub edge_id: String,
    /// Source node id.
    pub source_node: String,
    /// Target node id.
    pub target_node: String,
    /// Relationship kind.
    pub relationship: Relationship,
    /// Hash of the data that flowed along the edge.
    pub data_hash: Option<String>,
    /// Write time.
    pub created_at: DateTime<Utc>,
}

/// Parameters for [`LineageGraph::record_node`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewNode {
    /// Event kind.
    pub node_type: NodeType,
    /// Acting agent.
    pub agent_id: String,
    /// What happened.
    pub action: String,
    /// Opaque structured data.
    pub payload: Value,
    /// Agent trust at the time.
    pub trust_score: Option<f64>,
    /// Capability token used.
    pub token_id: Option<String>,
    /// How long it took.
    pub duration_ms: Option<u64>,
    /// Workspace boundary.
    pub workspace_id: Option<String>,
    /// Parents; each gets a `produced` edge to the new node.
    pub parent_node_ids: Vec<String>,
}

impl NewNode {
    /// Node with no optional fields and no parents.
    pub fn new(
        node_type: NodeType,
        agent_id: impl Into<String>,
        action: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            node_type,
            agent_id: agent_id.into(),
            action: action.into(),
            payload,
            trust_score: None,
            token_id: None,
            duration_ms: None,
            workspace_id: None,
            parent_node_ids: Vec::new(),
        }
    }

    /// Attach parent nodes.
    #[must_use]
    pub fn with_parents(mut self, parents: impl IntoIterator<Item = String>) -> Self {
        self.parent_node_ids.extend(parents);
        self
    }
}

/// What an agent has done, summarised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAccountability {
    /// Agent id.
    pub agent_id: String,
    /// All nodes ever recorded for the agent.
    pub total_nodes: u64,
    /// Node counts by type.
    pub by_type: BTreeMap<String, u64>,
    /// Mean trust score over nodes that carry one.
    pub average_trust: Option<f64>,
    /// Most recent nodes, newest first.
    pub recent: Vec<LineageNode>,
}

/// Downstream effect of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactAnalysis {
    /// Node analysed.
    pub origin: String,
    /// Every node reachable downstream.
    pub downstream_nodes: usize,
    /// Downstream score calculations.
    pub score_calculations: usize,
    /// Downstream case creations.
    pub case_creations: usize,
    /// The affected decisions themselves.
    pub affected: Vec<LineageNode>,
    /// Whether the traversal hit [`IMPACT_TRACE_LIMIT`].
    pub truncated: bool,
}

/// Result of re-hashing an edge's target payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCheck {
    /// Stored hash matches.
    Intact,
    /// Stored hash differs.
    Mismatch,
    /// Edge carries no hash.
    Unhashed,
}

#[derive(Clone, Copy)]
enum Direction {
    Forward,
    Backward,
}

/// The lineage DAG.
#[derive(Clone)]
pub struct LineageGraph {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for LineageGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineageGraph").finish_non_exhaustive()
    }
}

impl LineageGraph {
    /// Create a graph over `store`.
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Record a node and a `produced` edge from each parent.
    ///
    /// Each parent edge carries the hash of the new node's payload.
    ///
    /// # Errors
    ///
    /// Returns [`LineageError::NodeNotFound`] if a parent is missing; nothing
    /// is written in that case.
    pub async fn record_node(&self, node: NewNode) -> Result<LineageNode, LineageError> {
        let now = self.clock.now();
        let record = LineageNode {
            node_id: Uuid::new_v4().to_string(),
            node_type: node.node_type,
            agent_id: node.agent_id,
            action: node.action,
            payload: node.payload,
            trust_score: node.trust_score,
            token_id: node.token_id,
            duration_ms: node.duration_ms,
            workspace_id: node.workspace_id,
            created_at: crate::store::storage_precision(now),
        };
        let payload_hash = hash_canonical(&record.payload)?;

        let mut tx = self.store.pool().begin().await?;
        sqlx::query(
            "INSERT INTO lineage_nodes (node_id, node_type, agent_id, action, payload, \
             trust_score, token_id, duration_ms, workspace_id, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )
        .bind(&record.node_id)
        .bind(record.node_type.as_str())
        .bind(&record.agent_id)
        .bind(&record.action)
        .bind(serde_json::to_string(&record.payload)?)
        .bind(record.trust_score)
        .bind(&record.token_id)
        .bind(record.duration_ms.map(|d| i64::try_from(d).unwrap_or(i64::MAX)))
        .bind(&record.workspace_id)
        .bind(format_ts(&record.created_at))
        .execute(&mut *tx)
        .await?;

        for parent in &node.parent_node_ids {
            if !node_exists(&mut *tx, parent).await? {
                return Err(LineageError::NodeNotFound(parent.clone()));
            }
            insert_edge(
                &mut *tx,
                parent,
                &record.node_id,
                Relationship::Produced,
                Some(&payload_hash),
                &record.created_at,
            )
            .await?;
        }
        tx.commit().await?;

        debug!(
            node_id = %record.node_id,
            node_type = record.node_type.as_str(),
            agent_id = %record.agent_id,
            parents = node.parent_node_ids.len(),
            "lineage node recorded"
        );
        Ok(record)
    }

    /// Add an edge between two existing nodes.
    ///
    /// # Errors
    ///
    /// Returns [`LineageError::NodeNotFound`] if either endpoint is missing or
    /// [`LineageError::SelfLoop`] if they are the same node.
    pub async fn add_edge(
        &self,
        source: &str,
        target: &str,
        relationship: Relationship,
        data: Option<&Value>,
    ) -> Result<LineageEdge, LineageError> {
        if source == target {
            return Err(LineageError::SelfLoop(source.to_owned()));
        }
        let data_hash = data.map(hash_canonical).transpose()?;
        let now = crate::store::storage_precision(self.clock.now());

        let mut tx = self.store.pool().begin().await?;
        for endpoint in [source, target] {
            if !node_exists(&mut *tx, endpoint).await? {
                return Err(LineageError::NodeNotFound(endpoint.to_owned()));
            }
        }
        let edge = insert_edge(&mut *tx, source, target, relationship, data_hash.as_deref(), &now)
            .await?;
        tx.commit().await?;
        Ok(edge)
    }

    /// Look a node up.
    ///
    /// # Errors
    ///
    /// Returns [`LineageError::Store`] on storage failure.
    pub async fn get_node(&self, node_id: &str) -> Result<Option<LineageNode>, LineageError> {
        let row = sqlx::query("SELECT * FROM lineage_nodes WHERE node_id = ?1")
            .bind(node_id)
            .fetch_optional(self.store.pool())
            .await?;
        row.as_ref().map(decode_node).transpose()
    }

    /// Nodes downstream of `node_id`, breadth-first, origin excluded.
    ///
    /// `max_nodes` caps how many nodes are returned.
    ///
    /// # Errors
    ///
    /// Returns [`LineageError::NodeNotFound`] if the origin is missing.
    pub async fn forward_trace(
        &self,
        node_id: &str,
        max_nodes: usize,
    ) -> Result<Vec<LineageNode>, LineageError> {
        self.trace(node_id, max_nodes, Direction::Forward).await
    }

    /// Nodes upstream of `node_id`, breadth-first, origin excluded.
    ///
    /// # Errors
    ///
    /// Returns [`LineageError::NodeNotFound`] if the origin is missing.
    pub async fn backward_trace(
        &self,
        node_id: &str,
        max_nodes: usize,
    ) -> Result<Vec<LineageNode>, LineageError> {
        self.trace(node_id, max_nodes, Direction::Backward).await
    }

    /// Summary of what an agent has done.
    ///
    /// # Errors
    ///
    /// Returns [`LineageError::Store`] on storage failure.
    pub async fn agent_accountability(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<AgentAccountability, LineageError> {
        let counts = sqlx::query(
            "SELECT node_type, count(*) AS n FROM lineage_nodes WHERE agent_id = ?1 \
             GROUP BY node_type",
        )
        .bind(agent_id)
        .fetch_all(self.store.pool())
        .await?;

        let mut by_type = BTreeMap::new();
        let mut total_nodes = 0_u64;
        for row in counts {
            let node_type: String = row.try_get("node_type")?;
            let n: i64 = row.try_get("n")?;
            let n = u64::try_from(n).unwrap_or(0);
            total_nodes = total_nodes.saturating_add(n);
            by_type.insert(node_type, n);
        }

        let average_trust: Option<f64> = sqlx::query_scalar(
            "SELECT avg(trust_score) FROM lineage_nodes \
             WHERE agent_id = ?1 AND trust_score IS NOT NULL",
        )
        .bind(agent_id)
        .fetch_one(self.store.pool())
        .await?;

        let rows = sqlx::query(
            "SELECT * FROM lineage_nodes WHERE agent_id = ?1 ORDER BY rowid DESC LIMIT ?2",
        )
        .bind(agent_id)
        .bind(limit_param(limit))
        .fetch_all(self.store.pool())
        .await?;
        let recent = rows.iter().map(decode_node).collect::<Result<Vec<_>, _>>()?;

        Ok(AgentAccountability {
            agent_id: agent_id.to_owned(),
            total_nodes,
            by_type,
            average_trust,
            recent,
        })
    }

    /// Downstream score calculations and case creations affected by a node.
    ///
    /// # Errors
    ///
    /// Returns [`LineageError::NodeNotFound`] if the origin is missing.
    pub async fn impact_analysis(&self, node_id: &str) -> Result<ImpactAnalysis, LineageError> {
        let downstream = self.forward_trace(node_id, IMPACT_TRACE_LIMIT).await?;
        let truncated = downstream.len() >= IMPACT_TRACE_LIMIT;
        let affected: Vec<LineageNode> = downstream
            .iter()
            .filter(|n| {
                matches!(
                    n.node_type,
                    NodeType::ScoreCalculation | NodeType::CaseCreation
                )
            })
            .cloned()
            .collect();
        let score_calculations = affected
            .iter()
            .filter(|n| n.node_type == NodeType::ScoreCalculation)
            .count();
        Ok(ImpactAnalysis {
            origin: node_id.to_owned(),
            downstream_nodes: downstream.len(),
            score_calculations,
            case_creations: affected.len().saturating_sub(score_calculations),
            affected,
            truncated,
        })
    }

    /// Re-hash the target node's payload and compare with the edge's hash.
    ///
    /// # Errors
    ///
    /// Returns [`LineageError::EdgeNotFound`] or [`LineageError::NodeNotFound`]
    /// if the edge or its target is missing.
    pub async fn verify_edge(&self, edge_id: &str) -> Result<EdgeCheck, LineageError> {
        let row = sqlx::query("SELECT target_node, data_hash FROM lineage_edges WHERE edge_id = ?1")
            .bind(edge_id)
            .fetch_optional(self.store.pool())
            .await?
            .ok_or_else(|| LineageError::EdgeNotFound(edge_id.to_owned()))?;
        let target: String = row.try_get("target_node")?;
        let stored: Option<String> = row.try_get("data_hash")?;
        let Some(stored) = stored else {
            return Ok(EdgeCheck::Unhashed);
        };
        let node = self
            .get_node(&target)
            .await?
            .ok_or(LineageError::NodeNotFound(target))?;
        if hash_canonical(&node.payload)? == stored {
            Ok(EdgeCheck::Intact)
        } else {
            warn!(edge_id, node_id = %node.node_id, "lineage edge hash mismatch");
            Ok(EdgeCheck::Mismatch)
        }
    }

    /// Edges leaving `node_id`.
    ///
    /// # Errors
    ///
    /// Returns [`LineageError::Store`] on storage failure.
    pub async fn edges_from(&self, node_id: &str) -> Result<Vec<LineageEdge>, LineageError> {
        let rows = sqlx::query("SELECT * FROM lineage_edges WHERE source_node = ?1 ORDER BY rowid")
            .bind(node_id)
            .fetch_all(self.store.pool())
            .await?;
        rows.iter().map(decode_edge).collect()
    }

    async fn trace(
        &self,
        origin: &str,
        max_nodes: usize,
        direction: Direction,
    ) -> Result<Vec<LineageNode>, LineageError> {
        if self.get_node(origin).await?.is_none() {
            return Err(LineageError::NodeNotFound(origin.to_owned()));
        }
        let sql = match direction {
            Direction::Forward => {
                "SELECT n.* FROM lineage_edges e JOIN lineage_nodes n ON n.node_id = e.target_node \
                 WHERE e.source_node = ?1 ORDER BY e.rowid"
            }
            Direction::Backward => {
                "SELECT n.* FROM lineage_edges e JOIN lineage_nodes n ON n.node_id = e.source_node \
                 WHERE e.target_node = ?1 ORDER BY e.rowid"
            }
        };

        let mut visited: HashSet<String> = HashSet::from([origin.to_owned()]);
        let mut queue: VecDeque<String> = VecDeque::from([origin.to_owned()]);
        let mut result = Vec::new();

        'bfs: while let Some(current) = queue.pop_front() {
            let rows = sqlx::query(sql)
                .bind(&current)
                .fetch_all(self.store.pool())
                .await?;
            for row in &rows {
                if result.len() >= max_nodes {
                    break 'bfs;
                }
                let node = decode_node(row)?;
                if visited.insert(node.node_id.clone()) {
                    queue.push_back(node.node_id.clone());
                    result.push(node);
                }
            }
        }
        Ok(result)
    }
}

async fn node_exists(
    conn: &mut sqlx::SqliteConnection,
    node_id: &str,
) -> Result<bool, LineageError> {
    let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM lineage_nodes WHERE node_id = ?1")
        .bind(node_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(found.is_some())
}

async fn insert_edge(
    conn: &mut sqlx::SqliteConnection,
    source: &str,
    target: &str,
    relationship: Relationship,
    data_hash: Option<&str>,
    created_at: &DateTime<Utc>,
) -> Result<LineageEdge, LineageError> {
    let edge = LineageEdge {
        edge_id: Uuid::new_v4().to_string(),
        source_node: source.to_owned(),
        target_node: target.to_owned(),
        relationship,
        data_hash: data_hash.map(str::to_owned),
        created_at: *created_at,
    };
    sqlx::query(
        "INSERT INTO lineage_edges (edge_id, source_node, target_node, relationship, \
         data_hash, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(&edge.edge_id)
    .bind(&edge.source_node)
    .bind(&edge.target_node)
    .bind(edge.relationship.as_str())
    .bind(&edge.data_hash)
    .bind(format_ts(&edge.created_at))
    .execute(&mut *conn)
    .await?;
    Ok(edge)
}

fn decode_node(row: &sqlx::sqlite::SqliteRow) -> Result<LineageNode, LineageError> {
    let node_type: String = row.try_get("node_type")?;
    let payload: String = row.try_get("payload")?;
    let duration_ms: Option<i64> = row.try_get("duration_ms")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(LineageNode {
        node_id: row.try_get("node_id")?,
        node_type: NodeType::parse(&node_type)?,
        agent_id: row.try_get("agent_id")?,
        action: row.try_get("action")?,
        payload: serde_json::from_str(&payload)?,
        trust_score: row.try_get("trust_score")?,
        token_id: row.try_get("token_id")?,
        duration_ms: duration_ms.map(|d| u64::try_from(d).unwrap_or(0)),
        workspace_id: row.try_get("workspace_id")?,
        created_at: parse_ts(&created_at)?,
    })
}

fn decode_edge(row: &sqlx::sqlite::SqliteRow) -> Result<LineageEdge, LineageError> {
    let relationship: String = row.try_get("relationship")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(LineageEdge {
        edge_id: row.try_get("edge_id")?,
        source_node: row.try_get("source_node")?,
        target_node: row.try_get("target_node")?,
        relationship: Relationship::parse(&relationship)?,
        data_hash: row.try_get("data_hash")?,
        created_at: parse_ts(&created_at)?,
    })
}
