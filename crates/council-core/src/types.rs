use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique session identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution status of a single workflow node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl NodeStatus {
    /// Whether this status ends the node's execution.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle status of a whole session.
///
/// `idle → running → {paused ⇄ running} → {completed | failed | cancelled}`.
/// Terminal states are sticky in practice; the server is the source of truth
/// and transitions are applied as received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Execution-level status of the run graph projection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
}

/// Node kind as declared by the workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    Agent,
    Parallel,
    Sequence,
    Vote,
    Loop,
    FactCheck,
    HumanReview,
    End,
}

/// Role of a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Agent,
    System,
}

/// Token and cost accounting for one report or one accumulated total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost_usd: f64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Fold another report into this one.
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.estimated_cost_usd += other.estimated_cost_usd;
    }
}

/// One bubble in the transcript.
///
/// Content is mutable while `is_streaming` is set (chunks are concatenated
/// in place) and immutable once finalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub node_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    pub role: MessageRole,
    pub content: String,
    pub is_streaming: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// The transcript's organizing unit: one per executing node, or one shared
/// group per parallel fan-out point. Groups are appended in rendering order
/// and never removed or reordered, only mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageGroup {
    pub node_id: String,
    pub node_name: String,
    pub node_type: NodeType,
    pub is_parallel: bool,
    pub messages: Vec<Message>,
    pub status: NodeStatus,
}

/// Per-node execution record owned by the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: String,
    pub name: String,
    pub node_type: NodeType,
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// One user-visible run of a workflow.
///
/// The single long-lived aggregate of the transcript projection: replaced
/// wholesale by `init_session`, never partially reconstructed. `nodes` keeps
/// declaration order with unique ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSession {
    pub id: SessionId,
    pub workflow_id: String,
    pub group_id: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub nodes: Vec<NodeSnapshot>,
    pub active_node_ids: HashSet<String>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
}

impl WorkflowSession {
    pub fn node(&self, id: &str) -> Option<&NodeSnapshot> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut NodeSnapshot> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }
}

/// One declared node in a session-init snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionNodeSeed {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default = "default_seed_status")]
    pub status: NodeStatus,
}

fn default_seed_status() -> NodeStatus {
    NodeStatus::Pending
}

/// Caller-supplied snapshot used to (re)initialize the transcript projection.
///
/// The server sends one of these on session start and again after a
/// reconnect, so a resumed client never shows a blank transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInit {
    pub session_id: SessionId,
    pub workflow_id: String,
    pub group_id: String,
    #[serde(default)]
    pub nodes: Vec<SessionNodeSeed>,
}
