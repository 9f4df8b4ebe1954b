use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CouncilError, Result};
use crate::types::{NodeStatus, TokenUsage};

/// Raw inbound envelope: one JSON object per frame, discriminated by `event`.
///
/// Decoding into [`ServerEvent`] happens here, at the transport boundary;
/// nothing past this point inspects untyped payloads.
#[derive(Debug, Deserialize)]
pub struct ServerFrame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub node_id: Option<String>,
}

/// A decoded inbound frame: the typed event plus envelope metadata.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub event: ServerEvent,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Every event the orchestration server can push over the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Incremental text from an agent run.
    TokenStream {
        node_id: String,
        agent_id: String,
        chunk: String,
        is_thinking: bool,
    },
    /// A node's execution status changed.
    NodeStateChange { node_id: String, status: NodeStatus },
    /// A fan-out node spawned concurrent branch nodes.
    ParallelStart {
        node_id: String,
        branches: Vec<String>,
    },
    /// Token/cost accounting for one (node, agent) pair.
    TokenUsageReport {
        node_id: String,
        agent_id: String,
        usage: TokenUsage,
    },
    /// The whole run was paused.
    ExecutionPaused,
    /// The whole run completed.
    ExecutionCompleted,
    /// The whole run failed.
    ExecutionFailed,
    /// Execution is suspended awaiting a user decision.
    HumanInteractionRequired {
        node_id: String,
        reason: String,
        timeout_secs: u64,
    },
    /// A suspended node resumed; any outstanding review request is stale.
    NodeResumed,
    /// An agent invoked a tool mid-run.
    ToolExecution {
        node_id: String,
        agent_id: Option<String>,
        tool: String,
    },
    /// A server-reported error, optionally scoped to one node.
    Error {
        node_id: Option<String>,
        error: String,
    },
}

#[derive(Debug, Deserialize)]
struct TokenStreamData {
    node_id: String,
    agent_id: String,
    chunk: String,
    #[serde(default)]
    is_thinking: bool,
}

#[derive(Debug, Deserialize)]
struct NodeStateChangeData {
    node_id: String,
    status: NodeStatus,
}

#[derive(Debug, Deserialize)]
struct ParallelStartData {
    node_id: String,
    branches: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TokenUsageData {
    node_id: String,
    agent_id: String,
    input_tokens: u64,
    output_tokens: u64,
    estimated_cost_usd: f64,
}

#[derive(Debug, Deserialize)]
struct HumanInteractionData {
    #[serde(default)]
    node_id: Option<String>,
    reason: String,
    #[serde(default)]
    timeout: u64,
}

#[derive(Debug, Deserialize)]
struct ToolExecutionData {
    node_id: String,
    #[serde(default)]
    agent_id: Option<String>,
    tool: String,
}

#[derive(Debug, Deserialize)]
struct ErrorData {
    #[serde(default)]
    node_id: Option<String>,
    #[serde(default = "default_error_message")]
    error: String,
}

fn default_error_message() -> String {
    "Unknown error".to_string()
}

impl ServerFrame {
    /// Decode one frame of wire text into a typed message.
    pub fn decode(text: &str) -> Result<InboundMessage> {
        let frame: ServerFrame = serde_json::from_str(text)?;
        let event = match frame.event.as_str() {
            "token_stream" => {
                let d: TokenStreamData = serde_json::from_value(frame.data)?;
                ServerEvent::TokenStream {
                    node_id: d.node_id,
                    agent_id: d.agent_id,
                    chunk: d.chunk,
                    is_thinking: d.is_thinking,
                }
            }
            "node_state_change" => {
                let d: NodeStateChangeData = serde_json::from_value(frame.data)?;
                ServerEvent::NodeStateChange {
                    node_id: d.node_id,
                    status: d.status,
                }
            }
            "node:parallel_start" => {
                let d: ParallelStartData = serde_json::from_value(frame.data)?;
                ServerEvent::ParallelStart {
                    node_id: d.node_id,
                    branches: d.branches,
                }
            }
            "token_usage" => {
                let d: TokenUsageData = serde_json::from_value(frame.data)?;
                ServerEvent::TokenUsageReport {
                    node_id: d.node_id,
                    agent_id: d.agent_id,
                    usage: TokenUsage {
                        input_tokens: d.input_tokens,
                        output_tokens: d.output_tokens,
                        estimated_cost_usd: d.estimated_cost_usd,
                    },
                }
            }
            "execution:paused" => ServerEvent::ExecutionPaused,
            "execution:completed" => ServerEvent::ExecutionCompleted,
            "execution:failed" => ServerEvent::ExecutionFailed,
            "human_interaction_required" => {
                let d: HumanInteractionData = serde_json::from_value(frame.data)?;
                // Envelope-level node_id wins over the payload when both are set.
                let node_id = frame
                    .node_id
                    .or(d.node_id)
                    .ok_or_else(|| CouncilError::MalformedFrame(
                        "human_interaction_required without node_id".to_string(),
                    ))?;
                ServerEvent::HumanInteractionRequired {
                    node_id,
                    reason: d.reason,
                    timeout_secs: d.timeout,
                }
            }
            "node_resumed" => ServerEvent::NodeResumed,
            "tool_execution" => {
                let d: ToolExecutionData = serde_json::from_value(frame.data)?;
                ServerEvent::ToolExecution {
                    node_id: d.node_id,
                    agent_id: d.agent_id,
                    tool: d.tool,
                }
            }
            "error" => {
                let d: ErrorData = serde_json::from_value(frame.data)?;
                ServerEvent::Error {
                    node_id: d.node_id,
                    error: d.error,
                }
            }
            other => return Err(CouncilError::UnknownEvent(other.to_string())),
        };

        Ok(InboundMessage {
            event,
            timestamp: frame.timestamp,
        })
    }
}

/// A command sent from the client over the streaming channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "cmd", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    StartSession {
        workflow_id: String,
        group_id: String,
    },
    PauseSession {
        session_id: String,
    },
    ResumeSession {
        session_id: String,
    },
    UserInput {
        session_id: String,
        content: String,
    },
}

/// Out-of-band control action, sent via request/response rather than the
/// streaming channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Pause,
    Resume,
    Stop,
}

impl std::fmt::Display for ControlAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
        };
        write!(f, "{}", s)
    }
}

/// User decision for a pending human-review interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewDecision {
    Approve,
    Reject,
    Modify,
}

/// A server-issued interrupt requiring a user decision before execution
/// continues. At most one is outstanding at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanReviewRequest {
    pub session_id: String,
    pub node_id: String,
    pub reason: String,
    pub timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}
