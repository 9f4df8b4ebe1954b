use std::sync::Arc;

use tracing::error;

use council_core::event::{HumanReviewRequest, InboundMessage, ServerEvent};
use council_core::types::{ExecutionStatus, MessageRole, NodeStatus, SessionStatus};

use crate::rungraph::RunGraphStore;
use crate::transcript::{NewMessage, TranscriptStore};

/// Stateless dispatch from decoded server events to the two projections.
///
/// Must be invoked once per frame, in delivery order, with no suspension
/// between frames — the transport's driver task calls it synchronously.
pub struct EventRouter {
    transcript: Arc<TranscriptStore>,
    graph: Arc<RunGraphStore>,
}

impl EventRouter {
    pub fn new(transcript: Arc<TranscriptStore>, graph: Arc<RunGraphStore>) -> Self {
        Self { transcript, graph }
    }

    pub fn route(&self, msg: &InboundMessage) {
        match &msg.event {
            ServerEvent::TokenStream {
                node_id,
                agent_id,
                chunk,
                ..
            } => {
                self.transcript.append_message(NewMessage {
                    node_id: node_id.clone(),
                    agent_id: Some(agent_id.clone()),
                    agent_name: None,
                    role: MessageRole::Agent,
                    content: chunk.clone(),
                    is_streaming: true,
                    is_chunk: true,
                });
            }

            ServerEvent::NodeStateChange { node_id, status } => {
                self.transcript.update_node_status(node_id, *status);
                self.graph.update_node_status(node_id, *status, None);

                match status {
                    NodeStatus::Running => {
                        self.graph.add_active_node(node_id);
                        // First node starting pulls the whole run into
                        // `running` and starts the elapsed ticker.
                        self.transcript.update_session_status(SessionStatus::Running);
                        if self.graph.execution_status() != ExecutionStatus::Running {
                            self.graph.set_execution_status(ExecutionStatus::Running);
                            self.graph.start_timer();
                        }
                    }
                    NodeStatus::Completed | NodeStatus::Failed => {
                        self.graph.remove_active_node(node_id);
                        self.transcript.finalize_message(node_id, None);
                    }
                    NodeStatus::Pending => {}
                }
            }

            ServerEvent::ParallelStart { node_id, branches } => {
                self.graph.set_active_nodes(branches.clone());
                self.transcript.handle_parallel_start(node_id, branches);
            }

            ServerEvent::TokenUsageReport {
                node_id,
                agent_id,
                usage,
            } => {
                self.transcript.update_token_usage(node_id, agent_id, *usage);
                self.graph.update_node_token_usage(node_id, *usage);
            }

            ServerEvent::ExecutionPaused => {
                self.graph.set_execution_status(ExecutionStatus::Paused);
                self.graph.stop_timer();
                self.transcript.update_session_status(SessionStatus::Paused);
            }

            ServerEvent::ExecutionCompleted => {
                self.graph.set_execution_status(ExecutionStatus::Completed);
                self.graph.stop_timer();
                self.transcript
                    .update_session_status(SessionStatus::Completed);
            }

            ServerEvent::ExecutionFailed => {
                self.graph.set_execution_status(ExecutionStatus::Failed);
                self.graph.stop_timer();
                self.transcript.update_session_status(SessionStatus::Failed);
            }

            ServerEvent::HumanInteractionRequired {
                node_id,
                reason,
                timeout_secs,
            } => {
                let session_id = self
                    .transcript
                    .session()
                    .map(|s| s.id.to_string())
                    .unwrap_or_default();
                self.graph.set_human_review(Some(HumanReviewRequest {
                    session_id,
                    node_id: node_id.clone(),
                    reason: reason.clone(),
                    timeout_secs: *timeout_secs,
                    payload: None,
                }));
            }

            ServerEvent::NodeResumed => {
                self.graph.set_human_review(None);
            }

            ServerEvent::ToolExecution {
                node_id,
                agent_id,
                tool,
            } => {
                // Rendered inline in the agent's streaming bubble. Without an
                // agent id, fall back to the node id (one agent per node).
                let agent = agent_id.clone().unwrap_or_else(|| node_id.clone());
                self.transcript.append_message(NewMessage {
                    node_id: node_id.clone(),
                    agent_id: Some(agent),
                    agent_name: None,
                    role: MessageRole::Agent,
                    content: format!("\n\n> Executing tool: `{}`\n\n", tool),
                    is_streaming: true,
                    is_chunk: true,
                });
            }

            ServerEvent::Error { node_id, error: e } => {
                if let Some(node_id) = node_id {
                    self.graph
                        .update_node_status(node_id, NodeStatus::Failed, Some(e.clone()));
                    self.transcript.update_node_status(node_id, NodeStatus::Failed);
                }
                // A server error never terminates the run by itself.
                error!(error = %e, node_id = ?node_id, "Server reported error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use council_core::event::ServerFrame;
    use council_core::types::{NodeType, SessionId, SessionInit, SessionNodeSeed, TokenUsage};
    use std::time::Duration;

    fn fixture() -> (Arc<TranscriptStore>, Arc<RunGraphStore>, EventRouter) {
        let transcript = Arc::new(TranscriptStore::new());
        let graph = Arc::new(RunGraphStore::with_tick_interval(
            "http://unused",
            Duration::from_millis(10),
        ));
        let router = EventRouter::new(transcript.clone(), graph.clone());
        (transcript, graph, router)
    }

    fn seed_session(transcript: &TranscriptStore, graph: &RunGraphStore, ids: &[&str]) {
        transcript.init_session(SessionInit {
            session_id: SessionId::from_string("sess-1"),
            workflow_id: "wf-1".into(),
            group_id: "g-1".into(),
            nodes: ids
                .iter()
                .map(|id| SessionNodeSeed {
                    id: (*id).into(),
                    name: (*id).into(),
                    node_type: NodeType::Agent,
                    status: council_core::types::NodeStatus::Pending,
                })
                .collect(),
        });
        graph.load_workflow(
            ids.iter()
                .map(|id| council_core::graph::PositionedNode {
                    id: (*id).into(),
                    name: (*id).into(),
                    node_type: NodeType::Agent,
                    x: 0.0,
                    y: 0.0,
                })
                .collect(),
            Vec::new(),
        );
    }

    fn route(router: &EventRouter, frame: &str) {
        router.route(&ServerFrame::decode(frame).unwrap());
    }

    #[tokio::test]
    async fn test_token_stream_builds_one_message() {
        let (transcript, graph, router) = fixture();
        seed_session(&transcript, &graph, &["n1"]);

        route(&router, r#"{"event":"token_stream","data":{"node_id":"n1","agent_id":"a1","chunk":"Hello "}}"#);
        route(&router, r#"{"event":"token_stream","data":{"node_id":"n1","agent_id":"a1","chunk":"World!"}}"#);

        let groups = transcript.groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].messages.len(), 1);
        assert_eq!(groups[0].messages[0].content, "Hello World!");
    }

    #[tokio::test]
    async fn test_node_lifecycle() {
        let (transcript, graph, router) = fixture();
        seed_session(&transcript, &graph, &["n1"]);

        route(&router, r#"{"event":"node_state_change","data":{"node_id":"n1","status":"running"}}"#);

        assert!(graph.active_nodes().contains("n1"));
        assert_eq!(graph.execution_status(), ExecutionStatus::Running);
        assert_eq!(
            transcript.session().unwrap().status,
            SessionStatus::Running
        );

        route(&router, r#"{"event":"node_state_change","data":{"node_id":"n1","status":"completed"}}"#);

        assert!(!graph.active_nodes().contains("n1"));
        assert_eq!(graph.stats().completed_nodes, 1);
        let snap = transcript.session().unwrap().node("n1").cloned().unwrap();
        assert!(snap.started_at.is_some());
        assert!(snap.completed_at.is_some());
        graph.stop_timer();
    }

    #[tokio::test]
    async fn test_status_and_active_set_stay_consistent() {
        let (transcript, graph, router) = fixture();
        seed_session(&transcript, &graph, &["n1", "n2", "n3"]);

        let events = [
            r#"{"event":"node_state_change","data":{"node_id":"n1","status":"running"}}"#,
            r#"{"event":"node_state_change","data":{"node_id":"n2","status":"running"}}"#,
            r#"{"event":"node_state_change","data":{"node_id":"n1","status":"completed"}}"#,
            r#"{"event":"node_state_change","data":{"node_id":"n3","status":"running"}}"#,
            r#"{"event":"node_state_change","data":{"node_id":"n2","status":"failed"}}"#,
        ];

        for frame in events {
            route(&router, frame);
            let active = graph.active_nodes();
            for node in graph.nodes() {
                assert_eq!(
                    node.status == council_core::types::NodeStatus::Running,
                    active.contains(&node.id),
                    "active set diverged for {}",
                    node.id
                );
            }
        }
        graph.stop_timer();
    }

    #[tokio::test]
    async fn test_parallel_branch_traffic_folds_into_parent() {
        let (transcript, graph, router) = fixture();
        seed_session(&transcript, &graph, &["p1"]);

        route(&router, r#"{"event":"node:parallel_start","data":{"node_id":"p1","branches":["b1","b2"]}}"#);
        route(&router, r#"{"event":"token_stream","data":{"node_id":"b1","agent_id":"a1","chunk":"left"}}"#);
        route(&router, r#"{"event":"token_usage","data":{"node_id":"b2","agent_id":"a2","input_tokens":10,"output_tokens":5,"estimated_cost_usd":0.001}}"#);

        let expected: std::collections::HashSet<String> =
            ["b1", "b2"].iter().map(|s| s.to_string()).collect();
        assert_eq!(graph.active_nodes(), expected);

        let groups = transcript.groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].node_id, "p1");
        assert!(groups[0].is_parallel);
        assert!(!groups.iter().any(|g| g.node_id == "b1" || g.node_id == "b2"));
    }

    #[tokio::test]
    async fn test_usage_accumulates_in_both_projections() {
        let (transcript, graph, router) = fixture();
        seed_session(&transcript, &graph, &["n1", "n2"]);

        route(&router, r#"{"event":"token_usage","data":{"node_id":"n1","agent_id":"a1","input_tokens":100,"output_tokens":50,"estimated_cost_usd":0.01}}"#);
        route(&router, r#"{"event":"token_usage","data":{"node_id":"n2","agent_id":"a2","input_tokens":200,"output_tokens":100,"estimated_cost_usd":0.02}}"#);

        let session = transcript.session().unwrap();
        assert_eq!(session.total_tokens, 450);
        assert!((session.total_cost_usd - 0.03).abs() < 1e-9);

        assert_eq!(graph.stats().total_tokens, 450);
        assert!((graph.stats().total_cost_usd - 0.03).abs() < 1e-9);
        assert_eq!(graph.node("n1").unwrap().usage.unwrap(), TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
            estimated_cost_usd: 0.01,
        });
    }

    #[tokio::test]
    async fn test_pause_and_complete_lifecycle() {
        let (transcript, graph, router) = fixture();
        seed_session(&transcript, &graph, &["n1"]);

        route(&router, r#"{"event":"node_state_change","data":{"node_id":"n1","status":"running"}}"#);
        route(&router, r#"{"event":"execution:paused"}"#);

        assert_eq!(graph.execution_status(), ExecutionStatus::Paused);
        assert_eq!(transcript.session().unwrap().status, SessionStatus::Paused);

        route(&router, r#"{"event":"execution:completed"}"#);

        assert_eq!(graph.execution_status(), ExecutionStatus::Completed);
        let session = transcript.session().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(session.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_error_event_fails_named_node_only() {
        let (transcript, graph, router) = fixture();
        seed_session(&transcript, &graph, &["n1", "n2"]);

        route(&router, r#"{"event":"node_state_change","data":{"node_id":"n2","status":"running"}}"#);
        route(&router, r#"{"event":"error","data":{"node_id":"n1","error":"model overloaded"}}"#);

        assert_eq!(
            graph.node("n1").unwrap().status,
            council_core::types::NodeStatus::Failed
        );
        assert_eq!(
            graph.node("n1").unwrap().error.as_deref(),
            Some("model overloaded")
        );
        // independent nodes keep running
        assert_eq!(
            graph.node("n2").unwrap().status,
            council_core::types::NodeStatus::Running
        );
        assert_ne!(graph.execution_status(), ExecutionStatus::Failed);
        graph.stop_timer();
    }

    #[tokio::test]
    async fn test_review_request_round_trip() {
        let (transcript, graph, router) = fixture();
        seed_session(&transcript, &graph, &["hr1"]);

        route(&router, r#"{"event":"human_interaction_required","node_id":"hr1","data":{"reason":"check the draft","timeout":60}}"#);

        let review = graph.human_review().unwrap();
        assert_eq!(review.node_id, "hr1");
        assert_eq!(review.session_id, "sess-1");
        assert_eq!(review.timeout_secs, 60);

        route(&router, r#"{"event":"node_resumed"}"#);
        assert!(graph.human_review().is_none());
    }

    #[tokio::test]
    async fn test_tool_execution_annotates_the_stream() {
        let (transcript, graph, router) = fixture();
        seed_session(&transcript, &graph, &["n1"]);

        route(&router, r#"{"event":"token_stream","data":{"node_id":"n1","agent_id":"a1","chunk":"thinking"}}"#);
        route(&router, r#"{"event":"tool_execution","data":{"node_id":"n1","agent_id":"a1","tool":"web_search"}}"#);

        let content = &transcript.groups()[0].messages[0].content;
        assert!(content.contains("web_search"));
        assert!(content.starts_with("thinking"));
    }
}
