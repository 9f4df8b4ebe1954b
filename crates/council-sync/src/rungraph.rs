use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use council_core::error::{CouncilError, Result};
use council_core::event::{ControlAction, HumanReviewRequest, ReviewDecision};
use council_core::graph::{EdgeDecl, GraphDecl, PositionedNode};
use council_core::types::{ExecutionStatus, NodeStatus, NodeType, SessionId, TokenUsage};

use crate::layout::LayoutEngine;

/// A positioned, live-annotated node on the canvas.
#[derive(Debug, Clone)]
pub struct RunNode {
    pub id: String,
    pub node_type: NodeType,
    pub label: String,
    pub status: NodeStatus,
    pub progress: Option<f32>,
    pub error: Option<String>,
    pub usage: Option<TokenUsage>,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone)]
pub struct RunEdge {
    pub from: String,
    pub to: String,
}

/// Aggregate run statistics for the canvas header.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunStats {
    pub total_nodes: usize,
    pub completed_nodes: usize,
    pub failed_nodes: usize,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub elapsed_ms: u64,
}

#[derive(Default)]
struct RunGraphState {
    nodes: Vec<RunNode>,
    edges: Vec<RunEdge>,
    active: HashSet<String>,
    execution_status: ExecutionStatus,
    stats: RunStats,
    /// Node ids whose terminal transition has already been counted, so a
    /// duplicate completed/failed event cannot double-count the stats.
    counted: HashSet<String>,
    human_review: Option<HumanReviewRequest>,
}

/// The Run/Graph projection: per-node visual status, the active-node set,
/// execution-level status, elapsed-time ticking, and the out-of-band
/// control/review channel.
///
/// The elapsed-time ticker is an owned resource: at most one tick task is
/// ever live, and it is cancelled on stop, clear, and drop.
pub struct RunGraphStore {
    state: Arc<Mutex<RunGraphState>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    http: reqwest::Client,
    api_base: String,
    tick_interval: Duration,
}

impl RunGraphStore {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self::with_tick_interval(api_base, Duration::from_millis(100))
    }

    pub fn with_tick_interval(api_base: impl Into<String>, tick_interval: Duration) -> Self {
        let api_base = api_base.into().trim_end_matches('/').to_string();
        Self {
            state: Arc::new(Mutex::new(RunGraphState::default())),
            timer: Mutex::new(None),
            http: reqwest::Client::new(),
            api_base,
            tick_interval,
        }
    }

    /// Replace the visual graph. Every node starts `pending` and the
    /// total-node stat is recomputed; the terminal-count guard resets with
    /// the node set it guarded.
    pub fn load_workflow(&self, nodes: Vec<PositionedNode>, edges: Vec<EdgeDecl>) {
        let mut st = self.state.lock().unwrap();
        st.nodes = nodes
            .into_iter()
            .map(|n| RunNode {
                id: n.id,
                node_type: n.node_type,
                label: n.name,
                status: NodeStatus::Pending,
                progress: None,
                error: None,
                usage: None,
                x: n.x,
                y: n.y,
            })
            .collect();
        st.edges = edges
            .into_iter()
            .map(|e| RunEdge { from: e.from, to: e.to })
            .collect();
        st.stats.total_nodes = st.nodes.len();
        st.stats.completed_nodes = 0;
        st.stats.failed_nodes = 0;
        st.counted.clear();
    }

    /// Lay out a declarative graph (e.g. from a template) and load it.
    pub fn set_graph_from_template(&self, layout: &dyn LayoutEngine, graph: &GraphDecl) {
        let positioned = layout.layout(graph);
        self.load_workflow(positioned, graph.edges.clone());
    }

    /// Reset the projection and cancel any live ticker.
    pub fn clear_workflow(&self) {
        self.stop_timer();
        *self.state.lock().unwrap() = RunGraphState::default();
    }

    /// Mutate one node's visual status. Terminal transitions count toward
    /// the completed/failed stats exactly once per node.
    pub fn update_node_status(&self, node_id: &str, status: NodeStatus, error: Option<String>) {
        let mut st = self.state.lock().unwrap();
        let idx = match st.nodes.iter().position(|n| n.id == node_id) {
            Some(idx) => idx,
            None => {
                debug!(node_id, ?status, "Status for node not on the canvas");
                return;
            }
        };
        {
            let node = &mut st.nodes[idx];
            node.status = status;
            if let Some(error) = error {
                node.error = Some(error);
            }
        }
        if status.is_terminal() && st.counted.insert(node_id.to_string()) {
            match status {
                NodeStatus::Completed => st.stats.completed_nodes += 1,
                NodeStatus::Failed => st.stats.failed_nodes += 1,
                _ => {}
            }
        }
    }

    pub fn add_active_node(&self, node_id: &str) {
        self.state
            .lock()
            .unwrap()
            .active
            .insert(node_id.to_string());
    }

    pub fn remove_active_node(&self, node_id: &str) {
        self.state.lock().unwrap().active.remove(node_id);
    }

    /// Replace the active set, e.g. with a fan-out's branch ids.
    pub fn set_active_nodes(&self, node_ids: Vec<String>) {
        self.state.lock().unwrap().active = node_ids.into_iter().collect();
    }

    /// Fold a usage report into the node and the global stats.
    pub fn update_node_token_usage(&self, node_id: &str, usage: TokenUsage) {
        let mut st = self.state.lock().unwrap();
        if let Some(node) = st.nodes.iter_mut().find(|n| n.id == node_id) {
            node.usage.get_or_insert_with(TokenUsage::default).add(&usage);
        }
        st.stats.total_tokens += usage.total();
        st.stats.total_cost_usd += usage.estimated_cost_usd;
    }

    pub fn set_execution_status(&self, status: ExecutionStatus) {
        self.state.lock().unwrap().execution_status = status;
    }

    pub fn execution_status(&self) -> ExecutionStatus {
        self.state.lock().unwrap().execution_status
    }

    /// Issue a control action over the request/response channel.
    ///
    /// Local execution status follows the action only after the server
    /// confirms; a failed request returns `Err` and leaves prior status in
    /// place, so there is nothing to roll back.
    pub async fn send_control(&self, session_id: &SessionId, action: ControlAction) -> Result<()> {
        let url = format!("{}/api/v1/sessions/{}/control", self.api_base, session_id);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "action": action }))
            .send()
            .await?;

        if !resp.status().is_success() {
            warn!(%action, status = %resp.status(), "Control action rejected");
            return Err(CouncilError::Control {
                action: action.to_string(),
                message: format!("server returned {}", resp.status()),
            });
        }

        let status = match action {
            ControlAction::Pause => ExecutionStatus::Paused,
            ControlAction::Resume => ExecutionStatus::Running,
            ControlAction::Stop => ExecutionStatus::Failed,
        };
        self.set_execution_status(status);
        Ok(())
    }

    /// Record or clear the single outstanding human-review request.
    pub fn set_human_review(&self, request: Option<HumanReviewRequest>) {
        self.state.lock().unwrap().human_review = request;
    }

    pub fn human_review(&self) -> Option<HumanReviewRequest> {
        self.state.lock().unwrap().human_review.clone()
    }

    /// Post the user's decision for the outstanding review request.
    ///
    /// The request is cleared only on success; on failure it stays pending
    /// so the decision can be resubmitted.
    pub async fn submit_human_review(
        &self,
        decision: ReviewDecision,
        data: Option<serde_json::Value>,
    ) -> Result<()> {
        let request = self
            .state
            .lock()
            .unwrap()
            .human_review
            .clone()
            .ok_or(CouncilError::NoPendingReview)?;

        let url = format!(
            "{}/api/v1/sessions/{}/review",
            self.api_base, request.session_id
        );
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "decision": decision,
                "node_id": request.node_id,
                "data": data,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(CouncilError::Review(format!(
                "server returned {}",
                resp.status()
            )));
        }

        self.state.lock().unwrap().human_review = None;
        Ok(())
    }

    /// Start the elapsed-time ticker: resets elapsed to zero, cancels any
    /// previous ticker, and spawns a task that recomputes elapsed from a
    /// captured start instant. Starting is a fresh run, not a resume.
    pub fn start_timer(&self) {
        self.stop_timer();
        self.state.lock().unwrap().stats.elapsed_ms = 0;

        let weak = Arc::downgrade(&self.state);
        let tick = self.tick_interval;
        let handle = tokio::spawn(async move {
            let start = Instant::now();
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                let state = match weak.upgrade() {
                    Some(state) => state,
                    None => break,
                };
                state.lock().unwrap().stats.elapsed_ms = start.elapsed().as_millis() as u64;
            }
        });
        *self.timer.lock().unwrap() = Some(handle);
    }

    pub fn stop_timer(&self) {
        if let Some(handle) = self.timer.lock().unwrap().take() {
            handle.abort();
        }
    }

    pub fn nodes(&self) -> Vec<RunNode> {
        self.state.lock().unwrap().nodes.clone()
    }

    pub fn edges(&self) -> Vec<RunEdge> {
        self.state.lock().unwrap().edges.clone()
    }

    pub fn node(&self, node_id: &str) -> Option<RunNode> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .iter()
            .find(|n| n.id == node_id)
            .cloned()
    }

    pub fn active_nodes(&self) -> HashSet<String> {
        self.state.lock().unwrap().active.clone()
    }

    pub fn stats(&self) -> RunStats {
        self.state.lock().unwrap().stats
    }
}

impl Drop for RunGraphStore {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Router};
    use council_core::graph::NodeDecl;
    use tokio::net::TcpListener;

    fn positioned(id: &str, name: &str) -> PositionedNode {
        PositionedNode {
            id: id.into(),
            name: name.into(),
            node_type: NodeType::Agent,
            x: 0.0,
            y: 0.0,
        }
    }

    fn load(store: &RunGraphStore, ids: &[&str]) {
        store.load_workflow(
            ids.iter().map(|id| positioned(id, id)).collect(),
            Vec::new(),
        );
    }

    /// Serve a router on an ephemeral port and return its base URL.
    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn review_request() -> HumanReviewRequest {
        HumanReviewRequest {
            session_id: "s1".into(),
            node_id: "n1".into(),
            reason: "needs a look".into(),
            timeout_secs: 30,
            payload: None,
        }
    }

    #[tokio::test]
    async fn test_node_status_and_stats() {
        let store = RunGraphStore::new("http://unused");
        load(&store, &["n1", "n2"]);

        store.update_node_status("n1", NodeStatus::Completed, None);
        store.update_node_status("n2", NodeStatus::Failed, Some("boom".into()));

        let stats = store.stats();
        assert_eq!(stats.total_nodes, 2);
        assert_eq!(stats.completed_nodes, 1);
        assert_eq!(stats.failed_nodes, 1);
        assert_eq!(store.node("n2").unwrap().error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_duplicate_terminal_events_count_once() {
        let store = RunGraphStore::new("http://unused");
        load(&store, &["n1"]);

        store.update_node_status("n1", NodeStatus::Completed, None);
        store.update_node_status("n1", NodeStatus::Completed, None);

        assert_eq!(store.stats().completed_nodes, 1);
    }

    #[tokio::test]
    async fn test_active_set_management() {
        let store = RunGraphStore::new("http://unused");
        store.set_active_nodes(vec!["a".into(), "b".into()]);
        assert_eq!(store.active_nodes().len(), 2);

        store.remove_active_node("a");
        assert!(!store.active_nodes().contains("a"));
        assert!(store.active_nodes().contains("b"));

        store.add_active_node("c");
        assert!(store.active_nodes().contains("c"));
    }

    #[tokio::test]
    async fn test_token_usage_accumulates() {
        let store = RunGraphStore::new("http://unused");
        load(&store, &["n1"]);

        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
            estimated_cost_usd: 0.002,
        };
        store.update_node_token_usage("n1", usage);
        store.update_node_token_usage("n1", usage);

        assert_eq!(store.node("n1").unwrap().usage.unwrap().total(), 300);
        assert_eq!(store.stats().total_tokens, 300);
        assert!((store.stats().total_cost_usd - 0.004).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_timer_resets_and_ticks() {
        let store = RunGraphStore::with_tick_interval("http://unused", Duration::from_millis(5));

        store.start_timer();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.stats().elapsed_ms > 0);

        store.stop_timer();
        let frozen = store.stats().elapsed_ms;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.stats().elapsed_ms, frozen);

        // starting again is a fresh run, not a resume
        store.start_timer();
        assert!(store.stats().elapsed_ms < frozen);
        store.stop_timer();
    }

    #[tokio::test]
    async fn test_clear_workflow_resets_and_stops_timer() {
        let store = RunGraphStore::with_tick_interval("http://unused", Duration::from_millis(5));
        load(&store, &["n1"]);
        store.update_node_status("n1", NodeStatus::Completed, None);
        store.set_execution_status(ExecutionStatus::Running);
        store.start_timer();

        store.clear_workflow();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(store.nodes().is_empty());
        assert_eq!(store.execution_status(), ExecutionStatus::Idle);
        assert_eq!(store.stats(), RunStats::default());
    }

    #[tokio::test]
    async fn test_send_control_updates_status_after_success() {
        let base = serve(Router::new().route(
            "/api/v1/sessions/{id}/control",
            post(|| async { "ok" }),
        ))
        .await;
        let store = RunGraphStore::new(base);
        store.set_execution_status(ExecutionStatus::Running);

        store
            .send_control(&SessionId::from_string("session-1"), ControlAction::Pause)
            .await
            .unwrap();

        assert_eq!(store.execution_status(), ExecutionStatus::Paused);
    }

    #[tokio::test]
    async fn test_send_control_failure_leaves_status() {
        let base = serve(Router::new().route(
            "/api/v1/sessions/{id}/control",
            post(|| async { axum::http::StatusCode::INTERNAL_SERVER_ERROR }),
        ))
        .await;
        let store = RunGraphStore::new(base);
        store.set_execution_status(ExecutionStatus::Running);

        let err = store
            .send_control(&SessionId::from_string("session-1"), ControlAction::Stop)
            .await
            .unwrap_err();

        assert!(matches!(err, CouncilError::Control { .. }));
        assert_eq!(store.execution_status(), ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn test_review_submission_clears_request_on_success() {
        let base = serve(Router::new().route(
            "/api/v1/sessions/{id}/review",
            post(|| async { "ok" }),
        ))
        .await;
        let store = RunGraphStore::new(base);
        store.set_human_review(Some(review_request()));

        store
            .submit_human_review(ReviewDecision::Approve, None)
            .await
            .unwrap();

        assert!(store.human_review().is_none());
    }

    #[tokio::test]
    async fn test_review_submission_failure_keeps_request() {
        let base = serve(Router::new().route(
            "/api/v1/sessions/{id}/review",
            post(|| async { axum::http::StatusCode::BAD_GATEWAY }),
        ))
        .await;
        let store = RunGraphStore::new(base);
        store.set_human_review(Some(review_request()));

        let err = store
            .submit_human_review(ReviewDecision::Reject, None)
            .await
            .unwrap_err();

        assert!(matches!(err, CouncilError::Review(_)));
        assert!(store.human_review().is_some(), "request stays for retry");
    }

    #[tokio::test]
    async fn test_submit_without_pending_request_errors() {
        let store = RunGraphStore::new("http://unused");
        let err = store
            .submit_human_review(ReviewDecision::Approve, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CouncilError::NoPendingReview));
    }

    #[tokio::test]
    async fn test_template_layout_loads_pending_nodes() {
        let store = RunGraphStore::new("http://unused");
        let graph = GraphDecl {
            nodes: vec![
                NodeDecl::new("start", "Start", NodeType::Start),
                NodeDecl::new("agent", "Analyst", NodeType::Agent),
            ],
            edges: vec![EdgeDecl::new("start", "agent")],
        };

        store.set_graph_from_template(&crate::layout::LayeredLayout::default(), &graph);

        let nodes = store.nodes();
        assert_eq!(nodes.len(), 2);
        assert!(nodes.iter().all(|n| n.status == NodeStatus::Pending));
        assert_eq!(store.stats().total_nodes, 2);
        assert_eq!(store.edges().len(), 1);
    }
}
