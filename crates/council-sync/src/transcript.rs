use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use council_core::types::{
    Message, MessageGroup, MessageRole, NodeSnapshot, NodeStatus, NodeType, SessionInit,
    SessionStatus, TokenUsage, WorkflowSession,
};

/// Input to [`TranscriptStore::append_message`].
///
/// `is_chunk` marks incremental streaming text: a chunk is concatenated into
/// an existing still-streaming message from the same agent, anything else
/// starts a new bubble.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub node_id: String,
    pub agent_id: Option<String>,
    pub agent_name: Option<String>,
    pub role: MessageRole,
    pub content: String,
    pub is_streaming: bool,
    pub is_chunk: bool,
}

struct TranscriptState {
    session: Option<WorkflowSession>,
    groups: Vec<MessageGroup>,
    /// branch node id -> parent fan-out node id
    parallel_parent: HashMap<String, String>,
}

/// The Session/Transcript projection: per-node message groups, streaming
/// text assembly, token/cost accounting, and the session lifecycle.
///
/// All mutation happens synchronously under one lock, one inbound frame at a
/// time, so readers never observe a half-applied update.
pub struct TranscriptStore {
    state: Mutex<TranscriptState>,
}

impl TranscriptStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TranscriptState {
                session: None,
                groups: Vec::new(),
                parallel_parent: HashMap::new(),
            }),
        }
    }

    /// Replace the entire projection with a fresh session.
    ///
    /// Pre-seeds one NodeSnapshot per declared node and a MessageGroup for
    /// every node the snapshot already reports as running, so a client that
    /// reconnects mid-run resumes without a blank transcript.
    pub fn init_session(&self, init: SessionInit) {
        let mut st = self.state.lock().unwrap();

        let mut nodes: Vec<NodeSnapshot> = Vec::with_capacity(init.nodes.len());
        let mut active = std::collections::HashSet::new();
        let mut groups = Vec::new();

        for seed in init.nodes {
            if nodes.iter().any(|n: &NodeSnapshot| n.id == seed.id) {
                warn!(node_id = %seed.id, "Duplicate node id in session init, skipping");
                continue;
            }
            if seed.status == NodeStatus::Running {
                active.insert(seed.id.clone());
                groups.push(MessageGroup {
                    node_id: seed.id.clone(),
                    node_name: seed.name.clone(),
                    node_type: seed.node_type,
                    is_parallel: seed.node_type == NodeType::Parallel,
                    messages: Vec::new(),
                    status: NodeStatus::Running,
                });
            }
            nodes.push(NodeSnapshot {
                id: seed.id,
                name: seed.name,
                node_type: seed.node_type,
                status: seed.status,
                started_at: None,
                completed_at: None,
                usage: None,
            });
        }

        st.session = Some(WorkflowSession {
            id: init.session_id,
            workflow_id: init.workflow_id,
            group_id: init.group_id,
            status: SessionStatus::Idle,
            started_at: None,
            completed_at: None,
            nodes,
            active_node_ids: active,
            total_tokens: 0,
            total_cost_usd: 0.0,
        });
        st.groups = groups;
        st.parallel_parent.clear();
    }

    /// Drop all session state, e.g. when navigating away.
    pub fn clear_session(&self) {
        let mut st = self.state.lock().unwrap();
        st.session = None;
        st.groups.clear();
        st.parallel_parent.clear();
    }

    /// Apply a session lifecycle transition.
    ///
    /// The first `running` records `started_at` and never overwrites it;
    /// every terminal transition overwrites `completed_at` (last one wins,
    /// matching failed-after-paused flows).
    pub fn update_session_status(&self, status: SessionStatus) {
        let mut st = self.state.lock().unwrap();
        let session = match st.session.as_mut() {
            Some(s) => s,
            None => return,
        };
        session.status = status;
        if status == SessionStatus::Running && session.started_at.is_none() {
            session.started_at = Some(Utc::now());
        }
        if status.is_terminal() {
            session.completed_at = Some(Utc::now());
        }
    }

    /// Apply a node status transition.
    ///
    /// A `running` event for an unseen node id creates its snapshot (and
    /// group) on the fly — late joins and out-of-order initial snapshots
    /// must not drop traffic. Terminal transitions finalize any open
    /// streaming messages for the node.
    pub fn update_node_status(&self, node_id: &str, status: NodeStatus) {
        let mut st = self.state.lock().unwrap();
        let now = Utc::now();

        if let Some(session) = st.session.as_mut() {
            match session.node_mut(node_id) {
                Some(snap) => {
                    snap.status = status;
                    if status == NodeStatus::Running && snap.started_at.is_none() {
                        snap.started_at = Some(now);
                    }
                    if status.is_terminal() {
                        snap.completed_at = Some(now);
                    }
                }
                None if status == NodeStatus::Running => {
                    debug!(node_id, "Status for undeclared node, creating snapshot");
                    session.nodes.push(NodeSnapshot {
                        id: node_id.to_string(),
                        name: node_id.to_string(),
                        node_type: NodeType::Agent,
                        status,
                        started_at: Some(now),
                        completed_at: None,
                        usage: None,
                    });
                }
                None => {
                    debug!(node_id, ?status, "Status for unknown node, ignoring");
                }
            }

            match status {
                NodeStatus::Running => {
                    session.active_node_ids.insert(node_id.to_string());
                }
                NodeStatus::Completed | NodeStatus::Failed => {
                    session.active_node_ids.remove(node_id);
                }
                NodeStatus::Pending => {}
            }
        }

        if status == NodeStatus::Running {
            st.ensure_group(node_id);
        }

        // Only the group keyed by this node mirrors its status: a parallel
        // branch never flips its parent group.
        if let Some(group) = st.groups.iter_mut().find(|g| g.node_id == node_id) {
            group.status = status;
        }

        if status.is_terminal() {
            st.finalize(node_id, None);
        }
    }

    /// Replace the session's active-node set.
    pub fn set_active_nodes(&self, node_ids: &[String]) {
        let mut st = self.state.lock().unwrap();
        if let Some(session) = st.session.as_mut() {
            session.active_node_ids = node_ids.iter().cloned().collect();
        }
    }

    /// Append transcript content: either a new bubble, or — for a streaming
    /// chunk — concatenation into the open message from the same agent.
    ///
    /// Traffic for a registered parallel branch folds into the parent's
    /// group; that check precedes group creation.
    pub fn append_message(&self, msg: NewMessage) {
        let mut st = self.state.lock().unwrap();
        let group = st.ensure_group(&msg.node_id);

        if msg.is_chunk && msg.is_streaming {
            if let Some(open) = group
                .messages
                .iter_mut()
                .rev()
                .find(|m| m.is_streaming && m.agent_id.as_deref() == msg.agent_id.as_deref())
            {
                open.content.push_str(&msg.content);
                return;
            }
        }

        group.messages.push(Message {
            id: Uuid::new_v4().to_string(),
            node_id: msg.node_id,
            agent_id: msg.agent_id,
            agent_name: msg.agent_name,
            role: msg.role,
            content: msg.content,
            is_streaming: msg.is_streaming,
            timestamp: Utc::now(),
            usage: None,
        });
    }

    /// Mark streaming messages for a node as done — all of them, or only
    /// one agent's. Also called implicitly by terminal node transitions.
    pub fn finalize_message(&self, node_id: &str, agent_id: Option<&str>) {
        let mut st = self.state.lock().unwrap();
        st.finalize(node_id, agent_id);
    }

    /// Fold a usage report into the session totals, the node snapshot, and
    /// the reporting agent's latest message.
    pub fn update_token_usage(&self, node_id: &str, agent_id: &str, usage: TokenUsage) {
        let mut st = self.state.lock().unwrap();

        match st.session.as_mut() {
            Some(session) => {
                session.total_tokens += usage.total();
                session.total_cost_usd += usage.estimated_cost_usd;
                if let Some(snap) = session.node_mut(node_id) {
                    snap.usage.get_or_insert_with(TokenUsage::default).add(&usage);
                }
            }
            None => {
                debug!(node_id, "Usage report without a session, dropping");
                return;
            }
        }

        let key = st.group_key(node_id);
        if let Some(group) = st.groups.iter_mut().find(|g| g.node_id == key) {
            if let Some(message) = group
                .messages
                .iter_mut()
                .rev()
                .find(|m| m.agent_id.as_deref() == Some(agent_id))
            {
                message
                    .usage
                    .get_or_insert_with(TokenUsage::default)
                    .add(&usage);
            }
        }
    }

    /// Register a fan-out: each branch id maps to the parent node, and the
    /// parent gets a single shared parallel group.
    pub fn handle_parallel_start(&self, parent_id: &str, branches: &[String]) {
        let mut st = self.state.lock().unwrap();
        for branch in branches {
            st.parallel_parent
                .insert(branch.clone(), parent_id.to_string());
        }

        match st.groups.iter_mut().find(|g| g.node_id == parent_id) {
            Some(group) => group.is_parallel = true,
            None => {
                let (name, node_type) = st.node_display(parent_id, NodeType::Parallel);
                st.groups.push(MessageGroup {
                    node_id: parent_id.to_string(),
                    node_name: name,
                    node_type,
                    is_parallel: true,
                    messages: Vec::new(),
                    status: NodeStatus::Running,
                });
            }
        }
    }

    /// Current session, if any.
    pub fn session(&self) -> Option<WorkflowSession> {
        self.state.lock().unwrap().session.clone()
    }

    /// Message groups in rendering order.
    pub fn groups(&self) -> Vec<MessageGroup> {
        self.state.lock().unwrap().groups.clone()
    }

    /// The registered fan-out parent for a branch node id.
    pub fn parent_of(&self, node_id: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .parallel_parent
            .get(node_id)
            .cloned()
    }
}

impl Default for TranscriptStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptState {
    /// Which group a node's traffic belongs to: its fan-out parent when the
    /// node is a registered branch, itself otherwise.
    fn group_key(&self, node_id: &str) -> String {
        self.parallel_parent
            .get(node_id)
            .cloned()
            .unwrap_or_else(|| node_id.to_string())
    }

    /// Display name and type for a node, from the session snapshot when the
    /// node is declared there.
    fn node_display(&self, node_id: &str, fallback: NodeType) -> (String, NodeType) {
        self.session
            .as_ref()
            .and_then(|s| s.node(node_id))
            .map(|n| (n.name.clone(), n.node_type))
            .unwrap_or_else(|| (node_id.to_string(), fallback))
    }

    fn ensure_group(&mut self, node_id: &str) -> &mut MessageGroup {
        let key = self.group_key(node_id);
        if let Some(idx) = self.groups.iter().position(|g| g.node_id == key) {
            return &mut self.groups[idx];
        }
        let is_parallel = key != node_id;
        let fallback = if is_parallel {
            NodeType::Parallel
        } else {
            NodeType::Agent
        };
        let (name, node_type) = self.node_display(&key, fallback);
        self.groups.push(MessageGroup {
            node_id: key,
            node_name: name,
            node_type,
            is_parallel,
            messages: Vec::new(),
            status: NodeStatus::Running,
        });
        let idx = self.groups.len() - 1;
        &mut self.groups[idx]
    }

    fn finalize(&mut self, node_id: &str, agent_id: Option<&str>) {
        let key = self.group_key(node_id);
        if let Some(group) = self.groups.iter_mut().find(|g| g.node_id == key) {
            for message in group
                .messages
                .iter_mut()
                .filter(|m| m.is_streaming && m.node_id == node_id)
            {
                if agent_id.is_none() || message.agent_id.as_deref() == agent_id {
                    message.is_streaming = false;
                }
            }
        }
    }
}
