use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use council_core::error::{CouncilError, Result};
use council_core::graph::GraphDecl;
use council_core::types::SessionInit;

/// An agent definition as served by the CRUD API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// A named set of agents that a workflow runs against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub agent_ids: Vec<String>,
}

/// A reusable workflow with its embedded graph declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub graph: GraphDecl,
}

#[derive(Debug, Serialize)]
struct StartSessionBody<'a> {
    workflow_id: &'a str,
    group_id: &'a str,
}

/// Request/response client for the orchestration server's CRUD and session
/// endpoints. Only the shapes matter here; persistence lives server-side.
pub struct ApiClient {
    http: reqwest::Client,
    base: String,
}

impl ApiClient {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self.http.get(format!("{}{}", self.base, path)).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CouncilError::Api {
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(resp.json().await?)
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentProfile>> {
        self.get_json("/api/v1/agents").await
    }

    pub async fn list_groups(&self) -> Result<Vec<AgentGroup>> {
        self.get_json("/api/v1/groups").await
    }

    pub async fn list_templates(&self) -> Result<Vec<WorkflowTemplate>> {
        self.get_json("/api/v1/templates").await
    }

    pub async fn get_template(&self, id: &str) -> Result<WorkflowTemplate> {
        self.get_json(&format!("/api/v1/templates/{}", id)).await
    }

    /// Ask the server to start a run; the response is the same session-init
    /// snapshot it re-sends on reconnect.
    pub async fn start_session(&self, workflow_id: &str, group_id: &str) -> Result<SessionInit> {
        let resp = self
            .http
            .post(format!("{}/api/v1/sessions", self.base))
            .json(&StartSessionBody {
                workflow_id,
                group_id,
            })
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CouncilError::Api {
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(resp.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        routing::{get, post},
        Json, Router,
    };
    use tokio::net::TcpListener;

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_list_agents() {
        let base = serve(Router::new().route(
            "/api/v1/agents",
            get(|| async {
                Json(serde_json::json!([
                    {"id": "a1", "name": "Analyst", "role": "research"},
                    {"id": "a2", "name": "Critic"}
                ]))
            }),
        ))
        .await;

        let agents = ApiClient::new(base).list_agents().await.unwrap();
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0].role.as_deref(), Some("research"));
        assert!(agents[1].role.is_none());
    }

    #[tokio::test]
    async fn test_template_carries_graph() {
        let base = serve(Router::new().route(
            "/api/v1/templates/{id}",
            get(|| async {
                Json(serde_json::json!({
                    "id": "t1",
                    "name": "Debate",
                    "graph": {
                        "nodes": [{"id": "n1", "name": "Start", "type": "start"}],
                        "edges": []
                    }
                }))
            }),
        ))
        .await;

        let template = ApiClient::new(base).get_template("t1").await.unwrap();
        assert_eq!(template.graph.nodes.len(), 1);
        assert_eq!(template.graph.nodes[0].id, "n1");
    }

    #[tokio::test]
    async fn test_error_status_is_surfaced() {
        let base = serve(Router::new().route(
            "/api/v1/agents",
            get(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "down") }),
        ))
        .await;

        let err = ApiClient::new(base).list_agents().await.unwrap_err();
        match err {
            CouncilError::Api { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "down");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_start_session_returns_init_snapshot() {
        let base = serve(Router::new().route(
            "/api/v1/sessions",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["workflow_id"], "wf-1");
                Json(serde_json::json!({
                    "session_id": "sess-9",
                    "workflow_id": "wf-1",
                    "group_id": "g-1",
                    "nodes": [{"id": "n1", "name": "Start", "type": "start"}]
                }))
            }),
        ))
        .await;

        let init = ApiClient::new(base)
            .start_session("wf-1", "g-1")
            .await
            .unwrap();
        assert_eq!(init.session_id.to_string(), "sess-9");
        assert_eq!(init.nodes.len(), 1);
    }
}
