//! Client-side plumbing for the council orchestration server: the streaming
//! connection manager, the request/response API client, and the wiring that
//! feeds decoded frames into the sync engine.

pub mod api;
pub mod bridge;
pub mod connection;

pub use api::{AgentGroup, AgentProfile, ApiClient, WorkflowTemplate};
pub use bridge::attach_router;
pub use connection::{ConnectionManager, ConnectionStatus};
