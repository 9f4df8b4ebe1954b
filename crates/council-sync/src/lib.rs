//! Run-state synchronization: the two projections over the orchestration
//! server's event stream, the router that feeds them, and the layout seam.
//!
//! The transcript and the run graph are deliberately independent projections
//! of the same stream — a parallel fan-out appears as one transcript group
//! but N active graph nodes — so neither is derived from the other.

pub mod layout;
pub mod router;
pub mod rungraph;
pub mod transcript;

pub use layout::{LayeredLayout, LayoutEngine};
pub use router::EventRouter;
pub use rungraph::{RunEdge, RunGraphStore, RunNode, RunStats};
pub use transcript::{NewMessage, TranscriptStore};
