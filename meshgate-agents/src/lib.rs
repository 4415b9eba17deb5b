//! Meshgate Agents - Registry and Routing
//!
//! Provides the two shared, concurrently accessed structures of the control
//! plane:
//! - [`AgentRegistry`]: who is connected and what they can do
//! - [`TaskRouter`]: which task goes where, and what happened to it
//!
//! Both are built once and handed around as `Arc`s / cheap clones.

pub mod config;
pub mod events;
pub mod registry;
pub mod router;

pub use config::{DispatchConfig, SelectionPolicy};
pub use events::{BroadcastSink, EventSink, FanoutSink, MeshEvent, SharedEventSink, TracingSink};
pub use registry::{AgentRegistry, AgentSnapshot, AgentSummary};
pub use router::{TaskCounts, TaskRouter};
