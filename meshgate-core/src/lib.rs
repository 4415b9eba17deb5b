//! Meshgate Core - Data Types
//!
//! Identifiers, capabilities, agent and task models, the protocol message
//! envelope, the error taxonomy, and the transport traits. Every other
//! Meshgate crate depends on this one. No I/O lives here.

pub mod agent;
pub mod capability;
pub mod error;
pub mod health;
pub mod identity;
pub mod message;
pub mod task;
pub mod transport;

pub use agent::*;
pub use capability::*;
pub use error::*;
pub use health::*;
pub use identity::*;
pub use message::*;
pub use task::*;
pub use transport::*;
