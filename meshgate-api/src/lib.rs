//! Meshgate API - WebSocket Gateway and HTTP Surface
//!
//! This crate accepts agent connections and exposes the control plane over
//! HTTP. Agents connect to `/ws` with the `mcp.v1` subprotocol, register
//! their capabilities and receive tasks; task sources submit work through
//! `/api/v1/tasks`.
//!
//! The registry and router live in `meshgate-agents`. This crate adds the
//! wire codec, authentication, per-connection sessions, and the axum app.

pub mod auth;
pub mod codec;
pub mod config;
pub mod error;
pub mod gateway;
pub mod session;
pub mod telemetry;
pub mod transport;

// Re-export commonly used types
pub use auth::{
    authenticate, generate_jwt_token, validate_jwt_token, AuthConfig, Authenticator, Claims,
    Credential, JwtApiKeyAuthenticator, SharedAuthenticator,
};
pub use codec::{CodecConfig, WireCodec};
pub use config::{GatewayConfig, BINARY_SUBPROTOCOL, SUBPROTOCOL};
pub use error::{ApiError, ApiResult};
pub use gateway::{AppState, Gateway, SubmitTaskBody, TaskAccepted};
pub use session::{handshake, ConnectionSession, Handshake, SessionConfig, SessionHandle};
