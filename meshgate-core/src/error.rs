//! Error types for Meshgate operations
//!
//! Every failure the control plane can observe lands in one of the enums
//! below. Each maps to a stable [`ErrorCode`] that travels on the wire in
//! `error` messages and in HTTP error bodies.

use crate::{AgentId, TaskId, TaskState};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// WIRE ERROR CODES
// ============================================================================

/// Stable error codes shared by the WebSocket protocol and the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Credentials missing or rejected
    Unauthorized,
    /// Upgrade attempted without the required subprotocol
    UpgradeRequired,
    /// Connection-fatal protocol misuse
    ProtocolViolation,
    /// A single frame could not be decoded
    InvalidFormat,
    /// Task traffic before `agent.register`
    NotRegistered,
    /// `agent.register` carried unusable fields
    InvalidRegistration,
    /// No `agent.register` within the grace period
    RegistrationTimeout,
    /// Connection went silent past the idle window
    HeartbeatTimeout,
    /// Inbound message budget exhausted
    RateLimited,
    /// Message kind not valid in this direction or state
    UnexpectedMessage,
    /// No connected agent satisfies the task's capabilities
    NoEligibleAgent,
    /// Unknown task identifier
    TaskNotFound,
    /// Task already reached a terminal state
    TaskAlreadyFinished,
    /// Server is at capacity or shutting down
    ServiceUnavailable,
    /// Anything else
    InternalError,
}

impl ErrorCode {
    /// HTTP status used when this code is surfaced over HTTP.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::Unauthorized => 401,
            ErrorCode::UpgradeRequired => 426,
            ErrorCode::ProtocolViolation
            | ErrorCode::InvalidFormat
            | ErrorCode::InvalidRegistration
            | ErrorCode::UnexpectedMessage => 400,
            ErrorCode::NotRegistered => 403,
            ErrorCode::RegistrationTimeout | ErrorCode::HeartbeatTimeout => 408,
            ErrorCode::RateLimited => 429,
            ErrorCode::NoEligibleAgent => 409,
            ErrorCode::TaskNotFound => 404,
            ErrorCode::TaskAlreadyFinished => 409,
            ErrorCode::ServiceUnavailable => 503,
            ErrorCode::InternalError => 500,
        }
    }

    /// Get a default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "Authentication required",
            ErrorCode::UpgradeRequired => "Subprotocol mcp.v1 is required",
            ErrorCode::ProtocolViolation => "Protocol violation",
            ErrorCode::InvalidFormat => "Malformed message",
            ErrorCode::NotRegistered => "Agent must register before exchanging tasks",
            ErrorCode::InvalidRegistration => "Registration rejected",
            ErrorCode::RegistrationTimeout => "Registration not received in time",
            ErrorCode::HeartbeatTimeout => "Connection idle for too long",
            ErrorCode::RateLimited => "Message rate limit exceeded",
            ErrorCode::UnexpectedMessage => "Unexpected message",
            ErrorCode::NoEligibleAgent => "No eligible agent",
            ErrorCode::TaskNotFound => "Task not found",
            ErrorCode::TaskAlreadyFinished => "Task already finished",
            ErrorCode::ServiceUnavailable => "Service temporarily unavailable",
            ErrorCode::InternalError => "Internal server error",
        }
    }

    /// The SCREAMING_SNAKE_CASE wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::UpgradeRequired => "UPGRADE_REQUIRED",
            ErrorCode::ProtocolViolation => "PROTOCOL_VIOLATION",
            ErrorCode::InvalidFormat => "INVALID_FORMAT",
            ErrorCode::NotRegistered => "NOT_REGISTERED",
            ErrorCode::InvalidRegistration => "INVALID_REGISTRATION",
            ErrorCode::RegistrationTimeout => "REGISTRATION_TIMEOUT",
            ErrorCode::HeartbeatTimeout => "HEARTBEAT_TIMEOUT",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::UnexpectedMessage => "UNEXPECTED_MESSAGE",
            ErrorCode::NoEligibleAgent => "NO_ELIGIBLE_AGENT",
            ErrorCode::TaskNotFound => "TASK_NOT_FOUND",
            ErrorCode::TaskAlreadyFinished => "TASK_ALREADY_FINISHED",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ERROR ENUMS
// ============================================================================

/// Connection-fatal protocol errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Required subprotocol {required} was not offered")]
    MissingSubprotocol { required: String },

    #[error("Binary frame received but binary encoding was not negotiated")]
    BinaryNotNegotiated,

    #[error("Message {kind} is not valid in session state {state}")]
    OutOfSequence { kind: String, state: String },
}

/// Authentication failures. Always fatal and always pre-registration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("No credentials supplied")]
    MissingCredentials,

    #[error("Invalid token: {reason}")]
    InvalidToken { reason: String },

    #[error("Token has expired")]
    TokenExpired,

    #[error("Unknown API key")]
    UnknownApiKey,

    #[error("Authentication rejected: {reason}")]
    Rejected { reason: String },
}

/// Errors scoped to a single frame. The session decides whether to continue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("Binary frame truncated: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("Unsupported binary frame version {version}")]
    UnsupportedVersion { version: u8 },

    #[error("Unknown binary frame flags {flags:#04x}")]
    UnknownFlags { flags: u8 },

    #[error("Unknown message kind code {code}")]
    UnknownKind { code: u8 },

    #[error("Frame header says {header} but payload is {payload}")]
    KindMismatch { header: String, payload: String },

    #[error("Frame of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    #[error("Malformed message: {reason}")]
    Malformed { reason: String },

    #[error("Failed to encode message: {reason}")]
    Encode { reason: String },
}

/// Task-level dispatch errors. Never close a connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("No eligible agent for task {task_id}")]
    NoEligibleAgent { task_id: TaskId },

    #[error("Sending task {task_id} to agent {agent_id} failed: {reason}")]
    SendFailed {
        task_id: TaskId,
        agent_id: AgentId,
        reason: String,
    },

    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: TaskId },

    #[error("Task {task_id} already finished as {state}")]
    AlreadyFinished { task_id: TaskId, state: TaskState },
}

/// Liveness failures. Fatal for the session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LivenessError {
    #[error("No inbound traffic for {idle_ms}ms")]
    IdleTimeout { idle_ms: u64 },

    #[error("No registration within {grace_ms}ms")]
    RegistrationTimeout { grace_ms: u64 },
}

/// Outbound send failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("Session is closed")]
    Closed,

    #[error("Session is draining")]
    Draining,

    #[error("Transport error: {reason}")]
    Transport { reason: String },
}

/// Inbound receive failures. Only `Format` is recoverable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecvError {
    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Liveness error: {0}")]
    Liveness(#[from] LivenessError),

    #[error("Connection closed")]
    Closed,

    #[error("Transport error: {reason}")]
    Transport { reason: String },
}

impl RecvError {
    /// Whether the session may keep reading after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RecvError::Format(_))
    }
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Illegal task state change.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Task {task_id} cannot move from {from} to {to}")]
pub struct TaskTransitionError {
    pub task_id: TaskId,
    pub from: TaskState,
    pub to: TaskState,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all Meshgate errors.
#[derive(Debug, Clone, Error)]
pub enum MeshError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Format error: {0}")]
    Format(#[from] FormatError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Liveness error: {0}")]
    Liveness(#[from] LivenessError),

    #[error("Send error: {0}")]
    Send(#[from] SendError),

    #[error("Receive error: {0}")]
    Recv(#[from] RecvError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Task transition error: {0}")]
    Transition(#[from] TaskTransitionError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for Meshgate operations.
pub type MeshResult<T> = Result<T, MeshError>;

// ============================================================================
// CODE MAPPING
// ============================================================================

impl ProtocolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::MissingSubprotocol { .. } => ErrorCode::UpgradeRequired,
            ProtocolError::BinaryNotNegotiated | ProtocolError::OutOfSequence { .. } => {
                ErrorCode::ProtocolViolation
            }
        }
    }
}

impl LivenessError {
    pub fn code(&self) -> ErrorCode {
        match self {
            LivenessError::IdleTimeout { .. } => ErrorCode::HeartbeatTimeout,
            LivenessError::RegistrationTimeout { .. } => ErrorCode::RegistrationTimeout,
        }
    }
}

impl DispatchError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DispatchError::NoEligibleAgent { .. } => ErrorCode::NoEligibleAgent,
            DispatchError::SendFailed { .. } => ErrorCode::InternalError,
            DispatchError::TaskNotFound { .. } => ErrorCode::TaskNotFound,
            DispatchError::AlreadyFinished { .. } => ErrorCode::TaskAlreadyFinished,
        }
    }
}

impl RecvError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RecvError::Format(_) => ErrorCode::InvalidFormat,
            RecvError::Protocol(e) => e.code(),
            RecvError::Liveness(e) => e.code(),
            RecvError::Closed | RecvError::Transport { .. } => ErrorCode::InternalError,
        }
    }
}

impl MeshError {
    /// The wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            MeshError::Protocol(e) => e.code(),
            MeshError::Auth(_) => ErrorCode::Unauthorized,
            MeshError::Format(_) => ErrorCode::InvalidFormat,
            MeshError::Dispatch(e) => e.code(),
            MeshError::Liveness(e) => e.code(),
            MeshError::Recv(e) => e.code(),
            MeshError::Validation(_) => ErrorCode::InvalidRegistration,
            MeshError::Send(_) | MeshError::Transition(_) | MeshError::Config(_) => {
                ErrorCode::InternalError
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
