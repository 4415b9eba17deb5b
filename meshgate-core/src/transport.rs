//! Transport seams
//!
//! The session logic never touches a concrete WebSocket. It reads and writes
//! [`Frame`]s through [`FrameStream`] / [`FrameSink`], and the registry and
//! router reach agents only through [`AgentLink`].

use crate::{AgentId, ConnectionId, Message, RecvError, SendError, SessionState};
use async_trait::async_trait;
use std::fmt;

// ============================================================================
// FRAMES
// ============================================================================

/// One transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    /// Transport-level ping/pong. Counts as traffic, carries no message.
    Control,
    Close { code: u16, reason: String },
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(s) => s.len(),
            Frame::Binary(b) => b.len(),
            Frame::Control => 0,
            Frame::Close { reason, .. } => reason.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Short label for logs and metrics.
    pub fn encoding(&self) -> &'static str {
        match self {
            Frame::Text(_) => "text",
            Frame::Binary(_) => "binary",
            Frame::Control => "control",
            Frame::Close { .. } => "close",
        }
    }
}

/// WebSocket close codes used by the gateway.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const POLICY: u16 = 1008;
    pub const TOO_BIG: u16 = 1009;
    pub const INTERNAL: u16 = 1011;
    pub const IDLE_TIMEOUT: u16 = 4000;
    pub const REGISTRATION_TIMEOUT: u16 = 4001;
    pub const SUPERSEDED: u16 = 4002;
}

/// Why a session is being closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal() -> Self {
        Self::new(close_code::NORMAL, "closed")
    }

    pub fn going_away() -> Self {
        Self::new(close_code::GOING_AWAY, "server shutting down")
    }

    pub fn timeout() -> Self {
        Self::new(close_code::IDLE_TIMEOUT, "timeout")
    }

    pub fn registration_timeout() -> Self {
        Self::new(close_code::REGISTRATION_TIMEOUT, "registration timeout")
    }

    pub fn superseded() -> Self {
        Self::new(close_code::SUPERSEDED, "superseded by a newer session")
    }

    pub fn protocol_violation(detail: impl Into<String>) -> Self {
        Self::new(close_code::POLICY, detail)
    }

    pub fn peer_closed() -> Self {
        Self::new(close_code::NORMAL, "peer closed")
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reason, self.code)
    }
}

// ============================================================================
// TRAITS
// ============================================================================

/// Write half of a transport.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), SendError>;

    /// Send a close frame and release the transport. Best effort.
    async fn close(&mut self, reason: &CloseReason) -> Result<(), SendError>;
}

/// Read half of a transport.
#[async_trait]
pub trait FrameStream: Send {
    /// Next frame, or `None` once the peer is gone.
    async fn next_frame(&mut self) -> Option<Result<Frame, RecvError>>;
}

/// Non-owning handle to a live agent session.
///
/// Held by the registry and used by the router to deliver tasks. The
/// session itself owns the transport.
#[async_trait]
pub trait AgentLink: Send + Sync + fmt::Debug {
    fn connection_id(&self) -> ConnectionId;

    fn agent_id(&self) -> Option<AgentId>;

    fn state(&self) -> SessionState;

    /// Queue a message for the session's writer.
    async fn send(&self, message: Message) -> Result<(), SendError>;

    /// Request the session to close. Idempotent, returns immediately.
    fn close(&self, reason: CloseReason);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_len_and_encoding() {
        assert_eq!(Frame::Text("abc".into()).len(), 3);
        assert_eq!(Frame::Binary(vec![1, 2]).encoding(), "binary");
        assert!(Frame::Control.is_empty());
    }

    #[test]
    fn test_close_reasons() {
        assert_eq!(CloseReason::timeout().reason, "timeout");
        assert_eq!(CloseReason::superseded().code, close_code::SUPERSEDED);
        assert!(CloseReason::normal().to_string().contains("1000"));
    }
}
