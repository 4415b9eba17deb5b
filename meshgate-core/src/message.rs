//! Protocol message envelope
//!
//! Every frame carries exactly one [`Message`], discriminated by its `type`
//! field in JSON form and by a kind code in binary form.

use crate::{AgentId, AgentIdentity, ErrorCode, TaskId, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Negotiated encoding advertised to the agent in `agent.registered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodingInfo {
    pub binary: bool,
    /// Encoded size above which binary framing is used.
    pub threshold: usize,
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "agent.register")]
    AgentRegister {
        #[serde(default)]
        name: String,
        #[serde(default)]
        capabilities: Vec<String>,
        #[serde(default)]
        metadata: Map<String, Value>,
    },

    #[serde(rename = "agent.registered")]
    AgentRegistered {
        agent_id: AgentId,
        name: String,
        capabilities: Vec<String>,
        registered_at: Timestamp,
        encoding: EncodingInfo,
    },

    #[serde(rename = "task.execute")]
    TaskExecute { task_id: TaskId, content: Value },

    #[serde(rename = "task.result")]
    TaskResult {
        task_id: TaskId,
        #[serde(default)]
        result: Value,
    },

    #[serde(rename = "task.failed")]
    TaskFailed { task_id: TaskId, error: String },

    /// Gateway to agent: stop working on a task that was withdrawn.
    #[serde(rename = "task.cancel")]
    TaskCancel { task_id: TaskId, reason: String },

    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },

    #[serde(rename = "pong")]
    Pong { timestamp: i64 },

    #[serde(rename = "error")]
    Error {
        error: String,
        code: ErrorCode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task_id: Option<TaskId>,
    },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::AgentRegister { .. } => MessageKind::AgentRegister,
            Message::AgentRegistered { .. } => MessageKind::AgentRegistered,
            Message::TaskExecute { .. } => MessageKind::TaskExecute,
            Message::TaskResult { .. } => MessageKind::TaskResult,
            Message::TaskFailed { .. } => MessageKind::TaskFailed,
            Message::TaskCancel { .. } => MessageKind::TaskCancel,
            Message::Ping { .. } => MessageKind::Ping,
            Message::Pong { .. } => MessageKind::Pong,
            Message::Error { .. } => MessageKind::Error,
        }
    }

    /// `agent.registered` reply for a freshly registered identity.
    pub fn registered(identity: &AgentIdentity, encoding: EncodingInfo) -> Self {
        Message::AgentRegistered {
            agent_id: identity.agent_id.clone(),
            name: identity.name.clone(),
            capabilities: identity.capabilities.to_vec(),
            registered_at: identity.registered_at,
            encoding,
        }
    }

    /// Error reply using the code's default message.
    pub fn error(code: ErrorCode) -> Self {
        Message::error_with(code, code.default_message())
    }

    pub fn error_with(code: ErrorCode, error: impl Into<String>) -> Self {
        Message::Error {
            error: error.into(),
            code,
            task_id: None,
        }
    }

    /// Reply to a `ping`, echoing its timestamp when present.
    pub fn pong_for(ping_timestamp: Option<i64>) -> Self {
        Message::Pong {
            timestamp: ping_timestamp.unwrap_or_else(|| Utc::now().timestamp_millis()),
        }
    }
}

/// Message discriminator with a stable one-byte code for binary framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "agent.register")]
    AgentRegister,
    #[serde(rename = "agent.registered")]
    AgentRegistered,
    #[serde(rename = "task.execute")]
    TaskExecute,
    #[serde(rename = "task.result")]
    TaskResult,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "task.cancel")]
    TaskCancel,
}

impl MessageKind {
    pub const ALL: [MessageKind; 9] = [
        MessageKind::AgentRegister,
        MessageKind::AgentRegistered,
        MessageKind::TaskExecute,
        MessageKind::TaskResult,
        MessageKind::TaskFailed,
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::Error,
        MessageKind::TaskCancel,
    ];

    pub fn code(&self) -> u8 {
        match self {
            MessageKind::AgentRegister => 1,
            MessageKind::AgentRegistered => 2,
            MessageKind::TaskExecute => 3,
            MessageKind::TaskResult => 4,
            MessageKind::TaskFailed => 5,
            MessageKind::Ping => 6,
            MessageKind::Pong => 7,
            MessageKind::Error => 8,
            MessageKind::TaskCancel => 9,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.code() == code)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::AgentRegister => "agent.register",
            MessageKind::AgentRegistered => "agent.registered",
            MessageKind::TaskExecute => "task.execute",
            MessageKind::TaskResult => "task.result",
            MessageKind::TaskFailed => "task.failed",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::Error => "error",
            MessageKind::TaskCancel => "task.cancel",
        }
    }

    /// Kinds that require a registered session.
    pub fn is_task_bearing(&self) -> bool {
        matches!(
            self,
            MessageKind::TaskExecute
                | MessageKind::TaskResult
                | MessageKind::TaskFailed
                | MessageKind::TaskCancel
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown message kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageKindParseError(pub String);

impl fmt::Display for MessageKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown message kind: {}", self.0)
    }
}

impl std::error::Error for MessageKindParseError {}

impl FromStr for MessageKind {
    type Err = MessageKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s.trim())
            .ok_or_else(|| MessageKindParseError(s.to_string()))
    }
}
