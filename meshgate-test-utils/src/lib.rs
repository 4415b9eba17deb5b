//! Meshgate Test Utilities
//!
//! Shared test infrastructure for the Meshgate workspace:
//! - Proptest generators for protocol types
//! - A recording mock [`AgentLink`]
//! - An in-memory frame transport for driving sessions without sockets
//! - Fixtures and assertions

pub use meshgate_core::{
    AgentId, AgentIdentity, AgentLink, Capability, CapabilitySet, CloseReason, ConnectionId,
    ErrorCode, Frame, FrameSink, FrameStream, Message, MessageKind, RecvError, SendError,
    SessionState, TaskId, TaskRequest,
};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

// ============================================================================
// MOCK LINK
// ============================================================================

/// An [`AgentLink`] that records what it is asked to do.
#[derive(Debug)]
pub struct MockLink {
    connection_id: ConnectionId,
    agent_id: Mutex<Option<AgentId>>,
    state: Mutex<SessionState>,
    sent: Mutex<Vec<Message>>,
    closes: Mutex<Vec<CloseReason>>,
    fail_sends: AtomicBool,
}

impl MockLink {
    pub fn new(state: SessionState) -> Arc<Self> {
        Arc::new(Self {
            connection_id: ConnectionId::new(),
            agent_id: Mutex::new(None),
            state: Mutex::new(state),
            sent: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        })
    }

    /// A link in the `Registered` state.
    pub fn registered() -> Arc<Self> {
        Self::new(SessionState::Registered)
    }

    pub fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn set_agent_id(&self, agent_id: AgentId) {
        *self.agent_id.lock().unwrap() = Some(agent_id);
    }

    /// Make every subsequent `send` fail.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    pub fn close_reasons(&self) -> Vec<CloseReason> {
        self.closes.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentLink for MockLink {
    fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    fn agent_id(&self) -> Option<AgentId> {
        self.agent_id.lock().unwrap().clone()
    }

    fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    async fn send(&self, message: Message) -> Result<(), SendError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SendError::Transport {
                reason: "mock send failure".to_string(),
            });
        }
        match self.state() {
            SessionState::Draining => Err(SendError::Draining),
            SessionState::Closed => Err(SendError::Closed),
            _ => {
                self.sent.lock().unwrap().push(message);
                Ok(())
            }
        }
    }

    fn close(&self, reason: CloseReason) {
        self.closes.lock().unwrap().push(reason);
        self.set_state(SessionState::Closed);
    }
}

// ============================================================================
// IN-MEMORY TRANSPORT
// ============================================================================

pub mod memory {
    //! Frame transport over tokio channels.
    //!
    //! [`pipe`] returns the server halves (to hand to a session) and a
    //! [`MemoryPeer`] playing the agent.

    use super::*;
    use tokio::sync::mpsc;

    pub struct MemorySink {
        tx: mpsc::UnboundedSender<Frame>,
    }

    #[async_trait]
    impl FrameSink for MemorySink {
        async fn send_frame(&mut self, frame: Frame) -> Result<(), SendError> {
            self.tx.send(frame).map_err(|_| SendError::Closed)
        }

        async fn close(&mut self, reason: &CloseReason) -> Result<(), SendError> {
            self.tx
                .send(Frame::Close {
                    code: reason.code,
                    reason: reason.reason.clone(),
                })
                .map_err(|_| SendError::Closed)
        }
    }

    pub struct MemoryStream {
        rx: mpsc::UnboundedReceiver<Result<Frame, RecvError>>,
    }

    #[async_trait]
    impl FrameStream for MemoryStream {
        async fn next_frame(&mut self) -> Option<Result<Frame, RecvError>> {
            self.rx.recv().await
        }
    }

    /// The agent's end of a [`pipe`].
    pub struct MemoryPeer {
        to_server: Option<mpsc::UnboundedSender<Result<Frame, RecvError>>>,
        from_server: mpsc::UnboundedReceiver<Frame>,
    }

    impl MemoryPeer {
        pub fn send_frame(&self, frame: Frame) {
            if let Some(tx) = &self.to_server {
                let _ = tx.send(Ok(frame));
            }
        }

        pub fn send_json(&self, value: &Value) {
            self.send_frame(Frame::Text(value.to_string()));
        }

        pub fn send_message(&self, message: &Message) {
            let text = serde_json::to_string(message).expect("message serializes");
            self.send_frame(Frame::Text(text));
        }

        /// Inject a transport error into the server's read side.
        pub fn send_error(&self, error: RecvError) {
            if let Some(tx) = &self.to_server {
                let _ = tx.send(Err(error));
            }
        }

        /// Drop the write side, as if the agent vanished.
        pub fn hang_up(&mut self) {
            self.to_server = None;
        }

        pub async fn recv_frame(&mut self) -> Option<Frame> {
            self.from_server.recv().await
        }

        /// Next application message, skipping control frames. `None` once
        /// the server closed or dropped the connection.
        pub async fn recv_message(&mut self) -> Option<Message> {
            loop {
                match self.from_server.recv().await? {
                    Frame::Text(text) => {
                        return Some(serde_json::from_str(&text).expect("server sent valid JSON"))
                    }
                    Frame::Binary(bytes) => {
                        // Skip the 8-byte header; the payload is the JSON message.
                        let payload = bytes.get(8..).expect("binary frame has header");
                        return Some(
                            serde_json::from_slice(payload).expect("binary payload is JSON"),
                        );
                    }
                    Frame::Control => continue,
                    Frame::Close { .. } => return None,
                }
            }
        }

        /// Drain frames until the server sends a close frame or hangs up.
        pub async fn recv_close(&mut self) -> Option<(u16, String)> {
            while let Some(frame) = self.from_server.recv().await {
                if let Frame::Close { code, reason } = frame {
                    return Some((code, reason));
                }
            }
            None
        }
    }

    pub fn pipe() -> (MemorySink, MemoryStream, MemoryPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            MemorySink { tx: out_tx },
            MemoryStream { rx: in_rx },
            MemoryPeer {
                to_server: Some(in_tx),
                from_server: out_rx,
            },
        )
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Meshgate protocol types.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_agent_id() -> impl Strategy<Value = AgentId> {
        "[a-z][a-z0-9-]{0,15}".prop_map(AgentId::new)
    }

    pub fn arb_task_id() -> impl Strategy<Value = TaskId> {
        any::<[u8; 16]>().prop_map(|b| TaskId::from_uuid(uuid::Uuid::from_bytes(b)))
    }

    pub fn arb_capability() -> impl Strategy<Value = Capability> {
        "[a-z_]{1,16}".prop_map(|s| Capability::parse(&s).expect("generated tag is valid"))
    }

    pub fn arb_capability_set() -> impl Strategy<Value = CapabilitySet> {
        proptest::collection::btree_set(arb_capability(), 0..5)
            .prop_map(|caps| caps.into_iter().collect())
    }

    /// Small JSON values, nested at most two levels.
    pub fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[ -~]{0,24}".prop_map(Value::from),
        ];
        leaf.prop_recursive(2, 16, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
                proptest::collection::btree_map("[a-z]{1,8}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    pub fn arb_error_code() -> impl Strategy<Value = ErrorCode> {
        prop_oneof![
            Just(ErrorCode::Unauthorized),
            Just(ErrorCode::InvalidFormat),
            Just(ErrorCode::NotRegistered),
            Just(ErrorCode::RateLimited),
            Just(ErrorCode::NoEligibleAgent),
            Just(ErrorCode::InternalError),
        ]
    }

    pub fn arb_message() -> impl Strategy<Value = Message> {
        prop_oneof![
            (
                "[a-z ]{1,16}",
                proptest::collection::vec("[a-z_]{1,12}", 0..4)
            )
                .prop_map(|(name, capabilities)| Message::AgentRegister {
                    name,
                    capabilities,
                    metadata: Map::new(),
                }),
            (arb_task_id(), arb_json())
                .prop_map(|(task_id, content)| Message::TaskExecute { task_id, content }),
            (arb_task_id(), arb_json())
                .prop_map(|(task_id, result)| Message::TaskResult { task_id, result }),
            (arb_task_id(), "[ -~]{0,32}")
                .prop_map(|(task_id, error)| Message::TaskFailed { task_id, error }),
            (arb_task_id(), "[ -~]{0,32}")
                .prop_map(|(task_id, reason)| Message::TaskCancel { task_id, reason }),
            proptest::option::of(any::<i64>()).prop_map(|timestamp| Message::Ping { timestamp }),
            any::<i64>().prop_map(|timestamp| Message::Pong { timestamp }),
            (arb_error_code(), "[ -~]{0,32}", proptest::option::of(arb_task_id())).prop_map(
                |(code, error, task_id)| Message::Error {
                    error,
                    code,
                    task_id,
                }
            ),
        ]
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built values for common scenarios.

    use super::*;

    /// A registered identity whose agent id is `agent_id`.
    pub fn identity(agent_id: &str, capabilities: &[&str]) -> AgentIdentity {
        AgentIdentity {
            agent_id: AgentId::new(agent_id),
            name: agent_id.to_string(),
            capabilities: CapabilitySet::from_tags(capabilities).expect("valid tags"),
            metadata: Map::new(),
            registered_at: Utc::now(),
        }
    }

    /// An `agent.register` message.
    pub fn register_message(name: &str, capabilities: &[&str]) -> Message {
        Message::AgentRegister {
            name: name.to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            metadata: Map::new(),
        }
    }

    pub fn task_request(capabilities: &[&str], payload: Value) -> TaskRequest {
        TaskRequest::new(
            CapabilitySet::from_tags(capabilities).expect("valid tags"),
            payload,
        )
    }
}

pub use fixtures::{identity, register_message, task_request};

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for protocol exchanges.

    use super::*;

    /// Assert that `message` is an `error` carrying `code`.
    #[track_caller]
    pub fn assert_error_code(message: &Message, code: ErrorCode) {
        match message {
            Message::Error { code: got, .. } => assert_eq!(*got, code),
            other => panic!("Expected error {}, got: {:?}", code, other),
        }
    }

    /// Assert that `message` is `agent.registered` and return the agent id.
    #[track_caller]
    pub fn assert_registered(message: &Message) -> AgentId {
        match message {
            Message::AgentRegistered { agent_id, .. } => agent_id.clone(),
            other => panic!("Expected agent.registered, got: {:?}", other),
        }
    }
}
