//! Connection Session
//!
//! One session per upgraded connection. The session owns the transport and
//! runs two tasks:
//! - a reader loop that decodes frames, enforces liveness and registration
//!   deadlines, rate-limits inbound messages and talks to the registry and
//!   router
//! - a single writer that encodes queued messages into whole frames, so
//!   frames are never interleaved
//!
//! The registry and router only ever see the [`SessionHandle`], which queues
//! messages for the writer and requests closes.

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use meshgate_agents::{AgentRegistry, TaskRouter};
use meshgate_core::{
    close_code, AgentId, AgentIdentity, AgentLink, AuthError, CloseReason, ConnectionId,
    ErrorCode, Frame, FrameSink, FrameStream, LivenessError, MeshError, Message, Principal,
    ProtocolError, RecvError, RegistrationRequest, SendError, SessionState, TaskId, TaskOutcome,
};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::auth::{authenticate, Authenticator};
use crate::codec::WireCodec;
use crate::config::{GatewayConfig, SUBPROTOCOL};
use crate::telemetry::metrics;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Per-session timing and buffering.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Time allowed between upgrade and `agent.register`
    pub registration_grace: Duration,
    /// Inbound silence tolerated before the session is closed
    pub idle_timeout: Duration,
    /// Upper bound on flushing queued writes during close
    pub flush_timeout: Duration,
    /// Outbound queue depth
    pub outbound_buffer: usize,
    pub rate_limit_per_minute: u32,
    pub rate_limit_burst: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            registration_grace: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            flush_timeout: Duration::from_secs(5),
            outbound_buffer: 256,
            rate_limit_per_minute: 1000,
            rate_limit_burst: 100,
        }
    }
}

// ============================================================================
// HANDSHAKE
// ============================================================================

/// Outcome of a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub principal: Principal,
    /// Identifier the agent will register under
    pub agent_id: AgentId,
    /// Whether binary framing was negotiated
    pub binary: bool,
}

impl Handshake {
    pub fn new(principal: Principal, binary: bool) -> Self {
        let agent_id = principal.resolve_agent_id();
        Self {
            principal,
            agent_id,
            binary,
        }
    }
}

/// Subprotocol tokens offered in `Sec-WebSocket-Protocol`, in order.
pub fn offered_subprotocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Validate the subprotocol offer and authenticate the caller.
///
/// The subprotocol is checked first so a client that cannot speak the
/// protocol is turned away without touching the authenticator.
pub async fn handshake(
    config: &GatewayConfig,
    authenticator: &dyn Authenticator,
    headers: &HeaderMap,
) -> Result<Handshake, MeshError> {
    let offered = offered_subprotocols(headers);
    if !offered.iter().any(|p| p == SUBPROTOCOL) {
        return Err(ProtocolError::MissingSubprotocol {
            required: SUBPROTOCOL.to_string(),
        }
        .into());
    }

    let principal = tokio::time::timeout(
        config.handshake_timeout,
        authenticate(authenticator, headers),
    )
    .await
    .map_err(|_| AuthError::Rejected {
        reason: "handshake timed out".to_string(),
    })??;

    let binary = config.negotiates_binary(offered.iter().map(String::as_str));
    Ok(Handshake::new(principal, binary))
}

// ============================================================================
// SESSION HANDLE
// ============================================================================

/// Shared handle to a running session. This is what the registry stores.
#[derive(Debug)]
pub struct SessionHandle {
    connection_id: ConnectionId,
    agent_id: Mutex<Option<AgentId>>,
    state: Mutex<SessionState>,
    outbound: mpsc::Sender<Message>,
    close_tx: watch::Sender<Option<CloseReason>>,
}

impl SessionHandle {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` if the lifecycle allows it.
    fn transition(&self, next: SessionState) -> bool {
        let mut state = self.lock_state();
        if !state.can_transition_to(next) {
            return false;
        }
        *state = next;
        true
    }

    /// Move to Registered unless a close is already under way. A session
    /// that is already registered may register again.
    fn mark_registered(&self, agent_id: AgentId) -> bool {
        let mut state = self.lock_state();
        if *state != SessionState::Registered
            && !state.can_transition_to(SessionState::Registered)
        {
            return false;
        }
        *state = SessionState::Registered;
        *self.agent_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(agent_id);
        true
    }

    fn is_registered(&self) -> bool {
        *self.lock_state() == SessionState::Registered
    }
}

#[async_trait]
impl AgentLink for SessionHandle {
    fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    fn agent_id(&self) -> Option<AgentId> {
        self.agent_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn state(&self) -> SessionState {
        *self.lock_state()
    }

    async fn send(&self, message: Message) -> Result<(), SendError> {
        match self.state() {
            SessionState::Draining => return Err(SendError::Draining),
            SessionState::Closed => return Err(SendError::Closed),
            _ => {}
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| SendError::Closed)
    }

    fn close(&self, reason: CloseReason) {
        if !self.transition(SessionState::Draining) {
            return;
        }
        debug!(connection_id = %self.connection_id, reason = %reason, "Session close requested");
        self.close_tx.send_replace(Some(reason));
    }
}

// ============================================================================
// CONNECTION SESSION
// ============================================================================

/// A session that has completed its handshake and is ready to run.
pub struct ConnectionSession {
    handle: Arc<SessionHandle>,
    outbound_rx: mpsc::Receiver<Message>,
    agent_id: AgentId,
    codec: WireCodec,
    config: SessionConfig,
    limiter: DefaultDirectRateLimiter,
    registry: Arc<AgentRegistry>,
    router: TaskRouter,
}

impl ConnectionSession {
    pub fn new(
        handshake: &Handshake,
        codec: WireCodec,
        config: SessionConfig,
        registry: Arc<AgentRegistry>,
        router: TaskRouter,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_buffer.max(1));
        let (close_tx, _) = watch::channel(None);
        let handle = Arc::new(SessionHandle {
            connection_id: ConnectionId::new(),
            agent_id: Mutex::new(None),
            state: Mutex::new(SessionState::Connecting),
            outbound,
            close_tx,
        });

        let per_minute = NonZeroU32::new(config.rate_limit_per_minute).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.rate_limit_burst).unwrap_or(NonZeroU32::MIN);
        let limiter = RateLimiter::direct(Quota::per_minute(per_minute).allow_burst(burst));

        Self {
            handle,
            outbound_rx,
            agent_id: handshake.agent_id.clone(),
            codec,
            config,
            limiter,
            registry,
            router,
        }
    }

    pub fn handle(&self) -> Arc<SessionHandle> {
        Arc::clone(&self.handle)
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.handle.connection_id
    }

    /// Run the session on its own task.
    pub fn spawn<S, R>(self, sink: S, stream: R) -> JoinHandle<()>
    where
        S: FrameSink + 'static,
        R: FrameStream + 'static,
    {
        tokio::spawn(self.run(sink, stream))
    }

    /// Drive the session until it closes, then unregister and hand its
    /// in-flight tasks back to the router.
    pub async fn run<S, R>(self, sink: S, mut stream: R)
    where
        S: FrameSink + 'static,
        R: FrameStream,
    {
        let Self {
            handle,
            outbound_rx,
            agent_id,
            codec,
            config,
            limiter,
            registry,
            router,
        } = self;
        // A close requested before the transport came up leaves the
        // session Draining, and the read loop exits at once.
        handle.transition(SessionState::Handshaking);
        info!(
            connection_id = %handle.connection_id,
            agent_id = %agent_id,
            binary = codec.binary_negotiated(),
            "Session started"
        );

        let writer = tokio::spawn(write_loop(
            sink,
            outbound_rx,
            Arc::clone(&handle),
            codec.clone(),
            config.flush_timeout,
        ));

        let mut reader = SessionReader {
            handle,
            agent_id,
            codec,
            config,
            limiter,
            registry,
            router,
        };
        reader.read_loop(&mut stream).await;
        reader.finish(writer).await;
    }
}

/// The read side of a running session.
struct SessionReader {
    handle: Arc<SessionHandle>,
    agent_id: AgentId,
    codec: WireCodec,
    config: SessionConfig,
    limiter: DefaultDirectRateLimiter,
    registry: Arc<AgentRegistry>,
    router: TaskRouter,
}

impl SessionReader {
    /// Wait for the writer, then release the agent's registry entry and tasks.
    async fn finish(&self, writer: JoinHandle<()>) {
        let connection_id = self.handle.connection_id;
        // Every exit path of the read loop has requested a close by now.
        let grace = self.config.flush_timeout + Duration::from_secs(1);
        let abort = writer.abort_handle();
        if tokio::time::timeout(grace, writer).await.is_err() {
            warn!(connection_id = %connection_id, "Writer did not finish, aborting");
            abort.abort();
        }
        // Every exit path of the read loop left the session Draining.
        if !self.handle.transition(SessionState::Closed) {
            warn!(connection_id = %connection_id, state = %self.handle.state(), "Session closed out of order");
        }

        if let Some(agent_id) = self.handle.agent_id() {
            let removed = self.registry.unregister_session(&agent_id, connection_id);
            let requeued = self.router.on_session_closed(&agent_id, connection_id);
            info!(
                connection_id = %connection_id,
                agent_id = %agent_id,
                removed,
                requeued,
                "Session closed"
            );
        } else {
            info!(connection_id = %connection_id, "Session closed before registration");
        }
    }

    async fn read_loop<R: FrameStream>(&mut self, stream: &mut R) {
        let mut close_rx = self.handle.close_tx.subscribe();
        let registration_deadline = Instant::now() + self.config.registration_grace;
        let mut idle_deadline = Instant::now() + self.config.idle_timeout;

        loop {
            let awaiting_registration = self.handle.state() == SessionState::Handshaking;

            tokio::select! {
                // Resolved inside the branch so the watch guard never lives
                // across the other arms' awaits.
                _ = async { let _ = close_rx.wait_for(Option::is_some).await; } => return,

                _ = sleep_until(idle_deadline) => {
                    let error = LivenessError::IdleTimeout {
                        idle_ms: self.config.idle_timeout.as_millis() as u64,
                    };
                    warn!(connection_id = %self.handle.connection_id, error = %error, "Closing idle session");
                    self.reply(Message::error_with(error.code(), error.to_string())).await;
                    self.handle.close(CloseReason::timeout());
                    return;
                }

                _ = sleep_until(registration_deadline), if awaiting_registration => {
                    let error = LivenessError::RegistrationTimeout {
                        grace_ms: self.config.registration_grace.as_millis() as u64,
                    };
                    warn!(connection_id = %self.handle.connection_id, error = %error, "Closing unregistered session");
                    self.reply(Message::error_with(error.code(), error.to_string())).await;
                    self.handle.close(CloseReason::registration_timeout());
                    return;
                }

                frame = stream.next_frame() => {
                    let frame = match frame {
                        None => {
                            self.handle.close(CloseReason::peer_closed());
                            return;
                        }
                        Some(Err(error)) if error.is_recoverable() => {
                            idle_deadline = Instant::now() + self.config.idle_timeout;
                            self.reply(Message::error_with(error.code(), error.to_string())).await;
                            continue;
                        }
                        Some(Err(error)) => {
                            warn!(connection_id = %self.handle.connection_id, error = %error, "Transport read failed");
                            self.handle.close(CloseReason::new(close_code::INTERNAL, "transport error"));
                            return;
                        }
                        Some(Ok(frame)) => frame,
                    };

                    idle_deadline = Instant::now() + self.config.idle_timeout;
                    if self.handle.is_registered() {
                        self.registry.touch(&self.agent_id);
                    }
                    if let Some(metrics) = metrics() {
                        metrics.record_frame("in", frame.encoding());
                    }

                    match frame {
                        Frame::Control => continue,
                        Frame::Close { code, .. } => {
                            debug!(connection_id = %self.handle.connection_id, code, "Peer sent close");
                            self.handle.close(CloseReason::peer_closed());
                            return;
                        }
                        data => {
                            if !self.on_frame(data).await {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Handle one data frame. Returns `false` when the session must end.
    async fn on_frame(&mut self, frame: Frame) -> bool {
        if self.limiter.check().is_err() {
            debug!(connection_id = %self.handle.connection_id, "Inbound message over rate limit");
            self.reply(Message::error(ErrorCode::RateLimited)).await;
            return true;
        }

        match self.codec.decode(&frame) {
            Ok(message) => {
                self.on_message(message).await;
                true
            }
            Err(error) if error.is_recoverable() => {
                debug!(connection_id = %self.handle.connection_id, error = %error, "Dropping undecodable frame");
                self.reply(Message::error_with(error.code(), error.to_string()))
                    .await;
                true
            }
            Err(error) => {
                self.fail(error).await;
                false
            }
        }
    }

    async fn fail(&self, error: RecvError) {
        warn!(connection_id = %self.handle.connection_id, error = %error, "Protocol violation");
        self.reply(Message::error_with(error.code(), error.to_string()))
            .await;
        self.handle
            .close(CloseReason::protocol_violation(error.to_string()));
    }

    async fn on_message(&mut self, message: Message) {
        if message.kind().is_task_bearing() && !self.handle.is_registered() {
            if let Some(task_id) = task_id_of(&message) {
                self.reply(not_registered(task_id)).await;
            }
            return;
        }

        match message {
            Message::AgentRegister {
                name,
                capabilities,
                metadata,
            } => self.on_register(&name, &capabilities, metadata).await,

            Message::TaskResult { task_id, result } => {
                self.on_outcome(task_id, TaskOutcome::Completed(result))
                    .await
            }

            Message::TaskFailed { task_id, error } => {
                self.on_outcome(task_id, TaskOutcome::Failed(error)).await
            }

            Message::Ping { timestamp } => self.reply(Message::pong_for(timestamp)).await,

            Message::Pong { .. } => {}

            message @ (Message::TaskExecute { .. }
            | Message::TaskCancel { .. }
            | Message::AgentRegistered { .. }) => {
                self.reply(Message::error_with(
                    ErrorCode::UnexpectedMessage,
                    format!("{} is not accepted from agents", message.kind()),
                ))
                .await
            }

            Message::Error { error, code, task_id } => {
                warn!(
                    connection_id = %self.handle.connection_id,
                    agent_id = %self.agent_id,
                    code = %code,
                    task_id = ?task_id,
                    error = %error,
                    "Agent reported an error"
                );
            }
        }
    }

    async fn on_register(
        &mut self,
        name: &str,
        capabilities: &[String],
        metadata: serde_json::Map<String, serde_json::Value>,
    ) {
        let request = match RegistrationRequest::parse(name, capabilities, metadata) {
            Ok(request) => request,
            Err(e) => {
                debug!(connection_id = %self.handle.connection_id, error = %e, "Registration rejected");
                self.reply(Message::error_with(
                    ErrorCode::InvalidRegistration,
                    e.to_string(),
                ))
                .await;
                return;
            }
        };

        let identity = AgentIdentity::new(self.agent_id.clone(), request);
        // Queued ahead of registration so it precedes any task.execute.
        self.reply(Message::registered(&identity, self.codec.encoding_info()))
            .await;

        if !self.handle.mark_registered(self.agent_id.clone()) {
            return;
        }
        info!(
            connection_id = %self.handle.connection_id,
            agent_id = %self.agent_id,
            name = %identity.name,
            capabilities = ?identity.capabilities.to_vec(),
            "Agent registered"
        );
        let link: Arc<dyn AgentLink> = self.handle.clone();
        self.registry.register(identity, link);
    }

    async fn on_outcome(&self, task_id: TaskId, outcome: TaskOutcome) {
        match self.router.on_result(&self.agent_id, task_id, outcome) {
            Ok(true) => debug!(agent_id = %self.agent_id, task_id = %task_id, "Task outcome applied"),
            Ok(false) => {
                debug!(agent_id = %self.agent_id, task_id = %task_id, "Ignoring stale task outcome")
            }
            Err(e) => warn!(agent_id = %self.agent_id, task_id = %task_id, error = %e, "Outcome for unknown task"),
        }
    }

    /// Queue a message for the writer. A closing session drops it.
    async fn reply(&self, message: Message) {
        if let Err(e) = self.handle.send(message).await {
            debug!(connection_id = %self.handle.connection_id, error = %e, "Reply dropped");
        }
    }
}

fn task_id_of(message: &Message) -> Option<TaskId> {
    match message {
        Message::TaskExecute { task_id, .. }
        | Message::TaskResult { task_id, .. }
        | Message::TaskFailed { task_id, .. }
        | Message::TaskCancel { task_id, .. } => Some(*task_id),
        _ => None,
    }
}

fn not_registered(task_id: TaskId) -> Message {
    Message::Error {
        error: ErrorCode::NotRegistered.default_message().to_string(),
        code: ErrorCode::NotRegistered,
        task_id: Some(task_id),
    }
}

// ============================================================================
// WRITER
// ============================================================================

async fn write_message<S: FrameSink>(
    sink: &mut S,
    codec: &WireCodec,
    message: Message,
) -> Result<(), SendError> {
    let frame = match codec.encode(&message) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(kind = %message.kind(), error = %e, "Dropping unencodable message");
            return Ok(());
        }
    };
    let encoding = frame.encoding();
    sink.send_frame(frame).await?;
    if let Some(metrics) = metrics() {
        metrics.record_frame("out", encoding);
    }
    Ok(())
}

/// The only task that writes to the transport.
async fn write_loop<S: FrameSink>(
    mut sink: S,
    mut outbound: mpsc::Receiver<Message>,
    handle: Arc<SessionHandle>,
    codec: WireCodec,
    flush_timeout: Duration,
) {
    let mut close_rx = handle.close_tx.subscribe();

    let reason = loop {
        tokio::select! {
            biased;

            message = outbound.recv() => {
                let Some(message) = message else {
                    break CloseReason::normal();
                };
                if let Err(e) = write_message(&mut sink, &codec, message).await {
                    warn!(connection_id = %handle.connection_id, error = %e, "Transport write failed");
                    let reason = CloseReason::new(close_code::INTERNAL, "write failed");
                    handle.close(reason.clone());
                    break reason;
                }
            }

            requested = async {
                close_rx
                    .wait_for(Option::is_some)
                    .await
                    .ok()
                    .and_then(|reason| (*reason).clone())
            } => {
                break requested.unwrap_or_else(CloseReason::normal);
            }
        }
    };

    outbound.close();
    let flush = async {
        while let Some(message) = outbound.recv().await {
            if write_message(&mut sink, &codec, message).await.is_err() {
                break;
            }
        }
    };
    if tokio::time::timeout(flush_timeout, flush).await.is_err() {
        warn!(connection_id = %handle.connection_id, "Flush timed out, dropping queued messages");
    }

    if let Err(e) = sink.close(&reason).await {
        debug!(connection_id = %handle.connection_id, error = %e, "Close frame not delivered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_binary, CodecConfig};
    use axum::http::HeaderValue;
    use meshgate_agents::DispatchConfig;
    use meshgate_core::{FormatError, MessageKind, TaskState};
    use meshgate_test_utils::assertions::{assert_error_code, assert_registered};
    use meshgate_test_utils::memory::{pipe, MemoryPeer};
    use meshgate_test_utils::{register_message, task_request};
    use serde_json::json;

    struct Harness {
        registry: Arc<AgentRegistry>,
        router: TaskRouter,
    }

    impl Harness {
        fn new() -> Self {
            let registry = Arc::new(AgentRegistry::new());
            let router = TaskRouter::new(Arc::clone(&registry), DispatchConfig::default());
            Self { registry, router }
        }

        fn session(&self, user: &str, config: SessionConfig) -> ConnectionSession {
            let handshake = Handshake::new(
                Principal::User {
                    user_id: user.to_string(),
                    tenant_id: None,
                },
                false,
            );
            ConnectionSession::new(
                &handshake,
                WireCodec::text_only(CodecConfig::default()),
                config,
                Arc::clone(&self.registry),
                self.router.clone(),
            )
        }

        fn open(&self, user: &str, config: SessionConfig) -> (Arc<SessionHandle>, MemoryPeer, JoinHandle<()>) {
            let session = self.session(user, config);
            let handle = session.handle();
            let (sink, stream, peer) = pipe();
            let join = session.spawn(sink, stream);
            (handle, peer, join)
        }
    }

    async fn register(peer: &mut MemoryPeer, capabilities: &[&str]) -> AgentId {
        peer.send_message(&register_message("worker", capabilities));
        let reply = peer.recv_message().await.expect("registered reply");
        assert_registered(&reply)
    }

    #[test]
    fn test_offered_subprotocols_splits_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("mcp.v1, mcp.binary.v1"),
        );
        assert_eq!(offered_subprotocols(&headers), vec!["mcp.v1", "mcp.binary.v1"]);
        assert!(offered_subprotocols(&HeaderMap::new()).is_empty());
    }

    #[tokio::test]
    async fn test_handshake_requires_subprotocol() {
        let authenticator = crate::auth::JwtApiKeyAuthenticator::new({
            let mut config = crate::auth::AuthConfig::default();
            config.add_api_key("key-1".to_string());
            config
        });
        let config = GatewayConfig::default();

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("key-1"));
        let err = handshake(&config, &authenticator, &headers)
            .await
            .expect_err("no subprotocol offered");
        assert!(matches!(
            err,
            MeshError::Protocol(ProtocolError::MissingSubprotocol { .. })
        ));

        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("mcp.v1, mcp.binary.v1"),
        );
        let ok = handshake(&config, &authenticator, &headers)
            .await
            .expect("handshake succeeds");
        assert!(ok.binary);
        assert!(matches!(ok.principal, Principal::ApiKey { .. }));

        headers.insert("x-api-key", HeaderValue::from_static("wrong"));
        let err = handshake(&config, &authenticator, &headers)
            .await
            .expect_err("bad key");
        assert!(matches!(err, MeshError::Auth(AuthError::UnknownApiKey)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_reply_and_registry_entry() {
        let harness = Harness::new();
        let (handle, mut peer, _join) = harness.open("agent-1", SessionConfig::default());

        peer.send_message(&register_message("worker", &["code_analysis"]));
        let reply = peer.recv_message().await.expect("reply");
        match &reply {
            Message::AgentRegistered {
                agent_id,
                capabilities,
                encoding,
                ..
            } => {
                assert_eq!(agent_id.as_str(), "agent-1");
                assert_eq!(capabilities, &vec!["code_analysis".to_string()]);
                assert!(!encoding.binary);
            }
            other => panic!("expected agent.registered, got {other:?}"),
        }

        assert_eq!(handle.state(), SessionState::Registered);
        assert!(harness.registry.get(&AgentId::new("agent-1")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_traffic_before_registration_is_rejected() {
        let harness = Harness::new();
        let (handle, mut peer, _join) = harness.open("agent-1", SessionConfig::default());

        let task_id = TaskId::new();
        peer.send_message(&Message::TaskResult {
            task_id,
            result: json!({}),
        });
        let reply = peer.recv_message().await.expect("reply");
        assert_error_code(&reply, ErrorCode::NotRegistered);
        assert!(matches!(reply, Message::Error { task_id: Some(id), .. } if id == task_id));
        assert_eq!(handle.state(), SessionState::Handshaking);
        assert!(harness.registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_registration_keeps_waiting() {
        let harness = Harness::new();
        let (_handle, mut peer, _join) = harness.open("agent-1", SessionConfig::default());

        peer.send_json(&json!({ "type": "agent.register", "name": "worker", "capabilities": [] }));
        let reply = peer.recv_message().await.expect("reply");
        assert_error_code(&reply, ErrorCode::InvalidRegistration);

        let agent_id = register(&mut peer, &["code_analysis"]).await;
        assert_eq!(agent_id.as_str(), "agent-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_echoes_timestamp() {
        let harness = Harness::new();
        let (_handle, mut peer, _join) = harness.open("agent-1", SessionConfig::default());

        peer.send_message(&Message::Ping {
            timestamp: Some(1234),
        });
        assert_eq!(
            peer.recv_message().await,
            Some(Message::Pong { timestamp: 1234 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_timeout_closes_session() {
        let harness = Harness::new();
        let (handle, mut peer, join) = harness.open("agent-1", SessionConfig::default());

        let reply = peer.recv_message().await;
        assert!(matches!(
            reply,
            Some(Message::Error {
                code: ErrorCode::RegistrationTimeout,
                ..
            })
        ));
        let (code, _) = peer.recv_close().await.expect("close frame");
        assert_eq!(code, close_code::REGISTRATION_TIMEOUT);

        join.await.expect("session task");
        assert_eq!(handle.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_is_closed_and_removed() {
        let harness = Harness::new();
        let (_handle, mut peer, join) = harness.open("agent-1", SessionConfig::default());
        register(&mut peer, &["code_analysis"]).await;
        assert_eq!(harness.registry.len(), 1);

        // Agent goes silent; paused time advances to the idle deadline.
        let reply = peer.recv_message().await;
        assert!(matches!(
            reply,
            Some(Message::Error {
                code: ErrorCode::HeartbeatTimeout,
                ..
            })
        ));
        let (code, reason) = peer.recv_close().await.expect("close frame");
        assert_eq!(code, close_code::IDLE_TIMEOUT);
        assert_eq!(reason, "timeout");

        join.await.expect("session task");
        assert!(harness.registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_is_recoverable() {
        let harness = Harness::new();
        let (handle, mut peer, _join) = harness.open("agent-1", SessionConfig::default());

        peer.send_frame(Frame::Text("{not json".to_string()));
        let reply = peer.recv_message().await.expect("reply");
        assert_error_code(&reply, ErrorCode::InvalidFormat);

        peer.send_error(RecvError::Format(FormatError::Malformed {
            reason: "bad utf-8".to_string(),
        }));
        let reply = peer.recv_message().await.expect("reply");
        assert_error_code(&reply, ErrorCode::InvalidFormat);

        assert!(handle.state().is_open());
        register(&mut peer, &["code_analysis"]).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_binary_frame_without_negotiation_is_fatal() {
        let harness = Harness::new();
        let (_handle, mut peer, join) = harness.open("agent-1", SessionConfig::default());

        let bytes = encode_binary(MessageKind::Ping, br#"{"type":"ping"}"#).expect("encode");
        peer.send_frame(Frame::Binary(bytes));

        let reply = peer.recv_message().await.expect("reply");
        assert_error_code(&reply, ErrorCode::ProtocolViolation);
        let (code, _) = peer.recv_close().await.expect("close frame");
        assert_eq!(code, close_code::POLICY);
        join.await.expect("session task");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_drops_excess_messages() {
        let harness = Harness::new();
        let config = SessionConfig {
            rate_limit_per_minute: 1,
            rate_limit_burst: 2,
            ..SessionConfig::default()
        };
        let (handle, mut peer, _join) = harness.open("agent-1", config);

        for ts in 0..3 {
            peer.send_message(&Message::Ping { timestamp: Some(ts) });
        }
        assert_eq!(peer.recv_message().await, Some(Message::Pong { timestamp: 0 }));
        assert_eq!(peer.recv_message().await, Some(Message::Pong { timestamp: 1 }));
        let reply = peer.recv_message().await.expect("reply");
        assert_error_code(&reply, ErrorCode::RateLimited);
        assert!(handle.state().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatched_task_round_trip() {
        let harness = Harness::new();
        let (_handle, mut peer, _join) = harness.open("agent-1", SessionConfig::default());
        register(&mut peer, &["code_analysis"]).await;

        let task_id = harness
            .router
            .submit(task_request(&["code_analysis"], json!({ "file": "main.rs" })));
        match peer.recv_message().await {
            Some(Message::TaskExecute { task_id: id, content }) => {
                assert_eq!(id, task_id);
                assert_eq!(content, json!({ "file": "main.rs" }));
            }
            other => panic!("expected task.execute, got {other:?}"),
        }

        peer.send_message(&Message::TaskResult {
            task_id,
            result: json!({ "issues": 0 }),
        });
        let task = harness
            .router
            .wait_for_terminal(task_id, Duration::from_secs(5))
            .await
            .expect("task exists");
        assert_eq!(task.state, TaskState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_up_requeues_dispatched_task() {
        let harness = Harness::new();
        let (_handle, mut peer, join) = harness.open("agent-1", SessionConfig::default());
        register(&mut peer, &["code_analysis"]).await;

        let task_id = harness.router.submit(
            task_request(&["code_analysis"], json!({})).with_deadline(Duration::from_secs(3600)),
        );
        assert!(matches!(
            peer.recv_message().await,
            Some(Message::TaskExecute { .. })
        ));

        peer.hang_up();
        join.await.expect("session task");

        assert!(harness.registry.is_empty());
        let task = harness.router.get(task_id).expect("task exists");
        assert_eq!(task.state, TaskState::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_session_supersedes_older() {
        let harness = Harness::new();
        let (first, mut first_peer, first_join) =
            harness.open("agent-1", SessionConfig::default());
        register(&mut first_peer, &["code_analysis"]).await;

        let (second, mut second_peer, _second_join) =
            harness.open("agent-1", SessionConfig::default());
        register(&mut second_peer, &["code_analysis"]).await;

        let (code, _) = first_peer.recv_close().await.expect("close frame");
        assert_eq!(code, close_code::SUPERSEDED);
        first_join.await.expect("first session task");

        assert_eq!(first.state(), SessionState::Closed);
        let link = harness
            .registry
            .get_session(&AgentId::new("agent-1"))
            .expect("replacement stays registered");
        assert_eq!(link.connection_id(), second.connection_id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_after_close_fails() {
        let harness = Harness::new();
        let (handle, _peer, join) = harness.open("agent-1", SessionConfig::default());

        handle.close(CloseReason::normal());
        handle.close(CloseReason::going_away());
        assert_eq!(
            handle.send(Message::pong_for(Some(1))).await,
            Err(SendError::Draining)
        );

        join.await.expect("session task");
        assert_eq!(
            handle.send(Message::pong_for(Some(1))).await,
            Err(SendError::Closed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_before_transport_runs() {
        let harness = Harness::new();
        let session = harness.session("agent-1", SessionConfig::default());
        let handle = session.handle();
        assert_eq!(handle.state(), SessionState::Connecting);

        handle.close(CloseReason::going_away());
        assert_eq!(handle.state(), SessionState::Draining);
        assert!(!handle.mark_registered(AgentId::new("agent-1")));

        let (sink, stream, mut peer) = pipe();
        session.spawn(sink, stream).await.expect("session task");
        assert_eq!(handle.state(), SessionState::Closed);
        let (code, _) = peer.recv_close().await.expect("close frame");
        assert_eq!(code, close_code::GOING_AWAY);
        assert!(harness.registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_cannot_send_task_cancel() {
        let harness = Harness::new();
        let (_handle, mut peer, _join) = harness.open("agent-1", SessionConfig::default());
        let task_id = TaskId::new();
        let cancel = Message::TaskCancel {
            task_id,
            reason: "stop".to_string(),
        };

        peer.send_message(&cancel);
        let reply = peer.recv_message().await.expect("reply");
        assert_error_code(&reply, ErrorCode::NotRegistered);
        assert!(matches!(reply, Message::Error { task_id: Some(id), .. } if id == task_id));

        register(&mut peer, &["code_analysis"]).await;
        peer.send_message(&cancel);
        let reply = peer.recv_message().await.expect("reply");
        assert_error_code(&reply, ErrorCode::UnexpectedMessage);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_task_reaches_agent() {
        let harness = Harness::new();
        let (_handle, mut peer, _join) = harness.open("agent-1", SessionConfig::default());
        register(&mut peer, &["code_analysis"]).await;

        let task_id = harness
            .router
            .submit(task_request(&["code_analysis"], json!({})));
        assert!(matches!(
            peer.recv_message().await,
            Some(Message::TaskExecute { .. })
        ));

        harness
            .router
            .cancel(task_id, "operator withdrew it")
            .await
            .expect("cancel");
        assert_eq!(
            peer.recv_message().await,
            Some(Message::TaskCancel {
                task_id,
                reason: "operator withdrew it".to_string()
            })
        );

        // A result that crosses the cancel on the wire is ignored.
        peer.send_message(&Message::TaskResult {
            task_id,
            result: json!("late"),
        });
        peer.send_message(&Message::Ping { timestamp: Some(9) });
        assert_eq!(peer.recv_message().await, Some(Message::Pong { timestamp: 9 }));
        let task = harness.router.get(task_id).expect("task exists");
        assert_eq!(task.state, TaskState::Cancelled);
        assert_eq!(task.result, None);
    }
}
