//! Shared helpers for gateway integration tests: an in-process server on an
//! ephemeral port and a small agent client over tokio-tungstenite.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use meshgate_agents::{AgentRegistry, DispatchConfig, TaskRouter};
use meshgate_api::codec::decode_binary;
use meshgate_api::{generate_jwt_token, AuthConfig, Gateway, GatewayConfig, JwtApiKeyAuthenticator};
use meshgate_core::{AgentId, Message};
use meshgate_test_utils::register_message;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub const API_KEY: &str = "integration-test-key";

/// Upper bound on any single wait in these tests.
pub const STEP: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub addr: SocketAddr,
    pub gateway: Gateway,
    pub auth: AuthConfig,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(GatewayConfig::default(), DispatchConfig::default()).await
    }

    pub async fn start_with(config: GatewayConfig, dispatch: DispatchConfig) -> Self {
        let registry = Arc::new(AgentRegistry::new());
        let router = TaskRouter::new(Arc::clone(&registry), dispatch);
        let mut auth = AuthConfig::default();
        auth.add_api_key(API_KEY.to_string());
        let gateway = Gateway::new(
            config,
            registry,
            router,
            Arc::new(JwtApiKeyAuthenticator::new(auth.clone())),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (tx, rx) = oneshot::channel();
        let server = gateway.clone();
        tokio::spawn(async move {
            let _ = server
                .serve(listener, async {
                    let _ = rx.await;
                })
                .await;
        });

        Self {
            addr,
            gateway,
            auth,
            shutdown: Some(tx),
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn token_for(&self, user_id: &str) -> String {
        generate_jwt_token(&self.auth, user_id.to_string(), None, vec![]).expect("token")
    }

    /// Connect with the API key and `mcp.v1`.
    pub async fn connect(&self) -> AgentClient {
        self.connect_with(Some(("x-api-key", API_KEY.to_string())), Some("mcp.v1"))
            .await
            .expect("connect")
    }

    pub async fn connect_as(&self, user_id: &str) -> AgentClient {
        let bearer = format!("Bearer {}", self.token_for(user_id));
        self.connect_with(Some(("authorization", bearer)), Some("mcp.v1"))
            .await
            .expect("connect")
    }

    pub async fn connect_with(
        &self,
        credential: Option<(&'static str, String)>,
        protocols: Option<&str>,
    ) -> Result<AgentClient, tungstenite::Error> {
        let mut request = self.ws_url().into_client_request()?;
        if let Some((name, value)) = credential {
            request
                .headers_mut()
                .insert(name, HeaderValue::from_str(&value).expect("header value"));
        }
        if let Some(protocols) = protocols {
            request.headers_mut().insert(
                "sec-websocket-protocol",
                HeaderValue::from_str(protocols).expect("header value"),
            );
        }
        let (ws, _) = connect_async(request).await?;
        Ok(AgentClient { ws })
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Poll `condition` until it holds or [`STEP`] passes.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + STEP;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// HTTP status of a refused upgrade.
pub fn rejected_status(error: &tungstenite::Error) -> Option<u16> {
    match error {
        tungstenite::Error::Http(response) => Some(response.status().as_u16()),
        _ => None,
    }
}

pub struct AgentClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl AgentClient {
    pub async fn send(&mut self, message: &Message) {
        let text = serde_json::to_string(message).expect("serialize");
        self.ws
            .send(WsMessage::Text(text.into()))
            .await
            .expect("send");
    }

    /// Next protocol message, or `None` once the server closed.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            let next = tokio::time::timeout(STEP, self.ws.next())
                .await
                .expect("timed out waiting for a message")?;
            match next.ok()? {
                WsMessage::Text(text) => {
                    return Some(serde_json::from_str(text.as_str()).expect("valid JSON"))
                }
                WsMessage::Binary(bytes) => {
                    return Some(decode_binary(&bytes).expect("valid binary frame"))
                }
                WsMessage::Close(_) => return None,
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
            }
        }
    }

    /// Next data frame as received, without decoding.
    pub async fn recv_raw(&mut self) -> Option<WsMessage> {
        loop {
            let next = tokio::time::timeout(STEP, self.ws.next())
                .await
                .expect("timed out waiting for a frame")?;
            match next.ok()? {
                WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
                other => return Some(other),
            }
        }
    }

    /// Register and return the assigned agent id.
    pub async fn register(&mut self, name: &str, capabilities: &[&str]) -> AgentId {
        self.send(&register_message(name, capabilities)).await;
        match self.recv().await {
            Some(Message::AgentRegistered { agent_id, .. }) => agent_id,
            other => panic!("expected agent.registered, got {other:?}"),
        }
    }

    /// Read until the close frame and return its code.
    pub async fn recv_close(&mut self) -> Option<u16> {
        loop {
            let next = tokio::time::timeout(STEP, self.ws.next())
                .await
                .expect("timed out waiting for close")?;
            if let WsMessage::Close(frame) = next.ok()? {
                return frame.map(|f| u16::from(f.code));
            }
        }
    }
}
