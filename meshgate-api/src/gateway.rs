//! Gateway - Accept Path and HTTP Surface
//!
//! Routes:
//! - `GET /ws` - agent WebSocket upgrade (subprotocol `mcp.v1`)
//! - `POST /api/v1/tasks` - submit a task (authenticated)
//! - `GET /api/v1/tasks`, `GET /api/v1/tasks/:id` - task snapshots (authenticated)
//! - `DELETE /api/v1/tasks/:id?reason=...` - cancel a task (authenticated)
//! - `GET /api/v1/agents` - registry listing (authenticated)
//! - `GET /health`, `GET /health/live` - health checks (public)
//! - `GET /metrics` - Prometheus exposition (public)

use axum::{
    extract::{rejection::JsonRejection, ws::WebSocketUpgrade, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use meshgate_agents::{AgentRegistry, AgentSummary, TaskCounts, TaskRouter};
use meshgate_core::{
    CapabilitySet, CloseReason, HealthCheck, HealthReport, HealthStatus, MeshError, Principal,
    Task, TaskId, TaskRequest,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{authenticate, SharedAuthenticator};
use crate::codec::WireCodec;
use crate::config::{GatewayConfig, SUBPROTOCOL};
use crate::error::{ApiError, ApiResult};
use crate::session::{handshake, ConnectionSession};
use crate::telemetry::{metrics, metrics::render, observability_middleware};
use crate::transport;

// ============================================================================
// STATE
// ============================================================================

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<AgentRegistry>,
    pub router: TaskRouter,
    pub authenticator: SharedAuthenticator,
    connections: Arc<AtomicUsize>,
    started_at: Instant,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        registry: Arc<AgentRegistry>,
        router: TaskRouter,
        authenticator: SharedAuthenticator,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            router,
            authenticator,
            connections: Arc::new(AtomicUsize::new(0)),
            started_at: Instant::now(),
        }
    }

    /// Currently upgraded (or upgrading) connections.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// Reserve a connection slot, or `None` at capacity.
    fn acquire_slot(&self) -> Option<ConnectionSlot> {
        let previous = self.connections.fetch_add(1, Ordering::AcqRel);
        if previous >= self.config.max_connections {
            self.connections.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(ConnectionSlot {
            counter: Arc::clone(&self.connections),
        })
    }

    fn refresh_gauges(&self) {
        if let Some(metrics) = metrics() {
            metrics.set_registered_agents(self.registry.len());
        }
    }
}

/// Releases its connection slot on drop, including when an upgrade never
/// completes.
struct ConnectionSlot {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

// ============================================================================
// GATEWAY
// ============================================================================

/// The assembled gateway: state plus the axum app built on it.
#[derive(Clone)]
pub struct Gateway {
    state: AppState,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        registry: Arc<AgentRegistry>,
        router: TaskRouter,
        authenticator: SharedAuthenticator,
    ) -> Self {
        Self {
            state: AppState::new(config, registry, router, authenticator),
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Submit a task from inside the process.
    pub fn submit_task(&self, request: TaskRequest) -> TaskId {
        self.state.router.submit(request)
    }

    /// Build the axum application.
    pub fn app(&self) -> Router {
        let api_routes = Router::new()
            .route("/tasks", post(submit_task).get(list_tasks))
            .route("/tasks/:task_id", get(get_task).delete(cancel_task))
            .route("/agents", get(list_agents))
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                require_auth,
            ));

        Router::new()
            .route("/ws", get(ws_handler))
            .nest("/api/v1", api_routes)
            .route("/health", get(health))
            .route("/health/live", get(live))
            .route("/metrics", get(metrics_route))
            .with_state(self.state.clone())
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(build_cors_layer(&self.state.config))
                    .layer(middleware::from_fn(observability_middleware)),
            )
    }

    /// Prune old terminal tasks and refresh gauges every
    /// `maintenance_interval`.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(state.config.maintenance_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let pruned = state.router.prune_terminal(state.config.task_retention);
                if pruned > 0 {
                    tracing::debug!(pruned, "Pruned terminal tasks");
                }
                state.refresh_gauges();
            }
        })
    }

    /// Serve until `shutdown` resolves, then close every agent session.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> ApiResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let maintenance = self.spawn_maintenance();
        let registry = Arc::clone(&self.state.registry);
        let close_sessions = async move {
            shutdown.await;
            tracing::info!("Shutdown signal received, closing agent sessions");
            for agent in registry.list() {
                agent.link.close(CloseReason::going_away());
            }
        };

        let result = axum::serve(listener, self.app())
            .with_graceful_shutdown(close_sessions)
            .await
            .map_err(|e| ApiError::internal_error(format!("Server error: {}", e)));
        maintenance.abort();
        result
    }
}

/// Build the CORS layer. No configured origins allows any origin.
fn build_cors_layer(config: &GatewayConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static("x-api-key"),
        ])
        .max_age(Duration::from_secs(3600));

    if config.cors_origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        cors.allow_origin(origins)
    }
}

// ============================================================================
// AUTH MIDDLEWARE
// ============================================================================

/// Authenticate the request and stash the [`Principal`] in its extensions.
async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let principal = authenticate(state.authenticator.as_ref(), request.headers()).await?;
    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

// ============================================================================
// WEBSOCKET UPGRADE
// ============================================================================

fn reject(reason: &str, error: ApiError) -> Response {
    if let Some(metrics) = metrics() {
        metrics.record_rejection(reason);
    }
    tracing::debug!(reason, error = %error, "Upgrade rejected");
    error.into_response()
}

/// `GET /ws`: handshake, capacity check, upgrade, spawn the session.
async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let handshake = match handshake(&state.config, state.authenticator.as_ref(), &headers).await
    {
        Ok(handshake) => handshake,
        Err(MeshError::Protocol(_)) => {
            return reject("subprotocol", ApiError::upgrade_required(SUBPROTOCOL))
        }
        Err(e) => return reject("unauthorized", ApiError::from(e)),
    };

    let Some(slot) = state.acquire_slot() else {
        return reject(
            "capacity",
            ApiError::service_unavailable("Connection limit reached"),
        );
    };

    let Some(ws) = ws else {
        return reject(
            "not_websocket",
            ApiError::invalid_input("Expected a WebSocket upgrade request"),
        );
    };

    let codec = WireCodec::new(state.config.codec_config(), handshake.binary);
    let session = ConnectionSession::new(
        &handshake,
        codec,
        state.config.session_config(),
        Arc::clone(&state.registry),
        state.router.clone(),
    );
    tracing::debug!(
        agent_id = %handshake.agent_id,
        connection_id = %session.connection_id(),
        binary = handshake.binary,
        "Upgrading connection"
    );

    let registry = Arc::clone(&state.registry);
    ws.protocols([SUBPROTOCOL])
        .max_message_size(state.config.max_message_size)
        .on_failed_upgrade(|e| tracing::warn!(error = %e, "WebSocket upgrade failed"))
        .on_upgrade(move |socket| async move {
            let _slot = slot;
            if let Some(metrics) = metrics() {
                metrics.ws_connected();
            }
            let (sink, stream) = transport::split(socket);
            session.run(sink, stream).await;
            if let Some(metrics) = metrics() {
                metrics.ws_disconnected();
                metrics.set_registered_agents(registry.len());
            }
        })
}

// ============================================================================
// TASK ROUTES
// ============================================================================

/// Body of `POST /api/v1/tasks`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubmitTaskBody {
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Dispatch deadline override in milliseconds
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl SubmitTaskBody {
    fn into_request(self) -> ApiResult<TaskRequest> {
        let required = CapabilitySet::from_tags(&self.required_capabilities)
            .map_err(|e| ApiError::invalid_input(e.to_string()))?;
        let request = TaskRequest::new(required, self.payload);
        Ok(match self.deadline_ms {
            Some(0) => return Err(ApiError::invalid_input("deadline_ms must be positive")),
            Some(ms) => request.with_deadline(Duration::from_millis(ms)),
            None => request,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAccepted {
    pub task_id: TaskId,
}

async fn submit_task(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    body: Result<Json<SubmitTaskBody>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(body) = body.map_err(|e| ApiError::invalid_input(e.body_text()))?;
    let request = body.into_request()?;
    let task_id = state.router.submit(request);
    tracing::info!(task_id = %task_id, principal = ?principal, "Task submitted over HTTP");
    Ok((StatusCode::ACCEPTED, Json(TaskAccepted { task_id })))
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<Task>> {
    let id: TaskId = task_id
        .parse()
        .map_err(|_| ApiError::invalid_input(format!("Invalid task id: {}", task_id)))?;
    state
        .router
        .get(id)
        .map(Json)
        .ok_or_else(|| ApiError::task_not_found(id))
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelParams {
    #[serde(default)]
    pub reason: Option<String>,
}

async fn cancel_task(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(task_id): Path<String>,
    Query(params): Query<CancelParams>,
) -> ApiResult<Json<Task>> {
    let id: TaskId = task_id
        .parse()
        .map_err(|_| ApiError::invalid_input(format!("Invalid task id: {}", task_id)))?;
    let reason = params
        .reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "cancelled by client".to_string());
    let task = state.router.cancel(id, reason).await?;
    tracing::info!(task_id = %id, principal = ?principal, "Task cancelled over HTTP");
    Ok(Json(task))
}

async fn list_tasks(State(state): State<AppState>) -> Json<Vec<Task>> {
    Json(state.router.list())
}

async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentSummary>> {
    Json(state.registry.list().iter().map(|a| a.summary()).collect())
}

// ============================================================================
// HEALTH AND METRICS
// ============================================================================

fn health_report(state: &AppState) -> HealthReport {
    let agents = state.registry.len();
    let connections = state.connections();
    let TaskCounts {
        pending,
        dispatched,
        ..
    } = state.router.counts();

    // Degraded once 90% of the connection budget is in use.
    let near_capacity = connections * 10 >= state.config.max_connections * 9;
    let gateway = if near_capacity {
        HealthCheck::degraded("gateway", "near connection limit")
    } else {
        HealthCheck::healthy("gateway")
    }
    .with_metadata("connections", json!(connections))
    .with_metadata("max_connections", json!(state.config.max_connections))
    .with_metadata("uptime_seconds", json!(state.started_at.elapsed().as_secs()));

    let checks = vec![
        gateway,
        HealthCheck::healthy("registry").with_metadata("agents", json!(agents)),
        HealthCheck::healthy("router")
            .with_metadata("pending", json!(pending))
            .with_metadata("dispatched", json!(dispatched)),
    ];

    HealthReport {
        status: HealthReport::overall(&checks),
        version: env!("CARGO_PKG_VERSION").to_string(),
        agents,
        connections,
        pending_tasks: pending,
        checks,
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let report = health_report(&state);
    let status = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };
    (status, Json(report))
}

async fn live() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn metrics_route(State(state): State<AppState>) -> impl IntoResponse {
    state.refresh_gauges();
    render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthConfig, JwtApiKeyAuthenticator};
    use axum::body::{to_bytes, Body};
    use meshgate_agents::DispatchConfig;
    use meshgate_core::TaskState;
    use tower::ServiceExt;

    const API_KEY: &str = "test-key-0001";

    fn gateway_with(config: GatewayConfig) -> Gateway {
        let registry = Arc::new(AgentRegistry::new());
        let router = TaskRouter::new(Arc::clone(&registry), DispatchConfig::default());
        let mut auth = AuthConfig::default();
        auth.add_api_key(API_KEY.to_string());
        Gateway::new(
            config,
            registry,
            router,
            Arc::new(JwtApiKeyAuthenticator::new(auth)),
        )
    }

    fn gateway() -> Gateway {
        gateway_with(GatewayConfig::default())
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    fn ws_request() -> axum::http::request::Builder {
        Request::builder()
            .uri("/ws")
            .header(header::CONNECTION, "upgrade")
            .header(header::UPGRADE, "websocket")
            .header(header::SEC_WEBSOCKET_VERSION, "13")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
    }

    #[tokio::test]
    async fn test_upgrade_without_subprotocol_is_426() {
        let app = gateway().app();
        let response = app
            .oneshot(
                ws_request()
                    .header("x-api-key", API_KEY)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("infallible");

        assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
        let body = body_json(response).await;
        assert_eq!(body["code"], "UPGRADE_REQUIRED");
        assert_eq!(body["details"]["required_subprotocol"], "mcp.v1");
    }

    #[tokio::test]
    async fn test_upgrade_with_bad_credentials_is_401() {
        let gateway = gateway();
        let response = gateway
            .app()
            .oneshot(
                ws_request()
                    .header(header::SEC_WEBSOCKET_PROTOCOL, "mcp.v1")
                    .header("x-api-key", "nope")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("infallible");

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(gateway.state().registry.is_empty());
    }

    #[tokio::test]
    async fn test_upgrade_at_capacity_is_503() {
        let gateway = gateway_with(GatewayConfig {
            max_connections: 1,
            ..GatewayConfig::default()
        });
        let _held = gateway.state().acquire_slot().expect("first slot");

        let response = gateway
            .app()
            .oneshot(
                ws_request()
                    .header(header::SEC_WEBSOCKET_PROTOCOL, "mcp.v1")
                    .header("x-api-key", API_KEY)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("infallible");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(gateway.state().connections(), 1);
    }

    #[test]
    fn test_connection_slot_released_on_drop() {
        let gateway = gateway_with(GatewayConfig {
            max_connections: 1,
            ..GatewayConfig::default()
        });
        let slot = gateway.state().acquire_slot();
        assert!(slot.is_some());
        assert!(gateway.state().acquire_slot().is_none());
        drop(slot);
        assert_eq!(gateway.state().connections(), 0);
        assert!(gateway.state().acquire_slot().is_some());
    }

    #[tokio::test]
    async fn test_task_routes_require_auth() {
        let response = gateway()
            .app()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/v1/tasks")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"required_capabilities":["x"]}"#))
                    .expect("request"),
            )
            .await
            .expect("infallible");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_submit_and_fetch_task() {
        let gateway = gateway();
        let response = gateway
            .app()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/v1/tasks")
                    .header(header::CONTENT_TYPE, "application/json")
                    .header("x-api-key", API_KEY)
                    .body(Body::from(
                        r#"{"required_capabilities":["security_scan"],"payload":{"repo":"x"},"deadline_ms":60000}"#,
                    ))
                    .expect("request"),
            )
            .await
            .expect("infallible");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        let task_id = body["task_id"].as_str().expect("task id").to_string();

        let response = gateway
            .app()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/tasks/{}", task_id))
                    .header("x-api-key", API_KEY)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("infallible");
        assert_eq!(response.status(), StatusCode::OK);
        let task: Task = serde_json::from_value(body_json(response).await).expect("task");
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.payload, json!({ "repo": "x" }));
    }

    #[tokio::test]
    async fn test_unknown_task_is_404() {
        let response = gateway()
            .app()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/tasks/{}", TaskId::new()))
                    .header("x-api-key", API_KEY)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("infallible");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "TASK_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_cancel_task_over_http() {
        let gateway = gateway();
        let task_id = gateway.submit_task(TaskRequest::new(
            CapabilitySet::from_tags(["security_scan"]).expect("caps"),
            json!({}),
        ));
        let cancel = || {
            Request::builder()
                .method(Method::DELETE)
                .uri(format!("/api/v1/tasks/{}?reason=operator", task_id))
                .header("x-api-key", API_KEY)
                .body(Body::empty())
                .expect("request")
        };

        let response = gateway.app().oneshot(cancel()).await.expect("infallible");
        assert_eq!(response.status(), StatusCode::OK);
        let task: Task = serde_json::from_value(body_json(response).await).expect("task");
        assert_eq!(task.state, TaskState::Cancelled);
        assert_eq!(task.error.as_deref(), Some("operator"));
        assert_eq!(
            gateway.state().router.get(task_id).map(|t| t.state),
            Some(TaskState::Cancelled)
        );

        let response = gateway.app().oneshot(cancel()).await.expect("infallible");
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["code"], "TASK_ALREADY_FINISHED");
    }

    #[tokio::test]
    async fn test_cancel_unknown_or_unauthenticated() {
        let gateway = gateway();
        let response = gateway
            .app()
            .oneshot(
                Request::builder()
                    .method(Method::DELETE)
                    .uri(format!("/api/v1/tasks/{}", TaskId::new()))
                    .header("x-api-key", API_KEY)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("infallible");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = gateway
            .app()
            .oneshot(
                Request::builder()
                    .method(Method::DELETE)
                    .uri("/api/v1/tasks/not-a-task")
                    .header("x-api-key", API_KEY)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("infallible");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let task_id = gateway.submit_task(TaskRequest::new(
            CapabilitySet::from_tags(["x"]).expect("caps"),
            json!({}),
        ));
        let response = gateway
            .app()
            .oneshot(
                Request::builder()
                    .method(Method::DELETE)
                    .uri(format!("/api/v1/tasks/{}", task_id))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("infallible");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            gateway.state().router.get(task_id).map(|t| t.state),
            Some(TaskState::Pending)
        );
    }

    #[tokio::test]
    async fn test_invalid_submit_body_is_400() {
        for body in [r#"{"payload":{}}"#, r#"{"required_capabilities":[""]}"#] {
            let response = gateway()
                .app()
                .oneshot(
                    Request::builder()
                        .method(Method::POST)
                        .uri("/api/v1/tasks")
                        .header(header::CONTENT_TYPE, "application/json")
                        .header("x-api-key", API_KEY)
                        .body(Body::from(body))
                        .expect("request"),
                )
                .await
                .expect("infallible");
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
        }
    }

    #[tokio::test]
    async fn test_health_reports_counts() {
        let gateway = gateway();
        let response = gateway
            .app()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("infallible");
        assert_eq!(response.status(), StatusCode::OK);
        let report: HealthReport =
            serde_json::from_value(body_json(response).await).expect("report");
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.agents, 0);
        assert_eq!(report.connections, 0);
    }

    #[tokio::test]
    async fn test_metrics_route_serves_text() {
        let response = gateway()
            .app()
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("infallible");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let text = String::from_utf8(bytes.to_vec()).expect("utf-8");
        assert!(text.contains("meshgate_agents_registered"));
    }
}
