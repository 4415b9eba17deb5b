//! Prometheus Metrics Definitions
//!
//! Defines the gateway's metrics and exposes them for the /metrics route.
//! Control-plane events reach the metric set through [`MetricsSink`].

use axum::{http::StatusCode, response::IntoResponse};
use meshgate_agents::{EventSink, MeshEvent};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram, register_histogram_vec, CounterVec,
    Encoder, Gauge, Histogram, HistogramVec, TextEncoder,
};

use crate::error::{ApiError, ApiResult};

/// HTTP request latency buckets (seconds)
const HTTP_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0,
];

/// Time from a task becoming Pending to its delivery (seconds)
const DISPATCH_LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.010, 0.050, 0.100, 0.500, 1.0, 5.0, 10.0, 30.0,
];

/// Global metrics instance - initialized once at startup
pub static METRICS: Lazy<ApiResult<MeshMetrics>> = Lazy::new(MeshMetrics::new);

/// The metric set, if registration succeeded.
pub fn metrics() -> Option<&'static MeshMetrics> {
    METRICS.as_ref().ok()
}

/// Container for all Meshgate metrics.
#[derive(Clone)]
pub struct MeshMetrics {
    /// Open WebSocket connections
    pub connections_open: Gauge,

    /// Agents in the registry
    pub agents_registered: Gauge,

    /// Frames through sessions - labels: direction, encoding
    pub frames_total: CounterVec,

    /// Upgrade attempts refused - labels: reason
    pub connection_rejections_total: CounterVec,

    /// Task lifecycle transitions - labels: outcome
    pub tasks_total: CounterVec,

    /// Pending-to-dispatched latency
    pub dispatch_latency_seconds: Histogram,

    /// HTTP request counter - labels: method, path, status
    pub http_requests_total: CounterVec,

    /// HTTP request duration histogram - labels: method, path
    pub http_request_duration_seconds: HistogramVec,
}

fn registration_failed(name: &str, e: prometheus::Error) -> ApiError {
    ApiError::internal_error(format!("Failed to register {}: {}", name, e))
}

impl MeshMetrics {
    /// Create and register all metrics with Prometheus.
    pub fn new() -> ApiResult<Self> {
        Ok(Self {
            connections_open: register_gauge!(
                "meshgate_connections_open",
                "Current number of open agent connections"
            )
            .map_err(|e| registration_failed("connections_open", e))?,

            agents_registered: register_gauge!(
                "meshgate_agents_registered",
                "Current number of registered agents"
            )
            .map_err(|e| registration_failed("agents_registered", e))?,

            frames_total: register_counter_vec!(
                "meshgate_frames_total",
                "Frames read from or written to agent connections",
                &["direction", "encoding"]
            )
            .map_err(|e| registration_failed("frames_total", e))?,

            connection_rejections_total: register_counter_vec!(
                "meshgate_connection_rejections_total",
                "Upgrade attempts refused before the WebSocket was established",
                &["reason"]
            )
            .map_err(|e| registration_failed("connection_rejections_total", e))?,

            tasks_total: register_counter_vec!(
                "meshgate_tasks_total",
                "Task lifecycle transitions",
                &["outcome"]
            )
            .map_err(|e| registration_failed("tasks_total", e))?,

            dispatch_latency_seconds: register_histogram!(
                "meshgate_dispatch_latency_seconds",
                "Time a task waited in Pending before delivery",
                DISPATCH_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| registration_failed("dispatch_latency_seconds", e))?,

            http_requests_total: register_counter_vec!(
                "meshgate_http_requests_total",
                "Total number of HTTP requests",
                &["method", "path", "status"]
            )
            .map_err(|e| registration_failed("http_requests_total", e))?,

            http_request_duration_seconds: register_histogram_vec!(
                "meshgate_http_request_duration_seconds",
                "HTTP request duration in seconds",
                &["method", "path"],
                HTTP_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| registration_failed("http_request_duration_seconds", e))?,
        })
    }

    pub fn ws_connected(&self) {
        self.connections_open.inc();
    }

    pub fn ws_disconnected(&self) {
        self.connections_open.dec();
    }

    pub fn set_registered_agents(&self, count: usize) {
        self.agents_registered.set(count as f64);
    }

    /// `direction` is `in` or `out`.
    pub fn record_frame(&self, direction: &str, encoding: &str) {
        self.frames_total
            .with_label_values(&[direction, encoding])
            .inc();
    }

    pub fn record_rejection(&self, reason: &str) {
        self.connection_rejections_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn record_task(&self, outcome: &str) {
        self.tasks_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_dispatch(&self, wait_ms: u64) {
        self.record_task("dispatched");
        self.dispatch_latency_seconds
            .observe(wait_ms as f64 / 1000.0);
    }

    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let status_str = status.to_string();
        self.http_requests_total
            .with_label_values(&[method, path, &status_str])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, path])
            .observe(duration_secs);
    }
}

// ============================================================================
// EVENT SINK
// ============================================================================

/// Feeds control-plane events into [`METRICS`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSink;

impl EventSink for MetricsSink {
    fn emit(&self, event: MeshEvent) {
        let Some(metrics) = metrics() else {
            return;
        };
        match event {
            MeshEvent::TaskSubmitted { .. } => metrics.record_task("submitted"),
            MeshEvent::TaskDispatched { wait_ms, .. } => metrics.record_dispatch(wait_ms),
            MeshEvent::DispatchFailed { .. } => metrics.record_task("dispatch_failed"),
            MeshEvent::TaskRequeued { .. } => metrics.record_task("requeued"),
            MeshEvent::TaskCompleted { .. } => metrics.record_task("completed"),
            MeshEvent::TaskFailed { .. } => metrics.record_task("failed"),
            MeshEvent::TaskExpired { .. } => metrics.record_task("expired"),
            MeshEvent::TaskCancelled { .. } => metrics.record_task("cancelled"),
            // Registry size is sampled, see `set_registered_agents`.
            MeshEvent::AgentRegistered { .. }
            | MeshEvent::AgentSuperseded { .. }
            | MeshEvent::AgentUnregistered { .. } => {}
        }
    }
}

// ============================================================================
// EXPOSITION
// ============================================================================

/// Render every registered metric in Prometheus text format.
pub fn render() -> (StatusCode, [(&'static str, &'static str); 1], Vec<u8>) {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

/// Handler for GET /metrics without gauge refresh.
pub async fn metrics_handler() -> impl IntoResponse {
    render()
}
