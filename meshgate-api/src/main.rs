//! Meshgate Server Entry Point
//!
//! Loads configuration from the environment, wires the registry, router and
//! authenticator together, and serves the gateway until Ctrl-C.

use std::sync::Arc;

use meshgate_agents::{
    AgentRegistry, DispatchConfig, FanoutSink, SharedEventSink, TaskRouter, TracingSink,
};
use meshgate_api::telemetry::{init_tracing, MetricsSink, TelemetryConfig};
use meshgate_api::{
    ApiError, ApiResult, AuthConfig, Gateway, GatewayConfig, JwtApiKeyAuthenticator,
};

#[tokio::main]
async fn main() -> ApiResult<()> {
    let telemetry_config = TelemetryConfig::default();
    init_tracing(&telemetry_config)?;

    let gateway_config = GatewayConfig::from_env()?;
    let dispatch_config = DispatchConfig::from_env()?;
    let auth_config = AuthConfig::from_env();
    auth_config.validate_for_production()?;

    let mut events = FanoutSink::new().with(Arc::new(TracingSink));
    if telemetry_config.metrics_enabled {
        events = events.with(Arc::new(MetricsSink));
    }
    let events: SharedEventSink = Arc::new(events);

    let registry = Arc::new(AgentRegistry::with_events(Arc::clone(&events)));
    let router = TaskRouter::with_events(Arc::clone(&registry), dispatch_config, events);
    let authenticator = Arc::new(JwtApiKeyAuthenticator::new(auth_config));

    let addr = gateway_config.bind_addr()?;
    let gateway = Gateway::new(gateway_config, registry, router, authenticator);

    tracing::info!(%addr, "Starting Meshgate gateway");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    gateway
        .serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    tracing::info!("Meshgate gateway stopped");
    Ok(())
}
