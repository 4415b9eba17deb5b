//! Gateway Configuration Module
//!
//! Configuration for the accept path, sessions, and HTTP surface. Values are
//! loaded from `MESHGATE_*` environment variables with defaults suitable for
//! development.

use crate::codec::CodecConfig;
use crate::session::SessionConfig;
use meshgate_core::{ConfigError, MessageKind};
use std::net::SocketAddr;
use std::time::Duration;

/// Subprotocol every agent must offer.
pub const SUBPROTOCOL: &str = "mcp.v1";

/// Additional subprotocol token an agent offers to opt into binary framing.
pub const BINARY_SUBPROTOCOL: &str = "mcp.binary.v1";

// ============================================================================
// GATEWAY CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    // ========================================================================
    // Listener
    // ========================================================================
    pub bind_host: String,
    pub port: u16,

    /// Allowed CORS origins for the HTTP routes. Empty allows any origin.
    pub cors_origins: Vec<String>,

    // ========================================================================
    // Encoding
    // ========================================================================
    /// Whether binary framing may be negotiated at all.
    pub binary_enabled: bool,

    /// Encoded size above which negotiated connections switch to binary.
    pub binary_threshold: usize,

    /// Kinds always sent binary on negotiated connections.
    pub binary_kinds: Vec<MessageKind>,

    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,

    // ========================================================================
    // Session timing
    // ========================================================================
    /// Bound on credential verification during the upgrade.
    pub handshake_timeout: Duration,

    /// Time allowed between upgrade and `agent.register`.
    pub registration_grace: Duration,

    /// Inbound silence tolerated before the session is closed.
    pub idle_timeout: Duration,

    /// Bound on flushing queued writes while closing.
    pub flush_timeout: Duration,

    // ========================================================================
    // Limits
    // ========================================================================
    pub max_connections: usize,

    /// Per-session outbound queue depth.
    pub outbound_buffer: usize,

    /// Inbound messages per minute per session.
    pub rate_limit_per_minute: u32,

    pub rate_limit_burst: u32,

    // ========================================================================
    // Maintenance
    // ========================================================================
    /// How long terminal tasks stay queryable.
    pub task_retention: Duration,

    pub maintenance_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: 8080,
            cors_origins: Vec::new(),

            binary_enabled: true,
            binary_threshold: 1024,
            binary_kinds: vec![MessageKind::TaskExecute, MessageKind::TaskResult],
            max_message_size: 1024 * 1024, // 1 MiB

            handshake_timeout: Duration::from_secs(10),
            registration_grace: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            flush_timeout: Duration::from_secs(5),

            max_connections: 10_000,
            outbound_buffer: 256,
            rate_limit_per_minute: 1000,
            rate_limit_burst: 100,

            task_retention: Duration::from_secs(3600),
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

impl GatewayConfig {
    /// Create GatewayConfig from environment variables.
    ///
    /// Environment variables:
    /// - `MESHGATE_BIND`: Bind host (default: 0.0.0.0)
    /// - `MESHGATE_PORT` or `PORT`: Listen port (default: 8080)
    /// - `MESHGATE_CORS_ORIGINS`: Comma-separated allowed origins
    /// - `MESHGATE_BINARY_ENABLED`: "true" or "false" (default: true)
    /// - `MESHGATE_BINARY_THRESHOLD`: Bytes (default: 1024)
    /// - `MESHGATE_BINARY_KINDS`: Comma-separated message kinds
    /// - `MESHGATE_MAX_MESSAGE_SIZE`: Bytes (default: 1048576)
    /// - `MESHGATE_HANDSHAKE_TIMEOUT_MS`, `MESHGATE_REGISTRATION_GRACE_MS`,
    ///   `MESHGATE_IDLE_TIMEOUT_MS`, `MESHGATE_FLUSH_TIMEOUT_MS`
    /// - `MESHGATE_MAX_CONNECTIONS` (default: 10000)
    /// - `MESHGATE_OUTBOUND_BUFFER` (default: 256)
    /// - `MESHGATE_RATE_LIMIT_PER_MINUTE` (default: 1000)
    /// - `MESHGATE_RATE_LIMIT_BURST` (default: 100)
    /// - `MESHGATE_TASK_RETENTION_SECS` (default: 3600)
    /// - `MESHGATE_MAINTENANCE_INTERVAL_SECS` (default: 60)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let bind_host = std::env::var("MESHGATE_BIND").unwrap_or(defaults.bind_host);

        let port = match std::env::var("MESHGATE_PORT").or_else(|_| std::env::var("PORT")) {
            Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                field: "MESHGATE_PORT".to_string(),
                value: raw.clone(),
                reason: "not a port number".to_string(),
            })?,
            Err(_) => defaults.port,
        };

        let cors_origins = std::env::var("MESHGATE_CORS_ORIGINS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let binary_enabled = std::env::var("MESHGATE_BINARY_ENABLED")
            .ok()
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(defaults.binary_enabled);

        let binary_kinds = match std::env::var("MESHGATE_BINARY_KINDS") {
            Ok(raw) => parse_kinds(&raw)?,
            Err(_) => defaults.binary_kinds,
        };

        let config = Self {
            bind_host,
            port,
            cors_origins,
            binary_enabled,
            binary_threshold: env_parse("MESHGATE_BINARY_THRESHOLD")
                .unwrap_or(defaults.binary_threshold),
            binary_kinds,
            max_message_size: env_parse("MESHGATE_MAX_MESSAGE_SIZE")
                .unwrap_or(defaults.max_message_size),
            handshake_timeout: env_millis("MESHGATE_HANDSHAKE_TIMEOUT_MS")
                .unwrap_or(defaults.handshake_timeout),
            registration_grace: env_millis("MESHGATE_REGISTRATION_GRACE_MS")
                .unwrap_or(defaults.registration_grace),
            idle_timeout: env_millis("MESHGATE_IDLE_TIMEOUT_MS").unwrap_or(defaults.idle_timeout),
            flush_timeout: env_millis("MESHGATE_FLUSH_TIMEOUT_MS")
                .unwrap_or(defaults.flush_timeout),
            max_connections: env_parse("MESHGATE_MAX_CONNECTIONS")
                .unwrap_or(defaults.max_connections),
            outbound_buffer: env_parse("MESHGATE_OUTBOUND_BUFFER")
                .unwrap_or(defaults.outbound_buffer),
            rate_limit_per_minute: env_parse("MESHGATE_RATE_LIMIT_PER_MINUTE")
                .unwrap_or(defaults.rate_limit_per_minute),
            rate_limit_burst: env_parse("MESHGATE_RATE_LIMIT_BURST")
                .unwrap_or(defaults.rate_limit_burst),
            task_retention: env_parse("MESHGATE_TASK_RETENTION_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.task_retention),
            maintenance_interval: env_parse("MESHGATE_MAINTENANCE_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.maintenance_interval),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive: [(&str, u64); 6] = [
            ("max_message_size", self.max_message_size as u64),
            ("max_connections", self.max_connections as u64),
            ("outbound_buffer", self.outbound_buffer as u64),
            ("rate_limit_per_minute", u64::from(self.rate_limit_per_minute)),
            ("rate_limit_burst", u64::from(self.rate_limit_burst)),
            ("idle_timeout", self.idle_timeout.as_millis() as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: "0".to_string(),
                    reason: "must be positive".to_string(),
                });
            }
        }
        if self.maintenance_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "maintenance_interval".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.bind_host, self.port);
        addr.parse().map_err(|e| ConfigError::InvalidValue {
            field: "MESHGATE_BIND".to_string(),
            value: addr.clone(),
            reason: format!("{}", e),
        })
    }

    pub fn codec_config(&self) -> CodecConfig {
        CodecConfig {
            binary_threshold: self.binary_threshold,
            binary_kinds: self.binary_kinds.clone(),
            max_message_size: self.max_message_size,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            registration_grace: self.registration_grace,
            idle_timeout: self.idle_timeout,
            flush_timeout: self.flush_timeout,
            outbound_buffer: self.outbound_buffer,
            rate_limit_per_minute: self.rate_limit_per_minute,
            rate_limit_burst: self.rate_limit_burst,
        }
    }

    /// Whether binary framing applies to a connection that offered `protocols`.
    pub fn negotiates_binary<'a>(&self, mut protocols: impl Iterator<Item = &'a str>) -> bool {
        self.binary_enabled && protocols.any(|p| p == BINARY_SUBPROTOCOL)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

fn parse_kinds(raw: &str) -> Result<Vec<MessageKind>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse().map_err(|_| ConfigError::InvalidValue {
                field: "MESHGATE_BINARY_KINDS".to_string(),
                value: s.to_string(),
                reason: "unknown message kind".to_string(),
            })
        })
        .collect()
}
