//! Dispatch configuration

use meshgate_core::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How the router picks among several eligible agents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Fewest capabilities beyond the required set, then least recently
    /// dispatched-to, then earliest registration.
    #[default]
    SpecificityThenRecency,
    /// Least recently dispatched-to, then earliest registration.
    LeastRecentlyDispatched,
    /// Fewest in-flight tasks, then least recently dispatched-to.
    LeastOutstanding,
}

impl SelectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionPolicy::SpecificityThenRecency => "specificity_then_recency",
            SelectionPolicy::LeastRecentlyDispatched => "least_recently_dispatched",
            SelectionPolicy::LeastOutstanding => "least_outstanding",
        }
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "specificity_then_recency" | "specificity" => Ok(Self::SpecificityThenRecency),
            "least_recently_dispatched" | "round_robin" => Ok(Self::LeastRecentlyDispatched),
            "least_outstanding" | "least_loaded" => Ok(Self::LeastOutstanding),
            _ => Err(ConfigError::InvalidValue {
                field: "MESHGATE_DISPATCH_POLICY".to_string(),
                value: s.to_string(),
                reason: "unknown selection policy".to_string(),
            }),
        }
    }
}

/// Router tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// How long a task may stay Pending without an eligible agent.
    pub deadline: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: u32,
    /// Requeues allowed before a task expires as `agent_vanished`.
    pub max_reassignments: u32,
    pub policy: SelectionPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(30),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2,
            max_reassignments: 3,
            policy: SelectionPolicy::default(),
        }
    }
}

impl DispatchConfig {
    /// Load from `MESHGATE_DISPATCH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let deadline = env_millis("MESHGATE_DISPATCH_DEADLINE_MS").unwrap_or(defaults.deadline);
        let initial_backoff = env_millis("MESHGATE_DISPATCH_INITIAL_BACKOFF_MS")
            .unwrap_or(defaults.initial_backoff);
        let max_backoff =
            env_millis("MESHGATE_DISPATCH_MAX_BACKOFF_MS").unwrap_or(defaults.max_backoff);
        let backoff_multiplier = std::env::var("MESHGATE_DISPATCH_BACKOFF_MULTIPLIER")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.backoff_multiplier);
        let max_reassignments = std::env::var("MESHGATE_DISPATCH_MAX_REASSIGNMENTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_reassignments);
        let policy = match std::env::var("MESHGATE_DISPATCH_POLICY") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.policy,
        };

        let config = Self {
            deadline,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
            max_reassignments,
            policy,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_backoff.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "initial_backoff".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.max_backoff < self.initial_backoff {
            return Err(ConfigError::InvalidValue {
                field: "max_backoff".to_string(),
                value: format!("{:?}", self.max_backoff),
                reason: "must be at least initial_backoff".to_string(),
            });
        }
        if self.backoff_multiplier == 0 {
            return Err(ConfigError::InvalidValue {
                field: "backoff_multiplier".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Backoff following `current`, capped at `max_backoff`.
    pub fn next_backoff(&self, current: Duration) -> Duration {
        current
            .saturating_mul(self.backoff_multiplier)
            .min(self.max_backoff)
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
}
