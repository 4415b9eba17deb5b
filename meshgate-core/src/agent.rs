//! Agent identity, session state, and registration.

use crate::{AgentId, CapabilitySet, Timestamp, ValidationError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Longest accepted agent name, in bytes.
pub const MAX_AGENT_NAME_LEN: usize = 256;

// ============================================================================
// SESSION STATE
// ============================================================================

/// Lifecycle state of one connection session.
///
/// ```text
/// Connecting -> Handshaking -> Registered -> Draining -> Closed
///      \______________\____________________^
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Handshaking,
    Registered,
    Draining,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Handshaking => "handshaking",
            SessionState::Registered => "registered",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        }
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Handshaking)
                | (Handshaking, Registered)
                | (Connecting, Draining)
                | (Handshaking, Draining)
                | (Registered, Draining)
                | (Draining, Closed)
        )
    }

    /// Only registered sessions receive tasks.
    pub fn accepts_tasks(&self) -> bool {
        matches!(self, SessionState::Registered)
    }

    /// Whether outbound sends are still allowed.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Handshaking | SessionState::Registered
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// PRINCIPAL
// ============================================================================

/// The authenticated party behind a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Principal {
    /// Bearer token representing a user.
    User {
        user_id: String,
        tenant_id: Option<String>,
    },
    /// Opaque API key. `key_id` is a non-secret label for logging.
    ApiKey { key_id: String },
}

impl Principal {
    /// Decide the agent identifier for a freshly authenticated connection.
    ///
    /// A user principal keeps its user id unless that id is blank or the nil
    /// UUID, which count as "no identity". Everyone else gets a new UUIDv7.
    pub fn resolve_agent_id(&self) -> AgentId {
        match self {
            Principal::User { user_id, .. } if has_user_identity(user_id) => {
                AgentId::new(user_id.trim())
            }
            _ => AgentId::generate(),
        }
    }

    pub fn tenant_id(&self) -> Option<&str> {
        match self {
            Principal::User { tenant_id, .. } => tenant_id.as_deref(),
            Principal::ApiKey { .. } => None,
        }
    }
}

fn has_user_identity(user_id: &str) -> bool {
    let trimmed = user_id.trim();
    if trimmed.is_empty() {
        return false;
    }
    !matches!(Uuid::parse_str(trimmed), Ok(id) if id.is_nil())
}

// ============================================================================
// IDENTITY
// ============================================================================

/// What the registry knows about a registered agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub agent_id: AgentId,
    pub name: String,
    pub capabilities: CapabilitySet,
    /// Opaque, never interpreted.
    pub metadata: Map<String, Value>,
    pub registered_at: Timestamp,
}

impl AgentIdentity {
    pub fn new(agent_id: AgentId, registration: RegistrationRequest) -> Self {
        Self {
            agent_id,
            name: registration.name,
            capabilities: registration.capabilities,
            metadata: registration.metadata,
            registered_at: Utc::now(),
        }
    }
}

/// A validated `agent.register` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationRequest {
    pub name: String,
    pub capabilities: CapabilitySet,
    pub metadata: Map<String, Value>,
}

impl RegistrationRequest {
    /// Validate raw registration fields.
    pub fn parse(
        name: &str,
        capabilities: &[String],
        metadata: Map<String, Value>,
    ) -> Result<Self, ValidationError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "name".to_string(),
            });
        }
        if name.len() > MAX_AGENT_NAME_LEN {
            return Err(ValidationError::InvalidValue {
                field: "name".to_string(),
                reason: format!("longer than {} bytes", MAX_AGENT_NAME_LEN),
            });
        }
        if capabilities.is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "capabilities".to_string(),
            });
        }
        let capabilities = CapabilitySet::from_tags(capabilities)?;
        Ok(Self {
            name: name.to_string(),
            capabilities,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_transitions() {
        use SessionState::*;
        assert!(Connecting.can_transition_to(Handshaking));
        assert!(Handshaking.can_transition_to(Registered));
        assert!(Handshaking.can_transition_to(Draining));
        assert!(Registered.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Closed));
        assert!(!Registered.can_transition_to(Handshaking));
        assert!(!Closed.can_transition_to(Draining));
        assert!(!Connecting.can_transition_to(Registered));
    }

    #[test]
    fn test_only_registered_accepts_tasks() {
        assert!(SessionState::Registered.accepts_tasks());
        assert!(!SessionState::Handshaking.accepts_tasks());
        assert!(!SessionState::Draining.accepts_tasks());
        assert!(!SessionState::Draining.is_open());
    }

    #[test]
    fn test_user_principal_keeps_user_id() {
        let principal = Principal::User {
            user_id: "user-42".to_string(),
            tenant_id: Some("tenant-1".to_string()),
        };
        assert_eq!(principal.resolve_agent_id(), AgentId::new("user-42"));
        assert_eq!(principal.tenant_id(), Some("tenant-1"));
    }

    #[test]
    fn test_blank_or_nil_user_id_gets_fresh_id() {
        for user_id in ["", "   ", "00000000-0000-0000-0000-000000000000"] {
            let principal = Principal::User {
                user_id: user_id.to_string(),
                tenant_id: None,
            };
            let id = principal.resolve_agent_id();
            assert!(Uuid::parse_str(id.as_str()).is_ok());
            assert_ne!(id.as_str(), user_id);
        }
    }

    #[test]
    fn test_api_key_principals_get_unique_ids() {
        let principal = Principal::ApiKey {
            key_id: "key-1".to_string(),
        };
        assert_ne!(principal.resolve_agent_id(), principal.resolve_agent_id());
    }

    #[test]
    fn test_registration_validation() {
        let ok = RegistrationRequest::parse(
            " analyzer ",
            &["code_analysis".to_string()],
            Map::new(),
        )
        .expect("valid registration");
        assert_eq!(ok.name, "analyzer");
        assert_eq!(ok.capabilities.len(), 1);

        assert!(RegistrationRequest::parse("", &["a".to_string()], Map::new()).is_err());
        assert!(RegistrationRequest::parse("x", &[], Map::new()).is_err());
        assert!(RegistrationRequest::parse("x", &[" ".to_string()], Map::new()).is_err());
    }
}
