//! Authentication Module
//!
//! Agents authenticate during the WebSocket upgrade, and task sources
//! authenticate on the HTTP routes. Two credential kinds are accepted:
//! 1. API Key (via X-API-Key header)
//! 2. JWT token (via Authorization: Bearer header)
//!
//! Verification sits behind the [`Authenticator`] trait so deployments can
//! plug in their own identity provider. [`JwtApiKeyAuthenticator`] is the
//! bundled implementation.

use crate::error::{ApiError, ApiResult};
use async_trait::async_trait;
use axum::http::HeaderMap;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use meshgate_core::{AuthError, ConfigError, Principal};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

const INSECURE_DEFAULT_SECRET: &str = "INSECURE_DEFAULT_SECRET_CHANGE_IN_PRODUCTION";

/// Header carrying an API key.
pub const API_KEY_HEADER: &str = "x-api-key";

// ============================================================================
// CLOCK ABSTRACTION
// ============================================================================

/// Clock abstraction for JWT time validation.
///
/// Time checks are done here rather than inside `jsonwebtoken` so tests can
/// inject time and a broken system clock surfaces as an error instead of a
/// panic.
pub trait JwtClock: Send + Sync {
    /// Current time as Unix epoch seconds. Negative for pre-1970 clocks.
    fn now_epoch_secs(&self) -> i64;
}

/// Production clock using system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl JwtClock for SystemClock {
    fn now_epoch_secs(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Fixed clock for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub i64);

impl JwtClock for FixedClock {
    fn now_epoch_secs(&self) -> i64 {
        self.0
    }
}


// ============================================================================
// JWT SECRET
// ============================================================================

/// JWT signing secret that never shows up in logs.
#[derive(Clone)]
pub struct JwtSecret(SecretString);

impl JwtSecret {
    /// # Errors
    /// Returns error if the secret is empty.
    pub fn new(secret: String) -> Result<Self, ConfigError> {
        if secret.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "jwt_secret".to_string(),
            });
        }
        Ok(Self(SecretString::new(secret.into())))
    }

    /// Expose the secret value (only for cryptographic operations).
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn len(&self) -> usize {
        self.0.expose_secret().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.expose_secret().is_empty()
    }

    pub fn is_insecure_default(&self) -> bool {
        self.0.expose_secret() == INSECURE_DEFAULT_SECRET
    }
}

impl std::fmt::Debug for JwtSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JwtSecret([REDACTED, {} chars])", self.len())
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Authentication configuration.
#[derive(Clone)]
pub struct AuthConfig {
    /// Accepted API keys
    pub api_keys: HashSet<String>,

    /// JWT secret key for signing and verification
    pub jwt_secret: JwtSecret,

    /// JWT algorithm (default: HS256)
    pub jwt_algorithm: Algorithm,

    /// Lifetime of tokens issued by [`generate_jwt_token`] (default: 1 hour)
    pub jwt_expiration_secs: i64,

    /// Clock skew tolerance in seconds (default: 60)
    pub jwt_clock_skew_secs: i64,

    /// Clock for JWT time validation
    pub clock: Arc<dyn JwtClock>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("api_keys", &format!("[{} keys]", self.api_keys.len()))
            .field("jwt_secret", &self.jwt_secret)
            .field("jwt_algorithm", &self.jwt_algorithm)
            .field("jwt_expiration_secs", &self.jwt_expiration_secs)
            .field("jwt_clock_skew_secs", &self.jwt_clock_skew_secs)
            .field("clock", &"<JwtClock>")
            .finish()
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_keys: HashSet::new(),
            jwt_secret: build_jwt_secret(INSECURE_DEFAULT_SECRET.to_string()),
            jwt_algorithm: Algorithm::HS256,
            jwt_expiration_secs: 3600,
            jwt_clock_skew_secs: 60,
            clock: Arc::new(SystemClock),
        }
    }
}

impl AuthConfig {
    /// Create authentication configuration from environment variables.
    ///
    /// # Environment Variables
    /// - `MESHGATE_API_KEYS`: Comma-separated list of valid API keys
    /// - `MESHGATE_JWT_SECRET`: JWT signing secret
    /// - `MESHGATE_JWT_EXPIRATION_SECS`: Issued token lifetime (default: 3600)
    /// - `MESHGATE_JWT_CLOCK_SKEW_SECS`: Clock skew tolerance (default: 60)
    pub fn from_env() -> Self {
        let mut api_keys = HashSet::new();
        if let Ok(keys_str) = std::env::var("MESHGATE_API_KEYS") {
            for key in keys_str.split(',') {
                let trimmed = key.trim();
                if !trimmed.is_empty() {
                    api_keys.insert(trimmed.to_string());
                }
            }
        }

        let secret_str = std::env::var("MESHGATE_JWT_SECRET")
            .unwrap_or_else(|_| INSECURE_DEFAULT_SECRET.to_string());

        Self {
            api_keys,
            jwt_secret: build_jwt_secret(secret_str),
            jwt_algorithm: Algorithm::HS256,
            jwt_expiration_secs: std::env::var("MESHGATE_JWT_EXPIRATION_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3600),
            jwt_clock_skew_secs: std::env::var("MESHGATE_JWT_CLOCK_SKEW_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),
            clock: Arc::new(SystemClock),
        }
    }

    /// Refuse insecure secrets when `MESHGATE_ENVIRONMENT` is production.
    /// Elsewhere, warn and carry on.
    pub fn validate_for_production(&self) -> Result<(), ConfigError> {
        let environment = std::env::var("MESHGATE_ENVIRONMENT")
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase();
        let is_production = environment == "production" || environment == "prod";

        if self.jwt_secret.is_insecure_default() {
            if is_production {
                return Err(ConfigError::InvalidValue {
                    field: "MESHGATE_JWT_SECRET".to_string(),
                    value: "[REDACTED]".to_string(),
                    reason: format!(
                        "insecure default secret in MESHGATE_ENVIRONMENT={}",
                        environment
                    ),
                });
            }
            tracing::warn!(
                "Using insecure default JWT secret. Set MESHGATE_JWT_SECRET to a random \
                 value of at least 32 characters before deploying."
            );
        }

        if self.jwt_secret.len() < 32 {
            if is_production {
                return Err(ConfigError::InvalidValue {
                    field: "MESHGATE_JWT_SECRET".to_string(),
                    value: "[REDACTED]".to_string(),
                    reason: format!(
                        "secret is {} chars, at least 32 required",
                        self.jwt_secret.len()
                    ),
                });
            } else if !self.jwt_secret.is_insecure_default() {
                tracing::warn!(
                    secret_len = self.jwt_secret.len(),
                    "JWT secret is shorter than 32 characters"
                );
            }
        }

        Ok(())
    }

    pub fn add_api_key(&mut self, key: String) {
        self.api_keys.insert(key);
    }

    pub fn is_valid_api_key(&self, key: &str) -> bool {
        self.api_keys.contains(key)
    }
}

fn build_jwt_secret(secret_str: String) -> JwtSecret {
    let normalized = if secret_str.trim().is_empty() {
        INSECURE_DEFAULT_SECRET.to_string()
    } else {
        secret_str
    };

    match JwtSecret::new(normalized) {
        Ok(secret) => secret,
        Err(_) => JwtSecret(SecretString::new(INSECURE_DEFAULT_SECRET.to_string().into())),
    }
}

// ============================================================================
// JWT CLAIMS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID). Becomes the agent id when usable.
    pub sub: String,

    /// Issued at (Unix timestamp)
    pub iat: i64,

    /// Expiration time (Unix timestamp)
    pub exp: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    #[serde(default)]
    pub roles: Vec<String>,
}

impl Claims {
    pub fn new(
        user_id: String,
        tenant_id: Option<String>,
        expiration_secs: i64,
        clock: &dyn JwtClock,
    ) -> Self {
        let now = clock.now_epoch_secs();
        Self {
            sub: user_id,
            iat: now,
            exp: now + expiration_secs,
            tenant_id,
            roles: Vec::new(),
        }
    }

    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles.extend(roles);
        self
    }

    pub fn is_expired(&self, clock: &dyn JwtClock) -> bool {
        self.exp < clock.now_epoch_secs()
    }
}

// ============================================================================
// TOKEN FUNCTIONS
// ============================================================================

fn validate_claim_times(
    now: i64,
    exp: i64,
    nbf: Option<i64>,
    leeway_secs: i64,
) -> Result<(), AuthError> {
    if let Some(nbf) = nbf {
        if now + leeway_secs < nbf {
            return Err(AuthError::InvalidToken {
                reason: "token not yet valid".to_string(),
            });
        }
    }

    if exp < now - leeway_secs {
        return Err(AuthError::TokenExpired);
    }

    Ok(())
}

/// Validate a JWT and extract its claims.
///
/// Signature checking is delegated to `jsonwebtoken`; expiry is checked
/// against the configured clock with `jwt_clock_skew_secs` of leeway.
pub fn validate_jwt_token(config: &AuthConfig, token: &str) -> Result<Claims, AuthError> {
    let decoding_key = DecodingKey::from_secret(config.jwt_secret.expose().as_bytes());

    let mut validation = Validation::new(config.jwt_algorithm);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.required_spec_claims = HashSet::from(["exp".to_string()]);

    let token_data =
        decode::<Claims>(token, &decoding_key, &validation).map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::InvalidToken => AuthError::InvalidToken {
                reason: "token is malformed".to_string(),
            },
            jsonwebtoken::errors::ErrorKind::InvalidSignature => AuthError::InvalidToken {
                reason: "signature is invalid".to_string(),
            },
            _ => AuthError::InvalidToken {
                reason: e.to_string(),
            },
        })?;

    let claims = token_data.claims;

    let now = config.clock.now_epoch_secs();
    if now < 0 {
        tracing::error!(
            timestamp = now,
            "System clock returned pre-epoch time - server time is broken"
        );
        return Err(AuthError::Rejected {
            reason: "server clock misconfigured".to_string(),
        });
    }

    validate_claim_times(now, claims.exp, None, config.jwt_clock_skew_secs)?;

    Ok(claims)
}

/// Issue a token for `user_id`. Used by operators and tests.
pub fn generate_jwt_token(
    config: &AuthConfig,
    user_id: String,
    tenant_id: Option<String>,
    roles: Vec<String>,
) -> ApiResult<String> {
    let claims = Claims::new(user_id, tenant_id, config.jwt_expiration_secs, &*config.clock)
        .with_roles(roles);

    let encoding_key = EncodingKey::from_secret(config.jwt_secret.expose().as_bytes());
    let header = Header::new(config.jwt_algorithm);

    encode(&header, &claims, &encoding_key)
        .map_err(|e| ApiError::internal_error(format!("Failed to generate token: {}", e)))
}

// ============================================================================
// CREDENTIALS AND AUTHENTICATORS
// ============================================================================

/// A credential presented with a request.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Bearer(String),
    ApiKey(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Bearer(_) => f.write_str("Bearer([REDACTED])"),
            Credential::ApiKey(key) => write!(f, "ApiKey({})", api_key_label(key)),
        }
    }
}

impl Credential {
    /// Pull a credential from request headers. `X-API-Key` wins when both
    /// are present.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, AuthError> {
        if let Some(value) = headers.get(API_KEY_HEADER) {
            let key = value.to_str().map_err(|_| AuthError::UnknownApiKey)?.trim();
            if key.is_empty() {
                return Err(AuthError::UnknownApiKey);
            }
            return Ok(Credential::ApiKey(key.to_string()));
        }

        if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
            let raw = value.to_str().map_err(|_| AuthError::InvalidToken {
                reason: "authorization header is not valid text".to_string(),
            })?;
            return match raw.strip_prefix("Bearer ") {
                Some(token) if !token.trim().is_empty() => {
                    Ok(Credential::Bearer(token.trim().to_string()))
                }
                _ => Err(AuthError::InvalidToken {
                    reason: "authorization header must use the Bearer scheme".to_string(),
                }),
            };
        }

        Err(AuthError::MissingCredentials)
    }
}

/// Non-secret label for an API key, safe to log.
pub fn api_key_label(key: &str) -> String {
    let prefix: String = key.chars().take(8).collect();
    format!("api_key_{}", prefix)
}

/// Verifies credentials and names the party behind them.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn verify(&self, credential: &Credential) -> Result<Principal, AuthError>;
}

pub type SharedAuthenticator = Arc<dyn Authenticator>;

/// Extract and verify the credential carried by `headers`.
pub async fn authenticate(
    authenticator: &dyn Authenticator,
    headers: &HeaderMap,
) -> Result<Principal, AuthError> {
    let credential = Credential::from_headers(headers)?;
    authenticator.verify(&credential).await
}

/// HS256 JWTs plus a static API key set.
#[derive(Debug, Clone)]
pub struct JwtApiKeyAuthenticator {
    config: AuthConfig,
}

impl JwtApiKeyAuthenticator {
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }
}

#[async_trait]
impl Authenticator for JwtApiKeyAuthenticator {
    async fn verify(&self, credential: &Credential) -> Result<Principal, AuthError> {
        match credential {
            Credential::ApiKey(key) => {
                if !self.config.is_valid_api_key(key) {
                    return Err(AuthError::UnknownApiKey);
                }
                Ok(Principal::ApiKey {
                    key_id: api_key_label(key),
                })
            }
            Credential::Bearer(token) => {
                let claims = validate_jwt_token(&self.config, token)?;
                Ok(Principal::User {
                    user_id: claims.sub,
                    tenant_id: claims.tenant_id,
                })
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
