//! Pluggable handshake authentication
//!
//! The gateway does not own any authentication policy. A provider receives the
//! opaque token carried by the Handshake frame and either rejects it or grants
//! a session with an identity and optional connection parameters.

use async_trait::async_trait;
use log::debug;
use std::time::Duration;

use crate::auth::token::TokenManager;
use crate::error::{CometError, Result};

/// What an accepted handshake is allowed to be
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthGrant {
    pub user_id: String,
    /// Connection key; generated by the gateway when `None`
    pub key: Option<String>,
    /// Room to join as part of registration
    pub room: Option<String>,
    /// Overrides the configured heartbeat window
    pub heartbeat: Option<Duration>,
}

impl AuthGrant {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            key: None,
            room: None,
            heartbeat: None,
        }
    }
}

/// Trait for authentication providers
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Validate the handshake token. Rejection is `CometError::Auth`.
    async fn authenticate(&self, token: &[u8]) -> Result<AuthGrant>;

    /// Get the provider name for logging/debugging
    fn provider_name(&self) -> &'static str;
}

/// JWT-based authentication provider
pub struct JwtAuthProvider {
    tokens: TokenManager,
}

impl JwtAuthProvider {
    pub fn new(secret: &str) -> Self {
        Self {
            tokens: TokenManager::new(secret),
        }
    }

    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.tokens = self.tokens.with_issuer(issuer);
        self
    }
}

#[async_trait]
impl AuthProvider for JwtAuthProvider {
    async fn authenticate(&self, token: &[u8]) -> Result<AuthGrant> {
        let token = std::str::from_utf8(token)
            .map_err(|_| CometError::Auth("token is not valid UTF-8".to_string()))?
            .trim();
        let claims = self.tokens.validate_token(token)?;
        if claims.sub.is_empty() {
            return Err(CometError::Auth("token has an empty subject".to_string()));
        }

        Ok(AuthGrant {
            user_id: claims.sub,
            key: claims.key.filter(|k| !k.is_empty()),
            room: claims.room.filter(|r| !r.is_empty()),
            heartbeat: claims.hb.filter(|s| *s > 0).map(Duration::from_secs),
        })
    }

    fn provider_name(&self) -> &'static str {
        "jwt"
    }
}

/// Accepts every handshake; the token text becomes the user id.
///
/// Only wired in when anonymous access is enabled in the configuration.
pub struct AnonymousAuthProvider;

#[async_trait]
impl AuthProvider for AnonymousAuthProvider {
    async fn authenticate(&self, token: &[u8]) -> Result<AuthGrant> {
        let user_id = std::str::from_utf8(token)
            .ok()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or("anonymous");
        debug!("Anonymous handshake accepted for {}", user_id);
        Ok(AuthGrant::for_user(user_id))
    }

    fn provider_name(&self) -> &'static str {
        "anonymous"
    }
}
