use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{CometError, Result};

/// Handshake token claims issued by the logic tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user or device id)
    pub sub: String,
    /// Connection key chosen upstream; the gateway generates one when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Room joined immediately after the handshake
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    /// Heartbeat window in seconds for this connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Expiration time (as UTC timestamp)
    pub exp: usize,
    /// Issued at (as UTC timestamp)
    pub iat: usize,
}

fn now_secs() -> usize {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as usize)
        .unwrap_or(0)
}

impl Claims {
    /// Creates claims for a user valid for one hour
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = now_secs();
        Self {
            sub: user_id.into(),
            key: None,
            room: None,
            hb: None,
            iss: None,
            exp: now + 3600,
            iat: now,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    pub fn with_heartbeat_secs(mut self, secs: u64) -> Self {
        self.hb = Some(secs);
        self
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.iss = Some(issuer.into());
        self
    }

    pub fn expiring_in(mut self, secs: usize) -> Self {
        self.exp = self.iat + secs;
        self
    }

    /// Check if the token is expired
    pub fn is_expired(&self) -> bool {
        now_secs() > self.exp
    }
}

/// Manages JWT token operations
pub struct TokenManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenManager {
    /// Creates a new token manager with a secret
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Only accept tokens carrying this issuer
    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    /// Generates a JWT token for the given claims
    pub fn generate_token(&self, claims: &Claims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| CometError::Auth(format!("Failed to generate token: {}", e)))
    }

    /// Validates a token and returns its claims
    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| CometError::Auth(format!("Invalid token: {}", e)))
    }
}
