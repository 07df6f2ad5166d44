//! Server configuration module
//! Handles dynamic configuration parameters for the gateway

use crate::constants::*;
use crate::error::{CometError, Result};
use crate::protocol::HEADER_SIZE;
use std::env;
use std::time::Duration;

/// Server configuration parameters
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Identifier reported to discovery and to the upstream tier
    pub server_id: String,
    pub tcp_bind: String,
    pub ws_bind: String,
    pub ws_path: String,
    /// Optional secure WebSocket listener
    pub wss_bind: Option<String>,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub rpc_bind: String,

    /// Number of registry shards (fixed for the process lifetime)
    pub bucket_count: usize,
    /// Outbound frames held per connection before the oldest is displaced
    pub queue_capacity: usize,
    /// Largest accepted frame, header included
    pub max_frame_size: usize,
    pub handshake_timeout: Duration,
    /// Default heartbeat window, may be overridden per connection by the auth grant
    pub heartbeat_timeout: Duration,
    pub overflow_threshold: u32,
    pub overflow_window: Duration,
    pub drain_grace: Duration,
    pub idle_sweep_interval: Duration,

    pub region: String,
    pub zone: String,
    pub deploy_env: String,
    pub weight: i64,
    pub offline: bool,
    /// Client-facing addresses advertised to discovery
    pub public_addrs: Vec<String>,
    pub discovery_refresh: Duration,

    /// User ids whose traffic is logged verbosely
    pub whitelist: Vec<String>,

    pub jwt_secret: Option<String>,
    pub jwt_issuer: Option<String>,
    /// Accept any handshake token (development only)
    pub allow_anonymous_access: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: default_server_id(),
            tcp_bind: DEFAULT_TCP_BIND.to_string(),
            ws_bind: DEFAULT_WS_BIND.to_string(),
            ws_path: WS_PATH.to_string(),
            wss_bind: None,
            tls_cert_path: None,
            tls_key_path: None,
            rpc_bind: DEFAULT_RPC_BIND.to_string(),
            bucket_count: DEFAULT_BUCKET_COUNT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_frame_size: HEADER_SIZE + DEFAULT_MAX_BODY_SIZE,
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            overflow_threshold: DEFAULT_OVERFLOW_THRESHOLD,
            overflow_window: Duration::from_secs(DEFAULT_OVERFLOW_WINDOW_SECS),
            drain_grace: Duration::from_secs(DEFAULT_DRAIN_GRACE_SECS),
            idle_sweep_interval: Duration::from_secs(DEFAULT_IDLE_SWEEP_SECS),
            region: "local".to_string(),
            zone: "local-1".to_string(),
            deploy_env: "dev".to_string(),
            weight: DEFAULT_WEIGHT,
            offline: false,
            public_addrs: Vec::new(),
            discovery_refresh: Duration::from_secs(DEFAULT_DISCOVERY_REFRESH_SECS),
            whitelist: Vec::new(),
            jwt_secret: None,
            jwt_issuer: None,
            allow_anonymous_access: true,
        }
    }
}

fn default_server_id() -> String {
    env::var("HOSTNAME").unwrap_or_else(|_| format!("comet-{}", uuid::Uuid::new_v4()))
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|v| v.to_lowercase() == "true" || v == "1")
}

fn env_list(name: &str) -> Option<Vec<String>> {
    env_string(name).map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let secs = |name: &str, fallback: Duration| {
            env_parse::<u64>(name)
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };

        let max_body: Option<usize> = env_parse("RUSTY_COMET_MAX_BODY_SIZE");

        let config = Self {
            server_id: env_string("RUSTY_COMET_SERVER_ID").unwrap_or(defaults.server_id),
            tcp_bind: env_string("RUSTY_COMET_TCP_BIND").unwrap_or(defaults.tcp_bind),
            ws_bind: env_string("RUSTY_COMET_WS_BIND").unwrap_or(defaults.ws_bind),
            ws_path: env_string("RUSTY_COMET_WS_PATH").unwrap_or(defaults.ws_path),
            wss_bind: env_string("RUSTY_COMET_WSS_BIND"),
            tls_cert_path: env_string("RUSTY_COMET_TLS_CERT_PATH"),
            tls_key_path: env_string("RUSTY_COMET_TLS_KEY_PATH"),
            rpc_bind: env_string("RUSTY_COMET_RPC_BIND").unwrap_or(defaults.rpc_bind),
            bucket_count: env_parse("RUSTY_COMET_BUCKETS").unwrap_or(defaults.bucket_count),
            queue_capacity: env_parse("RUSTY_COMET_QUEUE_CAPACITY")
                .unwrap_or(defaults.queue_capacity),
            max_frame_size: max_body
                .map(|b| HEADER_SIZE + b)
                .unwrap_or(defaults.max_frame_size),
            handshake_timeout: secs("RUSTY_COMET_HANDSHAKE_TIMEOUT", defaults.handshake_timeout),
            heartbeat_timeout: secs("RUSTY_COMET_HEARTBEAT_TIMEOUT", defaults.heartbeat_timeout),
            overflow_threshold: env_parse("RUSTY_COMET_OVERFLOW_THRESHOLD")
                .unwrap_or(defaults.overflow_threshold),
            overflow_window: secs("RUSTY_COMET_OVERFLOW_WINDOW", defaults.overflow_window),
            drain_grace: secs("RUSTY_COMET_DRAIN_GRACE", defaults.drain_grace),
            idle_sweep_interval: secs("RUSTY_COMET_IDLE_SWEEP", defaults.idle_sweep_interval),
            region: env_string("RUSTY_COMET_REGION").unwrap_or(defaults.region),
            zone: env_string("RUSTY_COMET_ZONE").unwrap_or(defaults.zone),
            deploy_env: env_string("RUSTY_COMET_DEPLOY_ENV").unwrap_or(defaults.deploy_env),
            weight: env_parse("RUSTY_COMET_WEIGHT").unwrap_or(defaults.weight),
            offline: env_bool("RUSTY_COMET_OFFLINE").unwrap_or(defaults.offline),
            public_addrs: env_list("RUSTY_COMET_PUBLIC_ADDRS").unwrap_or(defaults.public_addrs),
            discovery_refresh: secs("RUSTY_COMET_DISCOVERY_REFRESH", defaults.discovery_refresh),
            whitelist: env_list("RUSTY_COMET_WHITELIST").unwrap_or(defaults.whitelist),
            jwt_secret: env_string("RUSTY_COMET_JWT_SECRET").or_else(|| env_string("JWT_SECRET")),
            jwt_issuer: env_string("RUSTY_COMET_JWT_ISSUER"),
            // SECURITY: Default to false outside of tests
            allow_anonymous_access: env_bool("RUSTY_COMET_ALLOW_ANONYMOUS").unwrap_or(false),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the gateway cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.bucket_count == 0 {
            return Err(CometError::Config("bucket count must be at least 1".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(CometError::Config("queue capacity must be at least 1".to_string()));
        }
        if self.max_frame_size < HEADER_SIZE {
            return Err(CometError::Config(format!(
                "max frame size {} is smaller than the {} byte header",
                self.max_frame_size, HEADER_SIZE
            )));
        }
        if self.ws_path.is_empty() || self.ws_path.contains('/') {
            return Err(CometError::Config(format!(
                "WebSocket path must be a single non-empty segment, got {:?}",
                self.ws_path
            )));
        }
        if self.heartbeat_timeout.is_zero() || self.handshake_timeout.is_zero() {
            return Err(CometError::Config("timeouts must be non-zero".to_string()));
        }
        if self.idle_sweep_interval.is_zero() || self.discovery_refresh.is_zero() {
            return Err(CometError::Config(
                "idle sweep and discovery refresh intervals must be non-zero".to_string(),
            ));
        }

        if self.wss_bind.is_some() && (self.tls_cert_path.is_none() || self.tls_key_path.is_none()) {
            return Err(CometError::Config(
                "RUSTY_COMET_WSS_BIND is set but RUSTY_COMET_TLS_CERT_PATH or RUSTY_COMET_TLS_KEY_PATH is not".to_string(),
            ));
        }
        if let (Some(cert), Some(key)) = (&self.tls_cert_path, &self.tls_key_path) {
            if self.wss_bind.is_some() {
                for (kind, path) in [("certificate", cert), ("private key", key)] {
                    if !std::path::Path::new(path).exists() {
                        return Err(CometError::Config(format!(
                            "TLS {} file does not exist: {}",
                            kind, path
                        )));
                    }
                }
            }
        }

        match &self.jwt_secret {
            Some(secret) => Self::validate_secret(secret)?,
            None if !self.allow_anonymous_access => {
                return Err(CometError::Config(
                    "JWT_SECRET environment variable is required unless anonymous access is enabled. \
                     Generate one with: openssl rand -base64 32"
                        .to_string(),
                ));
            }
            None => {}
        }

        Ok(())
    }

    /// Validate that a secret meets security requirements
    fn validate_secret(secret: &str) -> Result<()> {
        if secret.len() < 32 {
            return Err(CometError::Config(
                "JWT secret must be at least 32 characters long".to_string(),
            ));
        }

        let insecure_patterns = ["your-secret-key", "change-this", "secret", "password", "12345"];
        for pattern in &insecure_patterns {
            if secret.contains(pattern) {
                return Err(CometError::Config(format!(
                    "JWT secret contains insecure pattern '{}'",
                    pattern
                )));
            }
        }

        if secret.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(CometError::Config(
                "JWT secret should contain mixed characters".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_buckets_rejected() {
        let config = ServerConfig {
            bucket_count: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_idle_sweep_rejected() {
        let config = ServerConfig {
            idle_sweep_interval: Duration::ZERO,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_discovery_refresh_rejected() {
        let config = ServerConfig {
            discovery_refresh: Duration::ZERO,
            ..ServerConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("discovery refresh"));
    }

    #[test]
    fn test_frame_limit_below_header_rejected() {
        let config = ServerConfig {
            max_frame_size: HEADER_SIZE - 1,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_secret_required_without_anonymous() {
        let config = ServerConfig {
            allow_anonymous_access: false,
            jwt_secret: None,
            ..ServerConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("JWT_SECRET"));
    }

    #[test]
    fn test_weak_secret_rejected() {
        let config = ServerConfig {
            jwt_secret: Some("short".to_string()),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            jwt_secret: Some("Zq8!mX2#vR7@kP4$wL9^tN3&hB6*yF1%".to_string()),
            allow_anonymous_access: false,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_wss_requires_cert_and_key() {
        let config = ServerConfig {
            wss_bind: Some("0.0.0.0:3103".to_string()),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
