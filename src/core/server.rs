//! Gateway service that ties the registry to its collaborators

use log::{error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::auth::{AnonymousAuthProvider, AuthGrant, AuthProvider, JwtAuthProvider};
use crate::config::ServerConfig;
use crate::core::channel::{ChannelSettings, OverflowPolicy};
use crate::core::registry::Registry;
use crate::error::{CometError, Result};
use crate::upstream::{LoggingUpstream, UpstreamEvents};

/// Shared state every listener and the dispatcher work against
pub struct Gateway {
    config: ServerConfig,
    registry: Arc<Registry>,
    auth: Arc<dyn AuthProvider>,
    upstream: Arc<dyn UpstreamEvents>,
    whitelist: HashSet<String>,
}

impl Gateway {
    pub fn new(
        config: ServerConfig,
        auth: Arc<dyn AuthProvider>,
        upstream: Arc<dyn UpstreamEvents>,
    ) -> Self {
        let registry = Arc::new(
            Registry::new(config.bucket_count).with_max_frame_size(config.max_frame_size),
        );
        let whitelist = config.whitelist.iter().cloned().collect();
        Self {
            config,
            registry,
            auth,
            upstream,
            whitelist,
        }
    }

    /// Build the gateway with the auth provider the configuration asks for
    pub fn from_config(config: ServerConfig) -> Result<Self> {
        let auth: Arc<dyn AuthProvider> = match (&config.jwt_secret, config.allow_anonymous_access) {
            (Some(secret), _) => {
                let provider = JwtAuthProvider::new(secret);
                match &config.jwt_issuer {
                    Some(issuer) => Arc::new(provider.with_issuer(issuer)),
                    None => Arc::new(provider),
                }
            }
            (None, true) => {
                warn!("Anonymous access is enabled; every handshake token will be accepted");
                Arc::new(AnonymousAuthProvider)
            }
            (None, false) => {
                return Err(CometError::Config(
                    "no JWT secret configured and anonymous access is disabled".to_string(),
                ))
            }
        };
        info!("Using {} authentication", auth.provider_name());

        let upstream = Arc::new(LoggingUpstream::new(config.server_id.clone()));
        Ok(Self::new(config, auth, upstream))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn auth(&self) -> &Arc<dyn AuthProvider> {
        &self.auth
    }

    pub fn upstream(&self) -> &Arc<dyn UpstreamEvents> {
        &self.upstream
    }

    pub fn is_whitelisted(&self, user_id: &str) -> bool {
        self.whitelist.contains(user_id)
    }

    /// Limits for a connection accepted with `grant`
    pub fn channel_settings(&self, grant: &AuthGrant) -> ChannelSettings {
        ChannelSettings {
            queue_capacity: self.config.queue_capacity,
            overflow: OverflowPolicy {
                threshold: self.config.overflow_threshold,
                window: self.config.overflow_window,
            },
            heartbeat_window: grant.heartbeat.unwrap_or(self.config.heartbeat_timeout),
        }
    }

    /// Periodically close channels that outlived their heartbeat window
    pub fn start_idle_sweeper(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = self.config.idle_sweep_interval;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match self.registry.sweep_idle() {
                    Ok(0) => {}
                    Ok(n) => info!("Idle sweep closed {} connections", n),
                    Err(e) => error!("Idle sweep failed: {}", e),
                }
            }
        })
    }
}

// Shared reference to the gateway
pub type SharedGateway = Arc<Gateway>;
