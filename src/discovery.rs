//! Service registration with the discovery layer
//!
//! The gateway advertises itself with static routing fields plus live load
//! figures taken from the registry. A refresh loop republishes the metadata
//! periodically; shutdown marks the instance offline before deregistering it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::constants::{APP_ID, DISCOVERY_RETRY_SECS};
use crate::core::registry::Registry;
use crate::error::Result;

/// What the gateway publishes about itself
#[derive(Debug, Clone, Serialize)]
pub struct InstanceMetadata {
    pub region: String,
    pub zone: String,
    pub env: String,
    pub hostname: String,
    pub app_id: String,
    pub addrs: Vec<String>,
    pub weight: i64,
    pub offline: bool,
    pub connections: usize,
    pub peers: usize,
    pub updated_at: DateTime<Utc>,
}

/// External discovery collaborator
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn register(&self, metadata: &InstanceMetadata) -> Result<()>;

    async fn update(&self, metadata: &InstanceMetadata) -> Result<()>;

    async fn deregister(&self, metadata: &InstanceMetadata) -> Result<()>;
}

/// Default binding that only logs what would be published
pub struct LoggingDiscovery;

#[async_trait]
impl Discovery for LoggingDiscovery {
    async fn register(&self, metadata: &InstanceMetadata) -> Result<()> {
        info!(
            "Registered {} ({}/{}) addrs={:?} weight={}",
            metadata.hostname, metadata.region, metadata.zone, metadata.addrs, metadata.weight
        );
        Ok(())
    }

    async fn update(&self, metadata: &InstanceMetadata) -> Result<()> {
        debug!("Discovery update: {}", serde_json::to_string(metadata)?);
        Ok(())
    }

    async fn deregister(&self, metadata: &InstanceMetadata) -> Result<()> {
        info!("Deregistered {}", metadata.hostname);
        Ok(())
    }
}

struct StaticFields {
    region: String,
    zone: String,
    env: String,
    hostname: String,
    addrs: Vec<String>,
    weight: i64,
}

struct RegistrationState {
    discovery: Arc<dyn Discovery>,
    registry: Arc<Registry>,
    fields: StaticFields,
    offline: AtomicBool,
}

impl RegistrationState {
    fn snapshot(&self) -> InstanceMetadata {
        let (connections, peers) = match self.registry.aggregate_stats() {
            Ok(stats) => (stats.connections, stats.distinct_peers),
            Err(e) => {
                warn!("Could not read registry stats for discovery: {}", e);
                (0, 0)
            }
        };
        InstanceMetadata {
            region: self.fields.region.clone(),
            zone: self.fields.zone.clone(),
            env: self.fields.env.clone(),
            hostname: self.fields.hostname.clone(),
            app_id: APP_ID.to_string(),
            addrs: self.fields.addrs.clone(),
            weight: self.fields.weight,
            offline: self.offline.load(Ordering::Acquire),
            connections,
            peers,
            updated_at: Utc::now(),
        }
    }
}

/// A live registration and its refresh loop
pub struct Registration {
    state: Arc<RegistrationState>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Registration {
    /// Register once, then republish every `config.discovery_refresh`
    pub async fn start(
        discovery: Arc<dyn Discovery>,
        registry: Arc<Registry>,
        config: &ServerConfig,
    ) -> Result<Self> {
        let state = Arc::new(RegistrationState {
            discovery,
            registry,
            fields: StaticFields {
                region: config.region.clone(),
                zone: config.zone.clone(),
                env: config.deploy_env.clone(),
                hostname: config.server_id.clone(),
                addrs: config.public_addrs.clone(),
                weight: config.weight,
            },
            offline: AtomicBool::new(config.offline),
        });

        state.discovery.register(&state.snapshot()).await?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(refresh_loop(
            Arc::clone(&state),
            config.discovery_refresh,
            cancel.clone(),
        ));

        Ok(Self {
            state,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn metadata(&self) -> InstanceMetadata {
        self.state.snapshot()
    }

    pub fn is_offline(&self) -> bool {
        self.state.offline.load(Ordering::Acquire)
    }

    /// Tell discovery to stop routing new traffic here
    pub async fn mark_offline(&self) -> Result<()> {
        self.state.offline.store(true, Ordering::Release);
        info!("Marking instance offline in discovery");
        self.state.discovery.update(&self.state.snapshot()).await
    }

    /// Stop the refresh loop and deregister
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        let task = self.task.lock()?.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Discovery refresh task ended abnormally: {}", e);
            }
        }
        self.state.discovery.deregister(&self.state.snapshot()).await
    }
}

async fn refresh_loop(state: Arc<RegistrationState>, every: Duration, cancel: CancellationToken) {
    let retry = Duration::from_secs(DISCOVERY_RETRY_SECS);
    let mut delay = every;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(delay) => {}
        }
        delay = match state.discovery.update(&state.snapshot()).await {
            Ok(()) => every,
            Err(e) => {
                warn!("Discovery update failed, retrying in {:?}: {}", retry, e);
                retry
            }
        };
    }
    debug!("Discovery refresh loop stopped");
}
