//! Process signals and the coordinated shutdown drain

use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::core::registry::{DrainReport, Registry};
use crate::discovery::Registration;
use crate::error::Result;

/// What the process should do about a received signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Graceful stop: drain then exit
    Drain,
    /// Accepted and logged; nothing to reload at this layer
    Reload,
}

/// Wait for the next signal the gateway handles
#[cfg(unix)]
pub async fn wait_for_signal() -> Result<SignalAction> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sighup = signal(SignalKind::hangup())?;

    let (name, action) = tokio::select! {
        _ = sigint.recv() => ("SIGINT", SignalAction::Drain),
        _ = sigterm.recv() => ("SIGTERM", SignalAction::Drain),
        _ = sigquit.recv() => ("SIGQUIT", SignalAction::Drain),
        _ = sighup.recv() => ("SIGHUP", SignalAction::Reload),
    };
    info!("Received {}", name);
    Ok(action)
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> Result<SignalAction> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C");
    Ok(SignalAction::Drain)
}

/// Runs the bounded-time drain in order: stop listeners, reject pushes,
/// flush queues until the grace deadline, force-close the rest, deregister.
pub struct ShutdownCoordinator {
    registry: Arc<Registry>,
    listeners: CancellationToken,
    registration: Option<Arc<Registration>>,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(registry: Arc<Registry>, listeners: CancellationToken, grace: Duration) -> Self {
        Self {
            registry,
            listeners,
            registration: None,
            grace,
        }
    }

    pub fn with_registration(mut self, registration: Arc<Registration>) -> Self {
        self.registration = Some(registration);
        self
    }

    pub async fn drain(&self) -> Result<DrainReport> {
        info!("Shutdown started, grace period {:?}", self.grace);
        self.listeners.cancel();
        self.registry.begin_drain();

        if let Some(registration) = &self.registration {
            if let Err(e) = registration.mark_offline().await {
                warn!("Failed to mark instance offline: {}", e);
            }
        }

        let report = self.registry.drain(self.grace).await?;

        if let Some(registration) = &self.registration {
            if let Err(e) = registration.shutdown().await {
                warn!("Failed to deregister instance: {}", e);
            }
        }
        info!("Shutdown complete");
        Ok(report)
    }
}
