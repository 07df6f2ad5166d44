//! Events forwarded to the upstream logic tier
//!
//! The gateway reports liveness and client-originated frames upstream but never
//! waits on the upstream to decide anything about a connection's lifetime.

use async_trait::async_trait;
use log::{debug, info};

use crate::core::channel::{Channel, CloseReason};
use crate::error::Result;
use crate::protocol::Frame;

#[async_trait]
pub trait UpstreamEvents: Send + Sync {
    /// A heartbeat was received on `channel`
    async fn on_heartbeat(&self, channel: &Channel) -> Result<()>;

    /// A client frame that the gateway does not interpret itself
    async fn on_receive(&self, channel: &Channel, frame: &Frame) -> Result<()>;

    /// The channel has closed and left the registry
    async fn on_disconnect(&self, channel: &Channel, reason: CloseReason) -> Result<()>;
}

/// Default binding that only logs; used when no logic tier is wired in
pub struct LoggingUpstream {
    server_id: String,
}

impl LoggingUpstream {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
        }
    }
}

#[async_trait]
impl UpstreamEvents for LoggingUpstream {
    async fn on_heartbeat(&self, channel: &Channel) -> Result<()> {
        debug!(
            "[{}] heartbeat key={} user={}",
            self.server_id,
            channel.key(),
            channel.user_id()
        );
        Ok(())
    }

    async fn on_receive(&self, channel: &Channel, frame: &Frame) -> Result<()> {
        debug!(
            "[{}] receive key={} op={:?} seq={} bytes={}",
            self.server_id,
            channel.key(),
            frame.op,
            frame.seq,
            frame.body.len()
        );
        Ok(())
    }

    async fn on_disconnect(&self, channel: &Channel, reason: CloseReason) -> Result<()> {
        info!(
            "[{}] disconnect key={} user={} reason={}",
            self.server_id,
            channel.key(),
            channel.user_id(),
            reason
        );
        Ok(())
    }
}
