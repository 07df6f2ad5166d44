//! Sharded registry of every live connection
//!
//! Connections are spread over a fixed array of [`Bucket`]s by a stable hash
//! of their key, so single-connection operations touch exactly one shard and
//! room or global fan-out runs one task per shard.

use futures_util::future::join_all;
use log::{debug, error, info, warn};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::constants::{DEFAULT_MAX_BODY_SIZE, DRAIN_POLL_INTERVAL_MS};
use crate::core::bucket::{Bucket, DeliveryReport};
use crate::core::channel::{Channel, CloseReason, EnqueueOutcome};
use crate::error::{CometError, Result};
use crate::protocol::{Frame, FrameError, HEADER_SIZE};

/// Totals across all buckets, published as registration metadata
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub buckets: usize,
    pub connections: usize,
    pub distinct_peers: usize,
    pub rooms: usize,
    pub draining: bool,
}

/// Result of a shutdown drain
#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainReport {
    /// Connections that flushed their queue and closed before the deadline
    pub drained: usize,
    /// Connections force-closed at the deadline
    pub forced: usize,
    pub elapsed: Duration,
}

pub struct Registry {
    buckets: Vec<Arc<Bucket>>,
    draining: AtomicBool,
    /// Largest frame a push may produce, header included
    max_frame_size: usize,
}

/// Stable shard index for a connection key
pub fn shard_index(key: &str, bucket_count: usize) -> usize {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % bucket_count as u64) as usize
}

impl Registry {
    pub fn new(bucket_count: usize) -> Self {
        let bucket_count = bucket_count.max(1);
        info!("Creating registry with {} buckets", bucket_count);
        Self {
            buckets: (0..bucket_count).map(|i| Arc::new(Bucket::new(i))).collect(),
            draining: AtomicBool::new(false),
            max_frame_size: HEADER_SIZE + DEFAULT_MAX_BODY_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn buckets(&self) -> &[Arc<Bucket>] {
        &self.buckets
    }

    /// Bucket index owning `key`
    pub fn assign(&self, key: &str) -> usize {
        shard_index(key, self.buckets.len())
    }

    pub fn bucket_for(&self, key: &str) -> &Arc<Bucket> {
        &self.buckets[self.assign(key)]
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.is_draining() {
            Err(CometError::Draining)
        } else {
            Ok(())
        }
    }

    /// Reject a push no client transport could encode
    fn check_frame(&self, frame: &Frame) -> Result<()> {
        if frame.encoded_len() > self.max_frame_size {
            return Err(FrameError::Oversized {
                declared: frame.encoded_len(),
                max: self.max_frame_size,
            }
            .into());
        }
        Ok(())
    }

    /// Place a freshly handshaken channel in its bucket
    pub fn register(&self, channel: Arc<Channel>, room: Option<&str>) -> Result<usize> {
        self.ensure_accepting()?;
        let index = self.assign(channel.key());
        self.buckets[index].put(channel, room)?;
        Ok(index)
    }

    pub fn channel(&self, key: &str) -> Result<Option<Arc<Channel>>> {
        self.bucket_for(key).channel(key)
    }

    pub fn join(&self, channel: &Channel, room: &str) -> Result<bool> {
        self.bucket_for(channel.key()).join(channel, room)
    }

    pub fn leave(&self, channel: &Channel, room: &str) -> Result<bool> {
        self.bucket_for(channel.key()).leave(channel, room)
    }

    pub fn push_to_connection(&self, key: &str, frame: Frame) -> Result<DeliveryReport> {
        self.ensure_accepting()?;
        self.check_frame(&frame)?;
        let channel = self
            .channel(key)?
            .ok_or_else(|| CometError::NotFound(key.to_string()))?;

        let mut report = DeliveryReport {
            attempted: 1,
            failed: 0,
        };
        match channel.enqueue(frame) {
            Ok(EnqueueOutcome::Queued) => {}
            Ok(EnqueueOutcome::DisplacedOldest) => report.failed = 1,
            Err(e) => {
                debug!("Push to {} failed: {}", key, e);
                report.failed = 1;
            }
        }
        Ok(report)
    }

    /// Push to several keys; unknown keys are skipped rather than failing the call
    pub fn push_to_keys(&self, keys: &[String], frame: Frame) -> Result<DeliveryReport> {
        self.ensure_accepting()?;
        self.check_frame(&frame)?;
        let mut total = DeliveryReport::default();
        for key in keys {
            match self.push_to_connection(key, frame.clone()) {
                Ok(report) => total.merge(report),
                Err(CometError::NotFound(_)) => debug!("Push skipped unknown key {}", key),
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Fan a frame out to every member of `room`, one task per bucket
    pub async fn push_to_room(&self, room: &str, frame: Frame) -> Result<DeliveryReport> {
        self.ensure_accepting()?;
        self.check_frame(&frame)?;
        let room = Arc::new(room.to_string());
        self.fan_out(move |bucket, frame| bucket.broadcast(&room, &frame), frame)
            .await
    }

    /// Fan a frame out to every connection, one task per bucket
    pub async fn push_to_all(&self, frame: Frame) -> Result<DeliveryReport> {
        self.ensure_accepting()?;
        self.check_frame(&frame)?;
        self.fan_out(|bucket, frame| bucket.broadcast_all(&frame), frame)
            .await
    }

    async fn fan_out<F>(&self, op: F, frame: Frame) -> Result<DeliveryReport>
    where
        F: Fn(&Bucket, Frame) -> Result<DeliveryReport> + Clone + Send + 'static,
    {
        let tasks: Vec<_> = self
            .buckets
            .iter()
            .map(|bucket| {
                let bucket = Arc::clone(bucket);
                let frame = frame.clone();
                let op = op.clone();
                tokio::spawn(async move { op(bucket.as_ref(), frame) })
            })
            .collect();

        let mut total = DeliveryReport::default();
        for result in join_all(tasks).await {
            match result {
                Ok(Ok(report)) => total.merge(report),
                Ok(Err(e)) => error!("Bucket fan-out failed: {}", e),
                Err(e) => error!("Bucket fan-out task panicked: {}", e),
            }
        }
        Ok(total)
    }

    /// Member counts per room, merged across buckets
    pub fn room_counts(&self) -> Result<HashMap<String, usize>> {
        let mut counts = HashMap::new();
        for bucket in &self.buckets {
            for (room, n) in bucket.room_counts()? {
                *counts.entry(room).or_insert(0) += n;
            }
        }
        Ok(counts)
    }

    pub fn room_members(&self, room: &str) -> Result<Vec<String>> {
        let mut members = Vec::new();
        for bucket in &self.buckets {
            members.extend(bucket.room_members(room)?);
        }
        Ok(members)
    }

    pub fn connection_count(&self) -> Result<usize> {
        let mut total = 0;
        for bucket in &self.buckets {
            total += bucket.len()?;
        }
        Ok(total)
    }

    pub fn aggregate_stats(&self) -> Result<RegistryStats> {
        let mut connections = 0;
        let mut peers = HashSet::new();
        let mut rooms = HashSet::new();
        for bucket in &self.buckets {
            let stats = bucket.stats()?;
            connections += stats.connections;
            peers.extend(stats.peers);
            rooms.extend(bucket.room_counts()?.into_keys());
        }
        Ok(RegistryStats {
            buckets: self.buckets.len(),
            connections,
            distinct_peers: peers.len(),
            rooms: rooms.len(),
            draining: self.is_draining(),
        })
    }

    fn all_channels(&self) -> Result<Vec<Arc<Channel>>> {
        let mut channels = Vec::new();
        for bucket in &self.buckets {
            channels.extend(bucket.channels()?);
        }
        Ok(channels)
    }

    /// Close every channel whose heartbeat window has elapsed
    pub fn sweep_idle(&self) -> Result<usize> {
        let mut closed = 0;
        for channel in self.all_channels()? {
            if channel.is_idle_expired() && channel.close(CloseReason::HeartbeatTimeout) {
                closed += 1;
            }
        }
        Ok(closed)
    }

    /// Stop accepting registrations and pushes
    pub fn begin_drain(&self) {
        if !self.draining.swap(true, Ordering::AcqRel) {
            info!("Registry entering drain mode");
        }
    }

    /// Let every channel flush its queue, force-closing whatever remains at the deadline
    pub async fn drain(&self, grace: Duration) -> Result<DrainReport> {
        let started = Instant::now();
        let deadline = started + grace;
        self.begin_drain();

        let channels = self.all_channels()?;
        let initial = channels.len();
        for channel in &channels {
            channel.begin_drain();
        }
        info!("Draining {} connections with a {:?} grace period", initial, grace);

        while self.connection_count()? > 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(DRAIN_POLL_INTERVAL_MS)).await;
        }

        let mut forced = 0;
        for channel in self.all_channels()? {
            if channel.close(CloseReason::Shutdown) {
                forced += 1;
            }
        }
        if forced > 0 {
            warn!("Force-closed {} connections at drain deadline", forced);
        }

        let report = DrainReport {
            drained: initial.saturating_sub(forced),
            forced,
            elapsed: started.elapsed(),
        };
        info!(
            "Drain finished in {:?}: {} drained, {} forced",
            report.elapsed, report.drained, report.forced
        );
        Ok(report)
    }
}
