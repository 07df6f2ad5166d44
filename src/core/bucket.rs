//! One shard of the connection registry
//!
//! A bucket owns the connection map and the room index for its slice of the
//! key space. Both maps live behind a single mutex, and the lock is never held
//! across I/O or across a channel enqueue.

use log::{debug, info};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::channel::{Channel, CloseReason, EnqueueOutcome};
use crate::error::{CometError, Result};
use crate::protocol::Frame;

/// Outcome of delivering one frame to a set of channels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Channels the frame was offered to
    pub attempted: usize,
    /// Channels that were closed or had to displace a queued frame
    pub failed: usize,
}

impl DeliveryReport {
    pub fn merge(&mut self, other: DeliveryReport) {
        self.attempted += other.attempted;
        self.failed += other.failed;
    }

    pub fn delivered(&self) -> usize {
        self.attempted - self.failed
    }
}

/// Read-only snapshot of a bucket
#[derive(Debug, Clone, Default)]
pub struct BucketStats {
    pub connections: usize,
    pub peers: HashSet<IpAddr>,
    pub rooms: usize,
}

#[derive(Default)]
struct BucketInner {
    channels: HashMap<String, Arc<Channel>>,
    rooms: HashMap<String, HashSet<String>>,
    peer_counts: HashMap<IpAddr, usize>,
}

impl BucketInner {
    fn add_to_room(&mut self, channel: &Channel, room: &str) {
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(channel.key().to_string());
        channel.set_room(Some(room.to_string()));
    }

    /// Drop the channel from whatever room it is in, deleting the room when it empties
    fn remove_from_room(&mut self, channel: &Channel) {
        if let Some(room) = channel.room() {
            if let Some(members) = self.rooms.get_mut(&room) {
                members.remove(channel.key());
                if members.is_empty() {
                    self.rooms.remove(&room);
                }
            }
            channel.set_room(None);
        }
    }

    fn add_peer(&mut self, ip: IpAddr) {
        *self.peer_counts.entry(ip).or_insert(0) += 1;
    }

    fn remove_peer(&mut self, ip: IpAddr) {
        if let Some(count) = self.peer_counts.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.peer_counts.remove(&ip);
            }
        }
    }

    fn is_current(&self, channel: &Channel) -> bool {
        self.channels
            .get(channel.key())
            .map(|registered| std::ptr::eq(Arc::as_ptr(registered), channel))
            .unwrap_or(false)
    }

    fn ensure_current(&self, channel: &Channel) -> Result<()> {
        if self.is_current(channel) {
            Ok(())
        } else {
            Err(CometError::ChannelClosed(channel.key().to_string()))
        }
    }

    fn detach(&mut self, key: &str) -> Option<Arc<Channel>> {
        let channel = self.channels.remove(key)?;
        self.remove_from_room(&channel);
        self.remove_peer(channel.peer().ip());
        Some(channel)
    }
}

pub struct Bucket {
    index: usize,
    inner: Mutex<BucketInner>,
}

impl Bucket {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            inner: Mutex::new(BucketInner::default()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    fn lock(&self) -> Result<MutexGuard<'_, BucketInner>> {
        Ok(self.inner.lock()?)
    }

    /// Insert a channel, optionally placing it in a room in the same critical section.
    ///
    /// A live channel already registered under the same key is closed with
    /// [`CloseReason::Replaced`] once the lock is released.
    pub fn put(self: &Arc<Self>, channel: Arc<Channel>, room: Option<&str>) -> Result<()> {
        channel.attach_bucket(Arc::downgrade(self));

        let replaced = {
            let mut inner = self.lock()?;
            let replaced = inner.detach(channel.key());
            inner.add_peer(channel.peer().ip());
            if let Some(room) = room {
                inner.add_to_room(&channel, room);
            }
            inner
                .channels
                .insert(channel.key().to_string(), Arc::clone(&channel));
            replaced
        };

        if let Some(stale) = replaced {
            if !Arc::ptr_eq(&stale, &channel) {
                info!(
                    "Connection {} re-registered in bucket {}, closing stale channel",
                    channel.key(),
                    self.index
                );
                stale.close(CloseReason::Replaced);
            }
        }
        Ok(())
    }

    /// Remove a channel by key regardless of which instance is registered
    pub fn remove(&self, key: &str) -> Result<Option<Arc<Channel>>> {
        let mut inner = self.lock()?;
        Ok(inner.detach(key))
    }

    /// Remove this exact channel instance. A newer channel under the same key is left alone.
    pub fn remove_channel(&self, channel: &Channel) -> Result<bool> {
        let mut inner = self.lock()?;
        let is_current = inner.is_current(channel);
        if is_current {
            inner.detach(channel.key());
            debug!("Channel {} removed from bucket {}", channel.key(), self.index);
        }
        Ok(is_current)
    }

    pub fn channel(&self, key: &str) -> Result<Option<Arc<Channel>>> {
        Ok(self.lock()?.channels.get(key).cloned())
    }

    /// Move a channel into `room`, leaving its previous room. Returns false if it was already there.
    ///
    /// Fails with [`CometError::ChannelClosed`] when `channel` is no longer the
    /// instance registered under its key.
    pub fn join(&self, channel: &Channel, room: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        inner.ensure_current(channel)?;

        if channel.room().as_deref() == Some(room) {
            return Ok(false);
        }
        inner.remove_from_room(channel);
        inner.add_to_room(channel, room);
        Ok(true)
    }

    /// Take a channel out of `room`. Returns false if it was not a member.
    pub fn leave(&self, channel: &Channel, room: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        inner.ensure_current(channel)?;

        if channel.room().as_deref() != Some(room) {
            return Ok(false);
        }
        inner.remove_from_room(channel);
        Ok(true)
    }

    /// Offer a frame to every member of `room` in this bucket
    pub fn broadcast(&self, room: &str, frame: &Frame) -> Result<DeliveryReport> {
        let members: Vec<Arc<Channel>> = {
            let inner = self.lock()?;
            match inner.rooms.get(room) {
                Some(keys) => keys
                    .iter()
                    .filter_map(|key| inner.channels.get(key).cloned())
                    .collect(),
                None => return Ok(DeliveryReport::default()),
            }
        };
        Ok(deliver(&members, frame))
    }

    /// Offer a frame to every channel in this bucket
    pub fn broadcast_all(&self, frame: &Frame) -> Result<DeliveryReport> {
        let channels = self.channels()?;
        Ok(deliver(&channels, frame))
    }

    /// Snapshot of every registered channel
    pub fn channels(&self) -> Result<Vec<Arc<Channel>>> {
        Ok(self.lock()?.channels.values().cloned().collect())
    }

    pub fn room_members(&self, room: &str) -> Result<Vec<String>> {
        let inner = self.lock()?;
        Ok(inner
            .rooms
            .get(room)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Member count of every non-empty room in this bucket
    pub fn room_counts(&self) -> Result<HashMap<String, usize>> {
        let inner = self.lock()?;
        Ok(inner
            .rooms
            .iter()
            .map(|(room, keys)| (room.clone(), keys.len()))
            .collect())
    }

    pub fn has_room(&self, room: &str) -> Result<bool> {
        Ok(self.lock()?.rooms.contains_key(room))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.channels.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn stats(&self) -> Result<BucketStats> {
        let inner = self.lock()?;
        Ok(BucketStats {
            connections: inner.channels.len(),
            peers: inner.peer_counts.keys().copied().collect(),
            rooms: inner.rooms.len(),
        })
    }
}

/// Enqueue outside the lock; one failing channel never stops the rest
fn deliver(channels: &[Arc<Channel>], frame: &Frame) -> DeliveryReport {
    let mut report = DeliveryReport::default();
    for channel in channels {
        report.attempted += 1;
        match channel.enqueue(frame.clone()) {
            Ok(EnqueueOutcome::Queued) => {}
            Ok(EnqueueOutcome::DisplacedOldest) => report.failed += 1,
            Err(e) => {
                debug!("Delivery to {} failed: {}", channel.key(), e);
                report.failed += 1;
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel::{ChannelSettings, OverflowPolicy};
    use crate::protocol::Operation;
    use std::time::Duration;

    fn channel(key: &str, ip: &str) -> Arc<Channel> {
        Arc::new(Channel::new(
            key.to_string(),
            format!("user-{}", key),
            format!("{}:5000", ip).parse().unwrap(),
            ChannelSettings {
                queue_capacity: 8,
                overflow: OverflowPolicy {
                    threshold: 100,
                    window: Duration::from_secs(10),
                },
                heartbeat_window: Duration::from_secs(30),
            },
        ))
    }

    #[tokio::test]
    async fn test_put_and_remove() {
        let bucket = Arc::new(Bucket::new(0));
        let ch = channel("c1", "10.0.0.1");
        bucket.put(ch.clone(), None).unwrap();
        assert_eq!(bucket.len().unwrap(), 1);
        assert!(bucket.channel("c1").unwrap().is_some());

        let removed = bucket.remove("c1").unwrap().unwrap();
        assert!(Arc::ptr_eq(&removed, &ch));
        assert!(bucket.is_empty().unwrap());
        assert!(bucket.stats().unwrap().peers.is_empty());
    }

    #[tokio::test]
    async fn test_room_membership_matches_index() {
        let bucket = Arc::new(Bucket::new(0));
        let ch = channel("c1", "10.0.0.1");
        bucket.put(ch.clone(), Some("lobby")).unwrap();
        assert_eq!(ch.room().as_deref(), Some("lobby"));
        assert_eq!(bucket.room_members("lobby").unwrap(), vec!["c1".to_string()]);

        // Joining the same room again is a no-op
        assert!(!bucket.join(&ch, "lobby").unwrap());

        // Switching rooms leaves the old one, which then disappears
        assert!(bucket.join(&ch, "game").unwrap());
        assert_eq!(ch.room().as_deref(), Some("game"));
        assert!(!bucket.has_room("lobby").unwrap());

        assert!(bucket.leave(&ch, "game").unwrap());
        assert_eq!(ch.room(), None);
        assert!(!bucket.has_room("game").unwrap());
        assert!(!bucket.leave(&ch, "game").unwrap());
    }

    #[tokio::test]
    async fn test_join_unregistered_channel() {
        let bucket = Bucket::new(0);
        let ghost = channel("ghost", "10.0.0.1");
        assert!(matches!(
            bucket.join(&ghost, "r"),
            Err(CometError::ChannelClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_replaced_channel_cannot_move_successor() {
        let bucket = Arc::new(Bucket::new(0));
        let old = channel("c1", "10.0.0.1");
        let new = channel("c1", "10.0.0.2");
        bucket.put(old.clone(), None).unwrap();
        bucket.put(new.clone(), Some("lobby")).unwrap();

        assert!(matches!(
            bucket.join(&old, "game"),
            Err(CometError::ChannelClosed(_))
        ));
        assert!(matches!(
            bucket.leave(&old, "lobby"),
            Err(CometError::ChannelClosed(_))
        ));
        assert_eq!(new.room().as_deref(), Some("lobby"));
        assert_eq!(bucket.room_members("lobby").unwrap(), vec!["c1".to_string()]);
        assert!(!bucket.has_room("game").unwrap());
    }

    #[tokio::test]
    async fn test_close_removes_from_bucket_and_room() {
        let bucket = Arc::new(Bucket::new(0));
        let ch = channel("c1", "10.0.0.1");
        bucket.put(ch.clone(), Some("lobby")).unwrap();
        ch.close(CloseReason::PeerClosed);
        assert!(bucket.is_empty().unwrap());
        assert!(!bucket.has_room("lobby").unwrap());
    }

    #[tokio::test]
    async fn test_reconnect_replaces_stale_channel() {
        let bucket = Arc::new(Bucket::new(0));
        let old = channel("c1", "10.0.0.1");
        let new = channel("c1", "10.0.0.2");
        bucket.put(old.clone(), Some("lobby")).unwrap();
        bucket.put(new.clone(), Some("lobby")).unwrap();

        assert!(old.is_closed());
        assert_eq!(old.close_reason(), Some(CloseReason::Replaced));
        assert!(!new.is_closed());

        let current = bucket.channel("c1").unwrap().unwrap();
        assert!(Arc::ptr_eq(&current, &new));
        assert_eq!(bucket.room_members("lobby").unwrap().len(), 1);
        assert_eq!(bucket.stats().unwrap().peers.len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_only_reaches_room() {
        let bucket = Arc::new(Bucket::new(0));
        let inside = channel("in", "10.0.0.1");
        let outside = channel("out", "10.0.0.1");
        bucket.put(inside.clone(), Some("r1")).unwrap();
        bucket.put(outside.clone(), None).unwrap();

        let frame = Frame::new(Operation::Push, 0, &b"hi"[..]);
        let report = bucket.broadcast("r1", &frame).unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(inside.queued_len(), 1);
        assert_eq!(outside.queued_len(), 0);

        let report = bucket.broadcast_all(&frame).unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.failed, 0);

        let stats = bucket.stats().unwrap();
        assert_eq!(stats.connections, 2);
        assert_eq!(stats.peers.len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_counts_failures_without_aborting() {
        let bucket = Arc::new(Bucket::new(0));
        let a = channel("a", "10.0.0.1");
        let b = channel("b", "10.0.0.2");
        bucket.put(a.clone(), Some("r")).unwrap();
        bucket.put(b.clone(), Some("r")).unwrap();

        // Fill b so the next frame displaces one
        for seq in 0..8 {
            b.enqueue(Frame::empty(Operation::Push, seq)).unwrap();
        }
        let report = bucket
            .broadcast("r", &Frame::empty(Operation::Push, 99))
            .unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered(), 1);
        assert_eq!(a.queued_len(), 1);
    }
}
