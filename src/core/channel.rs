//! Per-connection session state
//!
//! A [`Channel`] is shared between the connection's read task, its write task
//! and the [`Bucket`] that indexes it. The outbound queue is the only path from
//! the rest of the gateway to the socket.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::core::bucket::Bucket;
use crate::error::{CometError, Result};
use crate::protocol::Frame;

const STATE_HANDSHAKING: u8 = 0;
const STATE_ACTIVE: u8 = 1;
const STATE_DRAINING: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// Lifecycle of a connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChannelState {
    Handshaking,
    Active,
    Draining,
    Closed,
}

impl ChannelState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            STATE_HANDSHAKING => ChannelState::Handshaking,
            STATE_ACTIVE => ChannelState::Active,
            STATE_DRAINING => ChannelState::Draining,
            _ => ChannelState::Closed,
        }
    }
}

/// Why a channel was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseReason {
    HeartbeatTimeout,
    HandshakeTimeout,
    AuthRejected,
    FrameError,
    PeerClosed,
    ClientClose,
    WriteFailed,
    SlowConsumer,
    Replaced,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::HeartbeatTimeout => "heartbeat timeout",
            Self::HandshakeTimeout => "handshake timeout",
            Self::AuthRejected => "authentication rejected",
            Self::FrameError => "malformed frame",
            Self::PeerClosed => "peer closed connection",
            Self::ClientClose => "client requested close",
            Self::WriteFailed => "socket write failed",
            Self::SlowConsumer => "slow consumer",
            Self::Replaced => "replaced by newer connection",
            Self::Shutdown => "gateway shutdown",
        };
        f.write_str(text)
    }
}

/// Forced-disconnect policy for consumers that keep overflowing their queue
#[derive(Debug, Clone, Copy)]
pub struct OverflowPolicy {
    /// Displacements tolerated within one window
    pub threshold: u32,
    pub window: Duration,
}

/// Per-connection limits fixed at handshake time
#[derive(Debug, Clone, Copy)]
pub struct ChannelSettings {
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub heartbeat_window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// The queue was full; its oldest frame was dropped to make room
    DisplacedOldest,
}

struct OutboundQueue {
    frames: VecDeque<Frame>,
    window_start: Instant,
    window_overflows: u32,
}

pub struct Channel {
    key: String,
    user_id: String,
    peer: SocketAddr,
    connected_at: DateTime<Utc>,
    settings: ChannelSettings,
    /// Written only by the owning bucket while it holds its lock
    room: Mutex<Option<String>>,
    state: AtomicU8,
    queue: Mutex<OutboundQueue>,
    writer_wake: Notify,
    shutdown: CancellationToken,
    epoch: Instant,
    last_seen_ms: AtomicU64,
    dropped: AtomicU64,
    close_reason: OnceLock<CloseReason>,
    bucket: OnceLock<Weak<Bucket>>,
}

impl Channel {
    pub fn new(key: String, user_id: String, peer: SocketAddr, settings: ChannelSettings) -> Self {
        let now = Instant::now();
        Self {
            key,
            user_id,
            peer,
            connected_at: Utc::now(),
            settings,
            room: Mutex::new(None),
            state: AtomicU8::new(STATE_HANDSHAKING),
            queue: Mutex::new(OutboundQueue {
                frames: VecDeque::with_capacity(settings.queue_capacity),
                window_start: now,
                window_overflows: 0,
            }),
            writer_wake: Notify::new(),
            shutdown: CancellationToken::new(),
            epoch: now,
            last_seen_ms: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            close_reason: OnceLock::new(),
            bucket: OnceLock::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn heartbeat_window(&self) -> Duration {
        self.settings.heartbeat_window
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    /// Room currently joined, if any
    pub fn room(&self) -> Option<String> {
        self.room
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_room(&self, room: Option<String>) {
        *self.room.lock().unwrap_or_else(PoisonError::into_inner) = room;
    }

    pub(crate) fn attach_bucket(&self, bucket: Weak<Bucket>) {
        let _ = self.bucket.set(bucket);
    }

    /// Handshaking -> Active. Returns false if the channel already moved on.
    pub fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_HANDSHAKING,
                STATE_ACTIVE,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Enter the shutdown drain: the writer flushes what is queued, then closes.
    pub fn begin_drain(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current != STATE_ACTIVE && current != STATE_HANDSHAKING {
                return false;
            }
            match self.state.compare_exchange(
                current,
                STATE_DRAINING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.writer_wake.notify_one();
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Record inbound activity for the heartbeat window
    pub fn touch(&self) {
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        self.last_seen_ms.store(elapsed, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last_seen = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last_seen)
    }

    pub fn is_idle_expired(&self) -> bool {
        self.idle_for() > self.settings.heartbeat_window
    }

    /// Append a frame without blocking.
    ///
    /// When the queue is full the oldest frame is dropped. Crossing the
    /// overflow threshold within one window closes the channel as a slow consumer.
    pub fn enqueue(&self, frame: Frame) -> Result<EnqueueOutcome> {
        if self.is_closed() {
            return Err(CometError::ChannelClosed(self.key.clone()));
        }

        let (outcome, evict) = {
            let mut queue = self.queue.lock()?;
            if queue.frames.len() < self.settings.queue_capacity {
                queue.frames.push_back(frame);
                (EnqueueOutcome::Queued, false)
            } else {
                queue.frames.pop_front();
                queue.frames.push_back(frame);
                self.dropped.fetch_add(1, Ordering::Relaxed);

                let now = Instant::now();
                if now.duration_since(queue.window_start) > self.settings.overflow.window {
                    queue.window_start = now;
                    queue.window_overflows = 0;
                }
                queue.window_overflows += 1;
                (
                    EnqueueOutcome::DisplacedOldest,
                    queue.window_overflows > self.settings.overflow.threshold,
                )
            }
        };

        self.writer_wake.notify_one();

        if evict {
            warn!(
                "Channel {} overflowed more than {} times in {:?}, disconnecting",
                self.key, self.settings.overflow.threshold, self.settings.overflow.window
            );
            self.close(CloseReason::SlowConsumer);
        }

        Ok(outcome)
    }

    /// Take every queued frame in FIFO order
    pub(crate) fn take_batch(&self) -> Result<Vec<Frame>> {
        let mut queue = self.queue.lock()?;
        Ok(queue.frames.drain(..).collect())
    }

    pub fn queued_len(&self) -> usize {
        self.queue
            .lock()
            .map(|q| q.frames.len())
            .unwrap_or(0)
    }

    /// Frames dropped by the overflow policy over the channel's lifetime
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Resolves when the writer has something to do
    pub(crate) fn writer_notified(&self) -> Notified<'_> {
        self.writer_wake.notified()
    }

    /// Resolves once the channel is closed
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    /// Close the channel. Idempotent; returns true only for the call that closed it.
    pub fn close(&self, reason: CloseReason) -> bool {
        let previous = self.state.swap(STATE_CLOSED, Ordering::AcqRel);
        if previous == STATE_CLOSED {
            return false;
        }

        let _ = self.close_reason.set(reason);
        self.shutdown.cancel();

        let discarded = match self.queue.lock() {
            Ok(mut queue) => {
                let n = queue.frames.len();
                queue.frames.clear();
                n
            }
            Err(_) => 0,
        };
        self.writer_wake.notify_one();

        if let Some(bucket) = self.bucket.get().and_then(Weak::upgrade) {
            if let Err(e) = bucket.remove_channel(self) {
                warn!("Failed to remove channel {} from bucket: {}", self.key, e);
            }
        }

        if discarded > 0 {
            debug!("Discarded {} queued frames for channel {}", discarded, self.key);
        }
        info!("Channel {} ({}) closed: {}", self.key, self.peer, reason);
        true
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("key", &self.key)
            .field("user_id", &self.user_id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("room", &self.room())
            .finish()
    }
}
