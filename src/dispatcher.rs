//! Upstream-facing push API
//!
//! Every operation wraps the payload into a `Push` frame and hands it to the
//! registry. Delivery is fire and forget: the report counts channels the frame
//! was offered to and those that could not take it cleanly.

use bytes::Bytes;
use log::debug;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::bucket::DeliveryReport;
use crate::core::registry::{Registry, RegistryStats};
use crate::error::{CometError, Result};
use crate::protocol::{Frame, Operation};

/// Who a push is addressed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushTarget {
    Connection(String),
    Keys(Vec<String>),
    Room(String),
    All,
}

/// One push from the upstream tier
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub target: PushTarget,
    pub payload: Bytes,
}

impl PushRequest {
    pub fn new(target: PushTarget, payload: impl Into<Bytes>) -> Self {
        Self {
            target,
            payload: payload.into(),
        }
    }
}

/// Membership of one room across all buckets
#[derive(Debug, Clone, Serialize)]
pub struct RoomMembership {
    pub room: String,
    pub members: Vec<String>,
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn push_frame(payload: Bytes) -> Frame {
        Frame::new(Operation::Push, 0, payload)
    }

    pub fn push_single(&self, key: &str, payload: impl Into<Bytes>) -> Result<DeliveryReport> {
        self.registry
            .push_to_connection(key, Self::push_frame(payload.into()))
    }

    /// Unknown keys are skipped and simply not counted
    pub fn push_keys(&self, keys: &[String], payload: impl Into<Bytes>) -> Result<DeliveryReport> {
        self.registry
            .push_to_keys(keys, Self::push_frame(payload.into()))
    }

    pub async fn push_room(&self, room: &str, payload: impl Into<Bytes>) -> Result<DeliveryReport> {
        self.registry
            .push_to_room(room, Self::push_frame(payload.into()))
            .await
    }

    pub async fn push_all(&self, payload: impl Into<Bytes>) -> Result<DeliveryReport> {
        self.registry
            .push_to_all(Self::push_frame(payload.into()))
            .await
    }

    pub async fn dispatch(&self, request: PushRequest) -> Result<DeliveryReport> {
        debug!(
            "Dispatching {} byte push to {:?}",
            request.payload.len(),
            request.target
        );
        match request.target {
            PushTarget::Connection(key) => self.push_single(&key, request.payload),
            PushTarget::Keys(keys) => self.push_keys(&keys, request.payload),
            PushTarget::Room(room) => self.push_room(&room, request.payload).await,
            PushTarget::All => self.push_all(request.payload).await,
        }
    }

    pub fn room_membership(&self, room: &str) -> Result<RoomMembership> {
        let mut members = self.registry.room_members(room)?;
        members.sort();
        Ok(RoomMembership {
            room: room.to_string(),
            members,
        })
    }

    /// Online count of every non-empty room
    pub fn rooms(&self) -> Result<HashMap<String, usize>> {
        self.registry.room_counts()
    }

    /// Room the connection is currently in
    pub fn connection_room(&self, key: &str) -> Result<Option<String>> {
        let channel = self
            .registry
            .channel(key)?
            .ok_or_else(|| CometError::NotFound(key.to_string()))?;
        Ok(channel.room())
    }

    pub fn stats(&self) -> Result<RegistryStats> {
        self.registry.aggregate_stats()
    }
}
