//! Core connection state: channels, buckets, the registry and the session driver

pub mod bucket;
pub mod channel;
pub mod registry;
pub mod server;
pub mod session;

// Re-export main components for convenience
pub use bucket::{Bucket, BucketStats, DeliveryReport};
pub use channel::{
    Channel, ChannelSettings, ChannelState, CloseReason, EnqueueOutcome, OverflowPolicy,
};
pub use registry::{shard_index, DrainReport, Registry, RegistryStats};
pub use server::{Gateway, SharedGateway};
pub use session::run_session;
