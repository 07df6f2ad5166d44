//! Rusty Comet - A sharded push gateway implemented in Rust
//!
//! This library holds long-lived client connections over TCP and WebSocket,
//! speaks a small length-prefixed binary protocol, and delivers server-side
//! pushes to single connections, rooms, or every connection.

pub mod auth;
pub mod config;
pub mod constants;
pub mod core;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod protocol;
pub mod shutdown;
pub mod upstream;

// Re-export main components
pub use config::ServerConfig;
pub use constants::*;
pub use error::{CometError, Result};
