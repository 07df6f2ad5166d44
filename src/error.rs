use std::error::Error;
use std::fmt;
use std::sync::PoisonError;

use crate::protocol::FrameError;

#[derive(Debug)]
pub enum CometError {
    // Wire errors
    Frame(FrameError),
    Protocol(String),

    // Handshake errors
    Auth(String),
    HandshakeTimeout,

    // Channel errors
    HeartbeatTimeout,
    ChannelClosed(String),
    Connection(String),
    Io(std::io::Error),

    // Registry errors
    NotFound(String),
    Draining,
    Lock(String),

    // Collaborator errors
    Upstream(String),
    Discovery(String),
    Serialization(String),

    // Configuration errors
    Config(String),
}

impl CometError {
    /// Whether the caller should retry the operation against another gateway instance
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Draining)
    }
}

impl fmt::Display for CometError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(err) => write!(f, "Frame error: {}", err),
            Self::Protocol(msg) => write!(f, "Protocol violation: {}", msg),
            Self::Auth(msg) => write!(f, "Authentication error: {}", msg),
            Self::HandshakeTimeout => write!(f, "Handshake timed out"),
            Self::HeartbeatTimeout => write!(f, "Heartbeat timed out"),
            Self::ChannelClosed(key) => write!(f, "Channel closed: {}", key),
            Self::Connection(msg) => write!(f, "Connection error: {}", msg),
            Self::Io(err) => write!(f, "I/O error: {}", err),
            Self::NotFound(key) => write!(f, "Connection not found: {}", key),
            Self::Draining => write!(f, "Gateway is draining, retry against another instance"),
            Self::Lock(msg) => write!(f, "Lock error: {}", msg),
            Self::Upstream(msg) => write!(f, "Upstream error: {}", msg),
            Self::Discovery(msg) => write!(f, "Discovery error: {}", msg),
            Self::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Self::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error for CometError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Frame(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<FrameError> for CometError {
    fn from(err: FrameError) -> Self {
        CometError::Frame(err)
    }
}

impl From<std::io::Error> for CometError {
    fn from(err: std::io::Error) -> Self {
        CometError::Io(err)
    }
}

impl From<serde_json::Error> for CometError {
    fn from(err: serde_json::Error) -> Self {
        CometError::Serialization(err.to_string())
    }
}

// Converting from PoisonError to facilitate poisoned mutex handling
impl<T> From<PoisonError<T>> for CometError {
    fn from(err: PoisonError<T>) -> Self {
        CometError::Lock(format!("Mutex poisoned: {}", err))
    }
}

// Generic result type for the gateway
pub type Result<T> = std::result::Result<T, CometError>;
