//! Wire protocol shared by the TCP and WebSocket transports
//!
//! Every frame is length-prefixed so the same bytes can travel over a raw
//! byte stream or inside a WebSocket binary message.

pub mod codec;
pub mod frame;

pub use codec::FrameCodec;
pub use frame::{decode, encode, Frame, FrameError, Operation, HEADER_SIZE, PROTOCOL_VERSION};
