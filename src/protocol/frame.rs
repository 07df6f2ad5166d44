//! Frame layout and whole-buffer encode/decode
//!
//! ```text
//! | packet_len u32 | header_len u16 | version u16 | operation u32 | sequence u32 | body ... |
//! ```
//!
//! All integers are big-endian. `packet_len` counts the header and the body.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

pub const PACKET_LEN_SIZE: usize = 4;
pub const HEADER_LEN_SIZE: usize = 2;
pub const VERSION_SIZE: usize = 2;
pub const OPERATION_SIZE: usize = 4;
pub const SEQUENCE_SIZE: usize = 4;
pub const HEADER_SIZE: usize =
    PACKET_LEN_SIZE + HEADER_LEN_SIZE + VERSION_SIZE + OPERATION_SIZE + SEQUENCE_SIZE;

pub const PROTOCOL_VERSION: u16 = 1;

/// Operation codes understood by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Operation {
    Handshake = 0,
    HandshakeAck = 1,
    Heartbeat = 2,
    HeartbeatAck = 3,
    Push = 4,
    PushAck = 5,
    Close = 6,
    RoomJoin = 7,
    RoomJoinAck = 8,
    RoomLeave = 9,
    RoomLeaveAck = 10,
}

impl Operation {
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for Operation {
    type Error = FrameError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        let op = match code {
            0 => Operation::Handshake,
            1 => Operation::HandshakeAck,
            2 => Operation::Heartbeat,
            3 => Operation::HeartbeatAck,
            4 => Operation::Push,
            5 => Operation::PushAck,
            6 => Operation::Close,
            7 => Operation::RoomJoin,
            8 => Operation::RoomJoinAck,
            9 => Operation::RoomLeave,
            10 => Operation::RoomLeaveAck,
            other => return Err(FrameError::UnknownOperation(other)),
        };
        Ok(op)
    }
}

/// Malformed or oversized wire data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Declared packet length exceeds the configured maximum
    Oversized { declared: usize, max: usize },
    /// Buffer ended before the declared packet length
    Truncated { needed: usize, available: usize },
    /// Header length field or packet length is inconsistent
    BadHeader(String),
    /// Operation code is not one of [`Operation`]
    UnknownOperation(u32),
    /// Bytes left over after a complete frame in a single-frame buffer
    TrailingBytes(usize),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oversized { declared, max } => {
                write!(f, "frame of {} bytes exceeds limit of {} bytes", declared, max)
            }
            Self::Truncated { needed, available } => {
                write!(f, "truncated frame: need {} bytes, have {}", needed, available)
            }
            Self::BadHeader(msg) => write!(f, "bad frame header: {}", msg),
            Self::UnknownOperation(code) => write!(f, "unknown operation code {}", code),
            Self::TrailingBytes(n) => write!(f, "{} trailing bytes after frame", n),
        }
    }
}

impl std::error::Error for FrameError {}

/// A decoded wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u16,
    pub op: Operation,
    pub seq: u32,
    pub body: Bytes,
}

impl Frame {
    pub fn new(op: Operation, seq: u32, body: impl Into<Bytes>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            op,
            seq,
            body: body.into(),
        }
    }

    /// Frame with no body
    pub fn empty(op: Operation, seq: u32) -> Self {
        Self::new(op, seq, Bytes::new())
    }

    /// Total encoded length including the header
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }

    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u32(self.encoded_len() as u32);
        dst.put_u16(HEADER_SIZE as u16);
        dst.put_u16(self.version);
        dst.put_u32(self.op.code());
        dst.put_u32(self.seq);
        dst.put_slice(&self.body);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Body interpreted as UTF-8, used for tokens and room ids
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// Encode a frame with the current protocol version
pub fn encode(op: Operation, seq: u32, payload: &[u8]) -> Bytes {
    Frame::new(op, seq, Bytes::copy_from_slice(payload)).to_bytes()
}

/// Decode exactly one frame occupying the whole buffer
pub fn decode(buf: &[u8], max_frame_size: usize) -> Result<Frame, FrameError> {
    let packet_len = check_prefix(buf, max_frame_size)?;
    if buf.len() < packet_len {
        return Err(FrameError::Truncated {
            needed: packet_len,
            available: buf.len(),
        });
    }
    if buf.len() > packet_len {
        return Err(FrameError::TrailingBytes(buf.len() - packet_len));
    }
    parse_packet(Bytes::copy_from_slice(buf))
}

/// Validate the length prefix and header length of a (possibly partial) buffer.
///
/// Returns the declared packet length. Requires at least [`HEADER_SIZE`] bytes.
pub(crate) fn check_prefix(buf: &[u8], max_frame_size: usize) -> Result<usize, FrameError> {
    if buf.len() < PACKET_LEN_SIZE {
        return Err(FrameError::Truncated {
            needed: HEADER_SIZE,
            available: buf.len(),
        });
    }
    let mut cursor = buf;
    let packet_len = cursor.get_u32() as usize;
    if packet_len > max_frame_size {
        return Err(FrameError::Oversized {
            declared: packet_len,
            max: max_frame_size,
        });
    }
    if packet_len < HEADER_SIZE {
        return Err(FrameError::BadHeader(format!(
            "packet length {} shorter than header",
            packet_len
        )));
    }
    if buf.len() < HEADER_SIZE {
        return Err(FrameError::Truncated {
            needed: HEADER_SIZE,
            available: buf.len(),
        });
    }
    let header_len = cursor.get_u16() as usize;
    if header_len != HEADER_SIZE {
        return Err(FrameError::BadHeader(format!(
            "header length {} (expected {})",
            header_len, HEADER_SIZE
        )));
    }
    Ok(packet_len)
}

/// Parse a buffer holding exactly one validated packet
pub(crate) fn parse_packet(mut packet: Bytes) -> Result<Frame, FrameError> {
    packet.advance(PACKET_LEN_SIZE + HEADER_LEN_SIZE);
    let version = packet.get_u16();
    let op = Operation::try_from(packet.get_u32())?;
    let seq = packet.get_u32();
    Ok(Frame {
        version,
        op,
        seq,
        body: packet,
    })
}
