//! Streaming codec for byte-stream transports
//!
//! Frames may arrive split across any number of reads; the decoder keeps the
//! partial bytes buffered and yields a frame only once it is complete.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::frame::{check_prefix, parse_packet, Frame, FrameError};
use crate::error::CometError;

#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CometError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CometError> {
        let packet_len = match check_prefix(src, self.max_frame_size) {
            Ok(len) => len,
            Err(FrameError::Truncated { needed, available }) => {
                src.reserve(needed.saturating_sub(available));
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if src.len() < packet_len {
            src.reserve(packet_len - src.len());
            return Ok(None);
        }

        let packet = src.split_to(packet_len).freeze();
        Ok(Some(parse_packet(packet)?))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CometError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CometError> {
        if frame.encoded_len() > self.max_frame_size {
            return Err(FrameError::Oversized {
                declared: frame.encoded_len(),
                max: self.max_frame_size,
            }
            .into());
        }
        frame.encode_into(dst);
        Ok(())
    }
}
