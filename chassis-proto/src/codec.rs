//! Stateful command-frame decoder.
//!
//! Fast path:
//! - Entire frame resident → zero-copy payload slice
//!
//! Slow path:
//! - Frame still arriving → `Ok(None)`, caller feeds more bytes
//!
//! Error handling: `Unknown` consumes the offending frame (the stream
//! stays aligned and the caller drops just that frame); `Mismatch` and
//! `MaxCommandSizeExceeded` leave the buffer untouched because the stream
//! cannot be resynchronized — the connection is torn down.

use bytes::Bytes;
use chassis_core::buffer::FrameBuffer;

use crate::command::{
    CommandId, ProtocolError, COMMAND_HEADER_SIZE, END_TAG, START_TAG, TAG_SIZE,
};
use crate::types::ClientId;

/// Default ceiling for one local command frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// A validated frame, payload not yet interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub sender: ClientId,
    pub id: CommandId,
    pub payload: Bytes,
}

/// Incremental decoder over a segmented inbound buffer.
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameDecoder {
    #[must_use]
    pub const fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Decode a single frame from `src`.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` → frame decoded and consumed
    /// - `Ok(None)` → need more data
    /// - `Err` → protocol violation
    pub fn decode(&mut self, src: &mut FrameBuffer) -> Result<Option<RawFrame>, ProtocolError> {
        let mut header = [0u8; COMMAND_HEADER_SIZE];
        if !src.peek(&mut header) {
            return Ok(None);
        }

        let start_tag = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if start_tag != START_TAG {
            return Err(ProtocolError::Mismatch);
        }

        let sender = u16::from_le_bytes([header[4], header[5]]);
        let command = header[6];
        let payload_size =
            u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;

        if payload_size > self.max_frame_size {
            return Err(ProtocolError::MaxCommandSizeExceeded);
        }

        let total = COMMAND_HEADER_SIZE + payload_size + TAG_SIZE;
        if src.len() < total {
            return Ok(None);
        }

        src.discard(COMMAND_HEADER_SIZE);
        let payload = src
            .extract(payload_size)
            .expect("length check guarantees payload bytes");
        let tag = src.extract(TAG_SIZE).expect("length check guarantees tag bytes");
        let end_tag = u32::from_le_bytes([tag[0], tag[1], tag[2], tag[3]]);
        if end_tag != END_TAG {
            return Err(ProtocolError::Mismatch);
        }

        let Some(id) = CommandId::from_wire(command) else {
            // Frame consumed; the stream stays aligned.
            return Err(ProtocolError::Unknown);
        };

        Ok(Some(RawFrame {
            sender,
            id,
            payload,
        }))
    }
}
