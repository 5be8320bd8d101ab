//! User-message payloads (SEND / NOTIFY / NOTIFY_ONE).
//!
//! The fabric frames and routes these; the embedded SOME/IP bytes are
//! never interpreted beyond the length consistency check.

use bytes::{BufMut, Bytes, BytesMut};

use crate::command::ProtocolError;
use crate::types::{ClientId, InstanceId};
use crate::wire;

/// Offset of the u32 length field inside a SOME/IP message header.
const SOMEIP_LENGTH_POS: usize = 4;
/// Bytes of the SOME/IP header not covered by its own length field.
const SOMEIP_LENGTH_EXCLUDED: usize = 8;

/// A routed SOME/IP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMessage {
    pub instance: InstanceId,
    pub reliable: bool,
    /// Dispatch status forwarded opaquely between spokes.
    pub status: u8,
    /// Destination client, or `ROUTING_CLIENT` for hub-addressed traffic.
    pub target: ClientId,
    /// Raw SOME/IP message bytes, header included.
    pub message: Bytes,
}

impl UserMessage {
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.instance);
        buf.put_u8(u8::from(self.reliable));
        buf.put_u8(self.status);
        buf.put_u16_le(self.target);
        buf.extend_from_slice(&self.message);
    }

    pub(crate) fn decode(data: &mut &[u8]) -> Result<Self, ProtocolError> {
        let instance = wire::take_u16(data)?;
        let reliable = wire::take_bool(data)?;
        let status = wire::take_u8(data)?;
        let target = wire::take_u16(data)?;
        let message = Bytes::copy_from_slice(data);
        *data = &[];
        Ok(Self {
            instance,
            reliable,
            status,
            target,
            message,
        })
    }

    /// Check the embedded SOME/IP length field against the actual byte
    /// count.
    ///
    /// Messages shorter than a SOME/IP header fail the check outright.
    #[must_use]
    pub fn someip_length_consistent(&self) -> bool {
        if self.message.len() < SOMEIP_LENGTH_POS + 4 {
            return false;
        }
        let declared = u32::from_be_bytes([
            self.message[SOMEIP_LENGTH_POS],
            self.message[SOMEIP_LENGTH_POS + 1],
            self.message[SOMEIP_LENGTH_POS + 2],
            self.message[SOMEIP_LENGTH_POS + 3],
        ]) as usize;
        declared == self.message.len() - SOMEIP_LENGTH_EXCLUDED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn someip_bytes(payload: &[u8]) -> Bytes {
        // message id (4) + length (4) + request id (4) + version/type/code (4)
        let mut msg = BytesMut::new();
        msg.put_u32(0x1234_8001);
        msg.put_u32((8 + payload.len()) as u32);
        msg.put_u32(0x0001_0001);
        msg.put_u32(0x0101_0200);
        msg.extend_from_slice(payload);
        msg.freeze()
    }

    #[test]
    fn roundtrip() {
        let message = UserMessage {
            instance: 0x0001,
            reliable: true,
            status: 0,
            target: 0x1002,
            message: someip_bytes(&[0xAA, 0xBB]),
        };

        let mut buf = BytesMut::new();
        message.encode(&mut buf);

        let mut data = &buf[..];
        let decoded = UserMessage::decode(&mut data).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn length_check_accepts_consistent_message() {
        let message = UserMessage {
            instance: 1,
            reliable: false,
            status: 0,
            target: 0,
            message: someip_bytes(&[1, 2, 3]),
        };
        assert!(message.someip_length_consistent());
    }

    #[test]
    fn length_check_rejects_mismatch() {
        let mut bytes = BytesMut::from(&someip_bytes(&[1, 2, 3])[..]);
        bytes[SOMEIP_LENGTH_POS + 3] ^= 0xFF;
        let message = UserMessage {
            instance: 1,
            reliable: false,
            status: 0,
            target: 0,
            message: bytes.freeze(),
        };
        assert!(!message.someip_length_consistent());
    }

    #[test]
    fn length_check_rejects_short_message() {
        let message = UserMessage {
            instance: 1,
            reliable: false,
            status: 0,
            target: 0,
            message: Bytes::from_static(&[0x00, 0x01]),
        };
        assert!(!message.someip_length_consistent());
    }
}
