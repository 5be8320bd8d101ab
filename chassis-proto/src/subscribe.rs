//! Subscription handshake payloads.
//!
//! SUBSCRIBE / UNSUBSCRIBE / EXPIRE share one base layout; ACK and NACK
//! echo the correlating `pending_id` verbatim so the subscriber can match
//! the asynchronous outcome to its request.
//!
//! Base layout keeps a reserved byte between `major` and `event`; the
//! slot is written as zero and ignored on decode.

use bytes::{BufMut, BytesMut};

use crate::command::ProtocolError;
use crate::types::{ClientId, EventId, EventgroupId, InstanceId, MajorVersion, PendingId, ServiceId};
use crate::wire;

/// Identity of one eventgroup subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionRef {
    pub service: ServiceId,
    pub instance: InstanceId,
    pub eventgroup: EventgroupId,
    pub major: MajorVersion,
    pub event: EventId,
    pub pending_id: PendingId,
}

impl SubscriptionRef {
    /// service + instance + eventgroup + major + reserved + event +
    /// pending_id.
    pub const WIRE_SIZE: usize = 14;

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.service);
        buf.put_u16_le(self.instance);
        buf.put_u16_le(self.eventgroup);
        buf.put_u8(self.major);
        buf.put_u8(0); // reserved
        buf.put_u16_le(self.event);
        buf.put_u32_le(self.pending_id);
    }

    pub(crate) fn decode(data: &mut &[u8]) -> Result<Self, ProtocolError> {
        let service = wire::take_u16(data)?;
        let instance = wire::take_u16(data)?;
        let eventgroup = wire::take_u16(data)?;
        let major = wire::take_u8(data)?;
        let _reserved = wire::take_u8(data)?;
        let event = wire::take_u16(data)?;
        let pending_id = wire::take_u32(data)?;
        Ok(Self {
            service,
            instance,
            eventgroup,
            major,
            event,
            pending_id,
        })
    }
}

/// SUBSCRIBE payload: the subscription plus an optional debounce filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub subscription: SubscriptionRef,
    pub filter: Option<DebounceFilter>,
}

impl SubscribeRequest {
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        self.subscription.encode(buf);
        if let Some(filter) = &self.filter {
            filter.encode(buf);
        }
    }

    pub(crate) fn decode(data: &mut &[u8]) -> Result<Self, ProtocolError> {
        let subscription = SubscriptionRef::decode(data)?;
        let filter = if data.is_empty() {
            None
        } else {
            Some(DebounceFilter::decode(data)?)
        };
        Ok(Self {
            subscription,
            filter,
        })
    }
}

/// SUBSCRIBE_ACK / SUBSCRIBE_NACK payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionReply {
    pub service: ServiceId,
    pub instance: InstanceId,
    pub eventgroup: EventgroupId,
    pub subscriber: ClientId,
    pub event: EventId,
    pub pending_id: PendingId,
}

impl SubscriptionReply {
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.service);
        buf.put_u16_le(self.instance);
        buf.put_u16_le(self.eventgroup);
        buf.put_u16_le(self.subscriber);
        buf.put_u16_le(self.event);
        buf.put_u32_le(self.pending_id);
    }

    pub(crate) fn decode(data: &mut &[u8]) -> Result<Self, ProtocolError> {
        Ok(Self {
            service: wire::take_u16(data)?,
            instance: wire::take_u16(data)?,
            eventgroup: wire::take_u16(data)?,
            subscriber: wire::take_u16(data)?,
            event: wire::take_u16(data)?,
            pending_id: wire::take_u32(data)?,
        })
    }
}

/// Per-subscription notification filter.
///
/// A notification is forwarded only when the filter accepts the new
/// payload relative to the last one delivered.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DebounceFilter {
    /// Forward only when the payload changed.
    pub on_change: bool,
    /// A forwarded change restarts the interval clock.
    pub on_change_resets_interval: bool,
    /// Minimum spacing between forwarded notifications, milliseconds.
    pub interval_ms: u32,
    /// Deliver the suppressed current value once the interval elapses.
    pub send_current_value_after: bool,
    /// Byte positions masked out of the change comparison: `(offset, mask)`
    /// pairs; a set mask bit marks a don't-care bit.
    pub ignore: Vec<(u32, u8)>,
}

impl DebounceFilter {
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(self.on_change));
        buf.put_u8(u8::from(self.on_change_resets_interval));
        buf.put_u32_le(self.interval_ms);
        buf.put_u8(u8::from(self.send_current_value_after));
        buf.put_u32_le(self.ignore.len() as u32);
        for &(offset, mask) in &self.ignore {
            buf.put_u32_le(offset);
            buf.put_u8(mask);
        }
    }

    pub(crate) fn decode(data: &mut &[u8]) -> Result<Self, ProtocolError> {
        let on_change = wire::take_bool(data)?;
        let on_change_resets_interval = wire::take_bool(data)?;
        let interval_ms = wire::take_u32(data)?;
        let send_current_value_after = wire::take_bool(data)?;
        let count = wire::take_u32(data)? as usize;
        let mut ignore = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let offset = wire::take_u32(data)?;
            let mask = wire::take_u8(data)?;
            ignore.push((offset, mask));
        }
        Ok(Self {
            on_change,
            on_change_resets_interval,
            interval_ms,
            send_current_value_after,
            ignore,
        })
    }

    /// Decide whether `candidate` should be forwarded given the last
    /// payload that was.
    #[must_use]
    pub fn accepts(&self, last: Option<&[u8]>, candidate: &[u8]) -> bool {
        if !self.on_change {
            return true;
        }
        let Some(last) = last else {
            return true;
        };
        if last.len() != candidate.len() {
            return true;
        }

        for (index, (&a, &b)) in last.iter().zip(candidate.iter()).enumerate() {
            let mask = self
                .ignore
                .iter()
                .find(|&&(offset, _)| offset as usize == index)
                .map_or(0, |&(_, mask)| mask);
            if a | mask != b | mask {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ref() -> SubscriptionRef {
        SubscriptionRef {
            service: 0x1234,
            instance: 0x0001,
            eventgroup: 0x00EE,
            major: 1,
            event: 0x8001,
            pending_id: 42,
        }
    }

    #[test]
    fn subscription_ref_layout() {
        let mut buf = BytesMut::new();
        sample_ref().encode(&mut buf);
        assert_eq!(buf.len(), SubscriptionRef::WIRE_SIZE);
        // reserved byte sits between major and event
        assert_eq!(buf[6], 1);
        assert_eq!(buf[7], 0);
        assert_eq!(&buf[8..10], &[0x01, 0x80]);
    }

    #[test]
    fn subscribe_without_filter_roundtrip() {
        let request = SubscribeRequest {
            subscription: sample_ref(),
            filter: None,
        };
        let mut buf = BytesMut::new();
        request.encode(&mut buf);

        let mut data = &buf[..];
        let decoded = SubscribeRequest::decode(&mut data).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn subscribe_with_filter_roundtrip() {
        let request = SubscribeRequest {
            subscription: sample_ref(),
            filter: Some(DebounceFilter {
                on_change: true,
                on_change_resets_interval: false,
                interval_ms: 50,
                send_current_value_after: true,
                ignore: vec![(0, 0x0F), (3, 0xFF)],
            }),
        };
        let mut buf = BytesMut::new();
        request.encode(&mut buf);

        let mut data = &buf[..];
        let decoded = SubscribeRequest::decode(&mut data).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn filter_passes_everything_when_not_on_change() {
        let filter = DebounceFilter::default();
        assert!(filter.accepts(Some(&[1, 2]), &[1, 2]));
    }

    #[test]
    fn filter_suppresses_unchanged_payload() {
        let filter = DebounceFilter {
            on_change: true,
            ..DebounceFilter::default()
        };
        assert!(!filter.accepts(Some(&[1, 2]), &[1, 2]));
        assert!(filter.accepts(Some(&[1, 2]), &[1, 3]));
        assert!(filter.accepts(None, &[1, 2]));
    }

    #[test]
    fn filter_ignores_masked_bits() {
        let filter = DebounceFilter {
            on_change: true,
            ignore: vec![(1, 0xFF)],
            ..DebounceFilter::default()
        };
        // byte 1 fully masked: change there is not a change
        assert!(!filter.accepts(Some(&[1, 2, 3]), &[1, 9, 3]));
        assert!(filter.accepts(Some(&[1, 2, 3]), &[2, 9, 3]));
    }
}
