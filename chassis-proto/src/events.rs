//! Event registration payloads.
//!
//! REGISTER_EVENT batches any number of registrations in one frame; each
//! record carries its own eventgroup list.

use bytes::{BufMut, BytesMut};
use smallvec::SmallVec;

use crate::command::ProtocolError;
use crate::types::{EventId, EventKind, EventgroupId, InstanceId, Reliability, ServiceId};
use crate::wire;

/// One event (or field) registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRegistration {
    pub service: ServiceId,
    pub instance: InstanceId,
    pub event: EventId,
    pub kind: EventKind,
    pub is_provided: bool,
    pub reliability: Reliability,
    pub is_cyclic: bool,
    pub eventgroups: SmallVec<[EventgroupId; 4]>,
}

impl EventRegistration {
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.service);
        buf.put_u16_le(self.instance);
        buf.put_u16_le(self.event);
        buf.put_u8(self.kind as u8);
        buf.put_u8(u8::from(self.is_provided));
        buf.put_u8(self.reliability as u8);
        buf.put_u8(u8::from(self.is_cyclic));
        buf.put_u16_le(self.eventgroups.len() as u16);
        for &eventgroup in &self.eventgroups {
            buf.put_u16_le(eventgroup);
        }
    }

    pub(crate) fn decode(data: &mut &[u8]) -> Result<Self, ProtocolError> {
        let service = wire::take_u16(data)?;
        let instance = wire::take_u16(data)?;
        let event = wire::take_u16(data)?;
        let kind = EventKind::from_wire(wire::take_u8(data)?);
        let is_provided = wire::take_bool(data)?;
        let reliability = Reliability::from_wire(wire::take_u8(data)?);
        let is_cyclic = wire::take_bool(data)?;
        let count = wire::take_u16(data)? as usize;
        let mut eventgroups = SmallVec::with_capacity(count);
        for _ in 0..count {
            eventgroups.push(wire::take_u16(data)?);
        }
        Ok(Self {
            service,
            instance,
            event,
            kind,
            is_provided,
            reliability,
            is_cyclic,
            eventgroups,
        })
    }
}

/// UNREGISTER_EVENT payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventDeregistration {
    pub service: ServiceId,
    pub instance: InstanceId,
    pub event: EventId,
    pub is_provided: bool,
}

impl EventDeregistration {
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.service);
        buf.put_u16_le(self.instance);
        buf.put_u16_le(self.event);
        buf.put_u8(u8::from(self.is_provided));
    }

    pub(crate) fn decode(data: &mut &[u8]) -> Result<Self, ProtocolError> {
        Ok(Self {
            service: wire::take_u16(data)?,
            instance: wire::take_u16(data)?,
            event: wire::take_u16(data)?,
            is_provided: wire::take_bool(data)?,
        })
    }
}
