//! Routing-info entry list codec.
//!
//! The hub distributes incremental routing deltas as a list of entries in
//! one ROUTING_INFO frame. Client entries may carry the peer's reachable
//! address in TCP mode; service entries carry the affected service
//! records. The per-entry size field lets a receiver skip entry kinds it
//! does not understand.

use std::net::IpAddr;

use bytes::{BufMut, BytesMut};

use crate::command::ProtocolError;
use crate::types::{ClientId, ServiceRecord};
use crate::wire;

/// Kind discriminator of a routing-info entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RoutingEntryKind {
    AddClient = 0x00,
    DeleteClient = 0x01,
    AddServiceInstance = 0x02,
    DeleteServiceInstance = 0x03,
}

impl RoutingEntryKind {
    #[must_use]
    pub const fn from_wire(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::AddClient),
            0x01 => Some(Self::DeleteClient),
            0x02 => Some(Self::AddServiceInstance),
            0x03 => Some(Self::DeleteServiceInstance),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_client_entry(&self) -> bool {
        matches!(self, Self::AddClient | Self::DeleteClient)
    }
}

/// One incremental routing delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingInfoEntry {
    pub kind: RoutingEntryKind,
    pub client: ClientId,
    /// Reachable address of the client, TCP mode only; never present on
    /// service entries.
    pub address: Option<(IpAddr, u16)>,
    /// Affected service records; empty on client entries.
    pub services: Vec<ServiceRecord>,
}

impl RoutingInfoEntry {
    #[must_use]
    pub fn add_client(client: ClientId, address: Option<(IpAddr, u16)>) -> Self {
        Self {
            kind: RoutingEntryKind::AddClient,
            client,
            address,
            services: Vec::new(),
        }
    }

    #[must_use]
    pub fn delete_client(client: ClientId) -> Self {
        Self {
            kind: RoutingEntryKind::DeleteClient,
            client,
            address: None,
            services: Vec::new(),
        }
    }

    #[must_use]
    pub fn add_service_instance(client: ClientId, service: ServiceRecord) -> Self {
        Self {
            kind: RoutingEntryKind::AddServiceInstance,
            client,
            address: None,
            services: vec![service],
        }
    }

    #[must_use]
    pub fn delete_service_instance(client: ClientId, service: ServiceRecord) -> Self {
        Self {
            kind: RoutingEntryKind::DeleteServiceInstance,
            client,
            address: None,
            services: vec![service],
        }
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        let address_size = match self.address {
            Some((IpAddr::V4(_), _)) => 6,
            Some((IpAddr::V6(_), _)) => 18,
            None => 0,
        };
        let entry_size = 2 + address_size + self.services.len() * ServiceRecord::WIRE_SIZE;

        buf.put_u8(self.kind as u8);
        buf.put_u32_le(entry_size as u32);
        buf.put_u16_le(self.client);

        if let Some((addr, port)) = self.address {
            match addr {
                IpAddr::V4(v4) => buf.extend_from_slice(&v4.octets()),
                IpAddr::V6(v6) => buf.extend_from_slice(&v6.octets()),
            }
            buf.put_u16_le(port);
        }

        for record in &self.services {
            encode_service_record(record, buf);
        }
    }

    pub(crate) fn decode(data: &mut &[u8]) -> Result<Self, ProtocolError> {
        let kind =
            RoutingEntryKind::from_wire(wire::take_u8(data)?).ok_or(ProtocolError::Unknown)?;
        let entry_size = wire::take_u32(data)? as usize;
        let mut entry = wire::take_bytes(data, entry_size)?;

        let client = wire::take_u16(&mut entry)?;

        if kind.is_client_entry() {
            let address = match entry.len() {
                0 => None,
                6 => {
                    let octets: [u8; 4] = wire::take_bytes(&mut entry, 4)?
                        .try_into()
                        .expect("take_bytes yields exactly 4 bytes");
                    let port = wire::take_u16(&mut entry)?;
                    Some((IpAddr::from(octets), port))
                }
                18 => {
                    let octets: [u8; 16] = wire::take_bytes(&mut entry, 16)?
                        .try_into()
                        .expect("take_bytes yields exactly 16 bytes");
                    let port = wire::take_u16(&mut entry)?;
                    Some((IpAddr::from(octets), port))
                }
                _ => return Err(ProtocolError::Unknown),
            };
            return Ok(Self {
                kind,
                client,
                address,
                services: Vec::new(),
            });
        }

        if entry.len() % ServiceRecord::WIRE_SIZE != 0 {
            return Err(ProtocolError::Unknown);
        }
        let mut services = Vec::with_capacity(entry.len() / ServiceRecord::WIRE_SIZE);
        while !entry.is_empty() {
            services.push(decode_service_record(&mut entry)?);
        }

        Ok(Self {
            kind,
            client,
            address: None,
            services,
        })
    }
}

/// Encode a full ROUTING_INFO payload.
pub(crate) fn encode_entries(entries: &[RoutingInfoEntry], buf: &mut BytesMut) {
    for entry in entries {
        entry.encode(buf);
    }
}

/// Decode a full ROUTING_INFO payload.
pub(crate) fn decode_entries(data: &mut &[u8]) -> Result<Vec<RoutingInfoEntry>, ProtocolError> {
    let mut entries = Vec::new();
    while !data.is_empty() {
        entries.push(RoutingInfoEntry::decode(data)?);
    }
    Ok(entries)
}

pub(crate) fn encode_service_record(record: &ServiceRecord, buf: &mut BytesMut) {
    buf.put_u16_le(record.service);
    buf.put_u16_le(record.instance);
    buf.put_u8(record.major);
    buf.put_u32_le(record.minor);
}

pub(crate) fn decode_service_record(data: &mut &[u8]) -> Result<ServiceRecord, ProtocolError> {
    Ok(ServiceRecord {
        service: wire::take_u16(data)?,
        instance: wire::take_u16(data)?,
        major: wire::take_u8(data)?,
        minor: wire::take_u32(data)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn roundtrip(entries: Vec<RoutingInfoEntry>) -> Vec<RoutingInfoEntry> {
        let mut buf = BytesMut::new();
        encode_entries(&entries, &mut buf);
        let mut data = &buf[..];
        let decoded = decode_entries(&mut data).unwrap();
        assert!(data.is_empty());
        decoded
    }

    #[test]
    fn add_client_without_address() {
        let entries = vec![RoutingInfoEntry::add_client(0x1000, None)];
        assert_eq!(roundtrip(entries.clone()), entries);
    }

    #[test]
    fn add_client_with_v4_address() {
        let entries = vec![RoutingInfoEntry::add_client(
            0x1001,
            Some((IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)), 40000)),
        )];
        assert_eq!(roundtrip(entries.clone()), entries);
    }

    #[test]
    fn mixed_entry_list() {
        let entries = vec![
            RoutingInfoEntry::add_client(0x1001, None),
            RoutingInfoEntry::add_service_instance(
                0x1001,
                ServiceRecord::new(0x1234, 0x0001, 1, 0),
            ),
            RoutingInfoEntry::delete_client(0x1002),
        ];
        assert_eq!(roundtrip(entries.clone()), entries);
    }

    #[test]
    fn client_entry_with_bogus_tail_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(RoutingEntryKind::AddClient as u8);
        buf.put_u32_le(5); // client + 3 stray bytes
        buf.put_u16_le(0x1000);
        buf.extend_from_slice(&[1, 2, 3]);

        let mut data = &buf[..];
        assert!(matches!(
            decode_entries(&mut data),
            Err(ProtocolError::Unknown)
        ));
    }

    #[test]
    fn service_entry_with_ragged_records_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(RoutingEntryKind::AddServiceInstance as u8);
        buf.put_u32_le(2 + 5);
        buf.put_u16_le(0x1000);
        buf.extend_from_slice(&[0; 5]);

        let mut data = &buf[..];
        assert!(matches!(
            decode_entries(&mut data),
            Err(ProtocolError::Unknown)
        ));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x09);
        buf.put_u32_le(2);
        buf.put_u16_le(0x1000);

        let mut data = &buf[..];
        assert!(matches!(
            decode_entries(&mut data),
            Err(ProtocolError::Unknown)
        ));
    }
}
