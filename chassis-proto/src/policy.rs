//! Security policy model and its big-endian wire format.
//!
//! A policy scopes a credential set (UID/GID intervals) to the requests
//! and offers it allows or denies. Everything else in the command protocol
//! is little-endian; the policy blob alone is big-endian, and that blob is
//! embedded verbatim in the UPDATE_SECURITY_POLICY and
//! DISTRIBUTE_SECURITY_POLICIES payloads.
//!
//! Wire layout:
//!
//! ```text
//! uid u32 · gid u32
//! requests_len u32 · { service u16 · ids_len u32 ·
//!                      { instances: id-item-list · methods: id-item-list } }
//! offers_len   u32 · { service u16 · instances: id-item-list }
//! id-item-list = total_len u32 · { item_len u32 · item_type u32 · payload }
//! ```
//!
//! `item_type == 1` carries a single u16; `item_type == 2` carries
//! `low u16 · high u16` with `low <= high`. A single value of `0` is
//! rejected, and a `[ANY_METHOD, ANY_METHOD]` item is rewritten to
//! `[1, ANY_METHOD]` on decode.

use bytes::{BufMut, BytesMut};

use crate::command::ProtocolError;
use crate::intervals::IntervalSet;
use crate::types::{Gid, InstanceId, MethodId, ServiceId, Uid, ANY_METHOD};

/// Requests covered by one policy entry: service intervals mapped to
/// (instance, method) interval pairs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestRule {
    pub services: IntervalSet<ServiceId>,
    pub ids: Vec<(IntervalSet<InstanceId>, IntervalSet<MethodId>)>,
}

/// Offers covered by one policy entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OfferRule {
    pub services: IntervalSet<ServiceId>,
    pub instances: IntervalSet<InstanceId>,
}

/// One credential-scoped allow/deny policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// `(uid intervals, gid intervals)` pairs this policy applies to.
    pub credentials: Vec<(IntervalSet<Uid>, IntervalSet<Gid>)>,
    /// True: listed credentials are allowed; false: listed credentials are
    /// denied.
    pub allow_who: bool,
    pub requests: Vec<RequestRule>,
    pub offers: Vec<OfferRule>,
    /// True: `requests`/`offers` list what is allowed; false: what is
    /// denied.
    pub allow_what: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            credentials: Vec::new(),
            allow_who: false,
            requests: Vec::new(),
            offers: Vec::new(),
            allow_what: false,
        }
    }
}

impl Policy {
    /// Allow-policy for a single principal, the only shape the wire format
    /// can carry.
    #[must_use]
    pub fn for_principal(uid: Uid, gid: Gid) -> Self {
        Self {
            credentials: vec![(IntervalSet::single(uid), IntervalSet::single(gid))],
            allow_who: true,
            requests: Vec::new(),
            offers: Vec::new(),
            allow_what: true,
        }
    }

    /// The single `(uid, gid)` of this policy, when it has exactly one
    /// single-valued credential pair.
    #[must_use]
    pub fn uid_gid(&self) -> Option<(Uid, Gid)> {
        if self.credentials.len() != 1 {
            return None;
        }
        let (uids, gids) = &self.credentials[0];
        match (single_value(uids), single_value(gids)) {
            (Some(uid), Some(gid)) => Some((uid, gid)),
            _ => None,
        }
    }

    /// True when `(uid, gid)` falls into any credential pair.
    #[must_use]
    pub fn matches_credentials(&self, uid: Uid, gid: Gid) -> bool {
        self.credentials
            .iter()
            .any(|(uids, gids)| uids.contains(uid) && gids.contains(gid))
    }

    /// True when `(service, instance, method)` is listed in `requests`.
    #[must_use]
    pub fn matches_request(
        &self,
        service: ServiceId,
        instance: InstanceId,
        method: MethodId,
    ) -> bool {
        self.requests.iter().any(|rule| {
            rule.services.contains(service)
                && rule
                    .ids
                    .iter()
                    .any(|(instances, methods)| {
                        instances.contains(instance) && methods.contains(method)
                    })
        })
    }

    /// True when `(service, instance)` is listed in `offers`.
    #[must_use]
    pub fn matches_offer(&self, service: ServiceId, instance: InstanceId) -> bool {
        self.offers
            .iter()
            .any(|rule| rule.services.contains(service) && rule.instances.contains(instance))
    }

    /// Serialize into the big-endian policy blob.
    ///
    /// Only policies with exactly one single-valued credential pair are
    /// serializable; anything else never left the configuration files in
    /// the first place.
    pub fn serialize(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let (uid, gid) = self.uid_gid().ok_or(ProtocolError::Unknown)?;
        buf.put_u32(uid);
        buf.put_u32(gid);

        let requests_pos = reserve_len(buf);
        for rule in &self.requests {
            for (low, high) in rule.services.spans() {
                for service in low..=high {
                    buf.put_u16(service);
                    let ids_pos = reserve_len(buf);
                    for (instances, methods) in &rule.ids {
                        serialize_interval_set(instances, buf);
                        serialize_interval_set(methods, buf);
                    }
                    patch_len(buf, ids_pos);
                }
            }
        }
        patch_len(buf, requests_pos);

        let offers_pos = reserve_len(buf);
        for rule in &self.offers {
            for (low, high) in rule.services.spans() {
                for service in low..=high {
                    buf.put_u16(service);
                    serialize_interval_set(&rule.instances, buf);
                }
            }
        }
        patch_len(buf, offers_pos);

        Ok(())
    }

    /// Deserialize a big-endian policy blob, consuming from `data`.
    ///
    /// Deserialized policies are always allow-policies; deny rules exist
    /// only in static configuration.
    pub fn deserialize(data: &mut &[u8]) -> Result<Self, ProtocolError> {
        let uid = take_u32(data)?;
        let gid = take_u32(data)?;

        let mut policy = Policy::for_principal(uid, gid);

        let requests_len = take_u32(data)? as usize;
        let mut remaining = checked_section(data, requests_len)?;
        while remaining > 0 {
            let before = data.len();

            let service = take_service_id(data)?;
            let ids = deserialize_ids(data)?;
            policy.requests.push(RequestRule {
                services: IntervalSet::single(service),
                ids,
            });

            remaining = remaining.saturating_sub(before - data.len());
        }

        let offers_len = take_u32(data)? as usize;
        let mut remaining = checked_section(data, offers_len)?;
        while remaining > 0 {
            let before = data.len();

            let service = take_service_id(data)?;
            let instances = deserialize_id_item_list(data)?;
            policy.offers.push(OfferRule {
                services: IntervalSet::single(service),
                instances,
            });

            remaining = remaining.saturating_sub(before - data.len());
        }

        Ok(policy)
    }
}

fn single_value<T: crate::intervals::IntervalValue>(set: &IntervalSet<T>) -> Option<T> {
    let mut spans = set.spans();
    match (spans.next(), spans.next()) {
        (Some((low, high)), None) if low == high => Some(low),
        _ => None,
    }
}

/// Write a zero length field, returning its position for backpatching.
fn reserve_len(buf: &mut BytesMut) -> usize {
    let pos = buf.len();
    buf.put_u32(0);
    pos
}

/// Backpatch the length field at `pos` with the bytes written since.
fn patch_len(buf: &mut BytesMut, pos: usize) {
    let len = (buf.len() - pos - 4) as u32;
    buf[pos..pos + 4].copy_from_slice(&len.to_be_bytes());
}

fn serialize_interval_set(set: &IntervalSet<u16>, buf: &mut BytesMut) {
    let pos = reserve_len(buf);
    for (low, high) in set.spans() {
        if low == high {
            buf.put_u32(2); // item_len
            buf.put_u32(1); // item_type: single value
            buf.put_u16(low);
        } else {
            buf.put_u32(4);
            buf.put_u32(2); // item_type: interval
            buf.put_u16(low);
            buf.put_u16(high);
        }
    }
    patch_len(buf, pos);
}

fn deserialize_ids(
    data: &mut &[u8],
) -> Result<Vec<(IntervalSet<InstanceId>, IntervalSet<MethodId>)>, ProtocolError> {
    let mut ids = Vec::new();

    let array_len = take_u32(data)? as usize;
    let mut remaining = checked_section(data, array_len)?;
    while remaining > 0 {
        let before = data.len();

        let instances = deserialize_id_item_list(data)?;
        let methods = deserialize_id_item_list(data)?;
        ids.push((instances, methods));

        remaining = remaining.saturating_sub(before - data.len());
    }

    Ok(ids)
}

fn deserialize_id_item_list(data: &mut &[u8]) -> Result<IntervalSet<u16>, ProtocolError> {
    let mut set = IntervalSet::new();

    let list_len = take_u32(data)? as usize;
    let mut remaining = checked_section(data, list_len)?;
    while remaining > 0 {
        let before = data.len();

        let (low, high) = deserialize_id_item(data)?;
        set.insert(low, high);

        remaining = remaining.saturating_sub(before - data.len());
    }

    Ok(set)
}

fn deserialize_id_item(data: &mut &[u8]) -> Result<(u16, u16), ProtocolError> {
    let item_len = take_u32(data)?;
    let item_type = take_u32(data)?;

    let (mut low, high) = match (item_type, item_len) {
        (1, 2) => {
            let value = take_u16(data)?;
            (value, value)
        }
        (2, 4) => {
            let low = take_u16(data)?;
            let high = take_u16(data)?;
            if low > high {
                return Err(ProtocolError::Unknown);
            }
            (low, high)
        }
        _ => return Err(ProtocolError::Unknown),
    };

    // Whole-range items mean "methods 1..ANY", not the literal sentinel.
    if low == ANY_METHOD && high == ANY_METHOD {
        low = 0x01;
    }

    if low == 0x0000 {
        return Err(ProtocolError::Unknown);
    }

    Ok((low, high))
}

fn take_service_id(data: &mut &[u8]) -> Result<ServiceId, ProtocolError> {
    let service = take_u16(data)?;
    if service == 0x0000 || service == 0xFFFF {
        tracing::warn!("rejecting reserved service id {service:#06x} in policy");
        return Err(ProtocolError::Unknown);
    }
    Ok(service)
}

/// Guard a declared section length against the bytes actually available.
fn checked_section(data: &[u8], declared: usize) -> Result<usize, ProtocolError> {
    if declared > data.len() {
        return Err(ProtocolError::NotEnoughBytes);
    }
    Ok(declared)
}

fn take_u16(data: &mut &[u8]) -> Result<u16, ProtocolError> {
    if data.len() < 2 {
        return Err(ProtocolError::NotEnoughBytes);
    }
    let value = u16::from_be_bytes([data[0], data[1]]);
    *data = &data[2..];
    Ok(value)
}

fn take_u32(data: &mut &[u8]) -> Result<u32, ProtocolError> {
    if data.len() < 4 {
        return Err(ProtocolError::NotEnoughBytes);
    }
    let value = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    *data = &data[4..];
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(policy: &Policy) -> Policy {
        let mut buf = BytesMut::new();
        policy.serialize(&mut buf).unwrap();
        let mut data = &buf[..];
        let decoded = Policy::deserialize(&mut data).unwrap();
        assert!(data.is_empty(), "trailing bytes after policy blob");
        decoded
    }

    #[test]
    fn roundtrip_empty_policy() {
        let policy = Policy::for_principal(1000, 1000);
        assert_eq!(roundtrip(&policy), policy);
    }

    #[test]
    fn roundtrip_request_and_offer() {
        // Literal values from the update round-trip scenario.
        let mut policy = Policy::for_principal(0x0102_0304, 0x0506_0708);
        policy.requests.push(RequestRule {
            services: IntervalSet::single(0x1337),
            ids: vec![(
                IntervalSet::range(0x0101, 0x1010),
                IntervalSet::range(0x0202, 0x2020),
            )],
        });
        let mut offer_instances = IntervalSet::range(0x0101, 0x1010);
        offer_instances.insert_value(0x7080);
        policy.offers.push(OfferRule {
            services: IntervalSet::single(0x1001),
            instances: offer_instances,
        });

        assert_eq!(roundtrip(&policy), policy);
    }

    #[test]
    fn uid_gid_big_endian_layout() {
        let policy = Policy::for_principal(0x0102_0304, 0x0506_0708);
        let mut buf = BytesMut::new();
        policy.serialize(&mut buf).unwrap();
        assert_eq!(&buf[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn deserialize_rejects_reserved_service() {
        let mut policy = Policy::for_principal(1, 1);
        policy.requests.push(RequestRule {
            services: IntervalSet::single(0xFFFF),
            ids: vec![(IntervalSet::single(1), IntervalSet::single(1))],
        });
        let mut buf = BytesMut::new();
        policy.serialize(&mut buf).unwrap();

        let mut data = &buf[..];
        assert!(matches!(
            Policy::deserialize(&mut data),
            Err(ProtocolError::Unknown)
        ));
    }

    #[test]
    fn deserialize_rejects_zero_single_value() {
        let mut policy = Policy::for_principal(1, 1);
        policy.offers.push(OfferRule {
            services: IntervalSet::single(0x1001),
            instances: IntervalSet::single(0),
        });
        let mut buf = BytesMut::new();
        policy.serialize(&mut buf).unwrap();

        let mut data = &buf[..];
        assert!(matches!(
            Policy::deserialize(&mut data),
            Err(ProtocolError::Unknown)
        ));
    }

    #[test]
    fn any_method_interval_is_rewritten() {
        let mut policy = Policy::for_principal(1, 1);
        policy.requests.push(RequestRule {
            services: IntervalSet::single(0x1234),
            ids: vec![(
                IntervalSet::single(1),
                IntervalSet::single(ANY_METHOD),
            )],
        });
        let mut buf = BytesMut::new();
        policy.serialize(&mut buf).unwrap();

        let mut data = &buf[..];
        let decoded = Policy::deserialize(&mut data).unwrap();
        assert_eq!(
            decoded.requests[0].ids[0].1,
            IntervalSet::range(0x01, ANY_METHOD)
        );
    }

    #[test]
    fn multi_credential_policy_is_unserializable() {
        let mut policy = Policy::for_principal(1, 1);
        policy
            .credentials
            .push((IntervalSet::single(2), IntervalSet::single(2)));
        let mut buf = BytesMut::new();
        assert!(policy.serialize(&mut buf).is_err());
    }

    #[test]
    fn truncated_blob_is_rejected() {
        let mut policy = Policy::for_principal(1, 1);
        policy.offers.push(OfferRule {
            services: IntervalSet::single(0x1001),
            instances: IntervalSet::single(7),
        });
        let mut buf = BytesMut::new();
        policy.serialize(&mut buf).unwrap();

        let mut data = &buf[..buf.len() - 3];
        assert!(matches!(
            Policy::deserialize(&mut data),
            Err(ProtocolError::NotEnoughBytes)
        ));
    }
}
