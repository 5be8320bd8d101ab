//! Command frames of the routing fabric.
//!
//! Every frame shares one header; the payload shape is selected by the
//! command id. The original inheritance tree (command → group base →
//! concrete command) is flattened into one tagged union here, with
//! encode/decode dispatching on the tag.
//!
//! ```text
//! offset 0 : u32  start_tag
//! offset 4 : u16  client_id   (sender)
//! offset 6 : u8   command_id
//! offset 7 : u32  payload_size
//! offset 11: payload
//! then     : u32  end_tag
//! ```
//!
//! All multi-byte fields little-endian, except the embedded policy blob.

use std::collections::{BTreeMap, BTreeSet};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::events::{EventDeregistration, EventRegistration};
use crate::policy::Policy;
use crate::routing_info::{
    decode_service_record, encode_service_record, RoutingInfoEntry,
};
use crate::send::UserMessage;
use crate::subscribe::{SubscribeRequest, SubscriptionRef, SubscriptionReply};
use crate::types::{
    ClientId, Gid, InstanceId, OfferScope, PendingSecurityUpdateId, RemoteOfferId, ServiceId,
    ServiceRecord, Uid,
};
use crate::{routing_info, wire};

/// Magic opening every frame.
pub const START_TAG: u32 = 0x0767_3767;
/// Magic closing every frame.
pub const END_TAG: u32 = 0x6737_6707;
/// start_tag + client + command id + payload size.
pub const COMMAND_HEADER_SIZE: usize = 11;
/// Size of each tag on the wire.
pub const TAG_SIZE: usize = 4;

/// Codec failure modes.
///
/// Any error aborts the current deserialization; partially parsed state is
/// discarded by construction (decoders build their value last).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("not enough bytes")]
    NotEnoughBytes,
    #[error("maximum command size exceeded")]
    MaxCommandSizeExceeded,
    #[error("start/end tag mismatch")]
    Mismatch,
    #[error("unknown or malformed command")]
    Unknown,
}

/// Wire ids of the command catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandId {
    AssignClient = 0x00,
    AssignClientAck = 0x01,
    RegisterApplication = 0x02,
    DeregisterApplication = 0x03,
    RoutingInfo = 0x04,
    RegisteredAck = 0x05,
    Ping = 0x06,
    Pong = 0x07,
    OfferService = 0x10,
    StopOfferService = 0x11,
    Subscribe = 0x12,
    Unsubscribe = 0x13,
    RequestService = 0x14,
    ReleaseService = 0x15,
    SubscribeNack = 0x16,
    SubscribeAck = 0x17,
    Send = 0x18,
    Notify = 0x19,
    NotifyOne = 0x1A,
    RegisterEvents = 0x1B,
    UnregisterEvent = 0x1C,
    OfferedServicesRequest = 0x1D,
    OfferedServicesResponse = 0x1E,
    UnsubscribeAck = 0x1F,
    ResendProvidedEvents = 0x20,
    UpdateSecurityPolicy = 0x21,
    UpdateSecurityPolicyResponse = 0x22,
    RemoveSecurityPolicy = 0x23,
    RemoveSecurityPolicyResponse = 0x24,
    DistributeSecurityPolicies = 0x25,
    UpdateSecurityCredentials = 0x26,
    Suspend = 0x27,
    Config = 0x28,
    Expire = 0x29,
    UpdateSecurityPolicyInt = 0x2A,
}

impl CommandId {
    #[must_use]
    pub const fn from_wire(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Self::AssignClient,
            0x01 => Self::AssignClientAck,
            0x02 => Self::RegisterApplication,
            0x03 => Self::DeregisterApplication,
            0x04 => Self::RoutingInfo,
            0x05 => Self::RegisteredAck,
            0x06 => Self::Ping,
            0x07 => Self::Pong,
            0x10 => Self::OfferService,
            0x11 => Self::StopOfferService,
            0x12 => Self::Subscribe,
            0x13 => Self::Unsubscribe,
            0x14 => Self::RequestService,
            0x15 => Self::ReleaseService,
            0x16 => Self::SubscribeNack,
            0x17 => Self::SubscribeAck,
            0x18 => Self::Send,
            0x19 => Self::Notify,
            0x1A => Self::NotifyOne,
            0x1B => Self::RegisterEvents,
            0x1C => Self::UnregisterEvent,
            0x1D => Self::OfferedServicesRequest,
            0x1E => Self::OfferedServicesResponse,
            0x1F => Self::UnsubscribeAck,
            0x20 => Self::ResendProvidedEvents,
            0x21 => Self::UpdateSecurityPolicy,
            0x22 => Self::UpdateSecurityPolicyResponse,
            0x23 => Self::RemoveSecurityPolicy,
            0x24 => Self::RemoveSecurityPolicyResponse,
            0x25 => Self::DistributeSecurityPolicies,
            0x26 => Self::UpdateSecurityCredentials,
            0x27 => Self::Suspend,
            0x28 => Self::Config,
            0x29 => Self::Expire,
            0x2A => Self::UpdateSecurityPolicyInt,
            _ => return None,
        })
    }
}

/// One decoded command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    AssignClient { name: String },
    AssignClientAck { assigned: ClientId },
    RegisterApplication { port: u16 },
    DeregisterApplication,
    RoutingInfo { entries: Vec<RoutingInfoEntry> },
    RegisteredAck,
    Ping,
    Pong,
    OfferService { service: ServiceRecord },
    StopOfferService { service: ServiceRecord },
    Subscribe(SubscribeRequest),
    Unsubscribe(SubscriptionRef),
    RequestService { services: BTreeSet<ServiceRecord> },
    ReleaseService { service: ServiceId, instance: InstanceId },
    SubscribeNack(SubscriptionReply),
    SubscribeAck(SubscriptionReply),
    Send(UserMessage),
    Notify(UserMessage),
    NotifyOne(UserMessage),
    RegisterEvents { events: Vec<EventRegistration> },
    UnregisterEvent(EventDeregistration),
    OfferedServicesRequest { scope: OfferScope },
    OfferedServicesResponse { services: BTreeSet<ServiceRecord> },
    UnsubscribeAck {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: u16,
        pending_id: u32,
    },
    ResendProvidedEvents { remote_offer_id: RemoteOfferId },
    UpdateSecurityPolicy {
        update_id: PendingSecurityUpdateId,
        policy: Policy,
    },
    UpdateSecurityPolicyResponse { update_id: PendingSecurityUpdateId },
    RemoveSecurityPolicy {
        update_id: PendingSecurityUpdateId,
        uid: Uid,
        gid: Gid,
    },
    RemoveSecurityPolicyResponse { update_id: PendingSecurityUpdateId },
    DistributeSecurityPolicies { policies: Vec<Policy> },
    UpdateSecurityCredentials { credentials: BTreeSet<(Uid, Gid)> },
    Suspend,
    Config { entries: BTreeMap<String, String> },
    Expire(SubscriptionRef),
    UpdateSecurityPolicyInt {
        update_id: PendingSecurityUpdateId,
        policy: Policy,
    },
}

impl Command {
    /// Wire id of this command.
    #[must_use]
    pub const fn id(&self) -> CommandId {
        match self {
            Self::AssignClient { .. } => CommandId::AssignClient,
            Self::AssignClientAck { .. } => CommandId::AssignClientAck,
            Self::RegisterApplication { .. } => CommandId::RegisterApplication,
            Self::DeregisterApplication => CommandId::DeregisterApplication,
            Self::RoutingInfo { .. } => CommandId::RoutingInfo,
            Self::RegisteredAck => CommandId::RegisteredAck,
            Self::Ping => CommandId::Ping,
            Self::Pong => CommandId::Pong,
            Self::OfferService { .. } => CommandId::OfferService,
            Self::StopOfferService { .. } => CommandId::StopOfferService,
            Self::Subscribe(_) => CommandId::Subscribe,
            Self::Unsubscribe(_) => CommandId::Unsubscribe,
            Self::RequestService { .. } => CommandId::RequestService,
            Self::ReleaseService { .. } => CommandId::ReleaseService,
            Self::SubscribeNack(_) => CommandId::SubscribeNack,
            Self::SubscribeAck(_) => CommandId::SubscribeAck,
            Self::Send(_) => CommandId::Send,
            Self::Notify(_) => CommandId::Notify,
            Self::NotifyOne(_) => CommandId::NotifyOne,
            Self::RegisterEvents { .. } => CommandId::RegisterEvents,
            Self::UnregisterEvent(_) => CommandId::UnregisterEvent,
            Self::OfferedServicesRequest { .. } => CommandId::OfferedServicesRequest,
            Self::OfferedServicesResponse { .. } => CommandId::OfferedServicesResponse,
            Self::UnsubscribeAck { .. } => CommandId::UnsubscribeAck,
            Self::ResendProvidedEvents { .. } => CommandId::ResendProvidedEvents,
            Self::UpdateSecurityPolicy { .. } => CommandId::UpdateSecurityPolicy,
            Self::UpdateSecurityPolicyResponse { .. } => CommandId::UpdateSecurityPolicyResponse,
            Self::RemoveSecurityPolicy { .. } => CommandId::RemoveSecurityPolicy,
            Self::RemoveSecurityPolicyResponse { .. } => CommandId::RemoveSecurityPolicyResponse,
            Self::DistributeSecurityPolicies { .. } => CommandId::DistributeSecurityPolicies,
            Self::UpdateSecurityCredentials { .. } => CommandId::UpdateSecurityCredentials,
            Self::Suspend => CommandId::Suspend,
            Self::Config { .. } => CommandId::Config,
            Self::Expire(_) => CommandId::Expire,
            Self::UpdateSecurityPolicyInt { .. } => CommandId::UpdateSecurityPolicyInt,
        }
    }

    /// Encode this command into a complete wire frame sent by `sender`.
    pub fn encode(&self, sender: ClientId) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(COMMAND_HEADER_SIZE + TAG_SIZE + 32);
        buf.put_u32_le(START_TAG);
        buf.put_u16_le(sender);
        buf.put_u8(self.id() as u8);
        let size_pos = buf.len();
        buf.put_u32_le(0);

        self.encode_payload(&mut buf)?;

        let payload_size = buf.len() - COMMAND_HEADER_SIZE;
        if payload_size > u32::MAX as usize {
            return Err(ProtocolError::MaxCommandSizeExceeded);
        }
        buf[size_pos..size_pos + 4].copy_from_slice(&(payload_size as u32).to_le_bytes());

        buf.put_u32_le(END_TAG);
        Ok(buf.freeze())
    }

    fn encode_payload(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            Self::AssignClient { name } => buf.extend_from_slice(name.as_bytes()),
            Self::AssignClientAck { assigned } => buf.put_u16_le(*assigned),
            Self::RegisterApplication { port } => buf.put_u16_le(*port),
            Self::DeregisterApplication
            | Self::RegisteredAck
            | Self::Ping
            | Self::Pong
            | Self::Suspend => {}
            Self::RoutingInfo { entries } => routing_info::encode_entries(entries, buf),
            Self::OfferService { service } | Self::StopOfferService { service } => {
                encode_service_record(service, buf);
            }
            Self::Subscribe(request) => request.encode(buf),
            Self::Unsubscribe(subscription) | Self::Expire(subscription) => {
                subscription.encode(buf);
            }
            Self::RequestService { services } | Self::OfferedServicesResponse { services } => {
                for service in services {
                    encode_service_record(service, buf);
                }
            }
            Self::ReleaseService { service, instance } => {
                buf.put_u16_le(*service);
                buf.put_u16_le(*instance);
            }
            Self::SubscribeNack(reply) | Self::SubscribeAck(reply) => reply.encode(buf),
            Self::Send(message) | Self::Notify(message) | Self::NotifyOne(message) => {
                message.encode(buf);
            }
            Self::RegisterEvents { events } => {
                buf.put_u16_le(events.len() as u16);
                for event in events {
                    event.encode(buf);
                }
            }
            Self::UnregisterEvent(event) => event.encode(buf),
            Self::OfferedServicesRequest { scope } => buf.put_u8(*scope as u8),
            Self::UnsubscribeAck {
                service,
                instance,
                eventgroup,
                pending_id,
            } => {
                buf.put_u16_le(*service);
                buf.put_u16_le(*instance);
                buf.put_u16_le(*eventgroup);
                buf.put_u32_le(*pending_id);
            }
            Self::ResendProvidedEvents { remote_offer_id } => buf.put_u32_le(*remote_offer_id),
            Self::UpdateSecurityPolicy { update_id, policy }
            | Self::UpdateSecurityPolicyInt { update_id, policy } => {
                buf.put_u32_le(*update_id);
                policy.serialize(buf)?;
            }
            Self::UpdateSecurityPolicyResponse { update_id }
            | Self::RemoveSecurityPolicyResponse { update_id } => buf.put_u32_le(*update_id),
            Self::RemoveSecurityPolicy {
                update_id,
                uid,
                gid,
            } => {
                buf.put_u32_le(*update_id);
                buf.put_u32_le(*uid);
                buf.put_u32_le(*gid);
            }
            Self::DistributeSecurityPolicies { policies } => {
                buf.put_u32_le(policies.len() as u32);
                for policy in policies {
                    let mut blob = BytesMut::new();
                    policy.serialize(&mut blob)?;
                    buf.put_u32_le(blob.len() as u32);
                    buf.extend_from_slice(&blob);
                }
            }
            Self::UpdateSecurityCredentials { credentials } => {
                for (uid, gid) in credentials {
                    buf.put_u32_le(*uid);
                    buf.put_u32_le(*gid);
                }
            }
            Self::Config { entries } => {
                buf.put_u32_le(entries.len() as u32);
                for (key, value) in entries {
                    buf.put_u32_le(key.len() as u32);
                    buf.extend_from_slice(key.as_bytes());
                    buf.put_u32_le(value.len() as u32);
                    buf.extend_from_slice(value.as_bytes());
                }
            }
        }
        Ok(())
    }

    /// Decode the payload of a validated frame.
    pub fn decode_payload(id: CommandId, payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut data = payload;
        let command = match id {
            CommandId::AssignClient => Self::AssignClient {
                name: String::from_utf8(data.to_vec()).map_err(|_| ProtocolError::Unknown)?,
            },
            CommandId::AssignClientAck => {
                let assigned = wire::take_u16(&mut data)?;
                wire::expect_empty(data)?;
                Self::AssignClientAck { assigned }
            }
            CommandId::RegisterApplication => {
                let port = wire::take_u16(&mut data)?;
                wire::expect_empty(data)?;
                Self::RegisterApplication { port }
            }
            CommandId::DeregisterApplication => {
                wire::expect_empty(data)?;
                Self::DeregisterApplication
            }
            CommandId::RoutingInfo => Self::RoutingInfo {
                entries: routing_info::decode_entries(&mut data)?,
            },
            CommandId::RegisteredAck => {
                wire::expect_empty(data)?;
                Self::RegisteredAck
            }
            CommandId::Ping => {
                wire::expect_empty(data)?;
                Self::Ping
            }
            CommandId::Pong => {
                wire::expect_empty(data)?;
                Self::Pong
            }
            CommandId::OfferService => {
                let service = decode_service_record(&mut data)?;
                wire::expect_empty(data)?;
                Self::OfferService { service }
            }
            CommandId::StopOfferService => {
                let service = decode_service_record(&mut data)?;
                wire::expect_empty(data)?;
                Self::StopOfferService { service }
            }
            CommandId::Subscribe => {
                let request = SubscribeRequest::decode(&mut data)?;
                wire::expect_empty(data)?;
                Self::Subscribe(request)
            }
            CommandId::Unsubscribe => {
                let subscription = SubscriptionRef::decode(&mut data)?;
                wire::expect_empty(data)?;
                Self::Unsubscribe(subscription)
            }
            CommandId::Expire => {
                let subscription = SubscriptionRef::decode(&mut data)?;
                wire::expect_empty(data)?;
                Self::Expire(subscription)
            }
            CommandId::RequestService => Self::RequestService {
                services: decode_service_set(&mut data)?,
            },
            CommandId::OfferedServicesResponse => Self::OfferedServicesResponse {
                services: decode_service_set(&mut data)?,
            },
            CommandId::ReleaseService => {
                let service = wire::take_u16(&mut data)?;
                let instance = wire::take_u16(&mut data)?;
                wire::expect_empty(data)?;
                Self::ReleaseService { service, instance }
            }
            CommandId::SubscribeNack => {
                let reply = SubscriptionReply::decode(&mut data)?;
                wire::expect_empty(data)?;
                Self::SubscribeNack(reply)
            }
            CommandId::SubscribeAck => {
                let reply = SubscriptionReply::decode(&mut data)?;
                wire::expect_empty(data)?;
                Self::SubscribeAck(reply)
            }
            CommandId::Send => Self::Send(UserMessage::decode(&mut data)?),
            CommandId::Notify => Self::Notify(UserMessage::decode(&mut data)?),
            CommandId::NotifyOne => Self::NotifyOne(UserMessage::decode(&mut data)?),
            CommandId::RegisterEvents => {
                let count = wire::take_u16(&mut data)? as usize;
                let mut events = Vec::with_capacity(count.min(256));
                for _ in 0..count {
                    events.push(EventRegistration::decode(&mut data)?);
                }
                wire::expect_empty(data)?;
                Self::RegisterEvents { events }
            }
            CommandId::UnregisterEvent => {
                let event = EventDeregistration::decode(&mut data)?;
                wire::expect_empty(data)?;
                Self::UnregisterEvent(event)
            }
            CommandId::OfferedServicesRequest => {
                let scope =
                    OfferScope::from_wire(wire::take_u8(&mut data)?).ok_or(ProtocolError::Unknown)?;
                wire::expect_empty(data)?;
                Self::OfferedServicesRequest { scope }
            }
            CommandId::UnsubscribeAck => {
                let service = wire::take_u16(&mut data)?;
                let instance = wire::take_u16(&mut data)?;
                let eventgroup = wire::take_u16(&mut data)?;
                let pending_id = wire::take_u32(&mut data)?;
                wire::expect_empty(data)?;
                Self::UnsubscribeAck {
                    service,
                    instance,
                    eventgroup,
                    pending_id,
                }
            }
            CommandId::ResendProvidedEvents => {
                let remote_offer_id = wire::take_u32(&mut data)?;
                wire::expect_empty(data)?;
                Self::ResendProvidedEvents { remote_offer_id }
            }
            CommandId::UpdateSecurityPolicy => {
                let (update_id, policy) = decode_policy_update(&mut data)?;
                Self::UpdateSecurityPolicy { update_id, policy }
            }
            CommandId::UpdateSecurityPolicyInt => {
                let (update_id, policy) = decode_policy_update(&mut data)?;
                Self::UpdateSecurityPolicyInt { update_id, policy }
            }
            CommandId::UpdateSecurityPolicyResponse => {
                let update_id = wire::take_u32(&mut data)?;
                wire::expect_empty(data)?;
                Self::UpdateSecurityPolicyResponse { update_id }
            }
            CommandId::RemoveSecurityPolicyResponse => {
                let update_id = wire::take_u32(&mut data)?;
                wire::expect_empty(data)?;
                Self::RemoveSecurityPolicyResponse { update_id }
            }
            CommandId::RemoveSecurityPolicy => {
                let update_id = wire::take_u32(&mut data)?;
                let uid = wire::take_u32(&mut data)?;
                let gid = wire::take_u32(&mut data)?;
                wire::expect_empty(data)?;
                Self::RemoveSecurityPolicy {
                    update_id,
                    uid,
                    gid,
                }
            }
            CommandId::DistributeSecurityPolicies => {
                let count = wire::take_u32(&mut data)? as usize;
                let mut policies = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    let size = wire::take_u32(&mut data)? as usize;
                    let mut blob = wire::take_bytes(&mut data, size)?;
                    let policy = Policy::deserialize(&mut blob)?;
                    if !blob.is_empty() {
                        return Err(ProtocolError::Unknown);
                    }
                    policies.push(policy);
                }
                wire::expect_empty(data)?;
                Self::DistributeSecurityPolicies { policies }
            }
            CommandId::UpdateSecurityCredentials => {
                if data.len() % 8 != 0 {
                    return Err(ProtocolError::Unknown);
                }
                let mut credentials = BTreeSet::new();
                while !data.is_empty() {
                    let uid = wire::take_u32(&mut data)?;
                    let gid = wire::take_u32(&mut data)?;
                    credentials.insert((uid, gid));
                }
                Self::UpdateSecurityCredentials { credentials }
            }
            CommandId::Suspend => {
                wire::expect_empty(data)?;
                Self::Suspend
            }
            CommandId::Config => {
                let count = wire::take_u32(&mut data)? as usize;
                let mut entries = BTreeMap::new();
                for _ in 0..count {
                    let klen = wire::take_u32(&mut data)? as usize;
                    let key = std::str::from_utf8(wire::take_bytes(&mut data, klen)?)
                        .map_err(|_| ProtocolError::Unknown)?
                        .to_string();
                    let vlen = wire::take_u32(&mut data)? as usize;
                    let value = std::str::from_utf8(wire::take_bytes(&mut data, vlen)?)
                        .map_err(|_| ProtocolError::Unknown)?
                        .to_string();
                    entries.insert(key, value);
                }
                wire::expect_empty(data)?;
                Self::Config { entries }
            }
        };
        Ok(command)
    }
}

fn decode_service_set(data: &mut &[u8]) -> Result<BTreeSet<ServiceRecord>, ProtocolError> {
    if data.len() % ServiceRecord::WIRE_SIZE != 0 {
        return Err(ProtocolError::Unknown);
    }
    let mut services = BTreeSet::new();
    while !data.is_empty() {
        services.insert(decode_service_record(data)?);
    }
    Ok(services)
}

fn decode_policy_update(
    data: &mut &[u8],
) -> Result<(PendingSecurityUpdateId, Policy), ProtocolError> {
    let update_id = wire::take_u32(data)?;
    let policy = Policy::deserialize(data)?;
    wire::expect_empty(data)?;
    Ok((update_id, policy))
}
