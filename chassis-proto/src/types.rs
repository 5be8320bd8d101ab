//! Fixed-width identifiers and shared wire records.
//!
//! Everything here is plain data; the codecs in the sibling modules do the
//! byte work. All identifiers travel little-endian on the wire except
//! inside the policy blob (see `policy`).

/// SOME/IP service identifier.
pub type ServiceId = u16;
/// Service instance identifier.
pub type InstanceId = u16;
/// Eventgroup identifier.
pub type EventgroupId = u16;
/// Event / notifier identifier.
pub type EventId = u16;
/// Method identifier.
pub type MethodId = u16;
/// Fabric-local application identifier, assigned by the hub.
pub type ClientId = u16;
/// Interface major version.
pub type MajorVersion = u8;
/// Interface minor version.
pub type MinorVersion = u32;
/// POSIX user id of a principal.
pub type Uid = u32;
/// POSIX group id of a principal.
pub type Gid = u32;
/// Correlator for asynchronous subscription handshakes.
pub type PendingId = u32;
/// Correlator for asynchronous security-policy updates.
pub type PendingSecurityUpdateId = u32;
/// Correlator for replaying provided events of a remote offer.
pub type RemoteOfferId = u32;

pub const ANY_SERVICE: ServiceId = 0xFFFF;
pub const ANY_INSTANCE: InstanceId = 0xFFFF;
pub const ANY_EVENTGROUP: EventgroupId = 0xFFFF;
pub const ANY_EVENT: EventId = 0xFFFF;
pub const ANY_METHOD: MethodId = 0xFFFF;
pub const ANY_MAJOR: MajorVersion = 0xFF;

pub const CLIENT_UNSET: ClientId = 0x0000;
/// The hub speaks as this client id.
pub const ROUTING_CLIENT: ClientId = 0x0000;
pub const DEFAULT_MAJOR: MajorVersion = 0x00;
pub const DEFAULT_MINOR: MinorVersion = 0x0000_0000;
/// Marks a locally originated subscription (no remote ACK correlation).
pub const PENDING_SUBSCRIPTION_ID: PendingId = 0xFFFF_FFFF;
/// Port placeholder for UDS spokes in REGISTER_APPLICATION.
pub const ILLEGAL_PORT: u16 = 0xFFFF;

/// One offered or requested service version.
///
/// Identity is `(service, instance)`; two records differing only in
/// version are distinct records with the same identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceRecord {
    pub service: ServiceId,
    pub instance: InstanceId,
    pub major: MajorVersion,
    pub minor: MinorVersion,
}

impl ServiceRecord {
    /// Serialized size: service + instance + major + minor.
    pub const WIRE_SIZE: usize = 9;

    #[must_use]
    pub const fn new(
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) -> Self {
        Self {
            service,
            instance,
            major,
            minor,
        }
    }

    /// True when both records name the same `(service, instance)`.
    #[must_use]
    pub const fn same_identity(&self, other: &Self) -> bool {
        self.service == other.service && self.instance == other.instance
    }
}

/// Event kind, as registered by the providing or consuming application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EventKind {
    Event = 0x00,
    Selective = 0x01,
    Field = 0x02,
    #[default]
    Unknown = 0xFF,
}

impl EventKind {
    #[must_use]
    pub const fn from_wire(value: u8) -> Self {
        match value {
            0x00 => Self::Event,
            0x01 => Self::Selective,
            0x02 => Self::Field,
            _ => Self::Unknown,
        }
    }

    /// Fields cache their last payload for late joiners.
    #[must_use]
    pub const fn is_field(&self) -> bool {
        matches!(self, Self::Field)
    }
}

/// Transport reliability requested for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Reliability {
    Reliable = 0x00,
    Unreliable = 0x01,
    Both = 0x02,
    #[default]
    Unknown = 0xFF,
}

impl Reliability {
    #[must_use]
    pub const fn from_wire(value: u8) -> Self {
        match value {
            0x00 => Self::Reliable,
            0x01 => Self::Unreliable,
            0x02 => Self::Both,
            _ => Self::Unknown,
        }
    }
}

/// Scope selector for OFFERED_SERVICES_REQUEST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OfferScope {
    Local = 0x00,
    Remote = 0x01,
    All = 0x02,
}

impl OfferScope {
    #[must_use]
    pub const fn from_wire(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Local),
            0x01 => Some(Self::Remote),
            0x02 => Some(Self::All),
            _ => None,
        }
    }
}

/// Security principal of a connected application.
///
/// UDS spokes are identified by their process credentials, TCP spokes by
/// their socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Principal {
    Credentials { uid: Uid, gid: Gid },
    Address { host: std::net::IpAddr, port: u16 },
}

impl Principal {
    #[must_use]
    pub const fn credentials(uid: Uid, gid: Gid) -> Self {
        Self::Credentials { uid, gid }
    }

    #[must_use]
    pub const fn uid_gid(&self) -> Option<(Uid, Gid)> {
        match self {
            Self::Credentials { uid, gid } => Some((*uid, *gid)),
            Self::Address { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_record_identity_ignores_version() {
        let a = ServiceRecord::new(0x1234, 0x0001, 1, 0);
        let b = ServiceRecord::new(0x1234, 0x0001, 2, 7);
        assert!(a.same_identity(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn event_kind_wire_mapping() {
        assert_eq!(EventKind::from_wire(0x02), EventKind::Field);
        assert_eq!(EventKind::from_wire(0x77), EventKind::Unknown);
        assert!(EventKind::Field.is_field());
        assert!(!EventKind::Event.is_field());
    }

    #[test]
    fn offer_scope_rejects_unknown() {
        assert_eq!(OfferScope::from_wire(2), Some(OfferScope::All));
        assert_eq!(OfferScope::from_wire(3), None);
    }
}
