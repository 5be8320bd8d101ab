//! Routing table and connection matrix.
//!
//! The hub owns exactly one of these. Every mutation computes the minimum
//! set of routing-info entries to bring each affected observer up to
//! date; one `DeltaBatch` maps observers to their ordered entry lists and
//! is flushed as one ROUTING_INFO frame per observer.
//!
//! Ordering invariant: for a given observer, the ADD_CLIENT introducing a
//! peer is appended before the first ADD_SERVICE_INSTANCE naming that
//! peer. The batch preserves append order per observer.

use std::collections::BTreeSet;
use std::net::IpAddr;

use hashbrown::{HashMap, HashSet};
use tracing::{debug, warn};

use chassis_proto::routing_info::RoutingInfoEntry;
use chassis_proto::types::{
    ClientId, InstanceId, MajorVersion, MinorVersion, OfferScope, ServiceId, ServiceRecord,
    ANY_INSTANCE, ANY_MAJOR, ANY_SERVICE, DEFAULT_MAJOR, DEFAULT_MINOR,
};

/// Reachable address of a TCP-mode spoke.
pub type PeerAddress = (IpAddr, u16);

type VersionMap = HashMap<InstanceId, (MajorVersion, MinorVersion)>;
type ServiceMap = HashMap<ServiceId, VersionMap>;

/// Per-observer routing-info entries, in emission order.
#[derive(Debug, Default)]
pub struct DeltaBatch {
    per_target: Vec<(ClientId, Vec<RoutingInfoEntry>)>,
}

impl DeltaBatch {
    fn push(&mut self, target: ClientId, entry: RoutingInfoEntry) {
        if let Some((_, entries)) = self.per_target.iter_mut().find(|(t, _)| *t == target) {
            entries.push(entry);
        } else {
            self.per_target.push((target, vec![entry]));
        }
    }

    fn merge(&mut self, other: DeltaBatch) {
        for (target, entries) in other.per_target {
            for entry in entries {
                self.push(target, entry);
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.per_target.is_empty()
    }

    /// Drain as `(observer, entries)` pairs, one ROUTING_INFO each.
    pub fn into_frames(self) -> impl Iterator<Item = (ClientId, Vec<RoutingInfoEntry>)> {
        self.per_target.into_iter()
    }

    #[cfg(test)]
    pub(crate) fn entries_for(&self, target: ClientId) -> &[RoutingInfoEntry] {
        self.per_target
            .iter()
            .find(|(t, _)| *t == target)
            .map_or(&[], |(_, entries)| entries.as_slice())
    }
}

#[derive(Debug, Default)]
struct ClientEntry {
    missed_pongs: u32,
    address: Option<PeerAddress>,
    services: ServiceMap,
}

/// Who offers what, who requested what, and who has been told about whom.
#[derive(Default)]
pub struct RoutingTable {
    clients: HashMap<ClientId, ClientEntry>,
    /// `connection_matrix[observer]` = peers the observer was told about.
    connection_matrix: HashMap<ClientId, HashSet<ClientId>>,
    service_requests: HashMap<ClientId, ServiceMap>,
}

/// Rejection reasons for offers.
#[derive(Debug, PartialEq, Eq)]
pub enum OfferError {
    /// `(service, instance)` already offered by another client.
    AlreadyOffered { by: ClientId },
}

impl RoutingTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `client` and compute its registration reply: the ADD_CLIENT
    /// self-entry first, then a replay of its prior requests against the
    /// current offers.
    pub fn register_client(
        &mut self,
        client: ClientId,
        address: Option<PeerAddress>,
    ) -> DeltaBatch {
        let entry = self.clients.entry(client).or_default();
        entry.address = address;
        entry.missed_pongs = 0;

        let mut batch = DeltaBatch::default();
        batch.push(client, RoutingInfoEntry::add_client(client, None));
        self.connection_matrix.entry(client).or_default().insert(client);

        // Replay requests accumulated before (re-)registration.
        let requested: Vec<ServiceRecord> = self
            .service_requests
            .get(&client)
            .map(requested_records)
            .unwrap_or_default();
        for request in requested {
            batch.merge(self.connect_request_to_offers(client, &request));
        }

        debug!("client {client:#06x} registered");
        batch
    }

    /// Record an offer and connect it to every matching requester.
    pub fn offer_service(
        &mut self,
        client: ClientId,
        record: ServiceRecord,
    ) -> Result<DeltaBatch, OfferError> {
        if let Some((other, _)) = self.find_offerer(record.service, record.instance) {
            if other != client {
                warn!(
                    "rejecting offer of {:#06x}.{:#06x} by {client:#06x}, already offered by {other:#06x}",
                    record.service, record.instance
                );
                return Err(OfferError::AlreadyOffered { by: other });
            }
        }

        self.clients
            .entry(client)
            .or_default()
            .services
            .entry(record.service)
            .or_default()
            .insert(record.instance, (record.major, record.minor));

        let mut batch = DeltaBatch::default();
        let requesters: Vec<ClientId> = self
            .service_requests
            .iter()
            .filter(|(requester, requests)| {
                **requester != client && request_matches(requests, &record)
            })
            .map(|(requester, _)| *requester)
            .collect();

        for requester in requesters {
            self.ensure_known(requester, client, &mut batch);
            batch.push(
                requester,
                RoutingInfoEntry::add_service_instance(client, record),
            );
            // The offerer learns the requester for upstream notification
            // delivery.
            self.ensure_known(client, requester, &mut batch);
        }

        Ok(batch)
    }

    /// Withdraw an offer. The version must match exactly, or be the
    /// DEFAULT wildcard pair.
    pub fn stop_offer_service(&mut self, client: ClientId, record: ServiceRecord) -> DeltaBatch {
        let mut batch = DeltaBatch::default();

        let Some(entry) = self.clients.get_mut(&client) else {
            return batch;
        };
        let Some(instances) = entry.services.get_mut(&record.service) else {
            return batch;
        };
        let wildcard = record.major == DEFAULT_MAJOR && record.minor == DEFAULT_MINOR;
        let removed = match instances.get(&record.instance) {
            Some(&(major, minor))
                if wildcard || (major == record.major && minor == record.minor) =>
            {
                instances.remove(&record.instance);
                Some(ServiceRecord::new(record.service, record.instance, major, minor))
            }
            _ => None,
        };
        if instances.is_empty() {
            entry.services.remove(&record.service);
        }

        let Some(stopped) = removed else {
            return batch;
        };

        for (requester, requests) in &self.service_requests {
            if *requester == client || !request_matches(requests, &stopped) {
                continue;
            }
            batch.push(
                *requester,
                RoutingInfoEntry::delete_service_instance(client, stopped),
            );
        }

        batch
    }

    /// Record requests and connect them to existing offers.
    pub fn request_service(
        &mut self,
        client: ClientId,
        records: impl IntoIterator<Item = ServiceRecord>,
    ) -> DeltaBatch {
        let mut batch = DeltaBatch::default();
        for record in records {
            self.service_requests
                .entry(client)
                .or_default()
                .entry(record.service)
                .or_default()
                .insert(record.instance, (record.major, record.minor));

            batch.merge(self.connect_request_to_offers(client, &record));
        }
        batch
    }

    /// Drop one request.
    pub fn release_service(&mut self, client: ClientId, service: ServiceId, instance: InstanceId) {
        if let Some(requests) = self.service_requests.get_mut(&client) {
            if let Some(instances) = requests.get_mut(&service) {
                instances.remove(&instance);
                if instances.is_empty() {
                    requests.remove(&service);
                }
            }
            if requests.is_empty() {
                self.service_requests.remove(&client);
            }
        }
    }

    /// Remove `client` entirely.
    ///
    /// Fabricates the stop-offers for everything the client still offered
    /// and a DELETE_CLIENT towards every observer that knew it. Matrix
    /// rows and columns disappear in the same call.
    pub fn deregister_client(&mut self, client: ClientId) -> (DeltaBatch, Vec<ServiceRecord>) {
        let mut batch = DeltaBatch::default();

        let stopped: Vec<ServiceRecord> = self
            .clients
            .get(&client)
            .map(|entry| {
                entry
                    .services
                    .iter()
                    .flat_map(|(service, instances)| {
                        instances.iter().map(|(instance, &(major, minor))| {
                            ServiceRecord::new(*service, *instance, major, minor)
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        for record in &stopped {
            for (requester, requests) in &self.service_requests {
                if *requester == client || !request_matches(requests, record) {
                    continue;
                }
                batch.push(
                    *requester,
                    RoutingInfoEntry::delete_service_instance(client, *record),
                );
            }
        }

        let observers: Vec<ClientId> = self
            .connection_matrix
            .iter()
            .filter(|(observer, known)| **observer != client && known.contains(&client))
            .map(|(observer, _)| *observer)
            .collect();
        for observer in observers {
            batch.push(observer, RoutingInfoEntry::delete_client(client));
        }

        self.connection_matrix.remove(&client);
        for known in self.connection_matrix.values_mut() {
            known.remove(&client);
        }
        self.clients.remove(&client);
        self.service_requests.remove(&client);

        debug!("client {client:#06x} deregistered");
        (batch, stopped)
    }

    /// The client currently offering `(service, instance)`, if any.
    #[must_use]
    pub fn find_offerer(
        &self,
        service: ServiceId,
        instance: InstanceId,
    ) -> Option<(ClientId, ServiceRecord)> {
        self.clients.iter().find_map(|(client, entry)| {
            entry.services.get(&service).and_then(|instances| {
                instances.get(&instance).map(|&(major, minor)| {
                    (*client, ServiceRecord::new(service, instance, major, minor))
                })
            })
        })
    }

    /// Snapshot of offers, filtered by scope.
    #[must_use]
    pub fn offered_services(&self, scope: OfferScope) -> BTreeSet<ServiceRecord> {
        self.clients
            .values()
            .filter(|entry| match scope {
                OfferScope::Local => entry.address.is_none(),
                OfferScope::Remote => entry.address.is_some(),
                OfferScope::All => true,
            })
            .flat_map(|entry| {
                entry.services.iter().flat_map(|(service, instances)| {
                    instances.iter().map(|(instance, &(major, minor))| {
                        ServiceRecord::new(*service, *instance, major, minor)
                    })
                })
            })
            .collect()
    }

    #[must_use]
    pub fn is_registered(&self, client: ClientId) -> bool {
        self.clients.contains_key(&client)
    }

    #[must_use]
    pub fn registered_clients(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    /// True when `observer` was told about `peer`.
    #[must_use]
    pub fn knows(&self, observer: ClientId, peer: ClientId) -> bool {
        self.connection_matrix
            .get(&observer)
            .is_some_and(|known| known.contains(&peer))
    }

    /// True when `client` appears anywhere in the connection matrix.
    #[must_use]
    pub fn matrix_mentions(&self, client: ClientId) -> bool {
        self.connection_matrix.contains_key(&client)
            || self
                .connection_matrix
                .values()
                .any(|known| known.contains(&client))
    }

    pub fn increment_missed_pongs(&mut self) {
        for entry in self.clients.values_mut() {
            entry.missed_pongs += 1;
        }
    }

    pub fn reset_missed_pongs(&mut self, client: ClientId) {
        if let Some(entry) = self.clients.get_mut(&client) {
            entry.missed_pongs = 0;
        }
    }

    /// Clients whose silence exceeded the tolerance.
    #[must_use]
    pub fn clients_over_pong_limit(&self, allowed_missing_pongs: u32) -> Vec<ClientId> {
        self.clients
            .iter()
            .filter(|(_, entry)| entry.missed_pongs > allowed_missing_pongs)
            .map(|(client, _)| *client)
            .collect()
    }

    /// Introduce `peer` to `observer` once, address included when known.
    fn ensure_known(&mut self, observer: ClientId, peer: ClientId, batch: &mut DeltaBatch) {
        let newly = self
            .connection_matrix
            .entry(observer)
            .or_default()
            .insert(peer);
        if newly {
            let address = self.clients.get(&peer).and_then(|entry| entry.address);
            batch.push(observer, RoutingInfoEntry::add_client(peer, address));
        }
    }

    /// Entries wiring one request of `client` to the current offers.
    fn connect_request_to_offers(
        &mut self,
        client: ClientId,
        request: &ServiceRecord,
    ) -> DeltaBatch {
        let mut batch = DeltaBatch::default();

        let offers: Vec<(ClientId, ServiceRecord)> = self
            .clients
            .iter()
            .filter(|(offerer, _)| **offerer != client)
            .flat_map(|(offerer, entry)| {
                entry
                    .services
                    .iter()
                    .filter(|(service, _)| {
                        request.service == **service || request.service == ANY_SERVICE
                    })
                    .flat_map(move |(service, instances)| {
                        instances
                            .iter()
                            .filter(|(instance, &(major, _))| {
                                (request.instance == **instance
                                    || request.instance == ANY_INSTANCE)
                                    && (request.major == major || request.major == ANY_MAJOR)
                            })
                            .map(move |(instance, &(major, minor))| {
                                (
                                    *offerer,
                                    ServiceRecord::new(*service, *instance, major, minor),
                                )
                            })
                    })
            })
            .collect();

        for (offerer, record) in offers {
            self.ensure_known(client, offerer, &mut batch);
            batch.push(client, RoutingInfoEntry::add_service_instance(offerer, record));
            self.ensure_known(offerer, client, &mut batch);
        }

        batch
    }
}

fn requested_records(requests: &ServiceMap) -> Vec<ServiceRecord> {
    requests
        .iter()
        .flat_map(|(service, instances)| {
            instances
                .iter()
                .map(|(instance, &(major, minor))| {
                    ServiceRecord::new(*service, *instance, major, minor)
                })
        })
        .collect()
}

fn request_matches(requests: &ServiceMap, record: &ServiceRecord) -> bool {
    let by_service = |service: ServiceId| {
        requests.get(&service).is_some_and(|instances| {
            instances.iter().any(|(instance, &(major, _))| {
                (*instance == record.instance || *instance == ANY_INSTANCE)
                    && (major == record.major || major == ANY_MAJOR)
            })
        })
    };
    by_service(record.service) || by_service(ANY_SERVICE)
}
