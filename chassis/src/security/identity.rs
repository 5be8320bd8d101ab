//! Client ↔ principal bookkeeping.
//!
//! The hub learns each spoke's principal (socket credentials for UDS,
//! address/port for TCP) at accept time and needs both directions: policy
//! checks look up the principal of a client id, teardown after a policy
//! removal finds every client of a principal.

use dashmap::DashMap;
use hashbrown::HashSet;
use tracing::warn;

use chassis_proto::types::{ClientId, Principal};

/// Bidirectional, concurrently updated identity map.
#[derive(Default)]
pub struct IdentityMap {
    by_client: DashMap<ClientId, Principal>,
    by_principal: DashMap<Principal, HashSet<ClientId>>,
}

impl IdentityMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `client` to `principal`. An existing binding is overwritten
    /// with a warning; the reverse index stays symmetric.
    pub fn store(&self, client: ClientId, principal: Principal) {
        if let Some(previous) = self.by_client.insert(client, principal) {
            if previous != principal {
                warn!(
                    client = format!("{client:#06x}"),
                    "client rebound to a different principal, overwriting"
                );
                if let Some(mut clients) = self.by_principal.get_mut(&previous) {
                    clients.remove(&client);
                }
            }
        }
        self.by_principal.entry(principal).or_default().insert(client);
    }

    #[must_use]
    pub fn principal_of(&self, client: ClientId) -> Option<Principal> {
        self.by_client.get(&client).map(|entry| *entry.value())
    }

    #[must_use]
    pub fn clients_of(&self, principal: &Principal) -> Vec<ClientId> {
        self.by_principal
            .get(principal)
            .map(|entry| entry.value().iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drop the binding of `client` from both directions.
    pub fn remove(&self, client: ClientId) {
        if let Some((_, principal)) = self.by_client.remove(&client) {
            let emptied = self
                .by_principal
                .get_mut(&principal)
                .map(|mut clients| {
                    clients.remove(&client);
                    clients.is_empty()
                })
                .unwrap_or(false);
            if emptied {
                self.by_principal.remove(&principal);
            }
        }
    }
}
