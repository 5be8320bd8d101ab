//! Policy store: credential-scoped allow/deny rules over interval sets.
//!
//! Read-heavy: every send, offer and subscribe consults the store, while
//! updates only arrive through UPDATE_SECURITY_POLICY and whitelist
//! reloads. Structure follows that shape — a shared/exclusive lock around
//! the policy list plus a per-principal positive-decision cache.
//!
//! The store is injected as an `Arc<PolicyStore>` into hub and spokes;
//! there is deliberately no process-global instance.

use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use chassis_proto::intervals::IntervalSet;
use chassis_proto::policy::Policy;
use chassis_proto::types::{Gid, InstanceId, MethodId, ServiceId, Uid};

/// Runtime behavior of policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// Policy engine off; everything is allowed silently.
    Disabled,
    /// Decisions are final.
    Enforce,
    /// Decisions are logged but every call returns "allowed".
    Audit,
}

/// Kind tag of a cached positive decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum DecisionKind {
    Request,
    Offer,
}

type DecisionKey = (DecisionKind, ServiceId, InstanceId, MethodId);

#[derive(Default)]
struct StoreInner {
    policies: Vec<Arc<Policy>>,
    /// UIDs allowed to push policy updates at runtime.
    uid_whitelist: IntervalSet<Uid>,
    /// Services updatable through runtime policy updates.
    service_whitelist: IntervalSet<ServiceId>,
    /// Extra credentials accepted for remote clients
    /// (UPDATE_SECURITY_CREDENTIALS).
    remote_credentials: HashSet<(Uid, Gid)>,
    /// Positive decisions per principal; wiped whenever a policy touching
    /// the principal changes.
    cache: HashMap<(Uid, Gid), HashSet<DecisionKey>>,
}

/// Loaded policies plus the update whitelist.
pub struct PolicyStore {
    mode: SecurityMode,
    check_whitelist: bool,
    inner: RwLock<StoreInner>,
}

impl PolicyStore {
    #[must_use]
    pub fn new(mode: SecurityMode, check_whitelist: bool) -> Self {
        Self {
            mode,
            check_whitelist,
            inner: RwLock::new(StoreInner::default()),
        }
    }

    #[must_use]
    pub const fn mode(&self) -> SecurityMode {
        self.mode
    }

    /// Load or replace one policy.
    ///
    /// A policy with the same single `(uid, gid)` replaces the previous
    /// one; the principal's cached decisions are dropped.
    pub fn update_policy(&self, policy: Policy) {
        let mut inner = self.inner.write();
        if let Some(principal) = policy.uid_gid() {
            inner.cache.remove(&principal);
            inner
                .policies
                .retain(|existing| existing.uid_gid() != Some(principal));
        }
        inner.policies.push(Arc::new(policy));
    }

    /// Remove the policy for `(uid, gid)`. Returns whether one existed.
    pub fn remove_policy(&self, uid: Uid, gid: Gid) -> bool {
        let mut inner = self.inner.write();
        inner.cache.remove(&(uid, gid));
        let before = inner.policies.len();
        inner
            .policies
            .retain(|policy| policy.uid_gid() != Some((uid, gid)));
        before != inner.policies.len()
    }

    /// Replace the update whitelist. All cached decisions are dropped.
    pub fn set_whitelist(&self, uids: IntervalSet<Uid>, services: IntervalSet<ServiceId>) {
        let mut inner = self.inner.write();
        inner.uid_whitelist = uids;
        inner.service_whitelist = services;
        inner.cache.clear();
    }

    /// Replace the accepted remote-client credential set.
    pub fn set_remote_credentials(&self, credentials: impl IntoIterator<Item = (Uid, Gid)>) {
        let mut inner = self.inner.write();
        inner.remote_credentials = credentials.into_iter().collect();
    }

    /// Snapshot of the distributable policies (those with a single
    /// principal, the only shape the wire format carries).
    #[must_use]
    pub fn distributable_policies(&self) -> Vec<Policy> {
        self.inner
            .read()
            .policies
            .iter()
            .filter(|policy| policy.uid_gid().is_some())
            .map(|policy| (**policy).clone())
            .collect()
    }

    /// Check whether a connecting client's credentials are acceptable.
    pub fn check_credentials(&self, client: u16, uid: Uid, gid: Gid) -> bool {
        if self.mode == SecurityMode::Disabled {
            return true;
        }

        let inner = self.inner.read();
        let listed = inner.remote_credentials.contains(&(uid, gid))
            || inner
                .policies
                .iter()
                .any(|policy| policy.allow_who && policy.matches_credentials(uid, gid));
        drop(inner);

        if !listed {
            return self.deny(format_args!(
                "credentials uid={uid} gid={gid} of client {client:#06x} not covered by any policy"
            ));
        }
        true
    }

    /// Check a request (method call or service request) against the
    /// loaded policies.
    ///
    /// `is_request_service` relaxes the method match: requesting a service
    /// only needs `(service, instance)` coverage.
    pub fn is_client_allowed(
        &self,
        uid: Uid,
        gid: Gid,
        service: ServiceId,
        instance: InstanceId,
        method: MethodId,
        is_request_service: bool,
    ) -> bool {
        if self.mode == SecurityMode::Disabled {
            return true;
        }

        let key = (DecisionKind::Request, service, instance, method);
        if self.cached(uid, gid, key) {
            return true;
        }

        let allowed = self.search(uid, gid, |policy| {
            let hit = if is_request_service {
                policy.requests.iter().any(|rule| {
                    rule.services.contains(service)
                        && rule.ids.iter().any(|(instances, _)| instances.contains(instance))
                })
            } else {
                policy.matches_request(service, instance, method)
            };
            // An allow policy matches on a positive hit; a deny policy
            // matches when the tuple is absent (empty deny set denies
            // nothing).
            if policy.allow_what {
                hit.then_some(true)
            } else {
                (!hit).then_some(true)
            }
        });

        if allowed {
            self.remember(uid, gid, key);
            return true;
        }
        self.deny(format_args!(
            "request {service:#06x}.{instance:#06x}/{method:#06x} denied for uid={uid} gid={gid}"
        ))
    }

    /// Check an offer against the loaded policies.
    pub fn is_offer_allowed(
        &self,
        uid: Uid,
        gid: Gid,
        service: ServiceId,
        instance: InstanceId,
    ) -> bool {
        if self.mode == SecurityMode::Disabled {
            return true;
        }

        let key = (DecisionKind::Offer, service, instance, 0);
        if self.cached(uid, gid, key) {
            return true;
        }

        let allowed = self.search(uid, gid, |policy| {
            let hit = policy.matches_offer(service, instance);
            if policy.allow_what {
                hit.then_some(true)
            } else {
                (!hit).then_some(true)
            }
        });

        if allowed {
            self.remember(uid, gid, key);
            return true;
        }
        self.deny(format_args!(
            "offer {service:#06x}.{instance:#06x} denied for uid={uid} gid={gid}"
        ))
    }

    /// Gate a runtime policy update against the whitelist.
    pub fn is_policy_update_allowed(&self, uid: Uid, policy: &Policy) -> bool {
        if !self.check_whitelist {
            debug!("policy update from uid={uid} accepted, whitelist check is off");
            return true;
        }

        let inner = self.inner.read();
        if !inner.uid_whitelist.contains(uid) {
            drop(inner);
            return self.deny(format_args!("policy update from uid={uid} not whitelisted"));
        }

        let all_services_listed = policy.requests.iter().all(|rule| {
            rule.services
                .spans()
                .all(|(low, high)| (low..=high).all(|s| inner.service_whitelist.contains(s)))
        });
        drop(inner);

        if !all_services_listed {
            return self.deny(format_args!(
                "policy update from uid={uid} names services outside the whitelist"
            ));
        }
        true
    }

    fn search<F>(&self, uid: Uid, gid: Gid, decide: F) -> bool
    where
        F: Fn(&Policy) -> Option<bool>,
    {
        let inner = self.inner.read();
        for policy in &inner.policies {
            if !policy.matches_credentials(uid, gid) {
                continue;
            }
            if let Some(allowed) = decide(policy) {
                return allowed;
            }
        }
        false
    }

    fn cached(&self, uid: Uid, gid: Gid, key: DecisionKey) -> bool {
        self.inner
            .read()
            .cache
            .get(&(uid, gid))
            .is_some_and(|keys| keys.contains(&key))
    }

    fn remember(&self, uid: Uid, gid: Gid, key: DecisionKey) {
        self.inner
            .write()
            .cache
            .entry((uid, gid))
            .or_default()
            .insert(key);
    }

    /// Central deny path: audit mode turns the denial into a log line.
    fn deny(&self, what: std::fmt::Arguments<'_>) -> bool {
        if self.mode == SecurityMode::Audit {
            info!("security audit: {what}");
            true
        } else {
            warn!("security: {what}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chassis_proto::policy::{OfferRule, RequestRule};

    fn request_policy(uid: Uid, gid: Gid, service: ServiceId) -> Policy {
        let mut policy = Policy::for_principal(uid, gid);
        policy.requests.push(RequestRule {
            services: IntervalSet::single(service),
            ids: vec![(IntervalSet::any(), IntervalSet::any())],
        });
        policy
    }

    #[test]
    fn disabled_mode_allows_everything() {
        let store = PolicyStore::new(SecurityMode::Disabled, false);
        assert!(store.is_client_allowed(1, 1, 0x1234, 1, 1, false));
        assert!(store.is_offer_allowed(1, 1, 0x1234, 1));
    }

    #[test]
    fn allow_policy_matches_listed_request() {
        let store = PolicyStore::new(SecurityMode::Enforce, false);
        store.update_policy(request_policy(1000, 1000, 0x1234));

        assert!(store.is_client_allowed(1000, 1000, 0x1234, 1, 1, false));
        assert!(!store.is_client_allowed(1000, 1000, 0x4321, 1, 1, false));
        assert!(!store.is_client_allowed(2000, 1000, 0x1234, 1, 1, false));
    }

    #[test]
    fn deny_policy_with_empty_set_denies_nothing() {
        let store = PolicyStore::new(SecurityMode::Enforce, false);
        let mut policy = Policy::for_principal(1000, 1000);
        policy.allow_what = false;
        store.update_policy(policy);

        assert!(store.is_client_allowed(1000, 1000, 0x1234, 1, 1, false));
    }

    #[test]
    fn deny_policy_blocks_listed_tuple() {
        let store = PolicyStore::new(SecurityMode::Enforce, false);
        let mut policy = request_policy(1000, 1000, 0x1234);
        policy.allow_what = false;
        store.update_policy(policy);

        assert!(!store.is_client_allowed(1000, 1000, 0x1234, 1, 1, false));
        assert!(store.is_client_allowed(1000, 1000, 0x4321, 1, 1, false));
    }

    #[test]
    fn audit_mode_allows_but_would_deny() {
        let store = PolicyStore::new(SecurityMode::Audit, false);
        assert!(store.is_client_allowed(1000, 1000, 0x1234, 1, 1, false));
    }

    #[test]
    fn offer_check_uses_offer_rules() {
        let store = PolicyStore::new(SecurityMode::Enforce, false);
        let mut policy = Policy::for_principal(1000, 1000);
        policy.offers.push(OfferRule {
            services: IntervalSet::single(0x1001),
            instances: IntervalSet::range(0x0101, 0x1010),
        });
        store.update_policy(policy);

        assert!(store.is_offer_allowed(1000, 1000, 0x1001, 0x0500));
        assert!(!store.is_offer_allowed(1000, 1000, 0x1001, 0x2000));
        assert!(!store.is_offer_allowed(1000, 1000, 0x1002, 0x0500));
    }

    #[test]
    fn update_invalidates_cached_decision() {
        let store = PolicyStore::new(SecurityMode::Enforce, false);
        store.update_policy(request_policy(1000, 1000, 0x1234));
        assert!(store.is_client_allowed(1000, 1000, 0x1234, 1, 1, false));

        // Replacement policy for the same principal covers nothing.
        store.update_policy(Policy::for_principal(1000, 1000));
        assert!(!store.is_client_allowed(1000, 1000, 0x1234, 1, 1, false));
    }

    #[test]
    fn remove_policy_revokes_access() {
        let store = PolicyStore::new(SecurityMode::Enforce, false);
        store.update_policy(request_policy(1000, 1000, 0x1234));
        assert!(store.is_client_allowed(1000, 1000, 0x1234, 1, 1, false));

        assert!(store.remove_policy(1000, 1000));
        assert!(!store.is_client_allowed(1000, 1000, 0x1234, 1, 1, false));
        assert!(!store.remove_policy(1000, 1000));
    }

    #[test]
    fn whitelist_gates_policy_updates() {
        let store = PolicyStore::new(SecurityMode::Enforce, true);
        store.set_whitelist(
            IntervalSet::range(1000, 1999),
            IntervalSet::range(0x1000, 0x1FFF),
        );

        let update = request_policy(1500, 1500, 0x1234);
        assert!(store.is_policy_update_allowed(1500, &update));
        assert!(!store.is_policy_update_allowed(2500, &update));

        let outside = request_policy(1500, 1500, 0x4000);
        assert!(!store.is_policy_update_allowed(1500, &outside));
    }

    /// Whitelist growth is monotone: enabling a UID never turns a prior
    /// allow into a deny.
    #[test]
    fn whitelist_enable_is_monotone() {
        let store = PolicyStore::new(SecurityMode::Enforce, true);
        store.set_whitelist(
            IntervalSet::range(1000, 1999),
            IntervalSet::range(0x1000, 0x1FFF),
        );
        let update = request_policy(1500, 1500, 0x1234);

        let allowed_before: Vec<bool> = (1000..1010)
            .map(|uid| store.is_policy_update_allowed(uid, &update))
            .collect();

        // widen the whitelist by a previously disallowed uid range
        store.set_whitelist(
            IntervalSet::range(500, 1999),
            IntervalSet::range(0x1000, 0x1FFF),
        );

        for (offset, was_allowed) in allowed_before.iter().enumerate() {
            let uid = 1000 + offset as u32;
            if *was_allowed {
                assert!(store.is_policy_update_allowed(uid, &update));
            }
        }
        assert!(store.is_policy_update_allowed(600, &update));
    }

    #[test]
    fn check_credentials_consults_remote_set() {
        let store = PolicyStore::new(SecurityMode::Enforce, false);
        assert!(!store.check_credentials(0x1000, 77, 77));

        store.set_remote_credentials([(77, 77)]);
        assert!(store.check_credentials(0x1000, 77, 77));
    }
}
