//! Routing manager core.
//!
//! Sans-IO: decoded commands go in, addressed frames and host events come
//! out. The async runtime (`runtime`) owns the sockets, feeds this core
//! and executes its outputs; tests drive it directly.
//!
//! Enforcement at the dispatch boundary:
//! - with credentialed transport, the bound client must match the frame's
//!   sender id;
//! - hub-emitted command kinds (ROUTING_INFO, security broadcasts) are
//!   rejected when they arrive inbound;
//! - remote spokes are only served when `allow_remote_clients` is set.

use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use tracing::{debug, info, warn};

use chassis_core::config::FabricConfig;
use chassis_proto::command::Command;
use chassis_proto::send::UserMessage;
use chassis_proto::subscribe::{SubscriptionRef, SubscriptionReply};
use chassis_proto::types::{
    ClientId, EventgroupId, InstanceId, Principal, ServiceId, ANY_METHOD, CLIENT_UNSET,
    PENDING_SUBSCRIPTION_ID,
};

use crate::security::{IdentityMap, PolicyStore};

use super::subscriptions::{PendingToken, SubscriptionEffect, SubscriptionRegistry};
use super::table::{DeltaBatch, RoutingTable};
use super::watchdog::Watchdog;

/// Outcome of a distributed security update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityUpdateResult {
    Success,
    Timeout,
}

/// Events surfaced to the hosting application (the SD layer and friends).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// A spoke asks for its provided field payloads to be replayed.
    ResendProvidedEvents {
        client: ClientId,
        remote_offer_id: u32,
    },
    /// All surviving clients answered the policy update, or the timer
    /// fired first.
    SecurityUpdateCompleted {
        update_id: u32,
        result: SecurityUpdateResult,
    },
    /// Last remote subscriber left; unsubscribe upstream as the routing
    /// client.
    UpstreamUnsubscribe {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    },
    /// A spoke pushed configuration (e.g. its hostname).
    ConfigurationChanged {
        client: ClientId,
        entries: std::collections::BTreeMap<String, String>,
    },
    /// A spoke suspends its SOME/IP role.
    Suspended { client: ClientId },
}

/// Outputs of one dispatch step.
#[derive(Debug, PartialEq, Eq)]
pub enum HubOutput {
    /// Send on the connection the triggering frame arrived on.
    Reply(Command),
    /// Send to a specific client's connection.
    Frame { target: ClientId, command: Command },
    /// Ask the hosting application whether to accept a subscription; the
    /// answer returns through `complete_subscription`.
    AskSubscription {
        token: PendingToken,
        subscriber: ClientId,
        subscription: SubscriptionRef,
    },
    Host(HostEvent),
}

struct PendingSecurityUpdate {
    requester: ClientId,
    waiting: HashSet<ClientId>,
}

/// The authoritative broker state.
pub struct HubCore {
    config: FabricConfig,
    policy: Arc<PolicyStore>,
    identities: Arc<IdentityMap>,
    table: RoutingTable,
    subscriptions: SubscriptionRegistry,
    watchdog: Watchdog,
    names: HashMap<ClientId, String>,
    used_ids: HashSet<ClientId>,
    pending_updates: HashMap<u32, PendingSecurityUpdate>,
}

impl HubCore {
    #[must_use]
    pub fn new(
        config: FabricConfig,
        policy: Arc<PolicyStore>,
        identities: Arc<IdentityMap>,
    ) -> Self {
        let watchdog = Watchdog::new(config.watchdog_enabled, config.allowed_missing_pongs);
        Self {
            config,
            policy,
            identities,
            table: RoutingTable::new(),
            subscriptions: SubscriptionRegistry::new(),
            watchdog,
            names: HashMap::new(),
            used_ids: HashSet::new(),
            pending_updates: HashMap::new(),
        }
    }

    #[must_use]
    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    #[must_use]
    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    /// Dispatch one inbound command.
    ///
    /// `bound` is the client id the transport authenticated for this
    /// connection (`None` on a fresh, unassigned connection); `remote`
    /// marks cross-host senders.
    pub fn handle_command(
        &mut self,
        bound: Option<ClientId>,
        remote: bool,
        sender: ClientId,
        command: Command,
    ) -> Vec<HubOutput> {
        if remote && !self.config.allow_remote_clients {
            warn!("dropping frame from remote client {sender:#06x}, remote access is off");
            return Vec::new();
        }

        if self.config.check_credentials {
            if let Some(bound) = bound {
                if bound != CLIENT_UNSET && sender != CLIENT_UNSET && bound != sender {
                    warn!(
                        "sender {sender:#06x} does not match bound client {bound:#06x}, dropping"
                    );
                    return Vec::new();
                }
            }
        }

        match command {
            Command::AssignClient { name } => self.on_assign_client(&name),
            Command::AssignClientAck { .. }
            | Command::RoutingInfo { .. }
            | Command::DistributeSecurityPolicies { .. }
            | Command::UpdateSecurityCredentials { .. } => {
                // Hub-emitted kinds; only the routing host may send them.
                warn!(
                    "client {sender:#06x} sent a routing-host command inbound, dropping"
                );
                Vec::new()
            }
            Command::RegisterApplication { port } => self.on_register_application(sender, port),
            Command::RegisteredAck => {
                debug!("client {sender:#06x} confirmed registration");
                Vec::new()
            }
            Command::DeregisterApplication => self.deregister(sender),
            Command::Ping => vec![HubOutput::Reply(Command::Pong)],
            Command::Pong => {
                self.watchdog.on_pong(&mut self.table, sender);
                Vec::new()
            }
            Command::OfferService { service } => self.on_offer_service(sender, service),
            Command::StopOfferService { service } => self
                .table
                .stop_offer_service(sender, service)
                .into_outputs(),
            Command::RequestService { services } => self.on_request_service(sender, services),
            Command::ReleaseService { service, instance } => {
                self.table.release_service(sender, service, instance);
                Vec::new()
            }
            Command::Subscribe(request) => self.on_subscribe(sender, request),
            Command::Unsubscribe(subscription) => self.on_unsubscribe(sender, subscription, true),
            Command::Expire(subscription) => self.on_unsubscribe(sender, subscription, false),
            Command::SubscribeAck(reply) => Self::relay_subscription_reply(
                sender,
                Command::SubscribeAck(reply),
                reply.subscriber,
            ),
            Command::SubscribeNack(reply) => Self::relay_subscription_reply(
                sender,
                Command::SubscribeNack(reply),
                reply.subscriber,
            ),
            Command::UnsubscribeAck { .. } => Vec::new(),
            Command::Send(message) => self.on_send(sender, message),
            Command::Notify(message) => self.on_notify(sender, message, false),
            Command::NotifyOne(message) => self.on_notify(sender, message, true),
            Command::RegisterEvents { events } => self.on_register_events(sender, events),
            Command::UnregisterEvent(event) => {
                self.subscriptions.unregister_event(sender, &event);
                Vec::new()
            }
            Command::OfferedServicesRequest { scope } => {
                vec![HubOutput::Reply(Command::OfferedServicesResponse {
                    services: self.table.offered_services(scope),
                })]
            }
            Command::OfferedServicesResponse { .. } => Vec::new(),
            Command::ResendProvidedEvents { remote_offer_id } => {
                self.on_resend_provided_events(sender, remote_offer_id)
            }
            Command::UpdateSecurityPolicy { update_id, policy } => {
                self.on_update_policy(sender, update_id, policy, false)
            }
            Command::UpdateSecurityPolicyInt { update_id, policy } => {
                self.on_update_policy(sender, update_id, policy, true)
            }
            Command::UpdateSecurityPolicyResponse { update_id } => {
                self.on_update_policy_response(sender, update_id)
            }
            Command::RemoveSecurityPolicy {
                update_id,
                uid,
                gid,
            } => {
                self.policy.remove_policy(uid, gid);
                vec![HubOutput::Reply(Command::RemoveSecurityPolicyResponse {
                    update_id,
                })]
            }
            Command::RemoveSecurityPolicyResponse { .. } => Vec::new(),
            Command::Suspend => vec![HubOutput::Host(HostEvent::Suspended { client: sender })],
            Command::Config { entries } => {
                if let Some(hostname) = entries.get("hostname") {
                    debug!("client {sender:#06x} reports hostname {hostname}");
                }
                vec![HubOutput::Host(HostEvent::ConfigurationChanged {
                    client: sender,
                    entries,
                })]
            }
        }
    }

    /// The hosting application decided a parked subscription.
    pub fn complete_subscription(
        &mut self,
        token: PendingToken,
        accepted: bool,
    ) -> Vec<HubOutput> {
        let effects = self.subscriptions.complete_subscribe(token, accepted);
        self.subscription_effects_to_outputs(effects)
    }

    /// One watchdog half-cycle: pings out, silent clients out.
    pub fn on_watchdog_half_cycle(&mut self) -> Vec<HubOutput> {
        let tick = self.watchdog.on_half_cycle(&mut self.table);
        let mut outputs: Vec<HubOutput> = tick
            .ping_targets
            .into_iter()
            .map(|target| HubOutput::Frame {
                target,
                command: Command::Ping,
            })
            .collect();
        for client in tick.lost {
            outputs.extend(self.handle_client_error(client));
        }
        outputs
    }

    /// Transport failure or watchdog loss: same path as an orderly
    /// deregistration, minus the goodbye.
    pub fn handle_client_error(&mut self, client: ClientId) -> Vec<HubOutput> {
        warn!("client {client:#06x} lost, deregistering on error");
        self.deregister(client)
    }

    /// The security-update timer fired.
    pub fn on_security_update_timeout(&mut self, update_id: u32) -> Vec<HubOutput> {
        let Some(pending) = self.pending_updates.remove(&update_id) else {
            return Vec::new();
        };
        let mut outputs = vec![HubOutput::Host(HostEvent::SecurityUpdateCompleted {
            update_id,
            result: SecurityUpdateResult::Timeout,
        })];
        outputs.push(HubOutput::Frame {
            target: pending.requester,
            command: Command::UpdateSecurityPolicyResponse { update_id },
        });
        outputs
    }

    /// Orderly shutdown: abort parked subscriptions so every caller gets
    /// its NACK.
    pub fn stop(&mut self) -> Vec<HubOutput> {
        let effects = self.subscriptions.cancel_all_pending();
        self.subscription_effects_to_outputs(effects)
    }

    /// A providing spoke answered a subscription; relay its verdict to
    /// the subscriber it names. Replies naming the sender itself are
    /// stray echoes and are dropped.
    fn relay_subscription_reply(
        sender: ClientId,
        command: Command,
        subscriber: ClientId,
    ) -> Vec<HubOutput> {
        if subscriber == sender {
            return Vec::new();
        }
        vec![HubOutput::Frame {
            target: subscriber,
            command,
        }]
    }

    fn on_assign_client(&mut self, name: &str) -> Vec<HubOutput> {
        // A returning application gets its previous id back while that id
        // is not taken by a live client.
        let remembered = self
            .names
            .iter()
            .find(|(id, known)| known.as_str() == name && !self.table.is_registered(**id))
            .map(|(id, _)| *id);

        let assigned = remembered.unwrap_or_else(|| self.next_client_id());
        self.used_ids.insert(assigned);
        self.names.insert(assigned, name.to_string());
        info!("assigned client id {assigned:#06x} to application '{name}'");
        vec![HubOutput::Reply(Command::AssignClientAck { assigned })]
    }

    fn on_register_application(&mut self, client: ClientId, port: u16) -> Vec<HubOutput> {
        let address = match self.identities.principal_of(client) {
            Some(Principal::Address { host, .. }) if port != chassis_proto::types::ILLEGAL_PORT => {
                Some((host, port))
            }
            _ => None,
        };
        self.used_ids.insert(client);
        let mut outputs = self.table.register_client(client, address).into_outputs();

        // A fresh spoke starts with the current policy set.
        if self.config.is_security_enabled {
            let policies = self.policy.distributable_policies();
            if !policies.is_empty() {
                outputs.push(HubOutput::Frame {
                    target: client,
                    command: Command::DistributeSecurityPolicies { policies },
                });
            }
        }
        outputs
    }

    /// Replay the sender's cached field payloads to their subscribers;
    /// the hosting application is told as well so remote offers are
    /// refreshed.
    fn on_resend_provided_events(
        &mut self,
        client: ClientId,
        remote_offer_id: u32,
    ) -> Vec<HubOutput> {
        let mut outputs = Vec::new();
        for ((service, instance, event), payload) in
            self.subscriptions.provided_field_payloads(client)
        {
            let targets = self
                .subscriptions
                .on_notify(service, instance, event, &payload);
            for target in targets {
                if target == client {
                    continue;
                }
                outputs.push(HubOutput::Frame {
                    target,
                    command: Command::Notify(UserMessage {
                        instance,
                        reliable: false,
                        status: 0,
                        target,
                        message: payload.clone(),
                    }),
                });
            }
        }
        outputs.push(HubOutput::Host(HostEvent::ResendProvidedEvents {
            client,
            remote_offer_id,
        }));
        outputs
    }

    /// Host-facing: accept new credentials and distribute them to every
    /// registered spoke.
    pub fn update_security_credentials(
        &mut self,
        credentials: std::collections::BTreeSet<(u32, u32)>,
    ) -> Vec<HubOutput> {
        self.policy.set_remote_credentials(credentials.clone());
        self.table
            .registered_clients()
            .into_iter()
            .map(|target| HubOutput::Frame {
                target,
                command: Command::UpdateSecurityCredentials {
                    credentials: credentials.clone(),
                },
            })
            .collect()
    }

    fn on_offer_service(
        &mut self,
        client: ClientId,
        service: chassis_proto::types::ServiceRecord,
    ) -> Vec<HubOutput> {
        if let Some((uid, gid)) = self.principal_ids(client) {
            if !self
                .policy
                .is_offer_allowed(uid, gid, service.service, service.instance)
            {
                return Vec::new();
            }
        }
        match self.table.offer_service(client, service) {
            Ok(batch) => batch.into_outputs(),
            Err(_) => Vec::new(),
        }
    }

    fn on_request_service(
        &mut self,
        client: ClientId,
        services: std::collections::BTreeSet<chassis_proto::types::ServiceRecord>,
    ) -> Vec<HubOutput> {
        let principal = self.principal_ids(client);
        let allowed = services.into_iter().filter(|record| {
            principal.map_or(true, |(uid, gid)| {
                self.policy.is_client_allowed(
                    uid,
                    gid,
                    record.service,
                    record.instance,
                    ANY_METHOD,
                    true,
                )
            })
        });
        let allowed: Vec<_> = allowed.collect();
        self.table.request_service(client, allowed).into_outputs()
    }

    fn on_subscribe(
        &mut self,
        subscriber: ClientId,
        request: chassis_proto::subscribe::SubscribeRequest,
    ) -> Vec<HubOutput> {
        let subscription = request.subscription;
        if let Some((uid, gid)) = self.principal_ids(subscriber) {
            let allowed = self.policy.is_client_allowed(
                uid,
                gid,
                subscription.service,
                subscription.instance,
                subscription.eventgroup,
                false,
            );
            if !allowed {
                // Denied subscriptions are answered, not dropped: the
                // subscriber must see its NACK.
                return vec![HubOutput::Reply(Command::SubscribeNack(
                    SubscriptionReply {
                        service: subscription.service,
                        instance: subscription.instance,
                        eventgroup: subscription.eventgroup,
                        subscriber,
                        event: subscription.event,
                        pending_id: subscription.pending_id,
                    },
                ))];
            }
        }

        let token = self.subscriptions.begin_subscribe(subscriber, request);
        vec![HubOutput::AskSubscription {
            token,
            subscriber,
            subscription,
        }]
    }

    fn on_unsubscribe(
        &mut self,
        subscriber: ClientId,
        subscription: SubscriptionRef,
        acknowledge: bool,
    ) -> Vec<HubOutput> {
        let effects = self.subscriptions.unsubscribe(subscriber, &subscription);
        let mut outputs = self.subscription_effects_to_outputs(effects);
        if acknowledge && subscription.pending_id != PENDING_SUBSCRIPTION_ID {
            outputs.push(HubOutput::Reply(Command::UnsubscribeAck {
                service: subscription.service,
                instance: subscription.instance,
                eventgroup: subscription.eventgroup,
                pending_id: subscription.pending_id,
            }));
        }
        outputs
    }

    fn on_send(&mut self, sender: ClientId, message: UserMessage) -> Vec<HubOutput> {
        if !message.someip_length_consistent() {
            // TODO: decide whether length-mismatched messages should be
            // rejected at decode instead of dropped here.
            warn!(
                "dropping message from {sender:#06x}: embedded length disagrees with frame size"
            );
            return Vec::new();
        }

        if let Some((uid, gid)) = self.principal_ids(sender) {
            let service = someip_service(&message);
            let method = someip_method(&message);
            if !self
                .policy
                .is_client_allowed(uid, gid, service, message.instance, method, false)
            {
                return Vec::new();
            }
        }

        let target = message.target;
        vec![HubOutput::Frame {
            target,
            command: Command::Send(message),
        }]
    }

    fn on_notify(&mut self, sender: ClientId, message: UserMessage, one: bool) -> Vec<HubOutput> {
        if !message.someip_length_consistent() {
            warn!(
                "dropping notification from {sender:#06x}: embedded length disagrees with frame size"
            );
            return Vec::new();
        }

        if one {
            // NOTIFY_ONE is already addressed.
            let target = message.target;
            return vec![HubOutput::Frame {
                target,
                command: Command::NotifyOne(message),
            }];
        }

        let service = someip_service(&message);
        let event = someip_method(&message);
        let targets =
            self.subscriptions
                .on_notify(service, message.instance, event, &message.message);
        targets
            .into_iter()
            .filter(|target| *target != sender)
            .map(|target| HubOutput::Frame {
                target,
                command: Command::Notify(message.clone()),
            })
            .collect()
    }

    fn on_register_events(
        &mut self,
        client: ClientId,
        events: Vec<chassis_proto::events::EventRegistration>,
    ) -> Vec<HubOutput> {
        let principal = self.principal_ids(client);
        let allowed: Vec<_> = events
            .into_iter()
            .filter(|registration| {
                principal.map_or(true, |(uid, gid)| {
                    if registration.is_provided {
                        self.policy.is_offer_allowed(
                            uid,
                            gid,
                            registration.service,
                            registration.instance,
                        )
                    } else {
                        self.policy.is_client_allowed(
                            uid,
                            gid,
                            registration.service,
                            registration.instance,
                            registration.event,
                            false,
                        )
                    }
                })
            })
            .collect();
        self.subscriptions.register_events(client, &allowed);
        Vec::new()
    }

    fn on_update_policy(
        &mut self,
        sender: ClientId,
        update_id: u32,
        policy: chassis_proto::policy::Policy,
        whitelist_exempt: bool,
    ) -> Vec<HubOutput> {
        if !whitelist_exempt {
            let Some((uid, _)) = self.principal_ids(sender) else {
                warn!("policy update from unidentified client {sender:#06x}, dropping");
                return Vec::new();
            };
            if !self.policy.is_policy_update_allowed(uid, &policy) {
                return Vec::new();
            }
        }

        self.policy.update_policy(policy.clone());

        // Distribute to every other registered client and wait for their
        // confirmations.
        let waiting: HashSet<ClientId> = self
            .table
            .registered_clients()
            .into_iter()
            .filter(|client| *client != sender)
            .collect();

        let mut outputs: Vec<HubOutput> = waiting
            .iter()
            .map(|&target| HubOutput::Frame {
                target,
                command: Command::UpdateSecurityPolicy {
                    update_id,
                    policy: policy.clone(),
                },
            })
            .collect();

        if waiting.is_empty() {
            outputs.push(HubOutput::Reply(Command::UpdateSecurityPolicyResponse {
                update_id,
            }));
            outputs.push(HubOutput::Host(HostEvent::SecurityUpdateCompleted {
                update_id,
                result: SecurityUpdateResult::Success,
            }));
        } else {
            self.pending_updates.insert(
                update_id,
                PendingSecurityUpdate {
                    requester: sender,
                    waiting,
                },
            );
        }
        outputs
    }

    fn on_update_policy_response(&mut self, sender: ClientId, update_id: u32) -> Vec<HubOutput> {
        let Some(pending) = self.pending_updates.get_mut(&update_id) else {
            return Vec::new();
        };
        pending.waiting.remove(&sender);
        if !pending.waiting.is_empty() {
            return Vec::new();
        }
        let pending = self.pending_updates.remove(&update_id).expect("checked above");
        vec![
            HubOutput::Frame {
                target: pending.requester,
                command: Command::UpdateSecurityPolicyResponse { update_id },
            },
            HubOutput::Host(HostEvent::SecurityUpdateCompleted {
                update_id,
                result: SecurityUpdateResult::Success,
            }),
        ]
    }

    fn deregister(&mut self, client: ClientId) -> Vec<HubOutput> {
        let (batch, stopped) = self.table.deregister_client(client);
        let mut outputs = batch.into_outputs();
        if !stopped.is_empty() {
            debug!(
                "fabricated {} stop-offer(s) for departing client {client:#06x}",
                stopped.len()
            );
        }

        let effects = self.subscriptions.drop_client(client);
        outputs.extend(self.subscription_effects_to_outputs(effects));

        self.identities.remove(client);
        self.watchdog.forget(client);
        // The name stays remembered so a returning application can get
        // the same id; the id itself is released.
        self.used_ids.remove(&client);

        // A departing client cannot hold up a policy update.
        let satisfied: Vec<u32> = self
            .pending_updates
            .iter_mut()
            .filter_map(|(update_id, pending)| {
                pending.waiting.remove(&client);
                pending.waiting.is_empty().then_some(*update_id)
            })
            .collect();
        for update_id in satisfied {
            let pending = self.pending_updates.remove(&update_id).expect("just seen");
            outputs.push(HubOutput::Frame {
                target: pending.requester,
                command: Command::UpdateSecurityPolicyResponse { update_id },
            });
            outputs.push(HubOutput::Host(HostEvent::SecurityUpdateCompleted {
                update_id,
                result: SecurityUpdateResult::Success,
            }));
        }

        outputs
    }

    fn subscription_effects_to_outputs(
        &mut self,
        effects: Vec<SubscriptionEffect>,
    ) -> Vec<HubOutput> {
        effects
            .into_iter()
            .map(|effect| match effect {
                SubscriptionEffect::Ack { target, reply } => HubOutput::Frame {
                    target,
                    command: Command::SubscribeAck(reply),
                },
                SubscriptionEffect::Nack { target, reply } => HubOutput::Frame {
                    target,
                    command: Command::SubscribeNack(reply),
                },
                SubscriptionEffect::InitialNotify {
                    target,
                    service: _,
                    instance,
                    event: _,
                    payload,
                } => HubOutput::Frame {
                    target,
                    command: Command::Notify(UserMessage {
                        instance,
                        reliable: false,
                        status: 0,
                        target,
                        message: payload,
                    }),
                },
                SubscriptionEffect::UpstreamUnsubscribe {
                    service,
                    instance,
                    eventgroup,
                } => HubOutput::Host(HostEvent::UpstreamUnsubscribe {
                    service,
                    instance,
                    eventgroup,
                }),
            })
            .collect()
    }

    fn principal_ids(&self, client: ClientId) -> Option<(u32, u32)> {
        self.identities
            .principal_of(client)
            .and_then(|principal| principal.uid_gid())
    }

    fn next_client_id(&mut self) -> ClientId {
        let base = self.config.client_id_base.max(1);
        let mut candidate = base;
        loop {
            if !self.used_ids.contains(&candidate) && !self.table.is_registered(candidate) {
                return candidate;
            }
            candidate = candidate.wrapping_add(1);
            if candidate == CLIENT_UNSET {
                candidate = 1;
            }
            if candidate == base {
                // Full wrap: id space exhausted; reuse the base and let
                // the matching connection fail loudly.
                warn!("client id space exhausted");
                return base;
            }
        }
    }
}

impl DeltaBatch {
    fn into_outputs(self) -> Vec<HubOutput> {
        self.into_frames()
            .map(|(target, entries)| HubOutput::Frame {
                target,
                command: Command::RoutingInfo { entries },
            })
            .collect()
    }
}

fn someip_service(message: &UserMessage) -> ServiceId {
    if message.message.len() >= 2 {
        u16::from_be_bytes([message.message[0], message.message[1]])
    } else {
        0
    }
}

fn someip_method(message: &UserMessage) -> u16 {
    if message.message.len() >= 4 {
        u16::from_be_bytes([message.message[2], message.message[3]])
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::SecurityMode;
    use bytes::{BufMut, Bytes, BytesMut};
    use chassis_proto::routing_info::{RoutingEntryKind, RoutingInfoEntry};
    use chassis_proto::subscribe::SubscribeRequest;
    use chassis_proto::types::ServiceRecord;

    fn hub() -> HubCore {
        HubCore::new(
            FabricConfig::default(),
            Arc::new(PolicyStore::new(SecurityMode::Disabled, false)),
            Arc::new(IdentityMap::new()),
        )
    }

    fn someip(service: ServiceId, method: u16, payload: &[u8]) -> Bytes {
        let mut msg = BytesMut::new();
        msg.put_u16(service);
        msg.put_u16(method);
        msg.put_u32((8 + payload.len()) as u32);
        msg.put_u32(0x0001_0001);
        msg.put_u32(0x0101_0200);
        msg.extend_from_slice(payload);
        msg.freeze()
    }

    fn register(hub: &mut HubCore, client: ClientId) {
        hub.handle_command(None, false, client, Command::RegisterApplication { port: 0xFFFF });
    }

    /// Registration happy path: assign, register, self ADD_CLIENT.
    #[test]
    fn registration_happy_path() {
        let mut hub = hub();

        let outputs = hub.handle_command(
            None,
            false,
            CLIENT_UNSET,
            Command::AssignClient {
                name: "app".to_string(),
            },
        );
        assert_eq!(
            outputs,
            vec![HubOutput::Reply(Command::AssignClientAck {
                assigned: 0x1000
            })]
        );

        let outputs = hub.handle_command(
            None,
            false,
            0x1000,
            Command::RegisterApplication { port: 0xFFFF },
        );
        assert_eq!(
            outputs,
            vec![HubOutput::Frame {
                target: 0x1000,
                command: Command::RoutingInfo {
                    entries: vec![RoutingInfoEntry::add_client(0x1000, None)],
                },
            }]
        );

        assert!(hub
            .handle_command(None, false, 0x1000, Command::RegisteredAck)
            .is_empty());
    }

    #[test]
    fn assigned_ids_do_not_repeat() {
        let mut hub = hub();
        let a = hub.handle_command(
            None,
            false,
            CLIENT_UNSET,
            Command::AssignClient { name: "a".into() },
        );
        let b = hub.handle_command(
            None,
            false,
            CLIENT_UNSET,
            Command::AssignClient { name: "b".into() },
        );
        assert_eq!(
            a,
            vec![HubOutput::Reply(Command::AssignClientAck { assigned: 0x1000 })]
        );
        assert_eq!(
            b,
            vec![HubOutput::Reply(Command::AssignClientAck { assigned: 0x1001 })]
        );
    }

    #[test]
    fn returning_application_gets_its_id_back() {
        let mut hub = hub();
        hub.handle_command(
            None,
            false,
            CLIENT_UNSET,
            Command::AssignClient { name: "a".into() },
        );
        register(&mut hub, 0x1000);
        hub.handle_command(None, false, 0x1000, Command::DeregisterApplication);

        let outputs = hub.handle_command(
            None,
            false,
            CLIENT_UNSET,
            Command::AssignClient { name: "a".into() },
        );
        assert_eq!(
            outputs,
            vec![HubOutput::Reply(Command::AssignClientAck { assigned: 0x1000 })]
        );
    }

    /// Offer / request rendezvous through the dispatch layer.
    #[test]
    fn offer_request_rendezvous() {
        let mut hub = hub();
        register(&mut hub, 0x1001);
        register(&mut hub, 0x1002);

        hub.handle_command(
            None,
            false,
            0x1001,
            Command::OfferService {
                service: ServiceRecord::new(0x1234, 0x0001, 1, 0),
            },
        );
        let outputs = hub.handle_command(
            None,
            false,
            0x1002,
            Command::RequestService {
                services: [ServiceRecord::new(0x1234, 0x0001, 0xFF, 0)]
                    .into_iter()
                    .collect(),
            },
        );

        let to_b = outputs.iter().find_map(|o| match o {
            HubOutput::Frame {
                target: 0x1002,
                command: Command::RoutingInfo { entries },
            } => Some(entries.clone()),
            _ => None,
        });
        let entries = to_b.expect("consumer gets routing info");
        assert_eq!(entries[0].kind, RoutingEntryKind::AddClient);
        assert_eq!(entries[0].client, 0x1001);
        assert_eq!(entries[1].kind, RoutingEntryKind::AddServiceInstance);
        assert_eq!(
            entries[1].services,
            vec![ServiceRecord::new(0x1234, 0x0001, 1, 0)]
        );

        assert!(outputs.iter().any(|o| matches!(
            o,
            HubOutput::Frame {
                target: 0x1001,
                command: Command::RoutingInfo { .. },
            }
        )));
    }

    #[test]
    fn bound_client_mismatch_is_dropped() {
        let mut config = FabricConfig::default();
        config.check_credentials = true;
        let mut hub = HubCore::new(
            config,
            Arc::new(PolicyStore::new(SecurityMode::Disabled, false)),
            Arc::new(IdentityMap::new()),
        );
        register(&mut hub, 0x1001);

        let outputs = hub.handle_command(Some(0x1001), false, 0x1002, Command::Ping);
        assert!(outputs.is_empty());
    }

    #[test]
    fn remote_clients_gated_by_config() {
        let mut hub = hub();
        assert!(hub
            .handle_command(None, true, 0x1001, Command::Ping)
            .is_empty());
    }

    #[test]
    fn inbound_routing_info_is_rejected() {
        let mut hub = hub();
        register(&mut hub, 0x1001);
        let outputs = hub.handle_command(
            None,
            false,
            0x1001,
            Command::RoutingInfo { entries: vec![] },
        );
        assert!(outputs.is_empty());
    }

    #[test]
    fn subscription_is_parked_then_acked() {
        let mut hub = hub();
        register(&mut hub, 0x1001);
        register(&mut hub, 0x1002);

        let subscription = SubscriptionRef {
            service: 0x1234,
            instance: 0x0001,
            eventgroup: 0x00EE,
            major: 1,
            event: chassis_proto::types::ANY_EVENT,
            pending_id: 11,
        };
        let outputs = hub.handle_command(
            None,
            false,
            0x1002,
            Command::Subscribe(SubscribeRequest {
                subscription,
                filter: None,
            }),
        );
        let HubOutput::AskSubscription { token, .. } = outputs[0] else {
            panic!("expected subscription question");
        };

        let outputs = hub.complete_subscription(token, true);
        assert!(outputs.iter().any(|o| matches!(
            o,
            HubOutput::Frame {
                target: 0x1002,
                command: Command::SubscribeAck(reply),
            } if reply.pending_id == 11
        )));
    }

    /// After deregistration no output ever targets the departed client.
    #[test]
    fn no_frames_to_deregistered_client() {
        let mut hub = hub();
        register(&mut hub, 0x1001);
        register(&mut hub, 0x1002);
        hub.handle_command(
            None,
            false,
            0x1001,
            Command::OfferService {
                service: ServiceRecord::new(0x1234, 0x0001, 1, 0),
            },
        );
        hub.handle_command(
            None,
            false,
            0x1002,
            Command::RequestService {
                services: [ServiceRecord::new(0x1234, 0x0001, 0xFF, 0)]
                    .into_iter()
                    .collect(),
            },
        );

        let outputs = hub.handle_command(None, false, 0x1001, Command::DeregisterApplication);
        for output in &outputs {
            if let HubOutput::Frame { target, .. } = output {
                assert_ne!(*target, 0x1001);
            }
        }
        assert!(!hub.table().matrix_mentions(0x1001));

        // watchdog pings no longer include the departed client
        let pings = hub.on_watchdog_half_cycle();
        for output in pings {
            if let HubOutput::Frame { target, .. } = output {
                assert_ne!(target, 0x1001);
            }
        }
    }

    #[test]
    fn notify_fans_out_to_subscribers() {
        let mut hub = hub();
        register(&mut hub, 0x1001);
        register(&mut hub, 0x1002);

        hub.handle_command(
            None,
            false,
            0x1001,
            Command::RegisterEvents {
                events: vec![chassis_proto::events::EventRegistration {
                    service: 0x1234,
                    instance: 0x0001,
                    event: 0x8001,
                    kind: chassis_proto::types::EventKind::Field,
                    is_provided: true,
                    reliability: chassis_proto::types::Reliability::Unreliable,
                    is_cyclic: false,
                    eventgroups: smallvec::smallvec![0x00EE],
                }],
            },
        );
        let outputs = hub.handle_command(
            None,
            false,
            0x1002,
            Command::Subscribe(SubscribeRequest {
                subscription: SubscriptionRef {
                    service: 0x1234,
                    instance: 0x0001,
                    eventgroup: 0x00EE,
                    major: 1,
                    event: chassis_proto::types::ANY_EVENT,
                    pending_id: 1,
                },
                filter: None,
            }),
        );
        let HubOutput::AskSubscription { token, .. } = outputs[0] else {
            panic!("expected subscription question");
        };
        hub.complete_subscription(token, true);

        let message = UserMessage {
            instance: 0x0001,
            reliable: false,
            status: 0,
            target: CLIENT_UNSET,
            message: someip(0x1234, 0x8001, &[0xAA, 0xBB]),
        };
        let outputs = hub.handle_command(None, false, 0x1001, Command::Notify(message));
        assert!(outputs.iter().any(|o| matches!(
            o,
            HubOutput::Frame {
                target: 0x1002,
                command: Command::Notify(_),
            }
        )));
    }

    #[test]
    fn length_mismatch_is_dropped_with_warning() {
        let mut hub = hub();
        register(&mut hub, 0x1001);

        let mut bytes = BytesMut::from(&someip(0x1234, 0x0001, &[1, 2])[..]);
        bytes[5] ^= 0x7F;
        let message = UserMessage {
            instance: 0x0001,
            reliable: true,
            status: 0,
            target: 0x1002,
            message: bytes.freeze(),
        };

        assert!(hub
            .handle_command(None, false, 0x1001, Command::Send(message))
            .is_empty());
    }

    #[test]
    fn security_update_waits_for_all_clients() {
        let mut hub = hub();
        register(&mut hub, 0x1001);
        register(&mut hub, 0x1002);
        register(&mut hub, 0x1003);

        let policy = chassis_proto::policy::Policy::for_principal(1000, 1000);
        let outputs = hub.handle_command(
            None,
            false,
            0x1001,
            Command::UpdateSecurityPolicyInt {
                update_id: 42,
                policy,
            },
        );
        // distributed to the two other clients, no completion yet
        let distributed = outputs
            .iter()
            .filter(|o| {
                matches!(
                    o,
                    HubOutput::Frame {
                        command: Command::UpdateSecurityPolicy { .. },
                        ..
                    }
                )
            })
            .count();
        assert_eq!(distributed, 2);

        assert!(hub
            .handle_command(
                None,
                false,
                0x1002,
                Command::UpdateSecurityPolicyResponse { update_id: 42 }
            )
            .is_empty());
        let outputs = hub.handle_command(
            None,
            false,
            0x1003,
            Command::UpdateSecurityPolicyResponse { update_id: 42 },
        );
        assert!(outputs.contains(&HubOutput::Host(HostEvent::SecurityUpdateCompleted {
            update_id: 42,
            result: SecurityUpdateResult::Success,
        })));
        assert!(outputs.contains(&HubOutput::Frame {
            target: 0x1001,
            command: Command::UpdateSecurityPolicyResponse { update_id: 42 },
        }));
    }

    #[test]
    fn departing_client_cannot_stall_security_update() {
        let mut hub = hub();
        register(&mut hub, 0x1001);
        register(&mut hub, 0x1002);

        let policy = chassis_proto::policy::Policy::for_principal(1000, 1000);
        hub.handle_command(
            None,
            false,
            0x1001,
            Command::UpdateSecurityPolicyInt {
                update_id: 7,
                policy,
            },
        );

        let outputs = hub.handle_command(None, false, 0x1002, Command::DeregisterApplication);
        assert!(outputs.contains(&HubOutput::Host(HostEvent::SecurityUpdateCompleted {
            update_id: 7,
            result: SecurityUpdateResult::Success,
        })));
    }

    #[test]
    fn security_update_timeout_reports_timeout() {
        let mut hub = hub();
        register(&mut hub, 0x1001);
        register(&mut hub, 0x1002);

        let policy = chassis_proto::policy::Policy::for_principal(1000, 1000);
        hub.handle_command(
            None,
            false,
            0x1001,
            Command::UpdateSecurityPolicyInt {
                update_id: 9,
                policy,
            },
        );

        let outputs = hub.on_security_update_timeout(9);
        assert!(outputs.contains(&HubOutput::Host(HostEvent::SecurityUpdateCompleted {
            update_id: 9,
            result: SecurityUpdateResult::Timeout,
        })));
        // late answers are inert
        assert!(hub
            .handle_command(
                None,
                false,
                0x1002,
                Command::UpdateSecurityPolicyResponse { update_id: 9 }
            )
            .is_empty());
    }

    #[test]
    fn resend_provided_events_replays_cached_fields() {
        let mut hub = hub();
        register(&mut hub, 0x1001);
        register(&mut hub, 0x1002);

        hub.handle_command(
            None,
            false,
            0x1001,
            Command::RegisterEvents {
                events: vec![chassis_proto::events::EventRegistration {
                    service: 0x1234,
                    instance: 0x0001,
                    event: 0x8001,
                    kind: chassis_proto::types::EventKind::Field,
                    is_provided: true,
                    reliability: chassis_proto::types::Reliability::Unreliable,
                    is_cyclic: false,
                    eventgroups: smallvec::smallvec![0x00EE],
                }],
            },
        );
        let outputs = hub.handle_command(
            None,
            false,
            0x1002,
            Command::Subscribe(SubscribeRequest {
                subscription: SubscriptionRef {
                    service: 0x1234,
                    instance: 0x0001,
                    eventgroup: 0x00EE,
                    major: 1,
                    event: chassis_proto::types::ANY_EVENT,
                    pending_id: 1,
                },
                filter: None,
            }),
        );
        let HubOutput::AskSubscription { token, .. } = outputs[0] else {
            panic!("expected subscription question");
        };
        hub.complete_subscription(token, true);

        // seed the cached payload through a live notification
        hub.handle_command(
            None,
            false,
            0x1001,
            Command::Notify(UserMessage {
                instance: 0x0001,
                reliable: false,
                status: 0,
                target: CLIENT_UNSET,
                message: someip(0x1234, 0x8001, &[0x11]),
            }),
        );

        let outputs = hub.handle_command(
            None,
            false,
            0x1001,
            Command::ResendProvidedEvents { remote_offer_id: 3 },
        );
        assert!(outputs.contains(&HubOutput::Host(HostEvent::ResendProvidedEvents {
            client: 0x1001,
            remote_offer_id: 3,
        })));
    }

    #[test]
    fn registration_distributes_policies_when_security_is_on() {
        let mut config = FabricConfig::default();
        config.is_security_enabled = true;
        let policy_store = Arc::new(PolicyStore::new(SecurityMode::Audit, false));
        policy_store.update_policy(chassis_proto::policy::Policy::for_principal(1000, 1000));
        let mut hub = HubCore::new(config, policy_store, Arc::new(IdentityMap::new()));

        let outputs =
            hub.handle_command(None, false, 0x1001, Command::RegisterApplication { port: 0xFFFF });
        assert!(outputs.iter().any(|o| matches!(
            o,
            HubOutput::Frame {
                target: 0x1001,
                command: Command::DistributeSecurityPolicies { policies },
            } if policies.len() == 1
        )));
    }

    #[test]
    fn credentials_update_is_broadcast() {
        let mut hub = hub();
        register(&mut hub, 0x1001);
        register(&mut hub, 0x1002);

        let outputs =
            hub.update_security_credentials([(77, 77)].into_iter().collect());
        assert_eq!(outputs.len(), 2);
        assert!(outputs.iter().all(|o| matches!(
            o,
            HubOutput::Frame {
                command: Command::UpdateSecurityCredentials { .. },
                ..
            }
        )));
    }

    #[test]
    fn offered_services_snapshot() {
        let mut hub = hub();
        register(&mut hub, 0x1001);
        hub.handle_command(
            None,
            false,
            0x1001,
            Command::OfferService {
                service: ServiceRecord::new(0x1234, 0x0001, 1, 0),
            },
        );

        let outputs = hub.handle_command(
            None,
            false,
            0x1001,
            Command::OfferedServicesRequest {
                scope: chassis_proto::types::OfferScope::Local,
            },
        );
        assert_eq!(
            outputs,
            vec![HubOutput::Reply(Command::OfferedServicesResponse {
                services: [ServiceRecord::new(0x1234, 0x0001, 1, 0)]
                    .into_iter()
                    .collect(),
            })]
        );
    }
}
