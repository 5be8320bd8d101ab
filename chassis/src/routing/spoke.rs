//! Routing client (spoke) core.
//!
//! The per-application façade to the hub. Sans-IO like the hub core: the
//! runtime feeds decoded commands, ticks and transport events, and
//! executes the returned actions. Application calls made before the spoke
//! reaches REGISTERED land in pending queues and are flushed on entry;
//! `request_service` calls are debounced into batched REQUEST_SERVICE
//! frames.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tracing::{debug, trace};

use chassis_proto::command::Command;
use chassis_proto::events::EventRegistration;
use chassis_proto::routing_info::{RoutingEntryKind, RoutingInfoEntry};
use chassis_proto::send::UserMessage;
use chassis_proto::subscribe::{SubscribeRequest, SubscriptionRef};
use chassis_proto::types::{ClientId, ServiceRecord};

use crate::security::PolicyStore;

use super::fsm::{FsmEffect, RegistrationFsm, RegistrationState};
use super::table::PeerAddress;

/// Application-facing events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpokeEvent {
    /// Registration state changed; DEREGISTERED surfaces connectivity
    /// loss.
    State(RegistrationState),
    /// A service instance (dis)appeared.
    ServiceAvailability {
        provider: ClientId,
        service: ServiceRecord,
        available: bool,
    },
    /// A routed request/response arrived.
    Message(UserMessage),
    /// A notification arrived.
    Notification(UserMessage),
    /// Outcome of a subscription handshake.
    SubscriptionResult {
        subscription: SubscriptionRef,
        accepted: bool,
    },
    /// The hub expired one of our subscriptions.
    SubscriptionExpired { subscription: SubscriptionRef },
    /// Answer to OFFERED_SERVICES_REQUEST.
    OfferedServices {
        services: BTreeSet<ServiceRecord>,
    },
}

/// Actions for the spoke runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpokeAction {
    SendToHub(Command),
    /// Bring up the spoke's own server endpoint (peers connect here for
    /// direct sends).
    StartLocalServer,
    /// Tear down and re-establish the hub connection.
    RestartTransport,
    /// Wake us again at the given instant to flush debounced requests.
    ScheduleFlush(Instant),
    Deliver(SpokeEvent),
}

/// Sans-IO spoke state.
pub struct SpokeCore {
    fsm: RegistrationFsm,
    policy: Arc<PolicyStore>,
    request_debounce: Duration,

    pending_offers: Vec<ServiceRecord>,
    pending_events: Vec<EventRegistration>,
    pending_subscriptions: Vec<SubscribeRequest>,
    pending_requests: BTreeSet<ServiceRecord>,
    request_flush_at: Option<Instant>,

    /// Peers the hub introduced, with their reachable address in TCP
    /// mode.
    known_peers: HashMap<ClientId, Option<PeerAddress>>,
}

impl SpokeCore {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        port: u16,
        request_debounce: Duration,
        policy: Arc<PolicyStore>,
    ) -> Self {
        Self {
            fsm: RegistrationFsm::new(name, port),
            policy,
            request_debounce,
            pending_offers: Vec::new(),
            pending_events: Vec::new(),
            pending_subscriptions: Vec::new(),
            pending_requests: BTreeSet::new(),
            request_flush_at: None,
            known_peers: HashMap::new(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> RegistrationState {
        self.fsm.state()
    }

    #[must_use]
    pub const fn client(&self) -> ClientId {
        self.fsm.client()
    }

    #[must_use]
    pub fn knows_peer(&self, peer: ClientId) -> bool {
        self.known_peers.contains_key(&peer)
    }

    /// Begin registration over a fresh transport.
    pub fn start(&mut self, now: Instant) -> Vec<SpokeAction> {
        let effects = self.fsm.start(now);
        self.map_fsm_effects(effects)
    }

    /// Orderly shutdown.
    pub fn deregister(&mut self) -> Vec<SpokeAction> {
        let effects = self.fsm.deregister();
        self.map_fsm_effects(effects)
    }

    /// Offer a service; queued until REGISTERED.
    pub fn offer_service(&mut self, service: ServiceRecord) -> Vec<SpokeAction> {
        if self.fsm.is_registered() {
            vec![SpokeAction::SendToHub(Command::OfferService { service })]
        } else {
            trace!("queueing offer until registered");
            self.pending_offers.push(service);
            Vec::new()
        }
    }

    pub fn stop_offer_service(&mut self, service: ServiceRecord) -> Vec<SpokeAction> {
        if self.fsm.is_registered() {
            vec![SpokeAction::SendToHub(Command::StopOfferService { service })]
        } else {
            self.pending_offers
                .retain(|pending| !pending.same_identity(&service));
            Vec::new()
        }
    }

    /// Request services; nearby calls are debounced into one frame.
    pub fn request_service(
        &mut self,
        services: impl IntoIterator<Item = ServiceRecord>,
        now: Instant,
    ) -> Vec<SpokeAction> {
        self.pending_requests.extend(services);
        if !self.fsm.is_registered() {
            return Vec::new();
        }
        if self.request_debounce.is_zero() {
            return self.flush_requests();
        }
        if self.request_flush_at.is_none() {
            let at = now + self.request_debounce;
            self.request_flush_at = Some(at);
            return vec![SpokeAction::ScheduleFlush(at)];
        }
        Vec::new()
    }

    pub fn release_service(&mut self, service: u16, instance: u16) -> Vec<SpokeAction> {
        self.pending_requests
            .retain(|record| record.service != service || record.instance != instance);
        if self.fsm.is_registered() {
            vec![SpokeAction::SendToHub(Command::ReleaseService {
                service,
                instance,
            })]
        } else {
            Vec::new()
        }
    }

    pub fn register_events(&mut self, events: Vec<EventRegistration>) -> Vec<SpokeAction> {
        if self.fsm.is_registered() {
            vec![SpokeAction::SendToHub(Command::RegisterEvents { events })]
        } else {
            self.pending_events.extend(events);
            Vec::new()
        }
    }

    pub fn subscribe(&mut self, request: SubscribeRequest) -> Vec<SpokeAction> {
        if self.fsm.is_registered() {
            vec![SpokeAction::SendToHub(Command::Subscribe(request))]
        } else {
            self.pending_subscriptions.push(request);
            Vec::new()
        }
    }

    pub fn unsubscribe(&mut self, subscription: SubscriptionRef) -> Vec<SpokeAction> {
        self.pending_subscriptions
            .retain(|pending| pending.subscription != subscription);
        if self.fsm.is_registered() {
            vec![SpokeAction::SendToHub(Command::Unsubscribe(subscription))]
        } else {
            Vec::new()
        }
    }

    /// Route a message through the hub.
    pub fn send(&mut self, message: UserMessage) -> Vec<SpokeAction> {
        if self.fsm.is_registered() {
            vec![SpokeAction::SendToHub(Command::Send(message))]
        } else {
            Vec::new()
        }
    }

    pub fn notify(&mut self, message: UserMessage) -> Vec<SpokeAction> {
        if self.fsm.is_registered() {
            vec![SpokeAction::SendToHub(Command::Notify(message))]
        } else {
            Vec::new()
        }
    }

    /// Timer tick: FSM deadlines and the request-debounce window.
    pub fn on_tick(&mut self, now: Instant) -> Vec<SpokeAction> {
        let effects = self.fsm.on_tick(now);
        let mut actions = self.map_fsm_effects(effects);
        if let Some(at) = self.request_flush_at {
            if now >= at && self.fsm.is_registered() {
                actions.extend(self.flush_requests());
            }
        }
        actions
    }

    /// The hub connection died.
    pub fn on_transport_lost(&mut self) -> Vec<SpokeAction> {
        self.known_peers.clear();
        let effects = self.fsm.on_transport_lost();
        let mut actions = self.map_fsm_effects(effects);
        if !actions.contains(&SpokeAction::RestartTransport) {
            actions.push(SpokeAction::RestartTransport);
        }
        actions
    }

    /// One decoded command from the hub connection.
    pub fn on_command(&mut self, command: Command, now: Instant) -> Vec<SpokeAction> {
        match command {
            Command::AssignClientAck { assigned } => {
                let effects = self.fsm.on_assign_ack(assigned, now);
                self.map_fsm_effects(effects)
            }
            Command::RoutingInfo { entries } => self.on_routing_info(entries),
            Command::Ping => vec![SpokeAction::SendToHub(Command::Pong)],
            Command::Send(message) => {
                vec![SpokeAction::Deliver(SpokeEvent::Message(message))]
            }
            Command::Notify(message) | Command::NotifyOne(message) => {
                vec![SpokeAction::Deliver(SpokeEvent::Notification(message))]
            }
            Command::SubscribeAck(reply) => {
                vec![SpokeAction::Deliver(SpokeEvent::SubscriptionResult {
                    subscription: SubscriptionRef {
                        service: reply.service,
                        instance: reply.instance,
                        eventgroup: reply.eventgroup,
                        major: 0,
                        event: reply.event,
                        pending_id: reply.pending_id,
                    },
                    accepted: true,
                })]
            }
            Command::SubscribeNack(reply) => {
                vec![SpokeAction::Deliver(SpokeEvent::SubscriptionResult {
                    subscription: SubscriptionRef {
                        service: reply.service,
                        instance: reply.instance,
                        eventgroup: reply.eventgroup,
                        major: 0,
                        event: reply.event,
                        pending_id: reply.pending_id,
                    },
                    accepted: false,
                })]
            }
            Command::Expire(subscription) => {
                vec![SpokeAction::Deliver(SpokeEvent::SubscriptionExpired {
                    subscription,
                })]
            }
            Command::OfferedServicesResponse { services } => {
                vec![SpokeAction::Deliver(SpokeEvent::OfferedServices { services })]
            }
            Command::UpdateSecurityPolicy { update_id, policy }
            | Command::UpdateSecurityPolicyInt { update_id, policy } => {
                self.policy.update_policy(policy);
                vec![SpokeAction::SendToHub(
                    Command::UpdateSecurityPolicyResponse { update_id },
                )]
            }
            Command::RemoveSecurityPolicy {
                update_id,
                uid,
                gid,
            } => {
                self.policy.remove_policy(uid, gid);
                vec![SpokeAction::SendToHub(
                    Command::RemoveSecurityPolicyResponse { update_id },
                )]
            }
            Command::DistributeSecurityPolicies { policies } => {
                for policy in policies {
                    self.policy.update_policy(policy);
                }
                Vec::new()
            }
            Command::UpdateSecurityCredentials { credentials } => {
                self.policy.set_remote_credentials(credentials);
                Vec::new()
            }
            other => {
                trace!("spoke ignoring {:?}", other.id());
                Vec::new()
            }
        }
    }

    fn on_routing_info(&mut self, entries: Vec<RoutingInfoEntry>) -> Vec<SpokeAction> {
        let mut actions = Vec::new();
        for entry in entries {
            match entry.kind {
                RoutingEntryKind::AddClient => {
                    if entry.client == self.fsm.client() {
                        let effects = self.fsm.on_self_added();
                        if !effects.is_empty() {
                            actions.extend(self.map_fsm_effects(effects));
                            actions.extend(self.flush_pending());
                        }
                    } else {
                        self.known_peers.insert(entry.client, entry.address);
                    }
                }
                RoutingEntryKind::DeleteClient => {
                    self.known_peers.remove(&entry.client);
                }
                RoutingEntryKind::AddServiceInstance => {
                    for service in entry.services {
                        actions.push(SpokeAction::Deliver(SpokeEvent::ServiceAvailability {
                            provider: entry.client,
                            service,
                            available: true,
                        }));
                    }
                }
                RoutingEntryKind::DeleteServiceInstance => {
                    for service in entry.services {
                        actions.push(SpokeAction::Deliver(SpokeEvent::ServiceAvailability {
                            provider: entry.client,
                            service,
                            available: false,
                        }));
                    }
                }
            }
        }
        actions
    }

    /// Everything queued while not yet registered goes out now: offers,
    /// event registrations, requests.
    fn flush_pending(&mut self) -> Vec<SpokeAction> {
        let mut actions = Vec::new();
        for service in std::mem::take(&mut self.pending_offers) {
            actions.push(SpokeAction::SendToHub(Command::OfferService { service }));
        }
        let events = std::mem::take(&mut self.pending_events);
        if !events.is_empty() {
            actions.push(SpokeAction::SendToHub(Command::RegisterEvents { events }));
        }
        actions.extend(self.flush_requests());
        for request in std::mem::take(&mut self.pending_subscriptions) {
            actions.push(SpokeAction::SendToHub(Command::Subscribe(request)));
        }
        if !actions.is_empty() {
            debug!("flushed {} pending command(s) on registration", actions.len());
        }
        actions
    }

    fn flush_requests(&mut self) -> Vec<SpokeAction> {
        self.request_flush_at = None;
        if self.pending_requests.is_empty() {
            return Vec::new();
        }
        let services = std::mem::take(&mut self.pending_requests);
        vec![SpokeAction::SendToHub(Command::RequestService { services })]
    }

    fn map_fsm_effects(&mut self, effects: Vec<FsmEffect>) -> Vec<SpokeAction> {
        let mut actions = Vec::new();
        for effect in effects {
            match effect {
                FsmEffect::SendAssignClient { name } => {
                    actions.push(SpokeAction::SendToHub(Command::AssignClient { name }));
                }
                FsmEffect::SendRegisterApplication { port } => {
                    actions.push(SpokeAction::SendToHub(Command::RegisterApplication { port }));
                }
                FsmEffect::SendRegisteredAck => {
                    actions.push(SpokeAction::SendToHub(Command::RegisteredAck));
                }
                FsmEffect::SendDeregisterApplication => {
                    actions.push(SpokeAction::SendToHub(Command::DeregisterApplication));
                }
                FsmEffect::StartLocalServer => actions.push(SpokeAction::StartLocalServer),
                FsmEffect::RestartTransport => actions.push(SpokeAction::RestartTransport),
                FsmEffect::StateChanged(state) => {
                    actions.push(SpokeAction::Deliver(SpokeEvent::State(state)));
                }
            }
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::SecurityMode;
    use chassis_proto::types::{ILLEGAL_PORT, PENDING_SUBSCRIPTION_ID};

    fn spoke(debounce: Duration) -> SpokeCore {
        SpokeCore::new(
            "app",
            ILLEGAL_PORT,
            debounce,
            Arc::new(PolicyStore::new(SecurityMode::Disabled, false)),
        )
    }

    fn sent(actions: &[SpokeAction]) -> Vec<&Command> {
        actions
            .iter()
            .filter_map(|action| match action {
                SpokeAction::SendToHub(command) => Some(command),
                _ => None,
            })
            .collect()
    }

    fn drive_to_registered(spoke: &mut SpokeCore, now: Instant) -> Vec<SpokeAction> {
        spoke.start(now);
        spoke.on_command(Command::AssignClientAck { assigned: 0x1000 }, now);
        spoke.on_command(
            Command::RoutingInfo {
                entries: vec![RoutingInfoEntry::add_client(0x1000, None)],
            },
            now,
        )
    }

    /// Spoke half of the registration happy path.
    #[test]
    fn registration_happy_path() {
        let mut spoke = spoke(Duration::ZERO);
        let now = Instant::now();

        let actions = spoke.start(now);
        assert_eq!(
            sent(&actions),
            vec![&Command::AssignClient {
                name: "app".to_string()
            }]
        );

        let actions = spoke.on_command(Command::AssignClientAck { assigned: 0x1000 }, now);
        assert!(actions.contains(&SpokeAction::StartLocalServer));
        assert!(sent(&actions).contains(&&Command::RegisterApplication { port: ILLEGAL_PORT }));

        let actions = spoke.on_command(
            Command::RoutingInfo {
                entries: vec![RoutingInfoEntry::add_client(0x1000, None)],
            },
            now,
        );
        assert!(sent(&actions).contains(&&Command::RegisteredAck));
        assert_eq!(spoke.state(), RegistrationState::Registered);
        assert_eq!(spoke.client(), 0x1000);
    }

    #[test]
    fn pending_offers_flush_on_registration() {
        let mut spoke = spoke(Duration::ZERO);
        let now = Instant::now();
        let record = ServiceRecord::new(0x1234, 0x0001, 1, 0);

        assert!(spoke.offer_service(record).is_empty());
        let actions = drive_to_registered(&mut spoke, now);
        assert!(sent(&actions).contains(&&Command::OfferService { service: record }));
    }

    #[test]
    fn request_debounce_batches_into_one_frame() {
        let mut spoke = spoke(Duration::from_millis(10));
        let now = Instant::now();
        drive_to_registered(&mut spoke, now);

        let first = spoke.request_service([ServiceRecord::new(0x1111, 1, 0xFF, 0)], now);
        assert!(matches!(first[0], SpokeAction::ScheduleFlush(_)));
        let second = spoke.request_service([ServiceRecord::new(0x2222, 1, 0xFF, 0)], now);
        assert!(second.is_empty());

        let actions = spoke.on_tick(now + Duration::from_millis(10));
        let commands = sent(&actions);
        assert_eq!(commands.len(), 1);
        let Command::RequestService { services } = commands[0] else {
            panic!("expected one batched REQUEST_SERVICE");
        };
        assert_eq!(services.len(), 2);
    }

    #[test]
    fn zero_debounce_sends_immediately() {
        let mut spoke = spoke(Duration::ZERO);
        let now = Instant::now();
        drive_to_registered(&mut spoke, now);

        let actions = spoke.request_service([ServiceRecord::new(0x1111, 1, 0xFF, 0)], now);
        assert!(matches!(
            sent(&actions)[0],
            Command::RequestService { .. }
        ));
    }

    #[test]
    fn routing_info_tracks_peers_and_availability() {
        let mut spoke = spoke(Duration::ZERO);
        let now = Instant::now();
        drive_to_registered(&mut spoke, now);

        let record = ServiceRecord::new(0x1234, 0x0001, 1, 0);
        let actions = spoke.on_command(
            Command::RoutingInfo {
                entries: vec![
                    RoutingInfoEntry::add_client(0x1001, None),
                    RoutingInfoEntry::add_service_instance(0x1001, record),
                ],
            },
            now,
        );
        assert!(spoke.knows_peer(0x1001));
        assert!(actions.contains(&SpokeAction::Deliver(SpokeEvent::ServiceAvailability {
            provider: 0x1001,
            service: record,
            available: true,
        })));

        let actions = spoke.on_command(
            Command::RoutingInfo {
                entries: vec![
                    RoutingInfoEntry::delete_service_instance(0x1001, record),
                    RoutingInfoEntry::delete_client(0x1001),
                ],
            },
            now,
        );
        assert!(!spoke.knows_peer(0x1001));
        assert!(actions.contains(&SpokeAction::Deliver(SpokeEvent::ServiceAvailability {
            provider: 0x1001,
            service: record,
            available: false,
        })));
    }

    #[test]
    fn ping_is_answered_with_pong() {
        let mut spoke = spoke(Duration::ZERO);
        let now = Instant::now();
        drive_to_registered(&mut spoke, now);

        let actions = spoke.on_command(Command::Ping, now);
        assert_eq!(sent(&actions), vec![&Command::Pong]);
    }

    #[test]
    fn transport_loss_restarts_and_requeues() {
        let mut spoke = spoke(Duration::ZERO);
        let now = Instant::now();
        drive_to_registered(&mut spoke, now);
        spoke.on_command(
            Command::RoutingInfo {
                entries: vec![RoutingInfoEntry::add_client(0x1001, None)],
            },
            now,
        );

        let actions = spoke.on_transport_lost();
        assert!(actions.contains(&SpokeAction::RestartTransport));
        assert!(actions.contains(&SpokeAction::Deliver(SpokeEvent::State(
            RegistrationState::Deregistered
        ))));
        assert!(!spoke.knows_peer(0x1001));
    }

    #[test]
    fn assign_timeout_is_surfaced() {
        let mut spoke = spoke(Duration::ZERO);
        let now = Instant::now();
        spoke.start(now);

        let actions = spoke.on_tick(now + super::super::fsm::ASSIGN_TIMEOUT);
        assert!(actions.contains(&SpokeAction::RestartTransport));
        assert_eq!(spoke.state(), RegistrationState::Deregistered);
    }

    #[test]
    fn hub_policy_update_is_stored_and_confirmed() {
        let store = Arc::new(PolicyStore::new(SecurityMode::Enforce, false));
        let mut spoke = SpokeCore::new("app", ILLEGAL_PORT, Duration::ZERO, store.clone());
        let now = Instant::now();

        let mut policy = chassis_proto::policy::Policy::for_principal(1000, 1000);
        policy.requests.push(chassis_proto::policy::RequestRule {
            services: chassis_proto::intervals::IntervalSet::single(0x1234),
            ids: vec![(
                chassis_proto::intervals::IntervalSet::any(),
                chassis_proto::intervals::IntervalSet::any(),
            )],
        });

        let actions = spoke.on_command(
            Command::UpdateSecurityPolicy {
                update_id: 5,
                policy,
            },
            now,
        );
        assert_eq!(
            sent(&actions),
            vec![&Command::UpdateSecurityPolicyResponse { update_id: 5 }]
        );
        assert!(store.is_client_allowed(1000, 1000, 0x1234, 1, 1, false));
    }

    #[test]
    fn subscription_results_are_delivered() {
        let mut spoke = spoke(Duration::ZERO);
        let now = Instant::now();
        drive_to_registered(&mut spoke, now);

        let request = SubscribeRequest {
            subscription: SubscriptionRef {
                service: 0x1234,
                instance: 1,
                eventgroup: 0x00EE,
                major: 1,
                event: chassis_proto::types::ANY_EVENT,
                pending_id: PENDING_SUBSCRIPTION_ID,
            },
            filter: None,
        };
        let actions = spoke.subscribe(request.clone());
        assert_eq!(sent(&actions), vec![&Command::Subscribe(request)]);

        let actions = spoke.on_command(
            Command::SubscribeNack(chassis_proto::subscribe::SubscriptionReply {
                service: 0x1234,
                instance: 1,
                eventgroup: 0x00EE,
                subscriber: 0x1000,
                event: chassis_proto::types::ANY_EVENT,
                pending_id: PENDING_SUBSCRIPTION_ID,
            }),
            now,
        );
        assert!(matches!(
            actions[0],
            SpokeAction::Deliver(SpokeEvent::SubscriptionResult {
                accepted: false,
                ..
            })
        ));
    }
}
