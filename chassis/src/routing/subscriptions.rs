//! Eventgroup subscription engine.
//!
//! Acceptance is asynchronous: `begin_subscribe` parks the request and
//! hands back a token, the hub asks the providing application, and
//! `complete_subscribe` turns the decision into exactly one ACK or NACK
//! (echoing the caller's `pending_id` verbatim). Remote subscriptions are
//! counted per eventgroup; the first one triggers the initial-events
//! burst, the last one leaving tells the upstream application to
//! unsubscribe as the routing client.

use bytes::Bytes;
use hashbrown::HashMap;
use smallvec::SmallVec;
use tracing::{debug, trace};

use chassis_proto::events::{EventDeregistration, EventRegistration};
use chassis_proto::subscribe::{DebounceFilter, SubscribeRequest, SubscriptionRef, SubscriptionReply};
use chassis_proto::types::{
    ClientId, EventId, EventKind, EventgroupId, InstanceId, Reliability, ServiceId, ANY_EVENT,
    PENDING_SUBSCRIPTION_ID,
};

type EventKey = (ServiceId, InstanceId, EventId);
type GroupKey = (ServiceId, InstanceId, EventgroupId);

/// Token correlating `begin_subscribe` with its decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingToken(u32);

/// Side effects the hub must act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEffect {
    Ack {
        target: ClientId,
        reply: SubscriptionReply,
    },
    Nack {
        target: ClientId,
        reply: SubscriptionReply,
    },
    /// Replay of a cached field payload towards a new remote subscriber.
    InitialNotify {
        target: ClientId,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        payload: Bytes,
    },
    /// No remote subscriber left; the upstream application unsubscribes
    /// as the routing client.
    UpstreamUnsubscribe {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    },
}

#[derive(Debug)]
struct EventInfo {
    provider: ClientId,
    kind: EventKind,
    #[allow(dead_code)]
    reliability: Reliability,
    is_provided: bool,
    #[allow(dead_code)]
    is_cyclic: bool,
    eventgroups: SmallVec<[EventgroupId; 4]>,
    last_payload: Option<Bytes>,
}

#[derive(Debug)]
struct SubscriberEntry {
    event: EventId,
    pending_id: u32,
    filter: Option<DebounceFilter>,
    /// Last payload actually forwarded, per event; feeds the debounce
    /// filter and the already-have exclusion on re-subscribe.
    forwarded: HashMap<EventId, Bytes>,
}

impl SubscriberEntry {
    fn is_remote(&self) -> bool {
        self.pending_id != PENDING_SUBSCRIPTION_ID
    }

    fn wants(&self, event: EventId) -> bool {
        self.event == ANY_EVENT || self.event == event
    }
}

#[derive(Debug, Default)]
struct GroupState {
    subscribers: HashMap<ClientId, SubscriberEntry>,
    remote_count: u32,
}

#[derive(Debug)]
struct PendingSubscription {
    subscriber: ClientId,
    request: SubscribeRequest,
}

/// Hub-owned subscription state.
#[derive(Default)]
pub struct SubscriptionRegistry {
    events: HashMap<EventKey, EventInfo>,
    groups: HashMap<GroupKey, GroupState>,
    pending: HashMap<PendingToken, PendingSubscription>,
    next_token: u32,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record event registrations of `client`.
    pub fn register_events(&mut self, client: ClientId, registrations: &[EventRegistration]) {
        for registration in registrations {
            let key = (
                registration.service,
                registration.instance,
                registration.event,
            );
            let info = self.events.entry(key).or_insert_with(|| EventInfo {
                provider: client,
                kind: registration.kind,
                reliability: registration.reliability,
                is_provided: registration.is_provided,
                is_cyclic: registration.is_cyclic,
                eventgroups: registration.eventgroups.clone(),
                last_payload: None,
            });
            if registration.is_provided {
                info.provider = client;
                info.is_provided = true;
            }
            if info.kind == EventKind::Unknown {
                info.kind = registration.kind;
            }
            for eventgroup in &registration.eventgroups {
                if !info.eventgroups.contains(eventgroup) {
                    info.eventgroups.push(*eventgroup);
                }
            }
        }
    }

    /// Drop one event registration.
    pub fn unregister_event(&mut self, client: ClientId, deregistration: &EventDeregistration) {
        let key = (
            deregistration.service,
            deregistration.instance,
            deregistration.event,
        );
        if let Some(info) = self.events.get(&key) {
            if info.provider == client || !deregistration.is_provided {
                self.events.remove(&key);
            }
        }
    }

    /// Cache a field payload for late joiners, and for the debounce
    /// comparison.
    pub fn set_payload(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        payload: Bytes,
    ) {
        if let Some(info) = self.events.get_mut(&(service, instance, event)) {
            if info.kind.is_field() {
                info.last_payload = Some(payload);
            }
        }
    }

    /// Park a subscription until the providing application decides.
    pub fn begin_subscribe(
        &mut self,
        subscriber: ClientId,
        request: SubscribeRequest,
    ) -> PendingToken {
        let token = PendingToken(self.next_token);
        self.next_token = self.next_token.wrapping_add(1);
        trace!(
            "subscription of {subscriber:#06x} to {:#06x}.{:#06x}/{:#06x} parked",
            request.subscription.service,
            request.subscription.instance,
            request.subscription.eventgroup
        );
        self.pending.insert(
            token,
            PendingSubscription {
                subscriber,
                request,
            },
        );
        token
    }

    /// Turn the application's decision into effects.
    ///
    /// Exactly one ACK or NACK results from every parked subscription.
    pub fn complete_subscribe(
        &mut self,
        token: PendingToken,
        accepted: bool,
    ) -> Vec<SubscriptionEffect> {
        let Some(parked) = self.pending.remove(&token) else {
            return Vec::new();
        };
        let subscription = parked.request.subscription;
        let subscriber = parked.subscriber;
        let reply = SubscriptionReply {
            service: subscription.service,
            instance: subscription.instance,
            eventgroup: subscription.eventgroup,
            subscriber,
            event: subscription.event,
            pending_id: subscription.pending_id,
        };

        if !accepted {
            return vec![SubscriptionEffect::Nack {
                target: subscriber,
                reply,
            }];
        }

        let key = (
            subscription.service,
            subscription.instance,
            subscription.eventgroup,
        );
        let is_remote = subscription.pending_id != PENDING_SUBSCRIPTION_ID;

        let (first_remote, already_delivered) = {
            let group = self.groups.entry(key).or_default();
            let previous = group.subscribers.insert(
                subscriber,
                SubscriberEntry {
                    event: subscription.event,
                    pending_id: subscription.pending_id,
                    filter: parked.request.filter,
                    forwarded: HashMap::new(),
                },
            );

            let was_remote = previous.as_ref().is_some_and(SubscriberEntry::is_remote);
            let already: HashMap<EventId, Bytes> =
                previous.map(|entry| entry.forwarded).unwrap_or_default();

            let mut first = false;
            if is_remote && !was_remote {
                group.remote_count += 1;
                first = group.remote_count == 1;
            }
            (first, already)
        };

        let mut effects = vec![SubscriptionEffect::Ack {
            target: subscriber,
            reply,
        }];

        if first_remote {
            effects.extend(self.initial_events(&subscription, subscriber, &already_delivered));
        }

        effects
    }

    /// Remove a subscription; `UNSUBSCRIBE` and hub-initiated `EXPIRE`
    /// share this path.
    pub fn unsubscribe(
        &mut self,
        subscriber: ClientId,
        subscription: &SubscriptionRef,
    ) -> Vec<SubscriptionEffect> {
        let key = (
            subscription.service,
            subscription.instance,
            subscription.eventgroup,
        );
        let mut effects = Vec::new();

        let Some(group) = self.groups.get_mut(&key) else {
            return effects;
        };
        let Some(entry) = group.subscribers.remove(&subscriber) else {
            return effects;
        };

        if entry.is_remote() {
            group.remote_count = group.remote_count.saturating_sub(1);
            if group.remote_count == 0 {
                effects.push(SubscriptionEffect::UpstreamUnsubscribe {
                    service: subscription.service,
                    instance: subscription.instance,
                    eventgroup: subscription.eventgroup,
                });
            }
        }
        if group.subscribers.is_empty() {
            self.groups.remove(&key);
        }

        effects
    }

    /// Remove everything a vanished client subscribed to or provided.
    pub fn drop_client(&mut self, client: ClientId) -> Vec<SubscriptionEffect> {
        let mut effects = Vec::new();

        let keys: Vec<GroupKey> = self
            .groups
            .iter()
            .filter(|(_, group)| group.subscribers.contains_key(&client))
            .map(|(key, _)| *key)
            .collect();
        for (service, instance, eventgroup) in keys {
            effects.extend(self.unsubscribe(
                client,
                &SubscriptionRef {
                    service,
                    instance,
                    eventgroup,
                    major: 0,
                    event: ANY_EVENT,
                    pending_id: PENDING_SUBSCRIPTION_ID,
                },
            ));
        }

        self.pending.retain(|_, parked| parked.subscriber != client);
        self.events.retain(|_, info| info.provider != client);

        effects
    }

    /// Abort every parked subscription; used at shutdown.
    pub fn cancel_all_pending(&mut self) -> Vec<SubscriptionEffect> {
        let tokens: Vec<PendingToken> = self.pending.keys().copied().collect();
        tokens
            .into_iter()
            .flat_map(|token| self.complete_subscribe(token, false))
            .collect()
    }

    /// Route a notification to the matching subscribers, after their
    /// debounce filters.
    pub fn on_notify(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        payload: &Bytes,
    ) -> Vec<ClientId> {
        self.set_payload(service, instance, event, payload.clone());

        let eventgroups: SmallVec<[EventgroupId; 4]> = self
            .events
            .get(&(service, instance, event))
            .map(|info| info.eventgroups.clone())
            .unwrap_or_default();

        let mut targets = Vec::new();
        for eventgroup in eventgroups {
            let Some(group) = self.groups.get_mut(&(service, instance, eventgroup)) else {
                continue;
            };
            for (subscriber, entry) in &mut group.subscribers {
                if !entry.wants(event) {
                    continue;
                }
                let last = entry.forwarded.get(&event).map(Bytes::as_ref);
                let passes = entry
                    .filter
                    .as_ref()
                    .map_or(true, |filter| filter.accepts(last, payload));
                if passes && !targets.contains(subscriber) {
                    entry.forwarded.insert(event, payload.clone());
                    targets.push(*subscriber);
                }
            }
        }
        targets
    }

    /// Count of remote subscribers for one eventgroup.
    #[must_use]
    pub fn remote_subscriber_count(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) -> u32 {
        self.groups
            .get(&(service, instance, eventgroup))
            .map_or(0, |group| group.remote_count)
    }

    /// True when any remote subscription for the eventgroup exists.
    #[must_use]
    pub fn has_remote_subscriber(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) -> bool {
        self.groups
            .get(&(service, instance, eventgroup))
            .is_some_and(|group| {
                group
                    .subscribers
                    .values()
                    .any(SubscriberEntry::is_remote)
            })
    }

    #[must_use]
    pub fn is_field(&self, service: ServiceId, instance: InstanceId, event: EventId) -> bool {
        self.events
            .get(&(service, instance, event))
            .is_some_and(|info| info.kind.is_field())
    }

    /// Cached payloads of every provided field of `client`; feeds
    /// RESEND_PROVIDED_EVENTS.
    #[must_use]
    pub fn provided_field_payloads(&self, client: ClientId) -> Vec<(EventKey, Bytes)> {
        self.events
            .iter()
            .filter(|(_, info)| {
                info.provider == client && info.is_provided && info.kind.is_field()
            })
            .filter_map(|(key, info)| info.last_payload.clone().map(|payload| (*key, payload)))
            .collect()
    }

    fn initial_events(
        &self,
        subscription: &SubscriptionRef,
        subscriber: ClientId,
        already_delivered: &HashMap<EventId, Bytes>,
    ) -> Vec<SubscriptionEffect> {
        let mut effects = Vec::new();
        for ((service, instance, event), info) in &self.events {
            if *service != subscription.service
                || *instance != subscription.instance
                || !info.kind.is_field()
                || !info.eventgroups.contains(&subscription.eventgroup)
            {
                continue;
            }
            if subscription.event != ANY_EVENT && subscription.event != *event {
                continue;
            }
            let Some(payload) = &info.last_payload else {
                continue;
            };
            // A re-subscribing peer that already saw this exact payload
            // does not get it replayed.
            if already_delivered.get(event) == Some(payload) {
                continue;
            }
            effects.push(SubscriptionEffect::InitialNotify {
                target: subscriber,
                service: *service,
                instance: *instance,
                event: *event,
                payload: payload.clone(),
            });
        }
        debug!(
            "initial burst of {} field payload(s) for {subscriber:#06x}",
            effects.len()
        );
        effects
    }
}
