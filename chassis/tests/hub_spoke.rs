//! Hub ↔ spoke interaction, driven sans-IO through the real codec.
//!
//! Every command crosses a simulated wire: spoke actions are encoded into
//! frames, decoded by the hub side, dispatched, and the hub's outputs
//! travel back the same way. What the sockets would carry is exactly what
//! these tests carry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chassis::routing::{
    HubCore, HubOutput, RegistrationState, SpokeAction, SpokeCore, SpokeEvent,
};
use chassis::security::{IdentityMap, PolicyStore, SecurityMode};
use chassis::FabricConfig;
use chassis_core::buffer::FrameBuffer;
use chassis_proto::codec::FrameDecoder;
use chassis_proto::command::Command;
use chassis_proto::subscribe::{SubscribeRequest, SubscriptionRef};
use chassis_proto::types::{
    ClientId, ServiceRecord, ANY_EVENT, ANY_MAJOR, CLIENT_UNSET, ILLEGAL_PORT,
};

/// One simulated node: a hub plus any number of spokes, connected by
/// encode-decode round trips instead of sockets.
struct Fabric {
    hub: HubCore,
    spokes: HashMap<ClientId, SpokeCore>,
    events: Vec<(ClientId, SpokeEvent)>,
    now: Instant,
}

impl Fabric {
    fn new() -> Self {
        let policy = Arc::new(PolicyStore::new(SecurityMode::Disabled, false));
        let identities = Arc::new(IdentityMap::new());
        Self {
            hub: HubCore::new(FabricConfig::default(), policy, identities),
            spokes: HashMap::new(),
            events: Vec::new(),
            now: Instant::now(),
        }
    }

    /// Register a new spoke through the full handshake and return its
    /// assigned id.
    fn connect(&mut self, name: &str) -> ClientId {
        let policy = Arc::new(PolicyStore::new(SecurityMode::Disabled, false));
        let mut spoke = SpokeCore::new(name, ILLEGAL_PORT, Duration::ZERO, policy);

        // ASSIGN_CLIENT goes out with the unset id; the hub's ack tells
        // us who we are.
        let assign = spoke
            .start(self.now)
            .into_iter()
            .find_map(|action| match action {
                SpokeAction::SendToHub(command) => Some(command),
                _ => None,
            })
            .expect("fresh spoke asks for an id");
        let outputs = self.deliver_to_hub(CLIENT_UNSET, assign);

        let assigned = outputs
            .into_iter()
            .find_map(|output| match output {
                HubOutput::Reply(Command::AssignClientAck { assigned }) => Some(assigned),
                _ => None,
            })
            .expect("hub must assign an id");
        assert_ne!(assigned, CLIENT_UNSET);

        let follow = spoke.on_command(Command::AssignClientAck { assigned }, self.now);
        self.spokes.insert(assigned, spoke);
        self.run_spoke_actions(assigned, follow);

        assert_eq!(
            self.spokes[&assigned].state(),
            RegistrationState::Registered,
            "handshake must complete"
        );
        assigned
    }

    /// Encode, re-decode and dispatch one spoke→hub command; returns the
    /// hub outputs that are not routable frames (replies already routed).
    fn deliver_to_hub(&mut self, sender: ClientId, command: Command) -> Vec<HubOutput> {
        let frame = command.encode(sender).expect("encodable command");
        let mut buffer = FrameBuffer::new();
        buffer.push(frame);
        let raw = FrameDecoder::default()
            .decode(&mut buffer)
            .expect("well-formed frame")
            .expect("complete frame");
        let command = Command::decode_payload(raw.id, &raw.payload).expect("decodable payload");

        let outputs = self
            .hub
            .handle_command(Some(raw.sender), false, raw.sender, command);
        self.route_outputs(sender, outputs)
    }

    /// Deliver routable outputs; auto-accept subscription questions.
    fn route_outputs(&mut self, origin: ClientId, outputs: Vec<HubOutput>) -> Vec<HubOutput> {
        let mut rest = Vec::new();
        for output in outputs {
            match output {
                HubOutput::Frame { target, command } => {
                    self.deliver_to_spoke(target, command);
                }
                HubOutput::Reply(command) if origin != CLIENT_UNSET => {
                    self.deliver_to_spoke(origin, command);
                }
                HubOutput::AskSubscription { token, .. } => {
                    let follow = self.hub.complete_subscription(token, true);
                    self.route_outputs(origin, follow);
                }
                other => rest.push(other),
            }
        }
        rest
    }

    fn deliver_to_spoke(&mut self, target: ClientId, command: Command) {
        let frame = command.encode(CLIENT_UNSET).expect("encodable command");
        let mut buffer = FrameBuffer::new();
        buffer.push(frame);
        let raw = FrameDecoder::default()
            .decode(&mut buffer)
            .expect("well-formed frame")
            .expect("complete frame");
        let command = Command::decode_payload(raw.id, &raw.payload).expect("decodable payload");

        let Some(spoke) = self.spokes.get_mut(&target) else {
            panic!("hub addressed unknown client {target:#06x}");
        };
        let actions = spoke.on_command(command, self.now);
        self.run_spoke_actions(target, actions);
    }

    fn run_spoke_actions(&mut self, spoke_id: ClientId, actions: Vec<SpokeAction>) {
        for action in actions {
            match action {
                SpokeAction::SendToHub(command) => {
                    for output in self.deliver_to_hub(spoke_id, command) {
                        assert!(
                            matches!(output, HubOutput::Host(_)),
                            "unexpected unroutable hub output: {output:?}"
                        );
                    }
                }
                SpokeAction::Deliver(event) => self.events.push((spoke_id, event)),
                SpokeAction::StartLocalServer
                | SpokeAction::RestartTransport
                | SpokeAction::ScheduleFlush(_) => {}
            }
        }
    }

    fn events_for(&self, spoke_id: ClientId) -> Vec<&SpokeEvent> {
        self.events
            .iter()
            .filter(|(id, _)| *id == spoke_id)
            .map(|(_, event)| event)
            .collect()
    }
}

#[test]
fn two_spokes_register_with_distinct_ids() {
    let mut fabric = Fabric::new();
    let a = fabric.connect("app-a");
    let b = fabric.connect("app-b");
    assert_ne!(a, b);
    assert!(fabric.hub.table().is_registered(a));
    assert!(fabric.hub.table().is_registered(b));
}

#[test]
fn offer_reaches_requester_with_availability_event() {
    let mut fabric = Fabric::new();
    let provider = fabric.connect("provider");
    let consumer = fabric.connect("consumer");

    let record = ServiceRecord::new(0x1234, 0x0001, 1, 0);
    let actions = fabric
        .spokes
        .get_mut(&provider)
        .unwrap()
        .offer_service(record);
    fabric.run_spoke_actions(provider, actions);

    let now = fabric.now;
    let actions = fabric.spokes.get_mut(&consumer).unwrap().request_service(
        [ServiceRecord::new(0x1234, 0x0001, ANY_MAJOR, 0)],
        now,
    );
    fabric.run_spoke_actions(consumer, actions);

    assert!(fabric
        .events_for(consumer)
        .iter()
        .any(|event| matches!(
            event,
            SpokeEvent::ServiceAvailability {
                provider: p,
                service,
                available: true,
            } if *p == provider && *service == record
        )));
    assert!(fabric.spokes[&consumer].knows_peer(provider));
}

#[test]
fn subscription_handshake_round_trips() {
    let mut fabric = Fabric::new();
    let _provider = fabric.connect("provider");
    let consumer = fabric.connect("consumer");

    let request = SubscribeRequest {
        subscription: SubscriptionRef {
            service: 0x1234,
            instance: 0x0001,
            eventgroup: 0x00EE,
            major: 1,
            event: ANY_EVENT,
            pending_id: 0x0000_0042,
        },
        filter: None,
    };
    let actions = fabric
        .spokes
        .get_mut(&consumer)
        .unwrap()
        .subscribe(request);
    fabric.run_spoke_actions(consumer, actions);

    assert!(fabric
        .events_for(consumer)
        .iter()
        .any(|event| matches!(
            event,
            SpokeEvent::SubscriptionResult {
                subscription,
                accepted: true,
            } if subscription.pending_id == 0x0000_0042
        )));
}

#[test]
fn deregistered_spoke_disappears_from_peers() {
    let mut fabric = Fabric::new();
    let provider = fabric.connect("provider");
    let consumer = fabric.connect("consumer");

    let record = ServiceRecord::new(0x1234, 0x0001, 1, 0);
    let actions = fabric
        .spokes
        .get_mut(&provider)
        .unwrap()
        .offer_service(record);
    fabric.run_spoke_actions(provider, actions);
    let now = fabric.now;
    let actions = fabric.spokes.get_mut(&consumer).unwrap().request_service(
        [ServiceRecord::new(0x1234, 0x0001, ANY_MAJOR, 0)],
        now,
    );
    fabric.run_spoke_actions(consumer, actions);

    let actions = fabric.spokes.get_mut(&provider).unwrap().deregister();
    fabric.run_spoke_actions(provider, actions);

    assert!(!fabric.hub.table().is_registered(provider));
    assert!(!fabric.hub.table().matrix_mentions(provider));
    assert!(fabric
        .events_for(consumer)
        .iter()
        .any(|event| matches!(
            event,
            SpokeEvent::ServiceAvailability {
                available: false,
                ..
            }
        )));
    assert!(!fabric.spokes[&consumer].knows_peer(provider));
}
