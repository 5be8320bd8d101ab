//! Spoke registration state machine.
//!
//! Sans-IO: the spoke runtime feeds it decoded commands, ticks and
//! transport events; it answers with effects the runtime executes. Time
//! is passed in explicitly so every timeout path is testable without a
//! clock.
//!
//! ```text
//! DEREGISTERED ─ASSIGN_CLIENT──────▶ ASSIGNING
//! ASSIGNING   ─ASSIGN_CLIENT_ACK──▶ ASSIGNED ─REGISTER_APPLICATION▶ REGISTERING
//! ASSIGNING   ─timeout(3s)────────▶ DEREGISTERED (restart transport)
//! REGISTERING ─ROUTING_INFO(self)─▶ REGISTERED
//! REGISTERING ─timeout(1s)────────▶ DEREGISTERED (restart transport)
//! REGISTERED  ─DEREGISTER─────────▶ DEREGISTERED
//! any         ─transport_lost─────▶ DEREGISTERED
//! ```

use std::time::{Duration, Instant};

use chassis_proto::types::{ClientId, CLIENT_UNSET};

/// Time allowed for the hub to answer ASSIGN_CLIENT.
pub const ASSIGN_TIMEOUT: Duration = Duration::from_secs(3);
/// Time allowed for the self ADD_CLIENT after REGISTER_APPLICATION.
pub const REGISTER_TIMEOUT: Duration = Duration::from_secs(1);

/// Registration lifecycle of a spoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Deregistered,
    Assigning,
    Assigned,
    Registering,
    Registered,
}

/// What the spoke runtime must do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsmEffect {
    SendAssignClient { name: String },
    SendRegisterApplication { port: u16 },
    SendRegisteredAck,
    SendDeregisterApplication,
    /// Bring up the spoke's own server endpoint so peers can connect for
    /// direct sends.
    StartLocalServer,
    /// Tear down and re-establish the hub connection.
    RestartTransport,
    StateChanged(RegistrationState),
}

/// The state machine proper.
pub struct RegistrationFsm {
    state: RegistrationState,
    name: String,
    port: u16,
    client: ClientId,
    deadline: Option<Instant>,
}

impl RegistrationFsm {
    #[must_use]
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            state: RegistrationState::Deregistered,
            name: name.into(),
            port,
            client: CLIENT_UNSET,
            deadline: None,
        }
    }

    #[must_use]
    pub const fn state(&self) -> RegistrationState {
        self.state
    }

    /// Assigned client id, `CLIENT_UNSET` before ASSIGN_CLIENT_ACK.
    #[must_use]
    pub const fn client(&self) -> ClientId {
        self.client
    }

    #[must_use]
    pub const fn is_registered(&self) -> bool {
        matches!(self.state, RegistrationState::Registered)
    }

    /// Kick off registration over a fresh transport.
    pub fn start(&mut self, now: Instant) -> Vec<FsmEffect> {
        if self.state != RegistrationState::Deregistered {
            return Vec::new();
        }
        self.state = RegistrationState::Assigning;
        self.deadline = Some(now + ASSIGN_TIMEOUT);
        vec![
            FsmEffect::SendAssignClient {
                name: self.name.clone(),
            },
            FsmEffect::StateChanged(RegistrationState::Assigning),
        ]
    }

    /// Hub assigned us an id; start the local server, then register.
    pub fn on_assign_ack(&mut self, assigned: ClientId, now: Instant) -> Vec<FsmEffect> {
        if self.state != RegistrationState::Assigning {
            return Vec::new();
        }
        self.client = assigned;
        self.state = RegistrationState::Assigned;
        let mut effects = vec![
            FsmEffect::StartLocalServer,
            FsmEffect::StateChanged(RegistrationState::Assigned),
        ];

        self.state = RegistrationState::Registering;
        self.deadline = Some(now + REGISTER_TIMEOUT);
        effects.push(FsmEffect::SendRegisterApplication { port: self.port });
        effects.push(FsmEffect::StateChanged(RegistrationState::Registering));
        effects
    }

    /// The hub's ROUTING_INFO listed ourselves as ADD_CLIENT.
    pub fn on_self_added(&mut self) -> Vec<FsmEffect> {
        if self.state != RegistrationState::Registering {
            return Vec::new();
        }
        self.state = RegistrationState::Registered;
        self.deadline = None;
        vec![
            FsmEffect::SendRegisteredAck,
            FsmEffect::StateChanged(RegistrationState::Registered),
        ]
    }

    /// Orderly shutdown from the application.
    pub fn deregister(&mut self) -> Vec<FsmEffect> {
        if self.state == RegistrationState::Deregistered {
            return Vec::new();
        }
        self.state = RegistrationState::Deregistered;
        self.deadline = None;
        self.client = CLIENT_UNSET;
        vec![
            FsmEffect::SendDeregisterApplication,
            FsmEffect::StateChanged(RegistrationState::Deregistered),
        ]
    }

    /// The hub connection died underneath us.
    pub fn on_transport_lost(&mut self) -> Vec<FsmEffect> {
        if self.state == RegistrationState::Deregistered {
            return Vec::new();
        }
        self.drop_to_deregistered()
    }

    /// Check the pending deadline.
    pub fn on_tick(&mut self, now: Instant) -> Vec<FsmEffect> {
        let Some(deadline) = self.deadline else {
            return Vec::new();
        };
        if now < deadline {
            return Vec::new();
        }
        match self.state {
            RegistrationState::Assigning | RegistrationState::Registering => {
                self.drop_to_deregistered()
            }
            _ => Vec::new(),
        }
    }

    fn drop_to_deregistered(&mut self) -> Vec<FsmEffect> {
        self.state = RegistrationState::Deregistered;
        self.deadline = None;
        self.client = CLIENT_UNSET;
        vec![
            FsmEffect::RestartTransport,
            FsmEffect::StateChanged(RegistrationState::Deregistered),
        ]
    }
}
