//! Routing: the hub (routing manager), the spokes (routing clients), and
//! the state they broker.

pub mod fsm;
pub mod hub;
pub mod runtime;
pub mod spoke;
pub mod subscriptions;
pub mod table;
pub mod watchdog;

pub use fsm::{RegistrationFsm, RegistrationState};
pub use hub::{HostEvent, HubCore, HubOutput, SecurityUpdateResult};
pub use runtime::{RoutingHub, RoutingSpoke, SubscriptionAcceptor};
pub use spoke::{SpokeAction, SpokeCore, SpokeEvent};
pub use subscriptions::{PendingToken, SubscriptionEffect, SubscriptionRegistry};
pub use table::{DeltaBatch, OfferError, RoutingTable};
pub use watchdog::{Watchdog, WatchdogTick};
