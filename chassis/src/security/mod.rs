//! Security: UID/GID policy checking and client identity bookkeeping.

pub mod identity;
pub mod store;

pub use identity::IdentityMap;
pub use store::{PolicyStore, SecurityMode};
