//! # Chassis Proto
//!
//! **Internal protocol implementation crate for chassis.**
//!
//! ⚠️ **This is an internal implementation detail. Use the `chassis` crate
//! for the public API.**
//!
//! This crate implements the framed, versioned command protocol spoken
//! between the routing manager and its spokes: the command catalog, the
//! incremental frame decoder, the routing-info entry lists, and the
//! big-endian security-policy blob with its interval sets.
//!
//! ## Features
//!
//! - **Zero-copy**: decoded payloads borrow from the inbound segments
//! - **Sans-IO**: pure state machines, no sockets in this crate
//! - **Fail-closed**: every decode error discards partial state

// Allow some pedantic lints
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::missing_errors_doc)] // Will add gradually
#![allow(clippy::doc_markdown)] // Too many false positives

// Internal modules (not part of public API)
mod wire;

// Protocol types
pub mod codec;
pub mod command;
pub mod events;
pub mod intervals;
pub mod policy;
pub mod routing_info;
pub mod send;
pub mod subscribe;
pub mod types;

// Re-export the working set for clean downstream imports
pub use codec::{FrameDecoder, RawFrame, DEFAULT_MAX_FRAME_SIZE};
pub use command::{Command, CommandId, ProtocolError, COMMAND_HEADER_SIZE};
pub use policy::Policy;
pub use types::{ClientId, ServiceRecord};

/// Prelude module for convenient imports
///
/// ```rust
/// use chassis_proto::prelude::*;
/// ```
pub mod prelude {
    pub use crate::codec::{FrameDecoder, RawFrame};
    pub use crate::command::{Command, CommandId, ProtocolError};
    pub use crate::events::EventRegistration;
    pub use crate::intervals::IntervalSet;
    pub use crate::policy::Policy;
    pub use crate::routing_info::{RoutingEntryKind, RoutingInfoEntry};
    pub use crate::send::UserMessage;
    pub use crate::subscribe::{DebounceFilter, SubscribeRequest, SubscriptionRef};
    pub use crate::types::*;
    pub use bytes::Bytes;
}
