//! Chassis Core
//!
//! This crate contains the runtime-agnostic core building blocks of the
//! routing fabric:
//! - Local transport addressing (UDS / local TCP) (`endpoint`)
//! - Segmented inbound byte buffer (`buffer`)
//! - Split-pump connection actor (`actor`)
//! - Frame sink contract shared by hub and spokes (`sink`)
//! - Resolved configuration consumed by the fabric (`config`)
//! - Error types (`error`)

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]

pub mod actor;
pub mod buffer;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod ipc;
pub mod sink;
pub mod tcp;

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::actor::{ConnectionActor, ConnectionCmd, ConnectionEvent};
    pub use crate::buffer::FrameBuffer;
    pub use crate::config::FabricConfig;
    pub use crate::endpoint::Endpoint;
    pub use crate::error::CoreError;
    pub use crate::sink::{ChannelSink, ErrorHandler, FrameSink};
}
