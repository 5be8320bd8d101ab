//! # Chassis
//!
//! A SOME/IP routing fabric: the inter-process layer that connects the
//! applications of one node to each other and to the central routing
//! manager over UNIX-domain sockets or local TCP.
//!
//! ## Architecture
//!
//! Chassis is structured as a **routing kernel** with clean layering:
//!
//! - **`chassis-core`**: transports, connection actors, configuration
//! - **`chassis-proto`**: the framed command protocol (sans-IO)
//! - **`chassis`**: hub and spoke runtimes, routing table, subscriptions,
//!   security policy engine (this crate)
//!
//! ## Roles
//!
//! Every application runs a [`routing::RoutingSpoke`]; exactly one
//! process per node additionally runs the [`routing::RoutingHub`], the
//! authoritative broker owning the routing table, the subscription
//! engine and the watchdog.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chassis::routing::RoutingSpoke;
//! use chassis::security::{PolicyStore, SecurityMode};
//! use chassis_core::config::FabricConfig;
//!
//! #[compio::main]
//! async fn main() {
//!     let policy = Arc::new(PolicyStore::new(SecurityMode::Disabled, false));
//!     let (spoke, events) = RoutingSpoke::new("demo-app", FabricConfig::default(), policy);
//!
//!     compio::runtime::spawn(async move {
//!         while let Ok(event) = events.recv_async().await {
//!             println!("event: {event:?}");
//!         }
//!     })
//!     .detach();
//!
//!     spoke.start().await.expect("routing host reachable");
//! }
//! ```
//!
//! ## Safety
//!
//! - 100% safe Rust in this crate; `unsafe` is confined to socket-option
//!   tuning in `chassis-core`
//! - Protocol state machines are sans-IO, pure and unit-tested
//! - No lock is held across an endpoint send

#![warn(missing_docs)]
#![warn(clippy::all)]
// Allow some pedantic patterns
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::future_not_send)] // Runtime-agnostic design
#![allow(clippy::missing_errors_doc)] // Will add gradually
#![allow(clippy::doc_markdown)] // Too many false positives

// Re-export core types
pub use bytes::Bytes;
pub use chassis_core::config::FabricConfig;
pub use chassis_core::endpoint::Endpoint;
pub use chassis_core::error::CoreError;
pub use chassis_proto::prelude::{Command, CommandId, Policy, ProtocolError};

#[allow(missing_docs)]
pub mod routing;
#[allow(missing_docs)]
pub mod security;

/// Development helpers (benches/tests)
pub mod dev_tracing;
