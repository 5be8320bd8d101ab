//! Resolved configuration consumed by the routing fabric.
//!
//! Configuration parsing happens outside the core; this struct carries the
//! already-resolved values the hub and spokes act on.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Resolved fabric configuration.
///
/// # Examples
///
/// ```
/// use chassis_core::config::FabricConfig;
/// use std::time::Duration;
///
/// let cfg = FabricConfig::default()
///     .with_network("local")
///     .with_watchdog(Duration::from_millis(200), 2);
/// assert!(cfg.watchdog_enabled);
/// ```
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Path namespace shared by all applications of one fabric instance.
    ///
    /// The UDS socket nodes live under `{base_path}/{network}/`.
    pub network: String,

    /// Root directory for UDS socket nodes.
    pub base_path: PathBuf,

    /// Whether the hub pings registered clients and expires silent ones.
    pub watchdog_enabled: bool,

    /// Full watchdog cycle; pings go out every half cycle.
    pub watchdog_timeout: Duration,

    /// Number of missed pongs tolerated before a client is declared lost.
    pub allowed_missing_pongs: u32,

    /// Grace period for orderly teardown.
    pub shutdown_timeout: Duration,

    /// Debounce window batching nearby `request_service` calls into one
    /// REQUEST_SERVICE frame. Zero disables batching.
    pub request_debounce_time: Duration,

    /// True when hub and spokes share a host (UDS transport).
    pub is_local_routing: bool,

    /// Name of the application hosting the routing manager.
    pub routing_host_name: String,

    /// Address of the routing host for TCP mode.
    pub routing_host_address: IpAddr,

    /// Port of the routing host for TCP mode.
    pub routing_host_port: u16,

    /// First client id the hub hands out.
    pub client_id_base: u16,

    /// Master switch for the policy engine.
    pub is_security_enabled: bool,

    /// Audit mode: policy decisions are logged but everything is allowed.
    pub is_security_audit: bool,

    /// Verify that the bound client matches the frame's sender id.
    pub check_credentials: bool,

    /// Enforce the update/whitelist on runtime policy changes.
    pub check_whitelist: bool,

    /// Accept spokes connecting from another host.
    pub allow_remote_clients: bool,

    /// Ceiling for a single local command frame.
    pub max_message_size_local: usize,

    /// Threads driving endpoint I/O.
    pub io_thread_count: usize,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            network: "default".to_string(),
            base_path: PathBuf::from("/tmp/chassis"),
            watchdog_enabled: false,
            watchdog_timeout: Duration::from_secs(5),
            allowed_missing_pongs: 3,
            shutdown_timeout: Duration::from_secs(5),
            request_debounce_time: Duration::from_millis(10),
            is_local_routing: true,
            routing_host_name: "routingmanagerd".to_string(),
            routing_host_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            routing_host_port: 31490,
            client_id_base: 0x1000,
            is_security_enabled: false,
            is_security_audit: false,
            check_credentials: false,
            check_whitelist: false,
            allow_remote_clients: false,
            max_message_size_local: 8 * 1024 * 1024,
            io_thread_count: num_cpus::get().min(4),
        }
    }
}

impl FabricConfig {
    #[must_use]
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    #[must_use]
    pub fn with_base_path(mut self, base_path: impl Into<PathBuf>) -> Self {
        self.base_path = base_path.into();
        self
    }

    /// Enable the watchdog with the given cycle and tolerance.
    #[must_use]
    pub fn with_watchdog(mut self, timeout: Duration, allowed_missing_pongs: u32) -> Self {
        self.watchdog_enabled = true;
        self.watchdog_timeout = timeout;
        self.allowed_missing_pongs = allowed_missing_pongs;
        self
    }

    #[must_use]
    pub fn with_request_debounce(mut self, window: Duration) -> Self {
        self.request_debounce_time = window;
        self
    }

    /// Switch to TCP mode against a remote routing host.
    #[must_use]
    pub fn with_routing_host(mut self, address: IpAddr, port: u16) -> Self {
        self.is_local_routing = false;
        self.routing_host_address = address;
        self.routing_host_port = port;
        self
    }

    /// Enable policy enforcement; `audit` downgrades denials to log lines.
    #[must_use]
    pub fn with_security(mut self, audit: bool) -> Self {
        self.is_security_enabled = true;
        self.is_security_audit = audit;
        self.check_credentials = true;
        self
    }

    #[must_use]
    pub fn with_client_id_base(mut self, base: u16) -> Self {
        self.client_id_base = base;
        self
    }

    #[must_use]
    pub fn with_max_message_size_local(mut self, max: usize) -> Self {
        self.max_message_size_local = max;
        self
    }
}
