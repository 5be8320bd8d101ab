//! Local-transport addressing for the routing fabric.
//!
//! A fabric node talks over UNIX-domain sockets (the default) or a local
//! TCP pair when the routing host is reached by address. Socket nodes for
//! the UDS transport live under a per-network base path and are named by
//! the owning client id in hex.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Transport endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Local TCP transport: `tcp://host:port`
    Tcp(SocketAddr),
    /// UNIX-domain socket transport: `local:///path/to/socket`
    #[cfg(unix)]
    Local(PathBuf),
}

impl Endpoint {
    /// Parse an endpoint from a string.
    ///
    /// Supported formats:
    /// - `tcp://127.0.0.1:30490`
    /// - `tcp://[::1]:30490` (IPv6)
    /// - `local:///tmp/chassis-default/1000` (Unix only)
    pub fn parse(s: &str) -> Result<Self, EndpointError> {
        s.parse()
    }

    /// Socket node for `client` under the base path of `network`.
    ///
    /// Layout: `{base_path}/{network}/{client_id:x}`. The hub owns the node
    /// named after `ROUTING_CLIENT` (0), each spoke the node named after
    /// its assigned id.
    #[cfg(unix)]
    #[must_use]
    pub fn for_client(base_path: &Path, network: &str, client: u16) -> Self {
        Self::Local(base_path.join(network).join(format!("{client:x}")))
    }

    /// Returns true if this is a TCP endpoint.
    #[must_use]
    pub fn is_tcp(&self) -> bool {
        matches!(self, Endpoint::Tcp(_))
    }

    /// Returns true if this is a UNIX-domain endpoint.
    #[cfg(unix)]
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Endpoint::Local(_))
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(addr) = s.strip_prefix("tcp://") {
            let socket_addr = addr
                .parse::<SocketAddr>()
                .map_err(|_| EndpointError::InvalidTcpAddress(addr.to_string()))?;
            Ok(Endpoint::Tcp(socket_addr))
        } else if let Some(path) = s.strip_prefix("local://") {
            #[cfg(unix)]
            {
                if path.is_empty() {
                    return Err(EndpointError::InvalidLocalPath(
                        "socket path cannot be empty".to_string(),
                    ));
                }
                Ok(Endpoint::Local(PathBuf::from(path)))
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                Err(EndpointError::LocalNotSupported)
            }
        } else {
            Err(EndpointError::InvalidScheme(s.to_string()))
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
            #[cfg(unix)]
            Endpoint::Local(path) => write!(f, "local://{}", path.display()),
        }
    }
}

/// Errors that can occur when parsing or using endpoints.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("Invalid scheme in endpoint: {0} (expected tcp:// or local://)")]
    InvalidScheme(String),

    #[error("Invalid TCP address: {0}")]
    InvalidTcpAddress(String),

    #[error("Invalid socket path: {0}")]
    InvalidLocalPath(String),

    #[error("UNIX-domain transport not supported on this platform")]
    LocalNotSupported,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
