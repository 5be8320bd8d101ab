/// Chassis Core Error Types
///
/// Transport-level error handling shared by the hub and spoke runtimes.
/// Frame-level failures live in the protocol crate; connection loss is
/// reported through the connection actor's lifecycle events, so the only
/// errors surfacing here are the ones the host must act on.

use std::io;
use thiserror::Error;

/// Main error type for transport operations
#[derive(Error, Debug)]
pub enum CoreError {
    /// IO error during socket operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to bind the server endpoint; fatal at startup
    #[error("Bind failed on {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: io::Error,
    },
}
