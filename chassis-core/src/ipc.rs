//! UNIX-domain socket transport.
//!
//! Socket nodes follow the `{base_path}/{network}/{client:x}` layout from
//! `endpoint::Endpoint::for_client`. The hub unlinks its node on shutdown
//! so a restart does not collide with a stale filesystem entry.

#[cfg(unix)]
use compio::net::{UnixListener, UnixStream};
#[cfg(unix)]
use std::path::Path;

#[cfg(unix)]
/// Connect to a peer's socket node.
pub async fn connect<P: AsRef<Path>>(path: P) -> std::io::Result<UnixStream> {
    UnixStream::connect(path).await
}

#[cfg(unix)]
/// Bind a socket node, replacing a stale one left by a crashed owner.
///
/// The parent directory is created on demand so a fresh network namespace
/// works without external setup.
pub async fn bind<P: AsRef<Path>>(path: P) -> std::io::Result<UnixListener> {
    let path_ref = path.as_ref();
    if let Some(parent) = path_ref.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path_ref.exists() {
        std::fs::remove_file(path_ref)?;
    }

    UnixListener::bind(path).await
}

#[cfg(unix)]
/// Accept a connection on a bound socket node.
pub async fn accept(listener: &UnixListener) -> std::io::Result<UnixStream> {
    let (stream, _addr) = listener.accept().await?;
    Ok(stream)
}

#[cfg(unix)]
/// Remove the socket node at shutdown. Missing nodes are not an error.
pub fn unlink<P: AsRef<Path>>(path: P) {
    let _ = std::fs::remove_file(path);
}
