//! Frame sink contract shared by hub and spoke runtimes.
//!
//! An implementation wraps one local transport connection and carries
//! whole command frames. Sends are best-effort: a `false` return means
//! the frame was dropped and the caller must not mutate any routing
//! state in response.

use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use flume::Sender;

use crate::actor::ConnectionCmd;

/// Callback invoked when a peer connection fails.
///
/// The argument is the client id bound to the failed connection, when one
/// is known.
pub type ErrorHandler = Box<dyn Fn(Option<u16>) + Send + Sync>;

/// Outbound frame contract for a single peer connection.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Queue one complete command frame. Returns `false` on a dead
    /// connection; no retry is attempted here.
    async fn send(&self, frame: Bytes) -> bool;

    /// Start pumping frames.
    async fn start(&self);

    /// Stop pumping and release the transport.
    async fn stop(&self);

    /// Register the per-peer error callback. Replaces a prior handler.
    fn register_error_handler(&self, handler: ErrorHandler);
}

/// Frame sink backed by a connection actor's command channel.
pub struct ChannelSink {
    tx: Sender<ConnectionCmd>,
    bound_client: Mutex<Option<u16>>,
    handler: Mutex<Option<ErrorHandler>>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(tx: Sender<ConnectionCmd>) -> Self {
        Self {
            tx,
            bound_client: Mutex::new(None),
            handler: Mutex::new(None),
        }
    }

    /// Record the client this connection authenticated as.
    pub fn bind(&self, client: u16) {
        *self.bound_client.lock().expect("bound-client lock") = Some(client);
    }

    #[must_use]
    pub fn bound_client(&self) -> Option<u16> {
        *self.bound_client.lock().expect("bound-client lock")
    }

    fn fail(&self) -> bool {
        let bound = self.bound_client();
        if let Some(handler) = self.handler.lock().expect("handler lock").as_ref() {
            handler(bound);
        }
        false
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&self, frame: Bytes) -> bool {
        if self.tx.send(ConnectionCmd::Send(frame)).is_err() {
            return self.fail();
        }
        true
    }

    async fn start(&self) {
        // The connection actor starts pumping the moment it is spawned;
        // nothing to arm here.
    }

    async fn stop(&self) {
        let _ = self.tx.send(ConnectionCmd::Close);
    }

    fn register_error_handler(&self, handler: ErrorHandler) {
        *self.handler.lock().expect("handler lock") = Some(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[compio::test]
    async fn send_enqueues_frame() {
        let (tx, rx) = flume::unbounded();
        let sink = ChannelSink::new(tx);

        assert!(sink.send(Bytes::from_static(b"frame")).await);
        assert!(matches!(rx.try_recv(), Ok(ConnectionCmd::Send(_))));
    }

    #[compio::test]
    async fn dead_channel_reports_error_with_bound_client() {
        let (tx, rx) = flume::unbounded();
        drop(rx);

        let sink = ChannelSink::new(tx);
        sink.bind(0x1001);

        let fired = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&fired);
        sink.register_error_handler(Box::new(move |client| {
            assert_eq!(client, Some(0x1001));
            seen.store(true, Ordering::Relaxed);
        }));

        assert!(!sink.send(Bytes::from_static(b"frame")).await);
        assert!(fired.load(Ordering::Relaxed));
    }

    #[compio::test]
    async fn stop_closes_the_connection() {
        let (tx, rx) = flume::unbounded();
        let sink = ChannelSink::new(tx);
        sink.stop().await;
        assert!(matches!(rx.try_recv(), Ok(ConnectionCmd::Close)));
    }
}
