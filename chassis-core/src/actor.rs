//! Connection Actor (Protocol-Agnostic Core)
//!
//! One actor == one local-transport connection.
//!
//! Responsibilities:
//! - Own the socket (AsyncRead + AsyncWrite)
//! - Drive read + write pumps (split-pump design)
//! - Move bytes between kernel and the framing layer above
//! - Emit lifecycle events (Connected / Disconnected)
//! - Never contain routing logic (delegated to the hub/spoke runtimes)
//! - Never contain protocol logic (framing happens in chassis-proto)

use bytes::Bytes;
use flume::{Receiver, Sender};
use tracing::trace;

use compio::io::{AsyncRead, AsyncWrite};

/// Messages from the framing layer to the socket
#[derive(Debug)]
pub enum ConnectionCmd {
    /// Send raw bytes (one or more already-encoded frames)
    Send(Bytes),
    /// Close socket
    Close,
}

/// Events from the socket to the framing layer
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Connection established
    Connected,
    /// Received bytes from peer
    Received(Bytes),
    /// Connection closed or failed
    Disconnected,
}

/// Minimal protocol-agnostic connection actor.
///
/// The command-frame decoder and the registration machinery are layered on
/// top by the hub and spoke runtimes; this type only moves bytes.
pub struct ConnectionActor<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    stream: S,

    /// Channel for delivering events upward
    event_tx: Sender<ConnectionEvent>,

    /// Channel for receiving commands from above
    cmd_rx: Receiver<ConnectionCmd>,

    /// Read chunk size for each kernel read
    read_chunk: usize,
}

impl<S> ConnectionActor<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        stream: S,
        event_tx: Sender<ConnectionEvent>,
        cmd_rx: Receiver<ConnectionCmd>,
        read_chunk: usize,
    ) -> Self {
        Self {
            stream,
            event_tx,
            cmd_rx,
            read_chunk,
        }
    }

    /// Run the actor event loop (split pump design).
    ///
    /// - Read pump: kernel → framing layer (via `event_tx`)
    /// - Write pump: framing layer → kernel (via `cmd_rx`)
    /// - No shared mutable state between pumps
    pub async fn run(mut self) {
        use compio::buf::BufResult;
        use compio::io::{AsyncReadExt, AsyncWriteExt};

        let _ = self.event_tx.send(ConnectionEvent::Connected);

        let mut write_queue: Vec<Bytes> = Vec::new();

        loop {
            // === WRITE PUMP (non-blocking drain) ===
            while let Ok(cmd) = self.cmd_rx.try_recv() {
                match cmd {
                    ConnectionCmd::Send(b) => write_queue.push(b),
                    ConnectionCmd::Close => {
                        let _ = self.event_tx.send(ConnectionEvent::Disconnected);
                        return;
                    }
                }
            }

            for buf in write_queue.drain(..) {
                let BufResult(write_res, _) = (&mut self.stream).write_all(buf.to_vec()).await;
                if write_res.is_err() {
                    trace!("write failed, closing connection");
                    let _ = self.event_tx.send(ConnectionEvent::Disconnected);
                    return;
                }
            }

            // === READ PUMP ===
            let chunk: Vec<u8> = Vec::with_capacity(self.read_chunk);
            let BufResult(read_res, chunk) = (&mut self.stream).read(chunk).await;

            match read_res {
                Ok(0) => {
                    trace!("EOF, connection closed by peer");
                    let _ = self.event_tx.send(ConnectionEvent::Disconnected);
                    break;
                }
                Err(e) => {
                    trace!("read error: {e:?}");
                    let _ = self.event_tx.send(ConnectionEvent::Disconnected);
                    break;
                }
                Ok(_) => {
                    let _ = self.event_tx.send(ConnectionEvent::Received(Bytes::from(chunk)));
                }
            }

            // Brief yield so queued write commands interleave with a busy
            // read side.
            compio::time::sleep(std::time::Duration::from_micros(1)).await;
        }
    }
}
