//! C1 — stream multiplexer.
//!
//! Thin wrapper around the `yamux` crate satisfying the contract of
//! spec §4.1: `open_stream`/`accept_stream`/`close`, full-duplex byte
//! streams with no framing above the byte layer, and a dead-session
//! failure mode once any operation errors.
//!
//! `yamux::Connection` exposes no handle type to open or close streams
//! from another task; it only hands out `poll_next_inbound`/
//! `poll_new_outbound`/`poll_close`, each requiring exclusive access to
//! drive the underlying socket. A single background task therefore owns
//! the `Connection` outright and is itself the driver: it is polled by
//! the runtime like any other future, and on every wake it drains
//! inbound streams, then services at most one outstanding open or close
//! request from a command channel. [`MuxSession::new`] spawns that task
//! once and exposes only the `open_stream`/`accept_stream`/`close`
//! surface spec.md names.
//!
//! `yamux` itself is built on `futures`' `AsyncRead`/`AsyncWrite`, not
//! tokio's; streams are adapted with `tokio_util::compat` at the two
//! boundaries (the incoming TLS connection going in, each `Stream`
//! coming out) so every other module in this crate only ever sees
//! tokio-flavoured I/O.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use yamux::{Config, Connection, Mode};

use crate::error::Error;

/// A multiplexed data stream, already adapted to tokio's `AsyncRead`/`AsyncWrite`.
pub type MuxStream = Compat<yamux::Stream>;

/// 32-bit stream identifier, per spec §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub fn stream_id(stream: &MuxStream) -> StreamId {
    StreamId(stream.get_ref().id().val())
}

/// Which side opened the mux connection first. The server plays
/// `Client` (it opens the command stream); the agent plays `Server`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// One outstanding request the driver task services against the
/// `Connection` it owns.
enum Command {
    Open(oneshot::Sender<Result<MuxStream, Error>>),
    Close(oneshot::Sender<Result<(), Error>>),
}

/// A live multiplexed session over one TLS connection.
pub struct MuxSession {
    cmd_tx: mpsc::Sender<Command>,
    inbound: mpsc::UnboundedReceiver<MuxStream>,
}

impl MuxSession {
    /// Wrap an established, ordered byte connection and start driving
    /// it in the background. `role` decides whether this side opens
    /// (`Client`) or accepts (`Server`) the mux's first stream.
    pub fn new<T>(io: T, role: Role) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mode = match role {
            Role::Client => Mode::Client,
            Role::Server => Mode::Server,
        };
        let compat: Compat<T> = io.compat();
        let connection = Connection::new(compat, Config::default(), mode);

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::channel(8);

        tokio::spawn(Driver {
            connection,
            inbound_tx,
            cmd_rx,
            pending_open: None,
            closing: None,
        });

        Self {
            cmd_tx,
            inbound: inbound_rx,
        }
    }

    /// Open a new, locally-initiated stream.
    pub async fn open_stream(&mut self) -> Result<MuxStream, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Open(reply_tx))
            .await
            .map_err(|_| Error::Transport("mux session closed".into()))?;
        reply_rx
            .await
            .map_err(|_| Error::Transport("mux session closed".into()))?
    }

    /// Accept the next peer-initiated stream, strictly FIFO in the
    /// order the peer opened them.
    pub async fn accept_stream(&mut self) -> Result<MuxStream, Error> {
        self.inbound
            .recv()
            .await
            .ok_or_else(|| Error::Transport("mux session closed".into()))
    }

    /// Close every stream and the underlying connection.
    pub async fn close(&mut self) -> Result<(), Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Close(reply_tx)).await.is_err() {
            // Driver already gone; treat as already closed.
            return Ok(());
        }
        reply_rx
            .await
            .map_err(|_| Error::Transport("mux session closed".into()))?
    }
}

/// Sole owner of the `Connection`, spawned as its own future rather
/// than an `async fn` loop: `poll_next_inbound`/`poll_new_outbound`/
/// `poll_close` all take `&mut self` and must be polled directly
/// against the same waker on every wake, which an `async` body driving
/// a `select!` over separate `.await`s cannot guarantee.
struct Driver<T> {
    connection: Connection<Compat<T>>,
    inbound_tx: mpsc::UnboundedSender<MuxStream>,
    cmd_rx: mpsc::Receiver<Command>,
    pending_open: Option<oneshot::Sender<Result<MuxStream, Error>>>,
    closing: Option<oneshot::Sender<Result<(), Error>>>,
}

impl<T> Future for Driver<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        // Drain every inbound stream the peer has opened so far,
        // preserving order; `accept_stream` reads off `inbound_tx`'s
        // receiver in the same order they arrive here.
        loop {
            match this.connection.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    let _ = this.inbound_tx.send(stream.compat());
                }
                Poll::Ready(Some(Err(e))) => {
                    tracing::debug!(error = %e, "mux connection driver stopping");
                    return Poll::Ready(());
                }
                Poll::Ready(None) => return Poll::Ready(()),
                Poll::Pending => break,
            }
        }

        // Pull in the next command once there is no open/close already
        // in flight; both `open_stream` and `close` take `&mut self` on
        // `MuxSession`, so only one can ever be outstanding at a time.
        if this.closing.is_none() && this.pending_open.is_none() {
            match this.cmd_rx.poll_recv(cx) {
                Poll::Ready(Some(Command::Open(reply))) => this.pending_open = Some(reply),
                Poll::Ready(Some(Command::Close(reply))) => this.closing = Some(reply),
                Poll::Ready(None) => return Poll::Ready(()),
                Poll::Pending => {}
            }
        }

        if let Some(reply) = this.closing.take() {
            return match this.connection.poll_close(cx) {
                Poll::Ready(result) => {
                    let _ = reply.send(result.map_err(|e| Error::Transport(format!("mux close: {e}"))));
                    Poll::Ready(())
                }
                Poll::Pending => {
                    this.closing = Some(reply);
                    Poll::Pending
                }
            };
        }

        if let Some(reply) = this.pending_open.take() {
            match this.connection.poll_new_outbound(cx) {
                Poll::Ready(Ok(stream)) => {
                    let _ = reply.send(Ok(stream.compat()));
                }
                Poll::Ready(Err(e)) => {
                    let _ = reply.send(Err(Error::Transport(format!("mux open_stream: {e}"))));
                }
                Poll::Pending => {
                    this.pending_open = Some(reply);
                }
            }
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn client_open_pairs_with_server_accept() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut client = MuxSession::new(client_io, Role::Client);
        let mut server = MuxSession::new(server_io, Role::Server);

        let mut client_stream = client.open_stream().await.unwrap();
        let mut server_stream = server.accept_stream().await.unwrap();

        client_stream.write_all(b"ping").await.unwrap();
        client_stream.flush().await.unwrap();
        let mut buf = [0u8; 4];
        server_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server_stream.write_all(b"pong").await.unwrap();
        server_stream.flush().await.unwrap();
        let mut buf = [0u8; 4];
        client_stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn accept_stream_errors_once_peer_closes() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut client = MuxSession::new(client_io, Role::Client);
        let mut server = MuxSession::new(server_io, Role::Server);

        client.close().await.unwrap();
        drop(client);

        assert!(server.accept_stream().await.is_err());
    }
}
