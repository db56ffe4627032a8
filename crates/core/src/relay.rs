//! Bidirectional byte splice between a local TCP connection and a mux
//! stream, registered in the owning session's [`Registry`] for the
//! duration. Mirrors the source's `handleConnection`: two concurrent
//! copies, either direction ending the whole relay.

use std::sync::Arc;

use tokio::io::{self, AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::mux::{stream_id, MuxStream};
use crate::registry::Registry;

pub async fn splice_registered(conn: TcpStream, stream: MuxStream, registry: Arc<Registry>) {
    let id = stream_id(&stream);
    let token = CancellationToken::new();
    registry.register(id, token.clone());

    let (conn_r, conn_w) = conn.into_split();
    let (stream_r, stream_w) = io::split(stream);

    splice_halves(conn_r, conn_w, stream_r, stream_w, token).await;

    registry.unregister(id);
}

/// Splice any pair of tokio-style half-duplex reader/writer pairs,
/// ending as soon as either direction's copy ends or `token` is
/// cancelled. Used both for registered data streams and for the SSH
/// tunnel's unregistered splices (§4.8), which have no registry entry.
pub async fn splice_halves<AR, AW, BR, BW>(
    mut a_r: AR,
    mut a_w: AW,
    mut b_r: BR,
    mut b_w: BW,
    token: CancellationToken,
) where
    AR: AsyncRead + Unpin,
    AW: AsyncWrite + Unpin,
    BR: AsyncRead + Unpin,
    BW: AsyncWrite + Unpin,
{
    let a_to_b = io::copy(&mut a_r, &mut b_w);
    let b_to_a = io::copy(&mut b_r, &mut a_w);
    tokio::pin!(a_to_b);
    tokio::pin!(b_to_a);

    tokio::select! {
        _ = &mut a_to_b => {}
        _ = &mut b_to_a => {}
        _ = token.cancelled() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn splice_forwards_both_directions_until_one_side_closes() {
        let (test_a, test_a_peer) = tokio::io::duplex(64);
        let (test_b, test_b_peer) = tokio::io::duplex(64);
        let (a_r, a_w) = tokio::io::split(test_a);
        let (b_r, b_w) = tokio::io::split(test_b);
        let token = CancellationToken::new();

        let splice = tokio::spawn(splice_halves(a_r, a_w, b_r, b_w, token));

        let (mut a_peer_r, mut a_peer_w) = tokio::io::split(test_a_peer);
        let (mut b_peer_r, mut b_peer_w) = tokio::io::split(test_b_peer);

        a_peer_w.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b_peer_r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        b_peer_w.write_all(b"world").await.unwrap();
        let mut buf = [0u8; 5];
        a_peer_r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        drop(a_peer_w);
        drop(b_peer_w);
        splice.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_ends_the_splice_immediately() {
        let (a, _a_peer) = tokio::io::duplex(64);
        let (b, _b_peer) = tokio::io::duplex(64);
        let (a_r, a_w) = tokio::io::split(a);
        let (b_r, b_w) = tokio::io::split(b);
        let token = CancellationToken::new();
        token.cancel();

        let result = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            splice_halves(a_r, a_w, b_r, b_w, token),
        )
        .await;
        assert!(result.is_ok(), "splice should end immediately once cancelled");
    }
}
