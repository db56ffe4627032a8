//! C7 — SOCKS5 ingress.
//!
//! A minimal, CONNECT-only SOCKSv5 responder grounded on ztunnel's
//! `socks5.rs` handler: no auth negotiation beyond NOAUTH, IPv4/IPv6/
//! domain address types, reply written before the upstream dial
//! resolves (see the design note on `reply_success_early`, not a bug
//! to be fixed here — spec'd behaviour).

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::route::RouteTable;
use crate::session::{Session, SessionId};
use crate::tunnel::Tunnel;

#[derive(Clone)]
pub struct SocksRouter {
    pub routes: Arc<RouteTable>,
    pub sessions: Arc<DashMap<SessionId, Arc<Session>>>,
    pub tunnel: Arc<Tunnel>,
}

impl SocksRouter {
    /// Resolve a SOCKS destination to a live session via the route
    /// table, falling through to the SSH tunnel if no route matches or
    /// the matched session has since closed.
    async fn dispatch(&self, conn: TcpStream, addr: &SocksAddr) {
        let target = addr.to_dial_string();
        if let Some(ip) = addr.route_ip() {
            if let Some(session_id) = self.routes.lookup(ip) {
                if let Some(session) = self.sessions.get(&session_id) {
                    session.connect_to_remote(conn, &target).await;
                    return;
                }
            }
        }
        self.tunnel.connect(conn, &target).await;
    }
}

pub struct Socks5 {
    listener: TcpListener,
}

impl Socks5 {
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, router: SocksRouter) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let router = router.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle(stream, &router).await {
                            tracing::debug!(peer = %peer, error = %e, "socks connection ended");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "socks accept failed");
                    break;
                }
            }
        }
    }
}

enum SocksAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl SocksAddr {
    fn to_dial_string(&self) -> String {
        match self {
            SocksAddr::Ip(sa) => sa.to_string(),
            SocksAddr::Domain(host, port) => format!("{host}:{port}"),
        }
    }

    /// The IP to resolve a CIDR route against. Domain names never
    /// match a route; they fall straight through to the tunnel, which
    /// can resolve them itself.
    fn route_ip(&self) -> Option<IpAddr> {
        match self {
            SocksAddr::Ip(sa) => Some(sa.ip()),
            SocksAddr::Domain(_, _) => None,
        }
    }
}

async fn handle(mut stream: TcpStream, router: &SocksRouter) -> std::io::Result<()> {
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting[0] != 0x05 {
        return Err(invalid("unsupported socks version"));
    }
    let nmethods = greeting[1] as usize;
    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;
    // NOAUTH only; a real client always offers it.
    stream.write_all(&[0x05, 0x00]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != 0x05 {
        return Err(invalid("unsupported socks version"));
    }
    if request[1] != 0x01 {
        return Err(invalid("only CONNECT is supported"));
    }
    // request[2] is reserved.
    let addr = match request[3] {
        0x01 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            let port = read_port(&mut stream).await?;
            SocksAddr::Ip(SocketAddr::new(IpAddr::from(octets), port))
        }
        0x04 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            let port = read_port(&mut stream).await?;
            SocksAddr::Ip(SocketAddr::new(IpAddr::from(octets), port))
        }
        0x03 => {
            let mut len = [0u8];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            let host = String::from_utf8(domain).map_err(|_| invalid("non-utf8 domain"))?;
            let port = read_port(&mut stream).await?;
            SocksAddr::Domain(host, port)
        }
        _ => return Err(invalid("unsupported address type")),
    };

    // Reply success before the upstream dial is even attempted; see
    // the design note accompanying this function.
    reply_success_early(&mut stream).await?;

    router.dispatch(stream, &addr).await;
    Ok(())
}

async fn read_port(stream: &mut TcpStream) -> std::io::Result<u16> {
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;
    Ok(u16::from_be_bytes(buf))
}

/// Spec-mandated ordering: the client sees `Succeeded` before the
/// destination dial has even started, so a later dial failure can only
/// surface as the relayed connection closing, not as a SOCKS error
/// reply. Kept as specified rather than reordered to dial-then-reply.
async fn reply_success_early(stream: &mut TcpStream) -> std::io::Result<()> {
    stream
        .write_all(&[
            0x05, 0x00, 0x00, // version, succeeded, reserved
            0x01, 0, 0, 0, 0, // bound address (unused, IPv4 zero)
            0, 0, // bound port (unused)
        ])
        .await
}

fn invalid(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelConfig;
    use crate::tunnel::Tunnel;
    use tokio::io::AsyncReadExt;

    fn ip_addr_request(ip: [u8; 4], port: u16) -> Vec<u8> {
        let mut req = vec![0x05, 0x01, 0x00, 0x01];
        req.extend_from_slice(&ip);
        req.extend_from_slice(&port.to_be_bytes());
        req
    }

    async fn no_op_router() -> SocksRouter {
        let tunnel = Tunnel::connect_chain(&TunnelConfig::default(), "0.0.0.0:0").await.unwrap();
        SocksRouter {
            routes: Arc::new(RouteTable::new()),
            sessions: Arc::new(DashMap::new()),
            tunnel: Arc::new(tunnel),
        }
    }

    #[tokio::test]
    async fn connect_request_with_no_matching_route_falls_through_to_direct_dial() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let accept_upstream = tokio::spawn(async move { upstream.accept().await.unwrap() });

        let socks = Socks5::bind("127.0.0.1:0").await.unwrap();
        let socks_addr = socks.local_addr().unwrap();
        let router = no_op_router().await;
        tokio::spawn(socks.run(router));

        let mut client = TcpStream::connect(socks_addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut greeting_reply = [0u8; 2];
        client.read_exact(&mut greeting_reply).await.unwrap();
        assert_eq!(greeting_reply, [0x05, 0x00]);

        let ip_octets = match upstream_addr.ip() {
            IpAddr::V4(v4) => v4.octets(),
            _ => panic!("expected ipv4 loopback"),
        };
        client
            .write_all(&ip_addr_request(ip_octets, upstream_addr.port()))
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[..3], [0x05, 0x00, 0x00]);

        let (mut upstream_conn, _) = accept_upstream.await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        upstream_conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn domain_addresses_never_resolve_to_a_route() {
        let addr = SocksAddr::Domain("example.com".into(), 443);
        assert!(addr.route_ip().is_none());
        assert_eq!(addr.to_dial_string(), "example.com:443");
    }

    #[test]
    fn ip_address_route_ip_matches_its_own_ip() {
        let sa: SocketAddr = "10.1.2.3:80".parse().unwrap();
        let addr = SocksAddr::Ip(sa);
        assert_eq!(addr.route_ip(), Some(sa.ip()));
        assert_eq!(addr.to_dial_string(), "10.1.2.3:80");
    }
}
