//! C8 — SSH tunnel egress.
//!
//! Builds an optional chain of SSH hops at startup (dial node 0
//! directly, each later node through the previous hop's own `Dial`),
//! and uses the last hop — if any — as the default route for SOCKS/
//! Connect destinations with no session route. If `tunnel.listen_addr`
//! is configured, the last hop is also asked to reverse-forward back to
//! this server's own listener, letting a remote SSH host reach it.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use russh::client::{self, Msg};
use russh::keys::key::PublicKey;
use russh::{Channel, ChannelStream};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::config::{SshNodeConfig, TunnelConfig};
use crate::error::{Error, Result};

struct TunnelHandler {
    /// Address dialed locally for each inbound reverse-forwarded
    /// connection. Only the last hop ever has this set, and only once
    /// `request_reverse_forward` runs — which happens after the hop is
    /// already connected and authenticated — so it has to be settable
    /// after the handler has been moved into `connect_stream`'s
    /// background task.
    local_forward_target: Arc<Mutex<Option<String>>>,
    /// Mirrors `TunnelConfig::insecure_host_keys` (default `true`): the
    /// agent already pins the server's own certificate, and these hops
    /// are operator-supplied infrastructure, not public peers, so
    /// accepting any host key is the default. Set the config flag to
    /// `false` to refuse hops whose host key can't be verified, since
    /// we carry no known-hosts store to verify against.
    insecure_host_keys: bool,
}

#[async_trait]
impl client::Handler for TunnelHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(self.insecure_host_keys)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _connected_address: &str,
        _connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let Some(target) = self.local_forward_target.lock().unwrap().clone() else {
            return Ok(());
        };
        tokio::spawn(async move {
            let local = match TcpStream::connect(&target).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(address = %target, error = %e, "tunnel reverse-forward dial failed");
                    return;
                }
            };
            let stream = channel.into_stream();
            let (chan_r, chan_w) = tokio::io::split(stream);
            let (local_r, local_w) = local.into_split();
            crate::relay::splice_halves(local_r, local_w, chan_r, chan_w, CancellationToken::new()).await;
        });
        Ok(())
    }
}

/// A single connected SSH hop. `dial` opens a direct-tcpip channel
/// through this hop to reach the next one (or the final destination).
struct Hop {
    handle: client::Handle<TunnelHandler>,
    forward_target: Arc<Mutex<Option<String>>>,
}

impl Hop {
    async fn dial(&self, host: &str, port: u16) -> Result<ChannelStream<Msg>> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, port as u32, "0.0.0.0", 0)
            .await
            .map_err(|e| Error::Transport(format!("ssh dial {host}:{port}: {e}")))?;
        Ok(channel.into_stream())
    }

    /// Arm this hop to dial `target` locally for every subsequent
    /// reverse-forwarded connection. Only meaningful once this hop has
    /// also been asked (via `tcpip_forward`) to listen remotely.
    fn set_forward_target(&self, target: String) {
        *self.forward_target.lock().unwrap() = Some(target);
    }
}

pub struct Tunnel {
    /// The last hop in the chain, used as the default egress for
    /// routes with no matching session. `None` if no nodes are
    /// configured: destinations then dial directly.
    last_hop: Option<Hop>,
}

impl Tunnel {
    /// Build the node chain and, if configured, start the reverse
    /// listener on the last hop. An empty node list is a valid
    /// configuration: `connect` then always dials directly.
    pub async fn connect_chain(config: &TunnelConfig, server_listen_addr: &str) -> Result<Self> {
        if config.nodes.is_empty() {
            return Ok(Self { last_hop: None });
        }

        let mut hop = dial_first_hop(&config.nodes[0], config.insecure_host_keys).await?;
        for node in &config.nodes[1..] {
            hop = dial_next_hop(&hop, node, config.insecure_host_keys).await?;
        }

        if let Some(listen_addr) = &config.listen_addr {
            request_reverse_forward(&hop, listen_addr, server_listen_addr).await?;
            hop.set_forward_target(server_listen_addr.to_string());
        }

        Ok(Self { last_hop: Some(hop) })
    }

    /// Dial `addr` through the last hop if one exists, else directly,
    /// and splice it bidirectionally with `conn` until either side ends.
    pub async fn connect(&self, conn: TcpStream, addr: &str) {
        let target = match addr.parse::<std::net::SocketAddr>() {
            Ok(sa) => (sa.ip().to_string(), sa.port()),
            Err(_) => match addr.rsplit_once(':') {
                Some((host, port)) => match port.parse::<u16>() {
                    Ok(p) => (host.to_string(), p),
                    Err(_) => {
                        tracing::warn!(addr, "tunnel connect: malformed port");
                        return;
                    }
                },
                None => {
                    tracing::warn!(addr, "tunnel connect: malformed address");
                    return;
                }
            },
        };

        let (conn_r, conn_w) = conn.into_split();
        let token = CancellationToken::new();

        match &self.last_hop {
            Some(hop) => match hop.dial(&target.0, target.1).await {
                Ok(stream) => {
                    let (remote_r, remote_w) = tokio::io::split(stream);
                    crate::relay::splice_halves(conn_r, conn_w, remote_r, remote_w, token).await;
                }
                Err(e) => tracing::warn!(addr, error = %e, "tunnel dial through ssh failed"),
            },
            None => match TcpStream::connect(format!("{}:{}", target.0, target.1)).await {
                Ok(remote) => {
                    let (remote_r, remote_w) = remote.into_split();
                    crate::relay::splice_halves(conn_r, conn_w, remote_r, remote_w, token).await;
                }
                Err(e) => tracing::warn!(addr, error = %e, "tunnel direct dial failed"),
            },
        }
    }
}

async fn dial_first_hop(node: &SshNodeConfig, insecure_host_keys: bool) -> Result<Hop> {
    let stream = TcpStream::connect(&node.host)
        .await
        .map_err(|e| Error::Transport(format!("ssh hop {}: {e}", node.host)))?;
    let forward_target = Arc::new(Mutex::new(None));
    let config = Arc::new(client::Config::default());
    let handler = TunnelHandler {
        local_forward_target: forward_target.clone(),
        insecure_host_keys,
    };
    let mut handle = client::connect_stream(config, stream, handler)
        .await
        .map_err(|e| Error::Transport(format!("ssh handshake {}: {e}", node.host)))?;
    authenticate(&mut handle, node).await?;
    Ok(Hop { handle, forward_target })
}

async fn dial_next_hop(previous: &Hop, node: &SshNodeConfig, insecure_host_keys: bool) -> Result<Hop> {
    let (host, port) = split_host_port(&node.host)?;
    let stream = previous.dial(&host, port).await?;
    let forward_target = Arc::new(Mutex::new(None));
    let config = Arc::new(client::Config::default());
    let handler = TunnelHandler {
        local_forward_target: forward_target.clone(),
        insecure_host_keys,
    };
    let mut handle = client::connect_stream(config, stream, handler)
        .await
        .map_err(|e| Error::Transport(format!("ssh handshake {}: {e}", node.host)))?;
    authenticate(&mut handle, node).await?;
    Ok(Hop { handle, forward_target })
}

async fn authenticate(handle: &mut client::Handle<TunnelHandler>, node: &SshNodeConfig) -> Result<()> {
    let ok = handle
        .authenticate_password(&node.username, &node.password)
        .await
        .map_err(|e| Error::Transport(format!("ssh auth {}: {e}", node.host)))?;
    if !ok {
        return Err(Error::Transport(format!("ssh auth rejected for {}", node.host)));
    }
    Ok(())
}

async fn request_reverse_forward(hop: &Hop, tunnel_listen_addr: &str, server_listen_addr: &str) -> Result<()> {
    let (bind_host, bind_port) = split_host_port(tunnel_listen_addr)?;
    hop.handle
        .tcpip_forward(&bind_host, bind_port as u32)
        .await
        .map_err(|e| Error::Transport(format!("ssh reverse forward {tunnel_listen_addr}: {e}")))?;
    tracing::info!(tunnel_listen_addr, server_listen_addr, "ssh reverse forward established");
    Ok(())
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::Transport(format!("malformed address {addr}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::Transport(format!("malformed port in {addr}")))?;
    Ok((host.to_string(), port))
}
