//! C9 — server aggregate. Owns every other component: the session
//! table, the route table, the observer list, the shared TLS identity
//! (`pub_key_hash`) and the per-process HTTP magic prefix.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine;
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::RwLock;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::route::RouteTable;
use crate::session::{Session, SessionId};
use crate::socks::{Socks5, SocksRouter};
use crate::tunnel::Tunnel;

/// Called on session create/close; the CLI registers itself at startup
/// (spec §4.9) to print connect/disconnect notices.
pub trait SessionObserver: Send + Sync {
    fn new_session(&self, session: &Arc<Session>);
    fn close_session(&self, session: &Arc<Session>);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Logical name -> per-OS shell command, populated once at startup and
/// consumed by the CLI/API so operators can run `ls`, `ps`, `id`,
/// `pwd`, `netstat` without knowing the remote OS (spec §4.9/§6).
fn os_command_table() -> HashMap<(&'static str, &'static str), &'static str> {
    let mut table = HashMap::new();
    table.insert(("linux", "ls"), "ls -la");
    table.insert(("linux", "ps"), "ps aux");
    table.insert(("linux", "id"), "id");
    table.insert(("linux", "pwd"), "pwd");
    table.insert(("linux", "netstat"), "netstat -tulpn");
    table.insert(("darwin", "ls"), "ls -la");
    table.insert(("darwin", "ps"), "ps aux");
    table.insert(("darwin", "id"), "id");
    table.insert(("darwin", "pwd"), "pwd");
    table.insert(("darwin", "netstat"), "netstat -an");
    table.insert(("windows", "ls"), "dir");
    table.insert(("windows", "ps"), "tasklist");
    table.insert(("windows", "id"), "whoami");
    table.insert(("windows", "pwd"), "cd");
    table.insert(("windows", "netstat"), "netstat -an");
    table
}

pub struct Server {
    pub config: Config,
    pub share_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub http_magic: String,
    pub pub_key_hash: String,

    sessions: Arc<DashMap<SessionId, Arc<Session>>>,
    routes: Arc<RouteTable>,
    tunnel: RwLock<Option<Arc<Tunnel>>>,
    observers: DashMap<u64, Arc<dyn SessionObserver>>,
    next_observer_id: std::sync::atomic::AtomicU64,
    os_commands: HashMap<(&'static str, &'static str), &'static str>,
}

impl Server {
    /// Build the server record: derive `pub_key_hash` from the PEM
    /// public key, generate a fresh `http_magic`, and set up empty
    /// session/route/observer tables. The SSH tunnel chain is built
    /// separately by `connect_tunnel` once the event loop is running.
    pub fn new(config: Config, share_dir: PathBuf, logs_dir: PathBuf, server_pub_pem: &[u8]) -> Result<Arc<Self>> {
        let pub_key_hash = spki_sha256_hex(server_pub_pem)?;
        let http_magic: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(15)
            .map(char::from)
            .collect();

        Ok(Arc::new(Self {
            config,
            share_dir,
            logs_dir,
            http_magic,
            pub_key_hash,
            sessions: Arc::new(DashMap::new()),
            routes: Arc::new(RouteTable::new()),
            tunnel: RwLock::new(None),
            observers: DashMap::new(),
            next_observer_id: std::sync::atomic::AtomicU64::new(0),
            os_commands: os_command_table(),
        }))
    }

    pub async fn connect_tunnel(&self) -> Result<()> {
        let tunnel = Tunnel::connect_chain(&self.config.tunnel, &self.config.listen_addr).await?;
        *self.tunnel.write().await = Some(Arc::new(tunnel));
        Ok(())
    }

    /// Run the agent handshake on a freshly dispatched connection and,
    /// on success, register the session and notify observers. Spawned
    /// by the listener per accepted connection; errors are logged and
    /// simply drop the connection (spec §7 transport-error handling).
    pub async fn accept_agent_session<T>(self: &Arc<Self>, id: SessionId, io: T, address: SocketAddr)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        match Session::handshake(id, io, address, &self.logs_dir).await {
            Ok(session) => {
                tracing::info!(session = id, summary = %session.summary(), "agent session established");
                self.sessions.insert(id, session.clone());
                for observer in self.observers.iter() {
                    observer.value().new_session(&session);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, address = %address, "agent handshake failed");
            }
        }
    }

    pub fn get_session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|e| e.value().clone())
    }

    pub fn list_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn close_session(&self, id: SessionId) -> Result<()> {
        let Some((_, session)) = self.sessions.remove(&id) else {
            return Err(Error::InvalidSessionId);
        };
        session.close().await;
        for observer in self.observers.iter() {
            observer.value().close_session(&session);
        }
        Ok(())
    }

    pub fn add_route(&self, cidr: &str, session_id: SessionId) -> Result<()> {
        if !self.sessions.contains_key(&session_id) {
            return Err(Error::InvalidSessionId);
        }
        self.routes
            .add_route(cidr, session_id)
            .map_err(|_| Error::InvalidCidr)
    }

    pub fn del_route(&self, cidr: &str) -> Result<()> {
        self.routes.del_route(cidr).map_err(|_| Error::InvalidRoute)
    }

    pub fn clear_routes(&self) {
        self.routes.clear_routes();
    }

    pub fn list_routes(&self) -> Vec<(String, SessionId)> {
        self.routes.list()
    }

    pub fn register_observer(&self, observer: Arc<dyn SessionObserver>) -> ObserverId {
        let id = self.next_observer_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.observers.insert(id, observer);
        ObserverId(id)
    }

    pub fn unregister_observer(&self, id: ObserverId) {
        self.observers.remove(&id.0);
    }

    /// The canned shell command for `name` (ls/ps/id/pwd/netstat) on
    /// the given agent OS, if one is defined.
    pub fn os_command(&self, os: &str, name: &str) -> Option<&'static str> {
        self.os_commands.get(&(os, name)).copied()
    }

    /// Agent binary generation is an external toolchain invocation
    /// (spec.md §1 out of scope); this keeps the operation signature
    /// spec.md §4.9 describes while always failing.
    pub async fn generate_agent(&self, _os: &str, _arch: &str) -> Result<PathBuf> {
        Err(Error::Operator(
            "agent binary generation is not implemented by this server".into(),
        ))
    }

    /// Start the SOCKS5 listener, if configured, and run it until the
    /// accept loop itself errors.
    pub async fn run_socks(self: &Arc<Self>) -> Result<()> {
        if !self.config.socks.enable {
            return Ok(());
        }
        let tunnel = self
            .tunnel
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Transport("tunnel not connected before starting socks".into()))?;
        let socks = Socks5::bind(&self.config.socks.addr)
            .await
            .map_err(Error::Resource)?;
        let router = SocksRouter {
            routes: self.routes.clone(),
            sessions: self.sessions.clone(),
            tunnel,
        };
        socks.run(router).await;
        Ok(())
    }

    /// Close every session, cascading to their jobs and streams
    /// (spec §5 graceful shutdown).
    pub async fn stop(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                session.close().await;
            }
        }
    }

}

/// SHA-256 of the DER-encoded SubjectPublicKeyInfo, hex-encoded — the
/// `pub_key_hash` embedded into generated agents for certificate
/// pinning (spec §4.9/§6). `server.pub` is a plain SPKI PEM block, not
/// a certificate or private key, so this strips the PEM armour and
/// decodes it directly rather than going through `rustls-pemfile`.
fn spki_sha256_hex(pem: &[u8]) -> Result<String> {
    let text =
        std::str::from_utf8(pem).map_err(|_| Error::Transport("server.pub is not valid utf-8".into()))?;
    let body: String = text
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    let der = base64::engine::general_purpose::STANDARD
        .decode(body.trim())
        .map_err(|e| Error::Transport(format!("decoding server.pub: {e}")))?;
    let digest = Sha256::digest(&der);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiConfig, SocksConfig, TunnelConfig};

    /// Not an actual SPKI structure — `spki_sha256_hex` only needs valid
    /// PEM armour and base64 underneath it, since it hashes the decoded
    /// bytes directly rather than parsing ASN.1.
    const TEST_PUB_PEM: &str = "-----BEGIN PUBLIC KEY-----\n\
aGVsbG8gd29ybGQgdGhpcyBpcyBhIGZha2UgU1BLSSBwYXlsb2FkIGZvciB0ZXN0aW5nIHB1cnBv\n\
c2VzIG9ubHkgMTIzNDU2Nzg5MA==\n\
-----END PUBLIC KEY-----\n";

    fn test_config() -> Config {
        Config {
            listen_addr: "127.0.0.1:0".into(),
            socks: SocksConfig::default(),
            tunnel: TunnelConfig::default(),
            api: ApiConfig::default(),
        }
    }

    fn build_server() -> Arc<Server> {
        let dir = tempfile::tempdir().unwrap();
        Server::new(
            test_config(),
            dir.path().join("share"),
            dir.path().join("logs"),
            TEST_PUB_PEM.as_bytes(),
        )
        .unwrap()
    }

    #[test]
    fn spki_hash_is_deterministic_and_hex() {
        let a = spki_sha256_hex(TEST_PUB_PEM.as_bytes()).unwrap();
        let b = spki_sha256_hex(TEST_PUB_PEM.as_bytes()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn spki_hash_rejects_garbage_base64() {
        assert!(spki_sha256_hex(b"-----BEGIN PUBLIC KEY-----\nnot base64!!\n-----END PUBLIC KEY-----\n").is_err());
    }

    #[test]
    fn server_new_generates_distinct_http_magic_per_instance() {
        let a = build_server();
        let b = build_server();
        assert_eq!(a.http_magic.len(), 15);
        assert_ne!(a.http_magic, b.http_magic);
    }

    #[test]
    fn os_command_lookup_covers_all_three_platforms() {
        let server = build_server();
        assert_eq!(server.os_command("linux", "ps"), Some("ps aux"));
        assert_eq!(server.os_command("darwin", "id"), Some("id"));
        assert_eq!(server.os_command("windows", "ls"), Some("dir"));
        assert_eq!(server.os_command("plan9", "ls"), None);
    }

    #[tokio::test]
    async fn close_unknown_session_is_an_error() {
        let server = build_server();
        assert!(server.close_session(42).await.is_err());
    }

    #[tokio::test]
    async fn generate_agent_is_unimplemented() {
        let server = build_server();
        assert!(server.generate_agent("linux", "amd64").await.is_err());
    }

    /// Hands the server a live session under `id` via a real handshake
    /// over an in-memory duplex pair, so tests that need `add_route` to
    /// see a known session don't have to reach into private state.
    async fn insert_fake_session(server: &Arc<Server>, id: SessionId) -> tempfile::TempDir {
        let (server_io, agent_io) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut mux = crate::mux::MuxSession::new(agent_io, crate::mux::Role::Server);
            let Ok(mut command_stream) = mux.accept_stream().await else { return };
            use tokio::io::AsyncWriteExt;
            let _ = command_stream
                .write_all(
                    &gomet_protocol::SystemInfo {
                        os: "linux".into(),
                        arch: "amd64".into(),
                        hostname: "fake".into(),
                    }
                    .encode(),
                )
                .await;
            // Hold the agent side open for the rest of the test.
            std::future::pending::<()>().await;
        });

        let logs_dir = tempfile::tempdir().unwrap();
        let session = Session::handshake(id, server_io, "127.0.0.1:1".parse().unwrap(), logs_dir.path())
            .await
            .unwrap();
        server.sessions.insert(id, session);
        logs_dir
    }

    #[tokio::test]
    async fn routes_round_trip_through_the_server() {
        let server = build_server();
        let _logs_dir = insert_fake_session(&server, 1).await;

        server.add_route("10.0.0.0/8", 1).unwrap();
        assert_eq!(server.list_routes(), vec![("10.0.0.0/8".to_string(), 1)]);
        server.del_route("10.0.0.0/8").unwrap();
        assert!(server.list_routes().is_empty());
    }

    #[test]
    fn add_route_rejects_an_unknown_session() {
        let server = build_server();
        let err = server.add_route("10.0.0.0/8", 999).unwrap_err();
        assert!(matches!(err, Error::InvalidSessionId));
        assert!(server.list_routes().is_empty());
    }
}
