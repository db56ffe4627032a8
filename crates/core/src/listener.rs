//! C2 — TLS listener & dispatcher.
//!
//! Accepts TLS connections, reads the first CRLF-terminated request
//! line, and routes it per spec §4.2: agent handshake upgrade, agent
//! binary download (stub — out of scope), file share GET/POST, or 404.
//! No HTTP framework sits in front of this: the protocol here is "read
//! one request line, maybe some headers, maybe a body", not a general
//! web server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use gomet_protocol::{HttpRequestLine, RequestKind};

use crate::server::Server;
use crate::share;

pub struct Listener {
    tcp: TcpListener,
    acceptor: TlsAcceptor,
}

impl Listener {
    pub async fn bind(addr: &str, tls_config: Arc<rustls::ServerConfig>) -> std::io::Result<Self> {
        let tcp = TcpListener::bind(addr).await?;
        Ok(Self {
            tcp,
            acceptor: TlsAcceptor::from(tls_config),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub async fn run(self, server: Arc<Server>) {
        let session_id = Arc::new(AtomicU64::new(0));
        loop {
            let (tcp_stream, peer) = match self.tcp.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "listener accept failed");
                    break;
                }
            };
            let acceptor = self.acceptor.clone();
            let server = server.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(tcp_stream).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::debug!(peer = %peer, error = %e, "tls accept failed");
                        return;
                    }
                };
                if let Err(e) = dispatch(tls_stream, peer, &server, &session_id).await {
                    tracing::debug!(peer = %peer, error = %e, "connection dispatch ended");
                }
            });
        }
    }
}

async fn dispatch<T>(
    stream: T,
    peer: SocketAddr,
    server: &Arc<Server>,
    session_id: &Arc<AtomicU64>,
) -> std::io::Result<()>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(());
    }

    // `reader` (not `reader.into_inner()`) carries on below: the first
    // `read_line` may have buffered more than just that line, and for
    // `NewAgentSession` those extra bytes are the start of the mux
    // handshake — dropping them would corrupt the stream.
    match HttpRequestLine::parse(&line, &server.http_magic) {
        RequestKind::NewAgentSession => {
            let id = session_id.fetch_add(1, Ordering::SeqCst) + 1;
            server.accept_agent_session(id, reader, peer).await;
        }
        RequestKind::AgentBuild { .. } => {
            write_not_found(reader).await?;
        }
        RequestKind::FileDownload { path } => {
            serve_download(reader, server, &path).await?;
        }
        RequestKind::FileUpload { path } => {
            receive_upload(reader, server, &path).await?;
        }
        RequestKind::NotFound => {
            write_not_found(reader).await?;
        }
    }
    Ok(())
}

async fn serve_download<T>(mut stream: T, server: &Arc<Server>, path: &str) -> std::io::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match share::resolve_download(&server.share_dir, path).await {
        Ok(resolved) => match tokio::fs::read(&resolved).await {
            Ok(bytes) => {
                let header = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    bytes.len()
                );
                stream.write_all(header.as_bytes()).await?;
                stream.write_all(&bytes).await?;
            }
            Err(_) => write_not_found(stream).await?,
        },
        Err(_) => write_not_found(stream).await?,
    }
    Ok(())
}

async fn receive_upload<T>(
    mut reader: BufReader<T>,
    server: &Arc<Server>,
    path: &str,
) -> std::io::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let content_length = read_content_length(&mut reader).await?;
    let mut body = vec![0u8; content_length];
    tokio::io::AsyncReadExt::read_exact(&mut reader, &mut body).await?;

    match share::resolve_upload(&server.share_dir, path).await {
        Ok(resolved) => {
            tokio::fs::write(&resolved, &body).await?;
            let stream = reader.into_inner();
            write_response(stream, "201 Created", b"").await?;
        }
        Err(_) => write_not_found(reader.into_inner()).await?,
    }
    Ok(())
}

async fn read_content_length<T>(reader: &mut BufReader<T>) -> std::io::Result<usize>
where
    T: AsyncRead + Unpin,
{
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
        if let Some(value) = line
            .to_ascii_lowercase()
            .strip_prefix("content-length:")
            .map(str::trim)
        {
            content_length = value.trim().parse().unwrap_or(0);
        }
    }
    Ok(content_length)
}

async fn write_not_found<T>(stream: T) -> std::io::Result<()>
where
    T: AsyncWrite + Unpin,
{
    write_response(stream, "404 Not Found", b"").await
}

async fn write_response<T>(mut stream: T, status: &str, body: &[u8]) -> std::io::Result<()>
where
    T: AsyncWrite + Unpin,
{
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(body).await?;
    Ok(())
}
