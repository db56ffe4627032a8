//! C4 — the six operator commands.
//!
//! A `Command` is built by the CLI/API layer (with whatever local
//! reader/writer a given command needs already attached), handed to
//! [`crate::session::Session::run_command`], and from then on only
//! touched through `remote_header`/`is_job`/`start`/`stop`/`describe`.
//! Non-job commands (`Execute`, `Download`, `Upload`, `Shell`) run
//! inline and are dropped when `start` returns; job commands (`Listen`,
//! `Connect`) are spawned and tracked in the session's job table until
//! killed or the session closes.

use std::sync::Weak;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use gomet_protocol::CommandHeader;

use crate::log::SessionLog;
use crate::mux::MuxStream;
use crate::registry::Registry;
use crate::session::Session;
use crate::teeio::copy_tee;

/// Everything a running command needs that only the owning session can
/// provide. Holds the session by [`Weak`] reference since commands live
/// inside `Session::jobs`, which is reached through an `Arc<Session>` —
/// a strong reference here would make the two keep each other alive
/// forever.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: std::sync::Arc<Registry>,
    pub log: std::sync::Arc<SessionLog>,
    pub session: Weak<Session>,
}

pub enum Command {
    Execute(Execute),
    Download(Download),
    Upload(Upload),
    Shell(Shell),
    Listen(Listen),
    Connect(Connect),
}

impl Command {
    /// The header to write and pair-accept before `start` runs, if any.
    /// `Connect` has none: it is driven entirely by local accepts, each
    /// one separately issuing its own `ConnectRemote` header.
    pub fn remote_header(&self) -> Option<CommandHeader> {
        match self {
            Command::Execute(e) => Some(CommandHeader::execute(e.command.clone())),
            Command::Download(d) => Some(CommandHeader::download(d.remote_filename.clone())),
            Command::Upload(u) => Some(CommandHeader::upload(u.remote_filename.clone())),
            Command::Shell(_) => Some(CommandHeader::shell()),
            Command::Listen(l) => Some(CommandHeader::listen(l.remote_address.clone())),
            Command::Connect(_) => None,
        }
    }

    pub fn is_job(&self) -> bool {
        matches!(self, Command::Listen(_) | Command::Connect(_))
    }

    pub fn describe(&self) -> String {
        match self {
            Command::Execute(e) => format!("execute: {}", e.command),
            Command::Download(d) => format!("download: {}", d.remote_filename),
            Command::Upload(u) => format!("upload: {}", u.remote_filename),
            Command::Shell(_) => "interactive shell".to_string(),
            Command::Listen(l) => format!("listen: remote {} -> local {}", l.remote_address, l.local_address),
            Command::Connect(c) => format!("connect: local {} -> remote {}", c.local_address, c.remote_address),
        }
    }

    pub async fn start(&self, ctx: SessionContext, stream: Option<MuxStream>) {
        match self {
            Command::Execute(e) => e.start(ctx, stream).await,
            Command::Download(d) => d.start(ctx, stream).await,
            Command::Upload(u) => u.start(ctx, stream).await,
            Command::Shell(s) => s.start(ctx, stream).await,
            Command::Listen(l) => l.start(ctx, stream).await,
            Command::Connect(c) => c.start(ctx, stream).await,
        }
    }

    pub async fn stop(&self) {
        match self {
            Command::Execute(_) | Command::Download(_) | Command::Upload(_) | Command::Shell(_) => {}
            Command::Listen(l) => l.stop(),
            Command::Connect(c) => c.stop(),
        }
    }
}

/// Run a shell command on the agent and tee its output stream to both a
/// local sink and the session transcript.
pub struct Execute {
    command: String,
    writer: Mutex<Option<Box<dyn AsyncWrite + Unpin + Send>>>,
}

impl Execute {
    pub fn new(command: impl Into<String>, writer: Box<dyn AsyncWrite + Unpin + Send>) -> Self {
        Self {
            command: command.into(),
            writer: Mutex::new(Some(writer)),
        }
    }

    async fn start(&self, ctx: SessionContext, stream: Option<MuxStream>) {
        let Some(mut stream) = stream else { return };
        let mut guard = self.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            if let Err(e) = copy_tee(&mut stream, &mut **writer, &ctx.log).await {
                tracing::debug!(error = %e, "execute stream ended");
            }
        }
        let _ = stream.shutdown().await;
    }
}

/// Pull a remote file to a local sink, teeing the bytes to the transcript.
pub struct Download {
    remote_filename: String,
    writer: Mutex<Option<Box<dyn AsyncWrite + Unpin + Send>>>,
}

impl Download {
    pub fn new(remote_filename: impl Into<String>, writer: Box<dyn AsyncWrite + Unpin + Send>) -> Self {
        Self {
            remote_filename: remote_filename.into(),
            writer: Mutex::new(Some(writer)),
        }
    }

    async fn start(&self, ctx: SessionContext, stream: Option<MuxStream>) {
        let Some(mut stream) = stream else { return };
        let mut guard = self.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            if let Err(e) = copy_tee(&mut stream, &mut **writer, &ctx.log).await {
                tracing::debug!(error = %e, "download stream ended");
            }
        }
    }
}

/// Push a local file to the agent, teeing the bytes to the transcript.
pub struct Upload {
    remote_filename: String,
    reader: Mutex<Option<Box<dyn AsyncRead + Unpin + Send>>>,
}

impl Upload {
    pub fn new(remote_filename: impl Into<String>, reader: Box<dyn AsyncRead + Unpin + Send>) -> Self {
        Self {
            remote_filename: remote_filename.into(),
            reader: Mutex::new(Some(reader)),
        }
    }

    async fn start(&self, ctx: SessionContext, stream: Option<MuxStream>) {
        let Some(mut stream) = stream else { return };
        let mut guard = self.reader.lock().await;
        if let Some(reader) = guard.as_mut() {
            if let Err(e) = copy_tee(&mut **reader, &mut stream, &ctx.log).await {
                tracing::debug!(error = %e, "upload stream ended");
            }
        }
        let _ = stream.shutdown().await;
    }
}

/// Interactive shell: two concurrent tee'd copies, terminating as soon
/// as either direction ends.
pub struct Shell {
    reader: Mutex<Option<Box<dyn AsyncRead + Unpin + Send>>>,
    writer: Mutex<Option<Box<dyn AsyncWrite + Unpin + Send>>>,
}

impl Shell {
    pub fn new(
        reader: Box<dyn AsyncRead + Unpin + Send>,
        writer: Box<dyn AsyncWrite + Unpin + Send>,
    ) -> Self {
        Self {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        }
    }

    async fn start(&self, ctx: SessionContext, stream: Option<MuxStream>) {
        let Some(mut stream) = stream else { return };
        // Wake the remote shell's PTY before starting the relay.
        if stream.write_all(b"\n").await.is_err() {
            return;
        }

        let mut reader_guard = self.reader.lock().await;
        let mut writer_guard = self.writer.lock().await;
        let (Some(reader), Some(writer)) = (reader_guard.as_mut(), writer_guard.as_mut()) else {
            return;
        };

        let (mut stream_r, mut stream_w) = tokio::io::split(stream);
        let log_out = ctx.log.clone();
        let log_in = ctx.log.clone();

        let out_to_remote = copy_tee(&mut **reader, &mut stream_w, &log_out);
        let remote_to_out = copy_tee(&mut stream_r, &mut **writer, &log_in);
        tokio::pin!(out_to_remote);
        tokio::pin!(remote_to_out);

        tokio::select! {
            _ = &mut out_to_remote => {}
            _ = &mut remote_to_out => {}
        }
    }
}

/// Forward a remote listener back to a local address: one control
/// stream carries a notify line per accepted remote connection, each
/// paired with its own accepted data stream, dialed out locally and
/// relayed.
pub struct Listen {
    remote_address: String,
    local_address: String,
    token: CancellationToken,
}

impl Listen {
    pub fn new(remote_address: impl Into<String>, local_address: impl Into<String>) -> Self {
        Self {
            remote_address: remote_address.into(),
            local_address: local_address.into(),
            token: CancellationToken::new(),
        }
    }

    async fn start(&self, ctx: SessionContext, stream: Option<MuxStream>) {
        let Some(control) = stream else { return };
        let (control_r, mut control_w) = tokio::io::split(control);
        let mut lines = tokio::io::BufReader::new(control_r).lines();
        use tokio::io::AsyncBufReadExt;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                line = lines.next_line() => {
                    match line {
                        Ok(Some(_notify)) => {
                            if control_w.write_all(b"OK\n").await.is_err() {
                                break;
                            }
                            let Some(session) = ctx.session.upgrade() else { break };
                            let data_stream = match session.accept_paired_stream().await {
                                Ok(s) => s,
                                Err(e) => {
                                    tracing::debug!(error = %e, "listen job accept failed");
                                    break;
                                }
                            };
                            match TcpStream::connect(&self.local_address).await {
                                Ok(conn) => {
                                    tokio::spawn(crate::relay::splice_registered(
                                        conn,
                                        data_stream,
                                        ctx.registry.clone(),
                                    ));
                                }
                                Err(e) => {
                                    tracing::warn!(address = %self.local_address, error = %e, "listen job local dial failed");
                                }
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
            }
        }
    }

    fn stop(&self) {
        self.token.cancel();
    }
}

/// Forward a local listener out through the agent: one `ConnectRemote`
/// header and accept per accepted local connection.
pub struct Connect {
    local_address: String,
    remote_address: String,
    token: CancellationToken,
}

impl Connect {
    pub fn new(local_address: impl Into<String>, remote_address: impl Into<String>) -> Self {
        Self {
            local_address: local_address.into(),
            remote_address: remote_address.into(),
            token: CancellationToken::new(),
        }
    }

    async fn start(&self, ctx: SessionContext, _stream: Option<MuxStream>) {
        let listener = match TcpListener::bind(&self.local_address).await {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(address = %self.local_address, error = %e, "connect job failed to bind");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((conn, _peer)) => {
                            let Some(session) = ctx.session.upgrade() else { break };
                            session.connect_to_remote(conn, &self.remote_address).await;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "connect job accept failed");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn stop(&self) {
        self.token.cancel();
    }
}
