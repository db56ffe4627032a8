//! C3 — per-agent session.
//!
//! Holds the mux session, the command stream, the job table and the
//! stream registry for one connected agent, and serialises every
//! "write command header, then accept the paired stream" exchange
//! behind a single lock (spec §5's suggested fix for concurrent
//! operators racing the FIFO pairing rule).

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use gomet_protocol::{CommandHeader, SystemInfo};

use crate::command::{Command, SessionContext};
use crate::error::{Error, Result};
use crate::log::SessionLog;
use crate::mux::{MuxSession, MuxStream, Role};
use crate::registry::Registry;

pub type SessionId = u64;
pub type JobId = u64;

/// Everything needed to perform a "write header, accept the paired
/// stream" exchange under one lock.
struct CommandChannel {
    command_stream: MuxStream,
    mux: MuxSession,
}

pub struct Session {
    pub id: SessionId,
    pub os: String,
    pub arch: String,
    pub hostname: String,
    pub address: SocketAddr,

    channel: Mutex<CommandChannel>,
    jobs: DashMap<JobId, Arc<Command>>,
    job_index: AtomicU64,
    pub registry: Arc<Registry>,
    pub log: Arc<SessionLog>,
}

impl Session {
    /// Perform the agent handshake over a freshly dispatched
    /// connection: wrap in the mux (client role), open the command
    /// stream, and read the system-info line. See spec §4.3 steps 1-4.
    pub async fn handshake<T>(
        id: SessionId,
        io: T,
        address: SocketAddr,
        logs_dir: &Path,
    ) -> Result<Arc<Self>>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let mut mux = MuxSession::new(io, Role::Client);
        let mut command_stream = mux.open_stream().await?;

        let line = read_line(&mut command_stream).await?;
        let info = SystemInfo::parse(&line)?;

        let log = Arc::new(SessionLog::open(logs_dir, &info.hostname).await?);

        Ok(Arc::new(Self {
            id,
            os: info.os,
            arch: info.arch,
            hostname: info.hostname,
            address,
            channel: Mutex::new(CommandChannel {
                command_stream,
                mux,
            }),
            jobs: DashMap::new(),
            job_index: AtomicU64::new(0),
            registry: Arc::new(Registry::new()),
            log,
        }))
    }

    fn next_job_id(&self) -> JobId {
        self.job_index.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn context(self: &Arc<Self>) -> SessionContext {
        SessionContext {
            registry: self.registry.clone(),
            log: self.log.clone(),
            session: Arc::downgrade(self),
        }
    }

    /// Write a header and immediately accept the paired stream,
    /// holding the session's single lock across both operations.
    async fn write_header_and_accept(&self, header: &CommandHeader) -> Result<MuxStream> {
        let mut guard = self.channel.lock().await;
        guard
            .command_stream
            .write_all(&header.encode())
            .await
            .map_err(|e| Error::Transport(format!("command stream write: {e}")))?;
        guard.mux.accept_stream().await
    }

    /// Accept the next stream paired to a header written elsewhere on
    /// a command's own control stream (spec's code 4 per-connection
    /// accept). Still goes through the session-wide lock.
    pub async fn accept_paired_stream(&self) -> Result<MuxStream> {
        let mut guard = self.channel.lock().await;
        guard.mux.accept_stream().await
    }

    /// Run a command: log its description, write its header if it has
    /// one, accept the paired stream if the header calls for it, then
    /// either run it inline (interactive) or spawn it as a job.
    pub async fn run_command(self: &Arc<Self>, command: Command) -> Result<()> {
        self.log.write_line(&command.describe()).await;

        let stream = match command.remote_header() {
            Some(header) => Some(self.write_header_and_accept(&header).await?),
            None => None,
        };

        let ctx = self.context();

        if command.is_job() {
            let job_id = self.next_job_id();
            tracing::info!(session = self.id, job = job_id, command = %command.describe(), "job started");
            let command = Arc::new(command);
            self.jobs.insert(job_id, command.clone());
            tokio::spawn(async move {
                command.start(ctx, stream).await;
            });
        } else {
            command.start(ctx, stream).await;
            command.stop().await;
        }
        Ok(())
    }

    /// Write the "5\n<addr>\n" header, accept the paired stream, and
    /// splice it with `conn`, registering the stream for the duration.
    pub async fn connect_to_remote(self: &Arc<Self>, conn: TcpStream, remote_address: &str) {
        let header = CommandHeader::connect_remote(remote_address);
        let stream = match self.write_header_and_accept(&header).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(session = self.id, error = %e, "connect_to_remote failed");
                return;
            }
        };
        let registry = self.registry.clone();
        tokio::spawn(crate::relay::splice_registered(conn, stream, registry));
    }

    pub fn jobs(&self) -> Vec<(JobId, String)> {
        self.jobs
            .iter()
            .map(|e| (*e.key(), e.value().describe()))
            .collect()
    }

    pub async fn kill_job(&self, job_id: JobId) -> bool {
        if let Some((_, job)) = self.jobs.remove(&job_id) {
            job.stop().await;
            true
        } else {
            false
        }
    }

    /// Close every job, then send the shutdown header and close the
    /// command stream and mux session, per spec §4.3 `Close()`.
    pub async fn close(&self) {
        let jobs: Vec<Arc<Command>> = self.jobs.iter().map(|e| e.value().clone()).collect();
        self.jobs.clear();
        for job in jobs {
            job.stop().await;
        }
        self.registry.close_all();

        let mut guard = self.channel.lock().await;
        let _ = guard
            .command_stream
            .write_all(&CommandHeader::shutdown().encode())
            .await;
        let _ = guard.command_stream.shutdown().await;
        let _ = guard.mux.close().await;
    }

    pub fn summary(&self) -> String {
        format!(
            "{} - {} - {}/{}",
            self.hostname, self.address, self.os, self.arch
        )
    }
}

async fn read_line<T>(stream: &mut T) -> Result<String>
where
    T: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncBufReadExt;
    let mut reader = tokio::io::BufReader::new(stream);
    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .await
        .map_err(|e| Error::Transport(format!("system info read: {e}")))?;
    if n == 0 {
        return Err(Error::Transport("connection closed before handshake".into()));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Execute;
    use gomet_protocol::CommandCode;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    /// Plays the agent's side of the mux: `Role::Server`, writing the
    /// system-info line as its first outbound stream, then answering
    /// exactly one command header by opening a paired data stream.
    async fn fake_agent() -> (Arc<Session>, tokio::task::JoinHandle<MuxStream>, tempfile::TempDir) {
        let (server_io, agent_io) = tokio::io::duplex(8192);
        let logs_dir = tempfile::tempdir().unwrap();

        let agent = tokio::spawn(async move {
            let mut mux = MuxSession::new(agent_io, Role::Server);
            let mut command_stream = mux.accept_stream().await.unwrap();
            command_stream
                .write_all(&SystemInfo {
                    os: "linux".into(),
                    arch: "amd64".into(),
                    hostname: "fake".into(),
                }.encode())
                .await
                .unwrap();

            let mut lines = tokio::io::BufReader::new(&mut command_stream);
            let mut code_line = String::new();
            lines.read_line(&mut code_line).await.unwrap();
            let code = CommandCode::from_u32(code_line.trim().parse().unwrap()).unwrap();
            if code.has_argument() {
                let mut arg_line = String::new();
                lines.read_line(&mut arg_line).await.unwrap();
            }

            let mut data_stream = mux.open_stream().await.unwrap();
            data_stream.write_all(b"remote output").await.unwrap();
            data_stream.shutdown().await.unwrap();
            data_stream
        });

        let session = Session::handshake(1, server_io, "127.0.0.1:1".parse().unwrap(), logs_dir.path())
            .await
            .unwrap();
        (session, agent, logs_dir)
    }

    #[tokio::test]
    async fn handshake_reads_system_info() {
        let (session, agent, _logs_dir) = fake_agent().await;
        assert_eq!(session.os, "linux");
        assert_eq!(session.arch, "amd64");
        assert_eq!(session.hostname, "fake");
        // The fake agent is still waiting on a command header that this
        // test never sends; drop it rather than awaiting completion.
        drop(agent);
    }

    #[tokio::test]
    async fn run_command_pairs_header_with_data_stream() {
        let (session, agent, _logs_dir) = fake_agent().await;
        let (sink, mut read_back) = tokio::io::duplex(1024);

        session
            .run_command(Command::Execute(Execute::new("echo hi", Box::new(sink))))
            .await
            .unwrap();

        let mut output = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut read_back, &mut output)
            .await
            .unwrap();
        assert_eq!(output, b"remote output");
        agent.await.unwrap();
    }

    #[tokio::test]
    async fn jobs_list_is_empty_for_a_fresh_session() {
        let (session, agent, _logs_dir) = fake_agent().await;
        assert!(session.jobs().is_empty());
        drop(agent);
    }
}
