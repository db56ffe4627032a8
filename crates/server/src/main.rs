//! # gomet control server
//!
//! The server-side control and multiplexing core for a remote-agent
//! framework. A TLS listener demultiplexes HTTP-looking probes from
//! long-lived agent sessions; each session hosts commands (execute,
//! file transfer, interactive shell, port forwards) over multiplexed
//! streams. A SOCKS5 listener and an optional SSH tunnel chain give
//! operators egress through any agent or hop.
//!
//! ## Modules
//!
//! - [`api`] — REST API endpoints, thin wrappers over `gomet_core::Server`
//! - [`cli`] — interactive two-mode operator shell

mod api;
mod cli;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use gomet_core::config::Config;
use gomet_core::server::Server;
use gomet_core::{tls, Listener};

#[derive(Parser)]
#[command(about = "gomet control server")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "config/config.json")]
    config: PathBuf,
    /// Directory containing server.crt, server.key and server.pub.
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,
    #[arg(long, default_value = "logs")]
    logs_dir: PathBuf,
    #[arg(long, default_value = "share")]
    share_dir: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "gomet_server=info".into()),
        )
        .init();

    let args = Args::parse();

    if let Err(e) = tokio::fs::create_dir_all(&args.logs_dir).await {
        error!(error = %e, "failed to create logs directory");
        std::process::exit(1);
    }
    if let Err(e) = tokio::fs::create_dir_all(&args.share_dir).await {
        error!(error = %e, "failed to create share directory");
        std::process::exit(1);
    }

    let config = match Config::load(&args.config).await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let cert_path = args.config_dir.join("server.crt");
    let key_path = args.config_dir.join("server.key");
    let pub_path = args.config_dir.join("server.pub");

    let tls_config = match tls::load_server_config(&cert_path, &key_path).await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load tls material");
            std::process::exit(1);
        }
    };
    let pub_pem = match tokio::fs::read(&pub_path).await {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, path = %pub_path.display(), "failed to read server.pub");
            std::process::exit(1);
        }
    };

    let listen_addr = config.listen_addr.clone();
    let api_config = config.api.clone();

    let server = match Server::new(config, args.share_dir, args.logs_dir, &pub_pem) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to build server");
            std::process::exit(1);
        }
    };
    server.register_observer(Arc::new(cli::PrintObserver));

    if let Err(e) = server.connect_tunnel().await {
        error!(error = %e, "failed to establish ssh tunnel chain");
        std::process::exit(1);
    }

    let listener = match Listener::bind(&listen_addr, tls_config).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, address = %listen_addr, "failed to bind tls listener");
            std::process::exit(1);
        }
    };
    info!(address = %listen_addr, "listening for agent connections");

    let listener_server = server.clone();
    tokio::spawn(async move { listener.run(listener_server).await });

    if server.config.socks.enable {
        let socks_server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = socks_server.run_socks().await {
                error!(error = %e, "socks listener stopped");
            }
        });
    }

    if api_config.enable {
        let api_server = server.clone();
        tokio::spawn(async move {
            run_api(api_server, &api_config.addr).await;
        });
    }

    cli::run(server).await;
    info!("shutting down");
}

async fn run_api(server: Arc<Server>, addr: &str) {
    let state = api::ApiState { server };
    let app = Router::new()
        .route("/sessions", get(api::list_sessions))
        .route("/sessions/{id}", get(api::get_session).delete(api::close_session))
        .route("/sessions/{id}/{command_name}", get(api::run_named_command))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = match addr.parse() {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, addr, "invalid api address");
            return;
        }
    };
    match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => {
            info!(%addr, "rest api listening");
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "rest api stopped");
            }
        }
        Err(e) => error!(error = %e, %addr, "failed to bind rest api"),
    }
}
