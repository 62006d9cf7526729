//! rchat-server: multi-user encrypted chat server.
//!
//! Accepts TCP connections behind a bounded admission gate, hands each
//! admitted client the shared chat key, authenticates it against the user
//! store and relays chat lines and file transfers between sessions.

mod admission;
mod auth;
mod config;
mod handshake;
mod server;
mod session;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use config::{ConfigOverrides, ServerConfig};
use server::ChatServer;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// rchat-server: encrypted multi-user chat server
#[derive(Parser, Debug)]
#[command(name = "rchat-server", version, about = "Encrypted multi-user chat server")]
struct Cli {
    /// Listen host
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Config file path
    #[arg(long, default_value = "~/.rchat/server.toml")]
    config: String,

    /// Maximum concurrently served connections
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Maximum queued connections (0 = unbounded)
    #[arg(long)]
    max_queue: Option<usize>,

    /// Shared key file
    #[arg(long)]
    key_file: Option<String>,

    /// User credentials file
    #[arg(long)]
    users_file: Option<String>,

    /// Directory for received uploads
    #[arg(long)]
    download_dir: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting rchat-server");

    let config_path = PathBuf::from(&cli.config);
    let overrides = ConfigOverrides {
        host: cli.host,
        port: cli.port,
        max_sessions: cli.max_sessions,
        max_queue: cli.max_queue,
        key_file: cli.key_file,
        users_file: cli.users_file,
        download_dir: cli.download_dir,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let cipher = match auth::key_store::load_or_create(&server_config.key_path) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load chat key");
            std::process::exit(1);
        }
    };

    let credentials = match auth::FileCredentialStore::open(&server_config.users_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "failed to open credential store");
            std::process::exit(1);
        }
    };

    let chat_server = Arc::new(ChatServer::new(server_config, cipher, credentials));
    let listener = match chat_server.bind().await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    let runner = chat_server.clone();
    let accept_task = tokio::spawn(async move { runner.run(listener).await });

    tokio::select! {
        _ = shutdown_signal() => info!("received shutdown signal"),
        _ = operator_exit() => info!("exit requested from console"),
    }

    chat_server.shutdown().await;
    match accept_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "accept loop failed"),
        Err(e) => warn!(error = %e, "accept task panicked"),
    }

    info!("rchat-server stopped");
}

/// Resolve when the operator types `exit` on stdin. Never resolves if stdin
/// is closed, leaving shutdown to signals.
async fn operator_exit() {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().eq_ignore_ascii_case("exit") => return,
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => std::future::pending::<()>().await,
        }
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
