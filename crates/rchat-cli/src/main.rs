//! rchat: terminal client for the rchat chat service.
//!
//! Joins a server (queueing if it is full), authenticates with a password
//! prompt and turns stdin into chat. Files are sent with `/file <path>`.

mod commands;
mod config;

use clap::Parser;
use commands::chat::ChatOptions;
use tracing::error;

/// rchat: encrypted multi-user chat client
#[derive(Parser)]
#[command(name = "rchat", version, about = "Encrypted multi-user chat client")]
struct Cli {
    /// Username to log in (or register) as
    username: String,

    /// Server host
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Create the account instead of logging in
    #[arg(long)]
    register: bool,

    /// Directory for received files
    #[arg(long)]
    download_dir: Option<String>,

    /// Config file path
    #[arg(long = "config")]
    config: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("rchat=debug,rchat_client=debug,rchat_core=debug")
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("rchat=warn,rchat_client=warn")
            .with_target(false)
            .init();
    }

    let config_path = cli
        .config
        .as_deref()
        .map(config::expand_tilde)
        .unwrap_or_else(config::default_config_path);
    let cfg = match config::Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("rchat: {e:#}");
            std::process::exit(1);
        }
    };

    // CLI flags override the config file.
    let download_dir = cli
        .download_dir
        .or(cfg.default.download_dir)
        .map(|d| config::expand_tilde(&d))
        .unwrap_or_else(rchat_client::default_download_dir);
    let opts = ChatOptions {
        host: cli.host.unwrap_or(cfg.default.host),
        port: cli.port.unwrap_or(cfg.default.port),
        username: cli.username,
        register: cli.register,
        download_dir,
    };

    if let Err(e) = commands::chat::run(opts).await {
        error!("{:#}", e);
        eprintln!("rchat: {e:#}");
        std::process::exit(1);
    }
}
