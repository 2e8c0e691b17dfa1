//! QuickPort client
//!
//! Connects to the relay server with an issued token and exposes the local
//! service described by that token on the relay's public port. Reconnects
//! with a fixed delay whenever the session ends.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use qp_client::{ControlSession, SessionStatus};
use qp_core::config::{self, ClientConfig};

#[derive(Parser)]
#[command(name = "quickport")]
#[command(about = "QuickPort client - expose a local TCP service through the relay")]
#[command(version)]
struct Args {
    /// Relay server control address (host:port)
    #[arg(short, long, env = "QUICKPORT_SERVER")]
    server: Option<String>,

    /// Token issued by the account service
    #[arg(short, long, env = "QUICKPORT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Public hostname shown in the route
    #[arg(long)]
    public_host: Option<String>,

    /// Seconds to wait before reconnecting
    #[arg(long)]
    reconnect_delay: Option<u64>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;
    tracing::info!("QuickPort client starting...");

    let config = load_config(&args)?;
    config.validate().context("Invalid configuration")?;

    tracing::info!("Relay server: {}", config.server_address);
    tracing::info!("Token: {}", config.masked_token());

    let session = Arc::new(ControlSession::new(config));
    let shutdown = CancellationToken::new();

    let mut status_rx = session.status();
    tokio::spawn(async move {
        let mut last = SessionStatus::default();
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow_and_update().clone();
            report_status(&last, &status);
            last = status;
        }
    });

    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        tracing::info!("Shutdown requested");
        ctrl_c_shutdown.cancel();
    });

    session.start(shutdown).await;

    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone());
    let filter = EnvFilter::new(directives);

    match &args.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {:?}", path))?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(std::sync::Mutex::new(file)),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    Ok(())
}

fn load_config(args: &Args) -> Result<ClientConfig> {
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);

    let mut config = if config_path.exists() {
        config::load_config::<ClientConfig>(&config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        if args.config.is_some() {
            anyhow::bail!("Config file not found: {:?}", config_path);
        }
        ClientConfig::default()
    };

    // Apply command-line overrides
    if let Some(server) = &args.server {
        config.server_address = server.clone();
    }
    if let Some(token) = &args.token {
        config.token = token.clone();
    }
    if let Some(public_host) = &args.public_host {
        config.public_host = public_host.clone();
    }
    if let Some(secs) = args.reconnect_delay {
        config.reconnect_delay = Duration::from_secs(secs);
    }

    Ok(config)
}

fn report_status(last: &SessionStatus, status: &SessionStatus) {
    if status.active && !last.active {
        if let Some(addr) = &status.public_addr {
            println!("Connected. Public address: {}", addr);
        }
        if let Some(route) = &status.route {
            println!("  {}", route);
        }
    } else if !status.active && last.active {
        println!("Disconnected from relay");
    }

    if last.proxy_running && !status.proxy_running {
        println!("Proxy stopped");
    }
}
