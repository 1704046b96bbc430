//! webterm-server: browser terminal gateway.
//!
//! Accepts WebSocket connections carrying a JSON message stream and relays
//! them to SSH, Telnet or local PTY backends, with join/watch/take session
//! sharing and suspend/resume.

mod config;
mod connection;
mod control;
mod handshake;
mod prompt;
mod server;
mod session;
mod transport;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use server::GatewayServer;
use std::path::PathBuf;
use tracing::{error, info};

/// webterm-server — browser terminal gateway
#[derive(Parser, Debug)]
#[command(name = "webterm-server", version, about = "Browser terminal gateway")]
struct Cli {
    /// Config file path
    #[arg(long, default_value = "~/.webterm/config.toml")]
    config: String,

    /// WebSocket listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Loopback control listener port
    #[arg(long)]
    control_port: Option<u16>,

    /// Bind address for the WebSocket listener
    #[arg(long)]
    bind: Option<String>,

    /// Seconds an issued token stays redeemable
    #[arg(long)]
    token_ttl: Option<u64>,

    /// Directory for session audit logs
    #[arg(long)]
    audit_log_dir: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting webterm-server");

    let config_path = PathBuf::from(&cli.config);
    let overrides = CliOverrides {
        port: cli.port,
        control_port: cli.control_port,
        bind: cli.bind,
        token_ttl: cli.token_ttl,
        audit_log_dir: cli.audit_log_dir,
    };
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let server = GatewayServer::new(server_config);

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                server.registry().close_all().await;
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    server.registry().close_all().await;
    info!("webterm-server stopped");
    Ok(())
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
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
