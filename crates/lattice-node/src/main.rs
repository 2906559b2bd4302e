//! lattice-node: run one mesh node from a config file.

use clap::Parser;
use lattice_node::{Node, NodeConfig};
use std::path::PathBuf;
use tracing::{error, info};

/// lattice-node — multi-protocol service mesh node
#[derive(Parser, Debug)]
#[command(name = "lattice-node", version, about = "Service mesh node")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Externally reachable URL of this node
    #[arg(long)]
    host_name: Option<String>,

    /// Passkey peers must present to attach
    #[arg(long)]
    passkey: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.lattice/config.toml")]
    config: String,

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

    let config_path = PathBuf::from(&cli.config);
    let config = match NodeConfig::load(
        Some(&config_path),
        cli.port,
        cli.host_name.as_deref(),
        cli.passkey.as_deref(),
    ) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.host_name,
        port = config.port,
        "starting lattice-node"
    );

    let node = match Node::new(config) {
        Ok(node) => node,
        Err(e) => {
            error!(error = %e, "failed to create node");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = node.run() => {
            if let Err(e) = result {
                error!(error = %e, "node error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("lattice-node stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
