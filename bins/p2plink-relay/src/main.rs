//! P2PLink Relay Server
//!
//! Rendezvous service that lets two peers behind NAT learn each other's
//! addresses. Holds one TCP connection per registered peer and forwards
//! address bundles on request.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use p2plink_network::config::DEFAULT_RELAY_ADDR;
use p2plink_network::{RendezvousServer, ServerConfig};

/// P2PLink Relay Server
#[derive(Parser)]
#[command(name = "p2plink-relay")]
#[command(author, version, about)]
struct Cli {
    /// Listen address for TCP
    #[arg(short, long, default_value = DEFAULT_RELAY_ADDR)]
    listen: SocketAddr,

    /// Close connections silent for this long (seconds, 0 = never)
    #[arg(long, default_value = "0")]
    idle_timeout: u64,

    /// Largest accepted relay message (bytes)
    #[arg(long, default_value = "65536")]
    max_message_size: usize,

    /// Statistics interval (seconds)
    #[arg(long, default_value = "60")]
    stats_interval: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = ServerConfig {
        listen_addr: cli.listen,
        idle_timeout: (cli.idle_timeout > 0).then(|| Duration::from_secs(cli.idle_timeout)),
        max_message_size: cli.max_message_size,
        ..ServerConfig::default()
    };

    info!("Starting P2PLink Relay Server...");
    info!("Listen: {}", config.listen_addr);
    match config.idle_timeout {
        Some(idle) => info!("Idle timeout: {} seconds", idle.as_secs()),
        None => info!("Idle timeout: disabled"),
    }

    let server = RendezvousServer::bind(config)
        .await
        .context("Failed to start relay server")?;
    let server = Arc::new(server);

    // Start statistics reporter
    let server_stats = Arc::clone(&server);
    let stats_interval = Duration::from_secs(cli.stats_interval.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(stats_interval);
        loop {
            interval.tick().await;
            let stats = server_stats.stats();
            info!(
                "Stats: {} peers, {} connections, {} registrations, {} exchanges ({} unknown)",
                stats.registered,
                stats.connections,
                stats.registrations,
                stats.exchanges,
                stats.unknown_targets
            );
        }
    });

    // Handle shutdown
    let server_run = Arc::clone(&server);
    tokio::select! {
        result = server_run.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Relay server stopped");
    Ok(())
}
