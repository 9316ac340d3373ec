//! P2PLink Agent
//!
//! Registers with a rendezvous relay, links directly to one peer through
//! LAN, IPv6 or a NAT hole punch, and bridges stdin/stdout over the link.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use p2plink_network::{discover_local_addrs, PeerIdentity};

mod bridge;
mod config;
mod session;

use config::{expand_path, AgentConfig};
use session::{Role, SessionDriver};

/// P2PLink - direct peer links through NAT
#[derive(Parser)]
#[command(name = "p2plink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "~/.p2plink/agent.toml")]
    config: PathBuf,

    /// Log level (overrides the config file)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Relay to try before the configured ones
    #[arg(short, long)]
    relay: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },

    /// Link to a peer by identity
    Connect {
        /// Identity of the peer to contact
        peer: String,
    },

    /// Register and wait for a peer to connect
    Wait,

    /// Show identity and discovered addresses
    Status,

    /// Show configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = expand_path(&cli.config)?;
    let mut config = match cli.command {
        Commands::Init { .. } => AgentConfig::default(),
        _ => AgentConfig::load_or_create(&config_path).await?,
    };

    // Initialize logging
    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let log_level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    if let Some(relay) = cli.relay {
        config.relays.insert(0, relay);
    }

    match cli.command {
        Commands::Init { force } => cmd_init(config_path, force).await,
        Commands::Connect { peer } => {
            let target = PeerIdentity::parse(&peer).context("Peer identity must not be empty")?;
            cmd_link(config, Role::Contact(target)).await
        }
        Commands::Wait => cmd_link(config, Role::Wait).await,
        Commands::Status => cmd_status(config).await,
        Commands::Config => cmd_config(&config),
    }
}

async fn cmd_init(config_path: PathBuf, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "Config already exists at {:?}. Use --force to overwrite.",
            config_path
        );
    }

    let config = AgentConfig::default();
    config.save(&config_path).await?;
    info!("Config saved to {:?}", config_path);

    println!("P2PLink initialized at {:?}", config_path);
    println!("Edit the relay list, then run: p2plink wait  (or: p2plink connect <peer>)");
    Ok(())
}

async fn cmd_link(config: AgentConfig, role: Role) -> Result<()> {
    config.validate()?;
    info!("Starting P2PLink agent...");

    let driver = SessionDriver::new(config)?;
    let (tx, rx) = mpsc::channel(256);

    let session = tokio::select! {
        result = driver.run(&role, tx) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            return Ok(());
        }
    };

    println!("Linked with {}", session.link.peer_addr());
    let sender = session.link.sender();

    tokio::select! {
        result = bridge::run(sender.clone(), rx) => {
            let stats = result?;
            info!("Received {} frames ({} bytes)", stats.frames_in, stats.bytes_in);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            sender.close().await?;
        }
    }

    info!("Session with relay {:?} ended", session.client.relay_addr());
    Ok(())
}

async fn cmd_status(config: AgentConfig) -> Result<()> {
    let driver = SessionDriver::new(config.clone())?;
    let identity = driver.stored_identity().await?;
    let local = discover_local_addrs().await;

    println!("P2PLink Status");
    println!("==============");
    match identity {
        Some(id) => println!("Identity: {}", id),
        None => println!("Identity: (not registered yet)"),
    }
    println!("Relays: {}", config.relays.join(", "));

    let lan = config
        .addresses
        .private
        .clone()
        .or_else(|| local.private.map(|ip| ip.to_string()));
    let ipv6 = config
        .addresses
        .ipv6
        .clone()
        .or_else(|| local.ipv6.map(|ip| ip.to_string()));
    println!("LAN address: {}", lan.as_deref().unwrap_or("unknown"));
    println!("IPv6 address: {}", ipv6.as_deref().unwrap_or("none"));
    Ok(())
}

fn cmd_config(config: &AgentConfig) -> Result<()> {
    let toml = toml::to_string_pretty(config)?;
    println!("{}", toml);
    Ok(())
}
