//! Agent configuration

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use p2plink_network::{ClientConfig, LinkConfig};

/// Main agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Relays to try, in order
    pub relays: Vec<String>,
    /// Local port shared by the relay connection and peer links (0 = any)
    pub local_port: u16,
    /// File holding the identity assigned by the relay
    pub identity_file: String,
    /// Full rendezvous cycles to attempt before giving up
    pub session_retries: u32,
    /// Self-reported address overrides
    #[serde(default)]
    pub addresses: AddressConfig,
    /// Timing knobs
    pub timing: TimingConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Address overrides; unset fields are discovered automatically
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddressConfig {
    /// LAN address to advertise
    pub private: Option<String>,
    /// IPv6 address to advertise
    pub ipv6: Option<String>,
    /// Skip discovery and advertise only the overrides
    pub disable_discovery: bool,
}

/// Timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Relay connect timeout (seconds)
    pub relay_connect_timeout: u64,
    /// Relay reply timeout (seconds)
    pub reply_timeout: u64,
    /// How long to wait for the peer's inbound dial (seconds)
    pub accept_timeout: u64,
    /// Per-attempt dial timeout (milliseconds)
    pub dial_timeout_ms: u64,
    /// Dial attempts per candidate
    pub dial_attempts: u32,
    /// Times to re-ask the relay for a peer that is not registered yet
    pub peer_lookup_retries: u32,
    /// Pause between peer lookups (seconds)
    pub peer_lookup_interval: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            relays: vec!["127.0.0.1:3001".to_string()],
            local_port: 0,
            identity_file: "~/.p2plink/uuid.txt".to_string(),
            session_retries: 3,
            addresses: AddressConfig::default(),
            timing: TimingConfig {
                relay_connect_timeout: 10,
                reply_timeout: 10,
                accept_timeout: 30,
                dial_timeout_ms: 2000,
                dial_attempts: 3,
                peer_lookup_retries: 5,
                peer_lookup_interval: 2,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl AgentConfig {
    /// Load configuration from file
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        toml::from_str(&contents).context("Failed to parse config file")
    }

    /// Load or create default configuration
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path).await
        } else {
            let config = Self::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = toml::to_string_pretty(self)?;
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.relays.is_empty() {
            anyhow::bail!("At least one relay must be configured");
        }

        if self.identity_file.trim().is_empty() {
            anyhow::bail!("identity_file must not be empty");
        }

        self.private_override()?;
        self.ipv6_override()?;

        self.client_config()
            .validate()
            .map_err(|e| anyhow::anyhow!(e))
    }

    /// Parsed LAN address override
    pub fn private_override(&self) -> Result<Option<SocketAddr>> {
        parse_override(self.addresses.private.as_deref(), "addresses.private")
    }

    /// Parsed IPv6 address override
    pub fn ipv6_override(&self) -> Result<Option<SocketAddr>> {
        let addr = parse_override(self.addresses.ipv6.as_deref(), "addresses.ipv6")?;
        if let Some(addr) = addr {
            if !addr.is_ipv6() {
                anyhow::bail!("addresses.ipv6 must be an IPv6 socket address");
            }
        }
        Ok(addr)
    }

    /// Rendezvous client settings
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            local_port: self.local_port,
            relay_connect_timeout: Duration::from_secs(self.timing.relay_connect_timeout),
            reply_timeout: Duration::from_secs(self.timing.reply_timeout),
            accept_timeout: Duration::from_secs(self.timing.accept_timeout),
            link: LinkConfig {
                attempts_per_candidate: self.timing.dial_attempts,
                attempt_timeout: Duration::from_millis(self.timing.dial_timeout_ms),
                ..LinkConfig::default()
            },
            ..ClientConfig::default()
        }
    }
}

fn parse_override(value: Option<&str>, field: &str) -> Result<Option<SocketAddr>> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => text
            .parse()
            .map(Some)
            .with_context(|| format!("{} is not a socket address: {}", field, text)),
    }
}

/// Expand a leading `~/` to the home directory
pub fn expand_path(path: &Path) -> Result<PathBuf> {
    let path_str = path.to_string_lossy();
    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = directories::BaseDirs::new()
            .context("Failed to get home directory")?
            .home_dir()
            .to_path_buf();
        Ok(home.join(rest))
    } else {
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.client_config().link.attempts_per_candidate, 3);
    }

    #[test]
    fn test_bad_overrides_rejected() {
        let mut config = AgentConfig::default();
        config.addresses.private = Some("not-an-address".into());
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.addresses.ipv6 = Some("10.0.0.1:3002".into());
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.relays.clear();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_or_create_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");

        let created = AgentConfig::load_or_create(&path).await.unwrap();
        assert!(path.exists());

        let loaded = AgentConfig::load(&path).await.unwrap();
        assert_eq!(loaded.relays, created.relays);
        assert_eq!(loaded.timing.dial_timeout_ms, created.timing.dial_timeout_ms);
    }

    #[test]
    fn test_expand_path() {
        let plain = Path::new("/etc/p2plink/agent.toml");
        assert_eq!(expand_path(plain).unwrap(), plain);

        let home = expand_path(Path::new("~/.p2plink/agent.toml")).unwrap();
        assert!(home.ends_with(".p2plink/agent.toml"));
        assert!(!home.starts_with("~"));
    }
}
