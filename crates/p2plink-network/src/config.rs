//! Configuration for links, rendezvous clients and the relay server

use std::net::{Ipv6Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default relay listen address, accepting IPv4 and IPv6 clients
pub const DEFAULT_RELAY_ADDR: &str = "[::]:3001";

/// Peer link configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Dial attempts per candidate address
    pub attempts_per_candidate: u32,

    /// Timeout for a single dial attempt
    pub attempt_timeout: Duration,

    /// Pause between attempts on the same candidate
    pub retry_backoff: Duration,

    /// Largest frame payload accepted from the peer
    pub max_frame_len: u64,

    /// Read buffer size
    pub read_chunk_size: usize,

    /// Consecutive transient read errors tolerated
    pub max_transient_errors: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            attempts_per_candidate: 3,
            attempt_timeout: Duration::from_secs(2),
            retry_backoff: Duration::from_millis(100),
            max_frame_len: 16 * 1024 * 1024,
            read_chunk_size: 64 * 1024,
            max_transient_errors: 16,
        }
    }
}

impl LinkConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.attempts_per_candidate == 0 {
            return Err("attempts_per_candidate must be at least 1".into());
        }
        if self.attempt_timeout.is_zero() {
            return Err("attempt_timeout must be non-zero".into());
        }
        if self.read_chunk_size == 0 {
            return Err("read_chunk_size must be non-zero".into());
        }
        Ok(())
    }
}

/// Rendezvous client configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Local port shared by the relay connection and peer dials (0 = pick one)
    pub local_port: u16,

    /// Timeout for connecting to the relay
    pub relay_connect_timeout: Duration,

    /// How long to wait for a relay reply
    pub reply_timeout: Duration,

    /// How long the passive side waits for an inbound peer
    pub accept_timeout: Duration,

    /// Largest relay message accepted
    pub max_message_size: usize,

    /// Peer link settings
    pub link: LinkConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            local_port: 0,
            relay_connect_timeout: Duration::from_secs(10),
            reply_timeout: Duration::from_secs(10),
            accept_timeout: Duration::from_secs(30),
            max_message_size: 64 * 1024,
            link: LinkConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.relay_connect_timeout.is_zero() {
            return Err("relay_connect_timeout must be non-zero".into());
        }
        if self.reply_timeout.is_zero() {
            return Err("reply_timeout must be non-zero".into());
        }
        if self.max_message_size < 256 {
            return Err("max_message_size must be at least 256 bytes".into());
        }
        self.link.validate()
    }
}

/// Relay server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: SocketAddr,

    /// Close connections that stay silent this long
    pub idle_timeout: Option<Duration>,

    /// Largest relay message accepted
    pub max_message_size: usize,

    /// Outbound queue depth per connection
    pub queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 3001),
            idle_timeout: None,
            max_message_size: 64 * 1024,
            queue_depth: 32,
        }
    }
}

impl ServerConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.queue_depth == 0 {
            return Err("queue_depth must be non-zero".into());
        }
        if self.max_message_size < 256 {
            return Err("max_message_size must be at least 256 bytes".into());
        }
        if matches!(self.idle_timeout, Some(t) if t.is_zero()) {
            return Err("idle_timeout must be non-zero when set".into());
        }
        Ok(())
    }
}
