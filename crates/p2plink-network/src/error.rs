//! Network error types

use thiserror::Error;

use crate::frame::FrameError;
use crate::link::DialAttempt;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection could not be opened
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection timeout
    #[error("Connection timeout: {0}")]
    Timeout(String),

    /// The relay closed the connection
    #[error("Relay connection closed")]
    RelayClosed,

    /// Protocol error on the relay channel
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Framing error on a peer link
    #[error("Framing error: {0}")]
    Framing(#[from] FrameError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Address already in use
    #[error("Address already in use: {0}")]
    AddressInUse(std::net::SocketAddr),

    /// Peer not found at the relay
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Every dial candidate failed
    #[error("All {} dial attempts failed", .attempts.len())]
    PathsExhausted { attempts: Vec<DialAttempt> },

    /// Operation not allowed in the current session state
    #[error("Invalid state: {operation} not allowed while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Link already closed
    #[error("Link closed")]
    LinkClosed,
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;
