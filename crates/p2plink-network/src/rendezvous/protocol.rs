//! Relay Wire Protocol
//!
//! JSON messages exchanged with the relay over a persistent TCP connection.
//! The channel carries no length framing, so incoming bytes are run through
//! a streaming JSON reader that recovers object boundaries on its own.
//!
//! Client -> relay:
//! - `{"method":"recvUUIDAndPrivAddr","privAddr":..,"ipv6Addr":..,"uuid":..}`
//! - `{"method":"exchangeInfo","targetUUID":..}`
//!
//! Relay -> client:
//! - `{"uuid":..,"pubAddr":..}`
//! - `{"address":..,"privAddr":..,"ipv6Addr":..,"shouldDownGrade":"true"|"false"}`

use std::fmt;
use std::net::SocketAddr;

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use crate::addr::host_literal;
use crate::error::{NetworkError, NetworkResult};

/// Opaque peer identifier minted by the relay
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identity
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Treat empty or whitespace-only input as "no identity"
    pub fn parse(id: &str) -> Option<Self> {
        let id = id.trim();
        if id.is_empty() {
            None
        } else {
            Some(Self(id.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The {public, private, ipv6} addresses a peer might be reached at
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressBundle {
    /// Observed by the relay on the live connection
    pub public: Option<SocketAddr>,
    /// Self-reported LAN address
    pub private: Option<SocketAddr>,
    /// Self-reported IPv6 address
    pub ipv6: Option<SocketAddr>,
}

impl AddressBundle {
    /// Bundle of self-reported addresses, as sent at registration
    pub fn local(private: Option<SocketAddr>, ipv6: Option<SocketAddr>) -> Self {
        Self {
            public: None,
            private,
            ipv6,
        }
    }
}

/// Parse a wire address. Empty or unparseable text means "absent".
pub fn parse_wire_addr(text: &str) -> Option<SocketAddr> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    text.parse().ok()
}

/// Render an address for the wire. IPv6 hosts are written fully expanded
/// inside brackets so the relay's classifier accepts them.
pub fn format_wire_addr(addr: Option<SocketAddr>) -> String {
    match addr {
        None => String::new(),
        Some(SocketAddr::V4(v4)) => v4.to_string(),
        Some(SocketAddr::V6(v6)) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => format!("{}:{}", v4, v6.port()),
            None => format!("[{}]:{}", host_literal((*v6.ip()).into()), v6.port()),
        },
    }
}

/// Client -> relay requests, tagged by `method`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum RelayRequest {
    /// Register (or re-register) this connection
    #[serde(rename = "recvUUIDAndPrivAddr")]
    Register {
        #[serde(rename = "privAddr", default)]
        priv_addr: String,
        #[serde(rename = "ipv6Addr", default)]
        ipv6_addr: String,
        #[serde(default)]
        uuid: String,
    },

    /// Ask the relay to exchange address bundles with a target peer
    #[serde(rename = "exchangeInfo")]
    ExchangeInfo {
        #[serde(rename = "targetUUID")]
        target_uuid: String,
    },
}

impl RelayRequest {
    pub fn register(bundle: &AddressBundle, identity: Option<&PeerIdentity>) -> Self {
        RelayRequest::Register {
            priv_addr: format_wire_addr(bundle.private),
            ipv6_addr: format_wire_addr(bundle.ipv6),
            uuid: identity.map(|id| id.to_string()).unwrap_or_default(),
        }
    }

    pub fn exchange_info(target: &PeerIdentity) -> Self {
        RelayRequest::ExchangeInfo {
            target_uuid: target.to_string(),
        }
    }
}

/// Reply to a registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterReply {
    pub uuid: String,
    #[serde(rename = "pubAddr")]
    pub pub_addr: String,
}

/// Peer info pushed to both sides of an exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfoReply {
    pub address: String,
    #[serde(rename = "privAddr", default)]
    pub priv_addr: String,
    #[serde(rename = "ipv6Addr", default)]
    pub ipv6_addr: String,
    /// "true" or "false"
    #[serde(rename = "shouldDownGrade", default)]
    pub should_downgrade: String,
}

impl PeerInfoReply {
    pub fn new(peer: &AddressBundle, should_downgrade: bool) -> Self {
        Self {
            address: format_wire_addr(peer.public),
            priv_addr: format_wire_addr(peer.private),
            ipv6_addr: format_wire_addr(peer.ipv6),
            should_downgrade: should_downgrade.to_string(),
        }
    }

    pub fn to_offer(&self) -> PeerOffer {
        PeerOffer {
            bundle: AddressBundle {
                public: parse_wire_addr(&self.address),
                private: parse_wire_addr(&self.priv_addr),
                ipv6: parse_wire_addr(&self.ipv6_addr),
            },
            should_downgrade: self.should_downgrade.trim().eq_ignore_ascii_case("true"),
        }
    }
}

/// Any message the relay sends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelayReply {
    Registered(RegisterReply),
    PeerInfo(PeerInfoReply),
}

/// A peer's addresses plus whether this side must skip IPv6
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerOffer {
    pub bundle: AddressBundle,
    pub should_downgrade: bool,
}

/// Serialize one relay message
pub fn encode_message<T: Serialize>(message: &T) -> NetworkResult<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

/// Reads consecutive JSON values off an unframed byte stream.
///
/// Objects coalesced into one read and objects split across reads are
/// both handled. `next_value` is cancel safe: bytes are only buffered
/// once a read completes.
pub struct JsonReader<R> {
    inner: R,
    buffer: BytesMut,
    chunk: Vec<u8>,
    max_size: usize,
}

impl<R: AsyncRead + Unpin> JsonReader<R> {
    pub fn new(inner: R, max_size: usize) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
            chunk: vec![0u8; 4096],
            max_size,
        }
    }

    /// Next complete JSON value, or `None` on a clean end of stream
    pub async fn next_value(&mut self) -> NetworkResult<Option<serde_json::Value>> {
        loop {
            if let Some(value) = self.take_buffered()? {
                return Ok(Some(value));
            }

            if self.buffer.len() > self.max_size {
                return Err(NetworkError::Protocol(format!(
                    "relay message exceeds {} bytes",
                    self.max_size
                )));
            }

            let n = self.inner.read(&mut self.chunk).await?;
            if n == 0 {
                return if self.buffer.iter().all(u8::is_ascii_whitespace) {
                    Ok(None)
                } else {
                    Err(NetworkError::Protocol(
                        "stream closed in the middle of a message".into(),
                    ))
                };
            }
            self.buffer.extend_from_slice(&self.chunk[..n]);
        }
    }

    fn take_buffered(&mut self) -> NetworkResult<Option<serde_json::Value>> {
        let (parsed, consumed) = {
            let mut stream =
                serde_json::Deserializer::from_slice(&self.buffer).into_iter::<serde_json::Value>();
            let parsed = stream.next();
            (parsed, stream.byte_offset())
        };

        match parsed {
            Some(Ok(value)) => {
                self.buffer.advance(consumed);
                Ok(Some(value))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(NetworkError::Protocol(format!("invalid JSON: {}", e))),
            None => {
                // Only whitespace left
                self.buffer.clear();
                Ok(None)
            }
        }
    }
}
