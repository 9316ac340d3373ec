//! Address Classification
//!
//! Strict textual classification of relay-observed addresses. Only dotted
//! quads and fully expanded IPv6 literals are recognised, since those are
//! the only forms the relay emits when comparing peer topologies.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Network family of an address, derived on demand and never stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkType {
    IPv4,
    IPv6,
    Invalid,
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkType::IPv4 => write!(f, "IPv4"),
            NetworkType::IPv6 => write!(f, "IPv6"),
            NetworkType::Invalid => write!(f, "invalid"),
        }
    }
}

/// Classify a textual address as IPv4, IPv6 or invalid.
///
/// Surrounding brackets are stripped first. Compressed IPv6 (`::`) and
/// anything carrying a port are rejected.
pub fn classify(address: &str) -> NetworkType {
    if address.len() < 7 {
        return NetworkType::Invalid;
    }

    let address = address
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(address);

    let quads: Vec<&str> = address.split('.').collect();
    if quads.len() == 4 {
        return if quads.iter().all(|part| is_octet(part)) {
            NetworkType::IPv4
        } else {
            NetworkType::Invalid
        };
    }

    let groups: Vec<&str> = address.split(':').collect();
    if groups.len() == 8 {
        return if groups.iter().all(|part| is_hextet(part)) {
            NetworkType::IPv6
        } else {
            NetworkType::Invalid
        };
    }

    NetworkType::Invalid
}

/// Classify the host part of a socket address.
///
/// The host is rendered in the canonical form `classify` accepts, with
/// IPv4-mapped IPv6 addresses unwrapped to plain IPv4.
pub fn classify_host(addr: &SocketAddr) -> NetworkType {
    classify(&host_literal(addr.ip()))
}

/// Render an IP the way the relay emits it: dotted quad, or all eight
/// IPv6 groups written out in four hex digits.
pub fn host_literal(ip: IpAddr) -> String {
    match ip.to_canonical() {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => v6
            .segments()
            .iter()
            .map(|seg| format!("{:04x}", seg))
            .collect::<Vec<_>>()
            .join(":"),
    }
}

fn is_octet(part: &str) -> bool {
    if part.is_empty() || part.len() > 3 {
        return false;
    }
    if part.len() > 1 && part.starts_with('0') {
        return false;
    }
    if !part.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    matches!(part.parse::<u16>(), Ok(n) if n <= 255)
}

fn is_hextet(part: &str) -> bool {
    part.len() <= 4 && part.bytes().all(|b| b.is_ascii_hexdigit())
}
