//! Local address discovery
//!
//! Finds the addresses this host would use to reach the internet by
//! connecting unbound UDP sockets toward public anchors. Connecting a UDP
//! socket only selects a route; no packet is sent.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use tokio::net::UdpSocket;
use tracing::debug;

use crate::rendezvous::AddressBundle;

const IPV4_ANCHOR: &str = "8.8.8.8:80";
const IPV6_ANCHOR: &str = "[2001:4860:4860::8888]:80";

/// Best-guess local addresses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalAddrs {
    /// Outbound LAN address (IPv4)
    pub private: Option<IpAddr>,
    /// Outbound global IPv6 address
    pub ipv6: Option<IpAddr>,
}

impl LocalAddrs {
    /// Self-reported bundle for registration on `port`
    pub fn bundle(&self, port: u16) -> AddressBundle {
        AddressBundle::local(
            self.private.map(|ip| SocketAddr::new(ip, port)),
            self.ipv6.map(|ip| SocketAddr::new(ip, port)),
        )
    }
}

/// Probe the outbound IPv4 and IPv6 addresses
pub async fn discover_local_addrs() -> LocalAddrs {
    let private = probe("0.0.0.0:0", IPV4_ANCHOR).await;
    let ipv6 = probe("[::]:0", IPV6_ANCHOR)
        .await
        .filter(|ip| matches!(ip, IpAddr::V6(v6) if !is_link_local(v6)));

    debug!("Local addresses: private {:?}, ipv6 {:?}", private, ipv6);
    LocalAddrs { private, ipv6 }
}

async fn probe(bind: &str, anchor: &str) -> Option<IpAddr> {
    let socket = UdpSocket::bind(bind).await.ok()?;
    if let Err(e) = socket.connect(anchor).await {
        debug!("No route toward {}: {}", anchor, e);
        return None;
    }
    let ip = socket.local_addr().ok()?.ip();
    usable(ip).then_some(ip)
}

fn usable(ip: IpAddr) -> bool {
    !ip.is_loopback() && !ip.is_unspecified()
}

fn is_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}
