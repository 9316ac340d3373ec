//! Rendezvous Server
//!
//! Accepts relay connections, keeps the client registry and brokers
//! address exchange between two named peers. Each accepted connection is
//! served by its own handler task, with a writer task draining an outbound
//! queue so other handlers can push peer info to it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::addr::{classify_host, NetworkType};
use crate::config::ServerConfig;
use crate::error::{NetworkError, NetworkResult};
use crate::rendezvous::protocol::{
    encode_message, format_wire_addr, parse_wire_addr, AddressBundle, JsonReader, PeerIdentity,
    PeerInfoReply, RegisterReply, RelayRequest,
};
use crate::rendezvous::registry::{ConnectionHandle, Registry};
use crate::socket::listen_dual_stack;

/// Decide who must skip IPv6: when the two public addresses are of
/// different families, the IPv6 side downgrades. Returns
/// `(requester, target)`.
pub fn downgrade_flags(requester: NetworkType, target: NetworkType) -> (bool, bool) {
    if requester == target {
        (false, false)
    } else {
        (requester == NetworkType::IPv6, target == NetworkType::IPv6)
    }
}

fn network_type(addr: Option<SocketAddr>) -> NetworkType {
    addr.map(|a| classify_host(&a)).unwrap_or(NetworkType::Invalid)
}

/// Counters reported by the relay binary
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections: AtomicU64,
    pub registrations: AtomicU64,
    pub exchanges: AtomicU64,
    pub unknown_targets: AtomicU64,
}

/// Point-in-time copy of `ServerStats`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections: u64,
    pub registrations: u64,
    pub exchanges: u64,
    pub unknown_targets: u64,
    pub registered: usize,
}

/// Relay server
pub struct RendezvousServer {
    listener: TcpListener,
    registry: Registry,
    config: ServerConfig,
    stats: Arc<ServerStats>,
    next_connection_id: AtomicU64,
}

impl RendezvousServer {
    /// Bind the listen address from `config`
    pub async fn bind(config: ServerConfig) -> NetworkResult<Self> {
        config.validate().map_err(NetworkError::Config)?;

        let listener = listen_dual_stack(config.listen_addr)?;
        info!("Rendezvous server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            registry: Registry::new(),
            config,
            stats: Arc::new(ServerStats::default()),
            next_connection_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> NetworkResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections: self.stats.connections.load(Ordering::Relaxed),
            registrations: self.stats.registrations.load(Ordering::Relaxed),
            exchanges: self.stats.exchanges.load(Ordering::Relaxed),
            unknown_targets: self.stats.unknown_targets.load(Ordering::Relaxed),
            registered: self.registry.len(),
        }
    }

    /// Accept connections until the task is dropped
    pub async fn run(&self) -> NetworkResult<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, remote)) => {
                    let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                    self.stats.connections.fetch_add(1, Ordering::Relaxed);
                    debug!("Accepted relay connection {} from {}", id, remote);

                    let session = Session::new(
                        id,
                        remote,
                        self.registry.clone(),
                        self.config.clone(),
                        Arc::clone(&self.stats),
                    );
                    tokio::spawn(session.run(stream));
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}

/// Per-connection handler state
struct Session {
    id: u64,
    remote: SocketAddr,
    registry: Registry,
    config: ServerConfig,
    stats: Arc<ServerStats>,
    /// Identity this connection registered, if any
    identity: Option<PeerIdentity>,
    bundle: AddressBundle,
}

impl Session {
    fn new(
        id: u64,
        remote: SocketAddr,
        registry: Registry,
        config: ServerConfig,
        stats: Arc<ServerStats>,
    ) -> Self {
        Self {
            id,
            remote: SocketAddr::new(remote.ip().to_canonical(), remote.port()),
            registry,
            config,
            stats,
            identity: None,
            bundle: AddressBundle::default(),
        }
    }

    async fn run(mut self, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(self.config.queue_depth);
        let handle = ConnectionHandle::new(self.id, self.remote, tx);
        tokio::spawn(write_loop(write_half, rx, self.remote));

        let mut reader = JsonReader::new(read_half, self.config.max_message_size);

        loop {
            let next = match self.config.idle_timeout {
                Some(idle) => match timeout(idle, reader.next_value()).await {
                    Ok(next) => next,
                    Err(_) => {
                        info!("Closing idle relay connection {} ({})", self.id, self.remote);
                        break;
                    }
                },
                None => reader.next_value().await,
            };

            match next {
                Ok(Some(value)) => match serde_json::from_value::<RelayRequest>(value) {
                    Ok(request) => self.handle_request(request, &handle),
                    Err(e) => debug!("Ignoring relay message from {}: {}", self.remote, e),
                },
                Ok(None) => {
                    debug!("Relay connection {} closed by {}", self.id, self.remote);
                    break;
                }
                Err(e) => {
                    warn!("Dropping relay connection {} ({}): {}", self.id, self.remote, e);
                    break;
                }
            }
        }

        if let Some(identity) = self.identity.take() {
            if self.registry.remove_connection(&identity, self.id) {
                info!("Unregistered peer {} ({})", identity, self.remote);
            }
        }
        // Dropping the last sender ends the writer, which closes the socket
    }

    fn handle_request(&mut self, request: RelayRequest, handle: &ConnectionHandle) {
        match request {
            RelayRequest::Register {
                priv_addr,
                ipv6_addr,
                uuid,
            } => self.handle_register(&priv_addr, &ipv6_addr, &uuid, handle),
            RelayRequest::ExchangeInfo { target_uuid } => {
                self.handle_exchange(&target_uuid, handle)
            }
        }
    }

    fn handle_register(
        &mut self,
        priv_addr: &str,
        ipv6_addr: &str,
        uuid: &str,
        handle: &ConnectionHandle,
    ) {
        let bundle = AddressBundle {
            public: Some(self.remote),
            private: parse_wire_addr(priv_addr),
            ipv6: parse_wire_addr(ipv6_addr),
        };
        let requested = PeerIdentity::parse(uuid);

        if let Some(previous) = self.identity.take() {
            if Some(&previous) != requested.as_ref() {
                self.registry.remove_connection(&previous, self.id);
            }
        }

        let identity = self.registry.register(requested, handle.clone(), bundle);
        self.stats.registrations.fetch_add(1, Ordering::Relaxed);
        info!(
            "Registered peer {} (public {}, private {:?}, ipv6 {:?})",
            identity, self.remote, bundle.private, bundle.ipv6
        );

        self.identity = Some(identity.clone());
        self.bundle = bundle;

        let reply = RegisterReply {
            uuid: identity.to_string(),
            pub_addr: format_wire_addr(Some(self.remote)),
        };
        self.reply(handle, &reply);
    }

    fn handle_exchange(&mut self, target_uuid: &str, handle: &ConnectionHandle) {
        let Some(requester) = self.identity.clone() else {
            warn!("exchangeInfo from unregistered connection {} ({})", self.id, self.remote);
            return;
        };

        let target_id = PeerIdentity::new(target_uuid.trim());
        let Some(target) = self.registry.lookup(&target_id) else {
            // No reply; the requester decides whether to ask again
            self.stats.unknown_targets.fetch_add(1, Ordering::Relaxed);
            info!("Exchange {} -> {}: target not registered", requester, target_id);
            return;
        };

        let (requester_downgrade, target_downgrade) = downgrade_flags(
            network_type(self.bundle.public),
            network_type(target.bundle.public),
        );
        self.stats.exchanges.fetch_add(1, Ordering::Relaxed);
        info!(
            "Exchange {} -> {} (downgrade: requester={}, target={})",
            requester, target_id, requester_downgrade, target_downgrade
        );

        self.reply(handle, &PeerInfoReply::new(&target.bundle, requester_downgrade));

        match encode_message(&PeerInfoReply::new(&self.bundle, target_downgrade)) {
            Ok(message) => {
                if let Err(e) = target.connection.send(message) {
                    warn!("Failed to push peer info to {}: {}", target_id, e);
                }
            }
            Err(e) => error!("Failed to encode peer info: {}", e),
        }
    }

    fn reply<T: serde::Serialize>(&self, handle: &ConnectionHandle, message: &T) {
        let result = encode_message(message).and_then(|bytes| handle.send(bytes));
        if let Err(e) = result {
            warn!("Failed to reply to {}: {}", self.remote, e);
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>, remote: SocketAddr) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = writer.write_all(&message).await {
            warn!("Write to {} failed: {}", remote, e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::protocol::RelayReply;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    async fn start_server(config: ServerConfig) -> (Arc<RendezvousServer>, SocketAddr) {
        let server = Arc::new(RendezvousServer::bind(config).await.unwrap());
        let addr = server.local_addr().unwrap();
        let runner = Arc::clone(&server);
        tokio::spawn(async move { runner.run().await });
        (server, addr)
    }

    fn local_config() -> ServerConfig {
        ServerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..ServerConfig::default()
        }
    }

    struct TestPeer {
        stream: TcpStream,
        reader_buf: Vec<u8>,
    }

    impl TestPeer {
        async fn connect(addr: SocketAddr) -> Self {
            Self {
                stream: TcpStream::connect(addr).await.unwrap(),
                reader_buf: Vec::new(),
            }
        }

        async fn send(&mut self, value: serde_json::Value) {
            let bytes = serde_json::to_vec(&value).unwrap();
            self.stream.write_all(&bytes).await.unwrap();
        }

        async fn recv(&mut self) -> RelayReply {
            loop {
                let (parsed, used) = {
                    let mut stream = serde_json::Deserializer::from_slice(&self.reader_buf)
                        .into_iter::<RelayReply>();
                    (stream.next(), stream.byte_offset())
                };
                if let Some(Ok(reply)) = parsed {
                    self.reader_buf.drain(..used);
                    return reply;
                }
                let mut chunk = [0u8; 1024];
                let n = tokio::time::timeout(Duration::from_secs(5), self.stream.read(&mut chunk))
                    .await
                    .expect("relay reply timed out")
                    .unwrap();
                assert!(n > 0, "relay closed the connection");
                self.reader_buf.extend_from_slice(&chunk[..n]);
            }
        }

        async fn register(&mut self, uuid: &str, priv_addr: &str) -> RegisterReply {
            self.send(json!({
                "method": "recvUUIDAndPrivAddr",
                "privAddr": priv_addr,
                "ipv6Addr": "",
                "uuid": uuid,
            }))
            .await;
            match self.recv().await {
                RelayReply::Registered(reply) => reply,
                other => panic!("expected registration reply, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_downgrade_rule() {
        use NetworkType::*;
        assert_eq!(downgrade_flags(IPv4, IPv4), (false, false));
        assert_eq!(downgrade_flags(IPv6, IPv6), (false, false));
        assert_eq!(downgrade_flags(IPv6, IPv4), (true, false));
        assert_eq!(downgrade_flags(IPv4, IPv6), (false, true));
        assert_eq!(downgrade_flags(Invalid, IPv4), (false, false));
    }

    #[tokio::test]
    async fn test_registration_reply_and_minting() {
        let (server, addr) = start_server(local_config()).await;

        let mut peer = TestPeer::connect(addr).await;
        let reply = peer.register("", "192.168.1.5:40000").await;
        assert!(!reply.uuid.is_empty());
        assert_eq!(reply.pub_addr, peer.stream.local_addr().unwrap().to_string());

        let again = peer.register(&reply.uuid, "192.168.1.6:40000").await;
        assert_eq!(again.uuid, reply.uuid);
        assert_eq!(server.registry().len(), 1);
        assert_eq!(server.stats().registrations, 2);
    }

    #[tokio::test]
    async fn test_exchange_pushes_to_both_sides() {
        let (_server, addr) = start_server(local_config()).await;

        let mut a = TestPeer::connect(addr).await;
        let mut b = TestPeer::connect(addr).await;
        a.register("a1", "192.168.1.5:40000").await;
        b.register("b1", "10.0.0.7:40001").await;

        a.send(json!({"method": "exchangeInfo", "targetUUID": "b1"})).await;

        let RelayReply::PeerInfo(to_a) = a.recv().await else {
            panic!("requester did not get peer info");
        };
        assert_eq!(to_a.address, b.stream.local_addr().unwrap().to_string());
        assert_eq!(to_a.priv_addr, "10.0.0.7:40001");
        assert_eq!(to_a.should_downgrade, "false");

        let RelayReply::PeerInfo(to_b) = b.recv().await else {
            panic!("target did not get peer info");
        };
        assert_eq!(to_b.address, a.stream.local_addr().unwrap().to_string());
        assert_eq!(to_b.priv_addr, "192.168.1.5:40000");
        assert_eq!(to_b.should_downgrade, "false");
    }

    #[tokio::test]
    async fn test_mixed_families_downgrade_ipv6_side() {
        let config = ServerConfig {
            listen_addr: "[::]:0".parse().unwrap(),
            ..ServerConfig::default()
        };
        // Hosts without IPv6 cannot run this
        let Ok(server) = RendezvousServer::bind(config).await else {
            return;
        };
        let port = server.local_addr().unwrap().port();
        let server = Arc::new(server);
        let runner = Arc::clone(&server);
        tokio::spawn(async move { runner.run().await });

        let Ok(v6_stream) = TcpStream::connect(("::1", port)).await else {
            return;
        };
        let mut a = TestPeer::connect(SocketAddr::from(([127, 0, 0, 1], port))).await;
        let mut b = TestPeer {
            stream: v6_stream,
            reader_buf: Vec::new(),
        };

        let a_reply = a.register("a1", "192.168.1.5:40000").await;
        let a_port = a.stream.local_addr().unwrap().port();
        assert_eq!(a_reply.pub_addr, format!("127.0.0.1:{}", a_port));

        let b_reply = b.register("b1", "").await;
        let b_port = b.stream.local_addr().unwrap().port();
        let b_public = format!("[0000:0000:0000:0000:0000:0000:0000:0001]:{}", b_port);
        assert_eq!(b_reply.pub_addr, b_public);

        a.send(json!({"method": "exchangeInfo", "targetUUID": "b1"})).await;

        let RelayReply::PeerInfo(to_a) = a.recv().await else {
            panic!("requester did not get peer info");
        };
        assert_eq!(to_a.address, b_public);
        assert_eq!(to_a.should_downgrade, "false");

        let RelayReply::PeerInfo(to_b) = b.recv().await else {
            panic!("target did not get peer info");
        };
        assert_eq!(to_b.address, format!("127.0.0.1:{}", a_port));
        assert_eq!(to_b.should_downgrade, "true");
    }

    #[tokio::test]
    async fn test_unknown_target_gets_no_reply() {
        let (server, addr) = start_server(local_config()).await;

        let mut a = TestPeer::connect(addr).await;
        a.register("a1", "").await;
        a.send(json!({"method": "exchangeInfo", "targetUUID": "nobody"})).await;
        // Unknown methods are ignored too
        a.send(json!({"method": "ping"})).await;

        let mut chunk = [0u8; 64];
        let read =
            tokio::time::timeout(Duration::from_millis(200), a.stream.read(&mut chunk)).await;
        assert!(read.is_err(), "relay answered an unknown target");

        // Connection is still usable
        let reply = a.register("a1", "").await;
        assert_eq!(reply.uuid, "a1");
        assert_eq!(server.stats().unknown_targets, 1);
    }

    #[tokio::test]
    async fn test_close_prunes_registry() {
        let (server, addr) = start_server(local_config()).await;

        let mut a = TestPeer::connect(addr).await;
        a.register("a1", "").await;
        assert_eq!(server.registry().len(), 1);

        drop(a);
        for _ in 0..50 {
            if server.registry().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(server.registry().is_empty());
    }

    #[tokio::test]
    async fn test_garbage_closes_connection() {
        let (server, addr) = start_server(local_config()).await;

        let mut a = TestPeer::connect(addr).await;
        a.register("a1", "").await;
        a.stream.write_all(b"this is not json").await.unwrap();

        let mut chunk = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(5), a.stream.read(&mut chunk))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(server.registry().lookup(&PeerIdentity::new("a1")).is_none());
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_connection() {
        let config = ServerConfig {
            idle_timeout: Some(Duration::from_millis(100)),
            ..local_config()
        };
        let (server, addr) = start_server(config).await;

        let mut a = TestPeer::connect(addr).await;
        a.register("a1", "").await;

        let mut chunk = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(5), a.stream.read(&mut chunk))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(server.registry().is_empty());
    }
}
