//! Relay plus two peers over loopback

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use p2plink_network::{
    AddressBundle, ClientConfig, DisconnectReason, LinkConfig, LinkEvent, NetworkError,
    PeerIdentity, RendezvousClient, RendezvousServer, ServerConfig, SessionState,
};

async fn start_relay() -> (Arc<RendezvousServer>, String) {
    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        ..ServerConfig::default()
    };
    let server = Arc::new(RendezvousServer::bind(config).await.unwrap());
    let addr = server.local_addr().unwrap().to_string();
    let runner = Arc::clone(&server);
    tokio::spawn(async move { runner.run().await });
    (server, addr)
}

fn client_config() -> ClientConfig {
    ClientConfig {
        reply_timeout: Duration::from_secs(2),
        accept_timeout: Duration::from_secs(10),
        link: LinkConfig {
            attempt_timeout: Duration::from_secs(2),
            retry_backoff: Duration::from_millis(20),
            ..LinkConfig::default()
        },
        ..ClientConfig::default()
    }
}

/// An address nothing listens on, standing in for a LAN the other peer
/// is not part of
async fn unreachable_lan_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

async fn expect_message(rx: &mut mpsc::Receiver<LinkEvent>) -> Bytes {
    match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
        Ok(Some(LinkEvent::Message(payload))) => payload,
        other => panic!("expected a message, got {:?}", other),
    }
}

#[tokio::test]
async fn test_two_peers_link_through_public_address() {
    let (server, relay) = start_relay().await;

    // B registers first and waits to be contacted
    let mut b = RendezvousClient::new(client_config());
    b.connect(&relay).await.unwrap();
    let b_lan = unreachable_lan_addr().await;
    let b_reg = b
        .register(&AddressBundle::local(Some(b_lan), None), Some(PeerIdentity::new("b1")))
        .await
        .unwrap();
    assert_eq!(b_reg.identity.as_str(), "b1");
    assert_eq!(b_reg.public_addr.map(|a| a.port()), Some(b.local_port()));
    let b_listener = b.listen().unwrap();

    // A registers and asks for B
    let mut a = RendezvousClient::new(client_config());
    a.connect(&relay).await.unwrap();
    let a_lan = unreachable_lan_addr().await;
    let a_reg = a
        .register(&AddressBundle::local(Some(a_lan), None), Some(PeerIdentity::new("a1")))
        .await
        .unwrap();
    assert_eq!(a_reg.identity.as_str(), "a1");
    assert_eq!(server.registry().len(), 2);

    let offer = a.request_peer(&PeerIdentity::new("b1")).await.unwrap();
    assert!(!offer.should_downgrade);
    assert_eq!(offer.bundle.private, Some(b_lan));
    assert_eq!(offer.bundle.public, b_reg.public_addr);
    assert_eq!(a.state(), SessionState::AwaitingPeer);

    // B learns about A from the relay's push
    let pushed = b.await_peer().await.unwrap();
    assert!(!pushed.should_downgrade);
    assert_eq!(pushed.bundle.public, a_reg.public_addr);
    assert_eq!(pushed.bundle.private, Some(a_lan));

    let (a_tx, mut a_rx) = mpsc::channel(16);
    let (b_tx, mut b_rx) = mpsc::channel(16);

    // A's LAN candidate fails, the public one reaches B's listener
    let (a_link, b_link) = tokio::join!(
        a.establish_link(&offer, a_tx),
        b.accept_link(&b_listener, b_tx)
    );
    let a_link = a_link.unwrap();
    let b_link = b_link.unwrap();

    assert_eq!(a.state(), SessionState::Linked);
    assert_eq!(b.state(), SessionState::Linked);
    assert_eq!(a_link.local_addr().port(), a.local_port());
    assert_eq!(Some(a_link.peer_addr()), b_reg.public_addr);

    a_link.send(b"hello from a").await.unwrap();
    b_link.send(b"").await.unwrap();
    b_link.send(b"hello from b").await.unwrap();

    assert_eq!(&expect_message(&mut b_rx).await[..], b"hello from a");
    assert_eq!(&expect_message(&mut a_rx).await[..], b"");
    assert_eq!(&expect_message(&mut a_rx).await[..], b"hello from b");

    // Closing A's write side ends B's read loop with the sentinel
    a_link.close().await.unwrap();
    match tokio::time::timeout(Duration::from_secs(5), b_rx.recv()).await {
        Ok(Some(LinkEvent::Disconnected(DisconnectReason::EndOfStream))) => {}
        other => panic!("expected disconnect sentinel, got {:?}", other),
    }
    assert_eq!(b_link.join().await, DisconnectReason::EndOfStream);
}

#[tokio::test]
async fn test_unknown_target_then_retry() {
    let (_server, relay) = start_relay().await;

    let mut a = RendezvousClient::new(client_config());
    a.connect(&relay).await.unwrap();
    a.register(&AddressBundle::default(), None).await.unwrap();

    let err = a.request_peer(&PeerIdentity::new("late")).await.unwrap_err();
    assert!(matches!(err, NetworkError::PeerNotFound(_)));
    assert_eq!(a.state(), SessionState::Registered);

    // The target shows up; asking again now succeeds
    let mut late = RendezvousClient::new(client_config());
    late.connect(&relay).await.unwrap();
    late.register(&AddressBundle::default(), Some(PeerIdentity::new("late")))
        .await
        .unwrap();

    let offer = a.request_peer(&PeerIdentity::new("late")).await.unwrap();
    assert_eq!(offer.bundle.public.map(|p| p.port()), Some(late.local_port()));
}

#[tokio::test]
async fn test_reconnect_keeps_identity() {
    let (server, relay) = start_relay().await;

    let mut first = RendezvousClient::new(client_config());
    first.connect(&relay).await.unwrap();
    let minted = first
        .register(&AddressBundle::default(), None)
        .await
        .unwrap()
        .identity;

    let mut second = RendezvousClient::new(client_config());
    second.connect(&relay).await.unwrap();
    let again = second
        .register(&AddressBundle::default(), Some(minted.clone()))
        .await
        .unwrap();
    assert_eq!(again.identity, minted);

    // The old connection going away must not evict the new one
    drop(first);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let record = server.registry().lookup(&minted).unwrap();
    assert_eq!(record.bundle.public.map(|p| p.port()), Some(second.local_port()));
}
