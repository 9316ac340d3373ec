//! Rendezvous Client
//!
//! Peer-side half of the relay protocol. Drives one session through
//! `Disconnected -> ConnectedToRelay -> Registered -> AwaitingPeer ->
//! PathSelecting -> Linked`, or into `Failed`, from which the caller may
//! `reset` and start over.
//!
//! The relay connection stays open for the whole session. Its local port
//! is reused for every peer dial and for the inbound listener, so the NAT
//! mapping created toward the relay is the one the peer punches through.

use std::fmt;
use std::net::SocketAddr;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{NetworkError, NetworkResult};
use crate::link::{candidate_list, dial_candidates, DialOutcome, LinkEvent, PeerLink};
use crate::rendezvous::protocol::{
    encode_message, parse_wire_addr, AddressBundle, JsonReader, PeerIdentity, PeerOffer,
    RelayReply, RelayRequest,
};
use crate::socket::{connect_reusable, listen_reusable, wildcard_for};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    ConnectedToRelay,
    Registered,
    AwaitingPeer,
    PathSelecting,
    Linked,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::ConnectedToRelay => "connected to relay",
            SessionState::Registered => "registered",
            SessionState::AwaitingPeer => "awaiting peer",
            SessionState::PathSelecting => "selecting path",
            SessionState::Linked => "linked",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Result of a successful registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Identity to persist and reuse next session
    pub identity: PeerIdentity,
    /// This peer's address as the relay sees it
    pub public_addr: Option<SocketAddr>,
}

struct RelayChannel {
    relay_addr: SocketAddr,
    reader: JsonReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Rendezvous client session
pub struct RendezvousClient {
    config: ClientConfig,
    state: SessionState,
    relay: Option<RelayChannel>,
    local_port: u16,
    registration: Option<Registration>,
    /// Peer info that arrived while waiting for something else
    pending_offer: Option<PeerOffer>,
}

impl RendezvousClient {
    pub fn new(config: ClientConfig) -> Self {
        let local_port = config.local_port;
        Self {
            config,
            state: SessionState::Disconnected,
            relay: None,
            local_port,
            registration: None,
            pending_offer: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Local port shared by the relay connection and peer links
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn registration(&self) -> Option<&Registration> {
        self.registration.as_ref()
    }

    pub fn relay_addr(&self) -> Option<SocketAddr> {
        self.relay.as_ref().map(|r| r.relay_addr)
    }

    fn expect_state(&self, operation: &'static str, allowed: &[SessionState]) -> NetworkResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(NetworkError::InvalidState {
                operation,
                state: self.state.to_string(),
            })
        }
    }

    fn fail(&mut self, error: NetworkError) -> NetworkError {
        warn!("Rendezvous session failed: {}", error);
        self.state = SessionState::Failed;
        error
    }

    /// Drop the relay connection and return to `Disconnected`
    pub fn reset(&mut self) {
        self.relay = None;
        self.registration = None;
        self.pending_offer = None;
        self.local_port = self.config.local_port;
        self.state = SessionState::Disconnected;
    }

    /// Connect to the relay from the configured local port
    pub async fn connect(&mut self, relay: &str) -> NetworkResult<()> {
        self.expect_state("connect", &[SessionState::Disconnected])?;

        let addrs: Vec<SocketAddr> = lookup_host(relay)
            .await
            .map_err(|e| NetworkError::ConnectionFailed(format!("resolve {}: {}", relay, e)))?
            .collect();

        let mut last_error =
            NetworkError::ConnectionFailed(format!("{} did not resolve to any address", relay));

        for addr in addrs {
            match connect_reusable(self.local_port, addr, self.config.relay_connect_timeout).await {
                Ok(stream) => {
                    self.local_port = stream.local_addr()?.port();
                    let (read_half, writer) = stream.into_split();
                    self.relay = Some(RelayChannel {
                        relay_addr: addr,
                        reader: JsonReader::new(read_half, self.config.max_message_size),
                        writer,
                    });
                    self.state = SessionState::ConnectedToRelay;
                    info!("Connected to relay {} from local port {}", addr, self.local_port);
                    return Ok(());
                }
                Err(e) => {
                    debug!("Relay address {} unreachable: {}", addr, e);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    /// Register our self-reported addresses, optionally under a known identity
    pub async fn register(
        &mut self,
        bundle: &AddressBundle,
        identity: Option<PeerIdentity>,
    ) -> NetworkResult<Registration> {
        self.expect_state(
            "register",
            &[SessionState::ConnectedToRelay, SessionState::Registered],
        )?;

        let request = RelayRequest::register(bundle, identity.as_ref());
        if let Err(e) = self.send_request(&request).await {
            return Err(self.fail(e));
        }

        let reply = loop {
            match timeout(self.config.reply_timeout, self.next_reply()).await {
                Err(_) => {
                    let error = NetworkError::Timeout("relay did not answer registration".into());
                    return Err(self.fail(error));
                }
                Ok(Err(e)) => return Err(self.fail(e)),
                Ok(Ok(RelayReply::Registered(reply))) => break reply,
                Ok(Ok(RelayReply::PeerInfo(info))) => {
                    debug!("Peer info arrived before registration reply, keeping it");
                    self.pending_offer = Some(info.to_offer());
                }
            }
        };

        let identity = match PeerIdentity::parse(&reply.uuid) {
            Some(id) => id,
            None => {
                let error = NetworkError::Protocol("relay returned an empty identity".into());
                return Err(self.fail(error));
            }
        };

        let registration = Registration {
            identity,
            public_addr: parse_wire_addr(&reply.pub_addr),
        };
        info!(
            "Registered as {} (public address {:?})",
            registration.identity, registration.public_addr
        );

        self.registration = Some(registration.clone());
        self.state = SessionState::Registered;
        Ok(registration)
    }

    /// Ask the relay for `target`'s addresses.
    ///
    /// The relay stays silent for identities it does not know, so the wait
    /// is bounded by the reply timeout. On timeout the session drops back to
    /// `Registered` and the request may be repeated.
    pub async fn request_peer(&mut self, target: &PeerIdentity) -> NetworkResult<PeerOffer> {
        self.expect_state("request_peer", &[SessionState::Registered])?;

        if let Err(e) = self.send_request(&RelayRequest::exchange_info(target)).await {
            return Err(self.fail(e));
        }
        self.state = SessionState::AwaitingPeer;

        match timeout(self.config.reply_timeout, self.next_offer()).await {
            Ok(Ok(offer)) => {
                info!(
                    "Received addresses for {}: {:?} (downgrade: {})",
                    target, offer.bundle, offer.should_downgrade
                );
                Ok(offer)
            }
            Ok(Err(e)) => Err(self.fail(e)),
            Err(_) => {
                info!("No answer for peer {}, it may not be registered yet", target);
                self.state = SessionState::Registered;
                Err(NetworkError::PeerNotFound(target.to_string()))
            }
        }
    }

    /// Wait, without a deadline, for the relay to push a peer's addresses
    /// because that peer asked for ours.
    pub async fn await_peer(&mut self) -> NetworkResult<PeerOffer> {
        self.expect_state("await_peer", &[SessionState::Registered])?;
        self.state = SessionState::AwaitingPeer;

        match self.next_offer().await {
            Ok(offer) => {
                info!(
                    "Peer {:?} is contacting us (downgrade: {})",
                    offer.bundle.public, offer.should_downgrade
                );
                Ok(offer)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Listen on the shared local port for the peer's inbound dial
    pub fn listen(&self) -> NetworkResult<TcpListener> {
        let relay = self.relay.as_ref().ok_or(NetworkError::InvalidState {
            operation: "listen",
            state: self.state.to_string(),
        })?;
        listen_reusable(wildcard_for(&relay.relay_addr, self.local_port))
    }

    /// Dial the peer's candidates in priority order
    pub async fn establish_link(
        &mut self,
        offer: &PeerOffer,
        sink: mpsc::Sender<LinkEvent>,
    ) -> NetworkResult<PeerLink> {
        self.expect_state("establish_link", &[SessionState::AwaitingPeer])?;
        self.state = SessionState::PathSelecting;

        let candidates = candidate_list(&offer.bundle, offer.should_downgrade);
        debug!("Dial candidates: {:?}", candidates);

        let outcome = dial_candidates(self.local_port, &candidates, &self.config.link).await;
        self.finish_dial(outcome, sink)
    }

    /// Accept the peer's inbound dial on `listener`
    pub async fn accept_link(
        &mut self,
        listener: &TcpListener,
        sink: mpsc::Sender<LinkEvent>,
    ) -> NetworkResult<PeerLink> {
        self.expect_state("accept_link", &[SessionState::AwaitingPeer])?;
        self.state = SessionState::PathSelecting;

        let accepted =
            PeerLink::accept(listener, self.config.accept_timeout, sink, &self.config.link).await;
        match accepted {
            Ok(link) => {
                self.state = SessionState::Linked;
                Ok(link)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Dial the peer while also accepting its dial; whichever connects
    /// first becomes the link.
    pub async fn establish_or_accept(
        &mut self,
        offer: &PeerOffer,
        listener: &TcpListener,
        sink: mpsc::Sender<LinkEvent>,
    ) -> NetworkResult<PeerLink> {
        self.expect_state("establish_or_accept", &[SessionState::AwaitingPeer])?;
        self.state = SessionState::PathSelecting;

        let candidates = candidate_list(&offer.bundle, offer.should_downgrade);
        let link_config = self.config.link.clone();
        let accept_wait = self.config.accept_timeout;

        let dial = dial_candidates(self.local_port, &candidates, &link_config);
        let accept = PeerLink::accept(listener, accept_wait, sink.clone(), &link_config);
        tokio::pin!(dial);
        tokio::pin!(accept);

        let mut dial_attempts = None;
        let mut accept_error = None;

        loop {
            tokio::select! {
                outcome = &mut dial, if dial_attempts.is_none() => match outcome {
                    DialOutcome::Connected { stream, candidate, .. } => {
                        debug!("Outbound dial to {} won", candidate.addr);
                        return self.start_link(stream, sink);
                    }
                    DialOutcome::Exhausted { attempts } => {
                        debug!("Outbound dial exhausted, still waiting for inbound");
                        dial_attempts = Some(attempts);
                    }
                },
                accepted = &mut accept, if accept_error.is_none() => match accepted {
                    Ok(link) => {
                        debug!("Inbound connection from {} won", link.peer_addr());
                        self.state = SessionState::Linked;
                        return Ok(link);
                    }
                    Err(e) => {
                        debug!("Inbound accept failed: {}", e);
                        accept_error = Some(e);
                    }
                },
            }

            if accept_error.is_some() {
                if let Some(attempts) = dial_attempts.take() {
                    return Err(self.fail(NetworkError::PathsExhausted { attempts }));
                }
            }
        }
    }

    fn finish_dial(
        &mut self,
        outcome: DialOutcome,
        sink: mpsc::Sender<LinkEvent>,
    ) -> NetworkResult<PeerLink> {
        match outcome {
            DialOutcome::Connected { stream, .. } => self.start_link(stream, sink),
            DialOutcome::Exhausted { attempts } => {
                Err(self.fail(NetworkError::PathsExhausted { attempts }))
            }
        }
    }

    fn start_link(
        &mut self,
        stream: TcpStream,
        sink: mpsc::Sender<LinkEvent>,
    ) -> NetworkResult<PeerLink> {
        match PeerLink::start(stream, sink, &self.config.link) {
            Ok(link) => {
                self.state = SessionState::Linked;
                Ok(link)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn send_request(&mut self, request: &RelayRequest) -> NetworkResult<()> {
        let message = encode_message(request)?;
        let relay = self.relay.as_mut().ok_or(NetworkError::RelayClosed)?;
        relay.writer.write_all(&message).await?;
        Ok(())
    }

    async fn next_reply(&mut self) -> NetworkResult<RelayReply> {
        let relay = self.relay.as_mut().ok_or(NetworkError::RelayClosed)?;
        loop {
            let value = relay.reader.next_value().await?.ok_or(NetworkError::RelayClosed)?;
            match serde_json::from_value::<RelayReply>(value) {
                Ok(reply) => return Ok(reply),
                Err(e) => debug!("Ignoring unrecognised relay message: {}", e),
            }
        }
    }

    async fn next_offer(&mut self) -> NetworkResult<PeerOffer> {
        if let Some(offer) = self.pending_offer.take() {
            return Ok(offer);
        }
        loop {
            match self.next_reply().await? {
                RelayReply::PeerInfo(info) => return Ok(info.to_offer()),
                RelayReply::Registered(_) => debug!("Ignoring late registration reply"),
            }
        }
    }
}
