//! Rendezvous session driver
//!
//! Runs full rendezvous cycles against the configured relays until a peer
//! link is up: connect, register, obtain the peer's addresses (by asking
//! for them, or by waiting for the peer to ask), then race our dial
//! against the peer's inbound dial.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};

use p2plink_network::{
    discover_local_addrs, AddressBundle, FileIdentityStore, IdentityStore, LinkEvent,
    NetworkError, PeerIdentity, PeerLink, PeerOffer, RendezvousClient,
};

use crate::config::{expand_path, AgentConfig};

/// How this agent finds its peer
#[derive(Debug, Clone)]
pub enum Role {
    /// Ask the relay for this peer
    Contact(PeerIdentity),
    /// Wait for a peer to ask for us
    Wait,
}

/// A live link plus the relay session that produced it
pub struct LinkedSession {
    pub link: PeerLink,
    /// Kept open so the relay keeps our registration
    pub client: RendezvousClient,
}

/// Session driver
pub struct SessionDriver {
    config: AgentConfig,
    store: FileIdentityStore,
}

impl SessionDriver {
    pub fn new(config: AgentConfig) -> Result<Self> {
        let identity_path = expand_path(Path::new(&config.identity_file))?;
        Ok(Self {
            config,
            store: FileIdentityStore::new(identity_path),
        })
    }

    /// Identity saved by a previous session, if any
    pub async fn stored_identity(&self) -> Result<Option<PeerIdentity>> {
        Ok(self.store.load().await?)
    }

    /// Try every relay, `session_retries + 1` rounds, until linked
    pub async fn run(&self, role: &Role, sink: mpsc::Sender<LinkEvent>) -> Result<LinkedSession> {
        let rounds = self.config.session_retries + 1;
        let mut last_error = None;

        for round in 1..=rounds {
            for relay in &self.config.relays {
                info!("Rendezvous via {} (round {}/{})", relay, round, rounds);

                match self.attempt(relay, role, sink.clone()).await {
                    Ok(session) => return Ok(session),
                    Err(e) => {
                        warn!("Rendezvous via {} failed: {:#}", relay, e);
                        last_error = Some(e);
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("No relays configured")))
            .context("All rendezvous attempts failed")
    }

    async fn attempt(
        &self,
        relay: &str,
        role: &Role,
        sink: mpsc::Sender<LinkEvent>,
    ) -> Result<LinkedSession> {
        let mut client = RendezvousClient::new(self.config.client_config());
        client.connect(relay).await?;

        let bundle = self.local_bundle(client.local_port()).await?;
        let stored = self.store.load().await?;
        let registration = client.register(&bundle, stored.clone()).await?;

        if stored.as_ref() != Some(&registration.identity) {
            self.store.save(&registration.identity).await?;
            info!("Saved identity {} to {:?}", registration.identity, self.store.path());
        }
        println!("Registered as {}", registration.identity);

        let listener = client.listen()?;

        let offer = match role {
            Role::Contact(target) => self.lookup_peer(&mut client, target).await?,
            Role::Wait => {
                info!("Waiting for a peer to contact {}", registration.identity);
                client.await_peer().await?
            }
        };

        let link = client.establish_or_accept(&offer, &listener, sink).await?;
        info!("Linked with peer at {}", link.peer_addr());

        Ok(LinkedSession { link, client })
    }

    /// Ask for `target`, retrying while the relay does not know it yet
    async fn lookup_peer(
        &self,
        client: &mut RendezvousClient,
        target: &PeerIdentity,
    ) -> Result<PeerOffer> {
        let retries = self.config.timing.peer_lookup_retries;
        let interval = Duration::from_secs(self.config.timing.peer_lookup_interval);

        let mut attempt = 0;
        loop {
            match client.request_peer(target).await {
                Ok(offer) => return Ok(offer),
                Err(NetworkError::PeerNotFound(_)) if attempt < retries => {
                    attempt += 1;
                    info!(
                        "Peer {} not registered yet, asking again ({}/{})",
                        target, attempt, retries
                    );
                    tokio::time::sleep(interval).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn local_bundle(&self, port: u16) -> Result<AddressBundle> {
        let private = self.config.private_override()?;
        let ipv6 = self.config.ipv6_override()?;

        if self.config.addresses.disable_discovery {
            return Ok(AddressBundle::local(private, ipv6));
        }

        let discovered = discover_local_addrs().await.bundle(port);
        Ok(AddressBundle::local(
            private.or(discovered.private),
            ipv6.or(discovered.ipv6),
        ))
    }
}
