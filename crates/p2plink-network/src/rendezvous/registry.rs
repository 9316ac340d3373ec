//! Client Registry
//!
//! Maps each registered identity to the connection it arrived on. The map is
//! an explicitly owned handle cloned into every connection task; each record
//! sits behind its shard lock, so a re-registration and a concurrent lookup
//! of the same identity never interleave.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::{NetworkError, NetworkResult};
use crate::rendezvous::protocol::{AddressBundle, PeerIdentity};

/// Write side of one relay connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    /// Server-assigned connection id
    pub id: u64,
    /// Remote address of the connection
    pub remote: SocketAddr,
    tx: mpsc::Sender<Bytes>,
}

impl ConnectionHandle {
    pub fn new(id: u64, remote: SocketAddr, tx: mpsc::Sender<Bytes>) -> Self {
        Self { id, remote, tx }
    }

    /// Queue an encoded message for this connection's writer
    pub fn send(&self, message: Bytes) -> NetworkResult<()> {
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => NetworkError::ConnectionFailed(format!(
                "outbound queue for {} is full",
                self.remote
            )),
            TrySendError::Closed(_) => {
                NetworkError::ConnectionFailed(format!("connection to {} is closed", self.remote))
            }
        })
    }
}

/// One registered peer
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub identity: PeerIdentity,
    pub connection: ConnectionHandle,
    pub bundle: AddressBundle,
    pub registered_at: Instant,
}

/// Identity -> record map shared by all connection tasks
#[derive(Debug, Clone, Default)]
pub struct Registry {
    records: Arc<DashMap<PeerIdentity, ClientRecord>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update the record for `requested`, or for a freshly
    /// minted identity when none was supplied. Returns the identity used.
    pub fn register(
        &self,
        requested: Option<PeerIdentity>,
        connection: ConnectionHandle,
        bundle: AddressBundle,
    ) -> PeerIdentity {
        let identity = requested.unwrap_or_else(|| self.mint());

        match self.records.entry(identity.clone()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.connection = connection;
                record.bundle = bundle;
                record.registered_at = Instant::now();
            }
            Entry::Vacant(entry) => {
                entry.insert(ClientRecord {
                    identity: identity.clone(),
                    connection,
                    bundle,
                    registered_at: Instant::now(),
                });
            }
        }

        identity
    }

    fn mint(&self) -> PeerIdentity {
        loop {
            let identity = PeerIdentity::generate();
            if !self.records.contains_key(&identity) {
                return identity;
            }
        }
    }

    /// Copy of the record for `identity`
    pub fn lookup(&self, identity: &PeerIdentity) -> Option<ClientRecord> {
        self.records.get(identity).map(|record| record.value().clone())
    }

    /// Remove `identity` if it is still owned by `connection_id`.
    /// A newer connection that re-registered the identity keeps it.
    pub fn remove_connection(&self, identity: &PeerIdentity, connection_id: u64) -> bool {
        self.records
            .remove_if(identity, |_, record| record.connection.id == connection_id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
