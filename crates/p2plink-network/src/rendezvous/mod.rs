//! Rendezvous relay protocol: wire messages, the relay server and the
//! peer-side client session.

pub mod client;
pub mod protocol;
pub mod registry;
pub mod server;

pub use client::{Registration, RendezvousClient, SessionState};
pub use protocol::{AddressBundle, PeerIdentity, PeerOffer, RelayReply, RelayRequest};
pub use registry::{ClientRecord, ConnectionHandle, Registry};
pub use server::{downgrade_flags, RendezvousServer, StatsSnapshot};
