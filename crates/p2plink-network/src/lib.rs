//! P2PLink Network Layer
//!
//! Direct peer-to-peer TCP links between peers behind NAT:
//! - Relay rendezvous (registration and address exchange)
//! - Multi-path dialing (LAN, IPv6, hole punch) from a shared local port
//! - Length-prefixed framing over the established stream

pub mod addr;
pub mod config;
pub mod error;
pub mod frame;
pub mod identity;
pub mod interfaces;
pub mod link;
pub mod rendezvous;
pub mod socket;

pub use addr::{classify, classify_host, NetworkType};
pub use config::{ClientConfig, LinkConfig, ServerConfig};
pub use error::{NetworkError, NetworkResult};
pub use frame::{encode_frame, FrameDecoder, FrameError};
pub use identity::{FileIdentityStore, IdentityStore};
pub use interfaces::{discover_local_addrs, LocalAddrs};
pub use link::{
    candidate_list, Candidate, DialAttempt, DisconnectReason, LinkEvent, LinkSender, PathKind,
    PeerLink,
};
pub use rendezvous::{
    AddressBundle, PeerIdentity, PeerOffer, Registration, RendezvousClient, RendezvousServer,
    SessionState,
};
