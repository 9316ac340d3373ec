//! Peer Links
//!
//! A `PeerLink` is one duplex TCP connection to the remote peer. It is
//! produced either by dialing an ordered list of candidate addresses from
//! the shared local port, or by accepting the peer's inbound dial. Once up,
//! a supervised read task decodes frames into the caller's sink and always
//! finishes with a `LinkEvent::Disconnected` sentinel.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};

use crate::config::LinkConfig;
use crate::error::{NetworkError, NetworkResult};
use crate::frame::{encode_frame, FrameDecoder};
use crate::rendezvous::AddressBundle;
use crate::socket::connect_reusable;

/// Which path a candidate address represents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    /// Peer's self-reported LAN address
    Lan,
    /// Peer's self-reported IPv6 address
    Ipv6,
    /// Peer's relay-observed address (hole punch)
    Public,
}

impl fmt::Display for PathKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathKind::Lan => write!(f, "lan"),
            PathKind::Ipv6 => write!(f, "ipv6"),
            PathKind::Public => write!(f, "public"),
        }
    }
}

/// One address to try
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub kind: PathKind,
    pub addr: SocketAddr,
}

/// Build the dial order for a peer: LAN, then IPv6 (unless told to
/// downgrade), then public. Absent, unspecified and duplicate addresses
/// are dropped.
pub fn candidate_list(peer: &AddressBundle, downgrade: bool) -> Vec<Candidate> {
    let ordered = [
        (PathKind::Lan, peer.private),
        (PathKind::Ipv6, if downgrade { None } else { peer.ipv6 }),
        (PathKind::Public, peer.public),
    ];

    let mut candidates: Vec<Candidate> = Vec::with_capacity(ordered.len());
    for (kind, addr) in ordered {
        let Some(addr) = addr else { continue };
        if addr.ip().is_unspecified() || addr.port() == 0 {
            continue;
        }
        if candidates.iter().any(|c| c.addr == addr) {
            continue;
        }
        candidates.push(Candidate { kind, addr });
    }
    candidates
}

/// Outcome of a single dial attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Connected,
    Failed(String),
}

/// Record of one dial attempt, kept only for the duration of the dial
#[derive(Debug, Clone)]
pub struct DialAttempt {
    pub target: SocketAddr,
    pub kind: PathKind,
    /// 1-based attempt index for this target
    pub attempt: u32,
    pub outcome: AttemptOutcome,
}

/// Result of walking the candidate list
#[derive(Debug)]
pub enum DialOutcome {
    Connected {
        stream: TcpStream,
        candidate: Candidate,
        attempts: Vec<DialAttempt>,
    },
    Exhausted {
        attempts: Vec<DialAttempt>,
    },
}

/// Try each candidate in order, each up to `attempts_per_candidate`
/// times, always from `local_port`. The first connection wins and the
/// remaining candidates are never tried.
pub async fn dial_candidates(
    local_port: u16,
    candidates: &[Candidate],
    config: &LinkConfig,
) -> DialOutcome {
    let mut attempts = Vec::new();

    for candidate in candidates {
        for attempt in 1..=config.attempts_per_candidate {
            match connect_reusable(local_port, candidate.addr, config.attempt_timeout).await {
                Ok(stream) => {
                    info!(
                        "Connected to peer via {} path {} (attempt {})",
                        candidate.kind, candidate.addr, attempt
                    );
                    attempts.push(DialAttempt {
                        target: candidate.addr,
                        kind: candidate.kind,
                        attempt,
                        outcome: AttemptOutcome::Connected,
                    });
                    return DialOutcome::Connected {
                        stream,
                        candidate: *candidate,
                        attempts,
                    };
                }
                Err(e) => {
                    debug!(
                        "Dial attempt {}/{} to {} ({}) failed: {}",
                        attempt, config.attempts_per_candidate, candidate.addr, candidate.kind, e
                    );
                    attempts.push(DialAttempt {
                        target: candidate.addr,
                        kind: candidate.kind,
                        attempt,
                        outcome: AttemptOutcome::Failed(e.to_string()),
                    });

                    if attempt < config.attempts_per_candidate && !config.retry_backoff.is_zero() {
                        sleep(config.retry_backoff).await;
                    }
                }
            }
        }
        warn!("Giving up on {} path {}", candidate.kind, candidate.addr);
    }

    DialOutcome::Exhausted { attempts }
}

/// Why a link's read loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer closed the stream cleanly
    EndOfStream,
    /// Peer violated the framing protocol
    Protocol(String),
    /// Read failed and could not be retried
    ReadError(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::EndOfStream => write!(f, "end of stream"),
            DisconnectReason::Protocol(e) => write!(f, "protocol error: {}", e),
            DisconnectReason::ReadError(e) => write!(f, "read error: {}", e),
        }
    }
}

/// What the read loop delivers to the sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One decoded payload
    Message(Bytes),
    /// Terminal sentinel; nothing follows it
    Disconnected(DisconnectReason),
}

/// Cloneable write capability for a link
#[derive(Clone)]
pub struct LinkSender {
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    peer_addr: SocketAddr,
}

impl LinkSender {
    /// Frame `payload` and write it to the peer
    pub async fn send(&self, payload: &[u8]) -> NetworkResult<()> {
        let frame = encode_frame(payload)?;

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(NetworkError::LinkClosed)?;
        writer.write_all(&frame).await?;

        trace!("Sent {} byte frame to {}", payload.len(), self.peer_addr);
        Ok(())
    }

    /// Shut down the write side. The peer sees end-of-stream.
    pub async fn close(&self) -> NetworkResult<()> {
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            writer.shutdown().await?;
            debug!("Closed write side of link to {}", self.peer_addr);
        }
        Ok(())
    }

    /// Remote address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

/// An established peer-to-peer connection
pub struct PeerLink {
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    sender: LinkSender,
    reader: JoinHandle<DisconnectReason>,
}

impl PeerLink {
    /// Take ownership of a connected stream and start decoding it into `sink`
    pub fn start(
        stream: TcpStream,
        sink: mpsc::Sender<LinkEvent>,
        config: &LinkConfig,
    ) -> NetworkResult<Self> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let (read_half, write_half) = stream.into_split();

        let reader = tokio::spawn(read_loop(
            read_half,
            peer_addr,
            sink,
            FrameDecoder::with_max_len(config.max_frame_len),
            config.read_chunk_size,
            config.max_transient_errors,
        ));

        info!("Peer link {} <-> {} up", local_addr, peer_addr);

        Ok(Self {
            peer_addr,
            local_addr,
            sender: LinkSender {
                writer: Arc::new(Mutex::new(Some(write_half))),
                peer_addr,
            },
            reader,
        })
    }

    /// Accept the first inbound connection on `listener` within `wait`
    pub async fn accept(
        listener: &TcpListener,
        wait: Duration,
        sink: mpsc::Sender<LinkEvent>,
        config: &LinkConfig,
    ) -> NetworkResult<Self> {
        let (stream, from) = timeout(wait, listener.accept())
            .await
            .map_err(|_| NetworkError::Timeout(format!("no inbound peer within {:?}", wait)))??;

        info!("Accepted inbound peer connection from {}", from);
        Self::start(stream, sink, config)
    }

    /// Remote address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Local address (shares its port with the relay connection)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Write capability that collaborators may hold
    pub fn sender(&self) -> LinkSender {
        self.sender.clone()
    }

    /// Frame and send one payload
    pub async fn send(&self, payload: &[u8]) -> NetworkResult<()> {
        self.sender.send(payload).await
    }

    /// Shut down the write side
    pub async fn close(&self) -> NetworkResult<()> {
        self.sender.close().await
    }

    /// Whether the read loop has ended
    pub fn is_finished(&self) -> bool {
        self.reader.is_finished()
    }

    /// Wait for the read loop to end and return why it did
    pub async fn join(self) -> DisconnectReason {
        match self.reader.await {
            Ok(reason) => reason,
            Err(e) => DisconnectReason::ReadError(format!("read task failed: {}", e)),
        }
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::TimedOut
    )
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    peer_addr: SocketAddr,
    sink: mpsc::Sender<LinkEvent>,
    mut decoder: FrameDecoder,
    chunk_size: usize,
    max_transient_errors: u32,
) -> DisconnectReason {
    let mut chunk = vec![0u8; chunk_size.max(1)];
    let mut transient_errors = 0u32;

    let reason = 'read: loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => {
                info!("Peer {} closed the link", peer_addr);
                if !decoder.is_idle() {
                    debug!(
                        "Discarding {} bytes of an incomplete frame from {}",
                        decoder.buffered(),
                        peer_addr
                    );
                }
                break DisconnectReason::EndOfStream;
            }
            Ok(n) => n,
            Err(e) if is_transient(&e) && transient_errors < max_transient_errors => {
                transient_errors += 1;
                warn!("Transient read error from {} ({}), retrying", peer_addr, e);
                continue;
            }
            Err(e) => {
                warn!("Read from {} failed: {}", peer_addr, e);
                break DisconnectReason::ReadError(e.to_string());
            }
        };
        transient_errors = 0;

        decoder.extend(&chunk[..n]);
        loop {
            match decoder.next_frame() {
                Ok(Some(payload)) => {
                    trace!("Received {} byte frame from {}", payload.len(), peer_addr);
                    if sink.send(LinkEvent::Message(payload)).await.is_err() {
                        debug!("Link sink dropped, stopping reader for {}", peer_addr);
                        return DisconnectReason::EndOfStream;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Framing error from {}: {}", peer_addr, e);
                    break 'read DisconnectReason::Protocol(e.to_string());
                }
            }
        }
    };

    let _ = sink.send(LinkEvent::Disconnected(reason.clone())).await;
    reason
}
