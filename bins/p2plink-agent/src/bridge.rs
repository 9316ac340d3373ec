//! Stdio bridge
//!
//! Forwards each stdin line to the peer as one frame and prints every
//! frame received from the peer as one line.

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};

use p2plink_network::{LinkEvent, LinkSender};

/// Counters for the session summary
#[derive(Debug, Default, Clone, Copy)]
pub struct BridgeStats {
    pub frames_in: u64,
    pub bytes_in: u64,
}

/// Pump stdin into `sender` and `events` to stdout until the peer leaves
pub async fn run(sender: LinkSender, mut events: mpsc::Receiver<LinkEvent>) -> Result<BridgeStats> {
    let outbound = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            sender.send(line.as_bytes()).await?;
        }
        debug!("Stdin closed, closing link");
        sender.close().await?;
        Ok::<_, anyhow::Error>(())
    });

    let mut stats = BridgeStats::default();
    let mut stdout = tokio::io::stdout();

    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Message(payload) => {
                stats.frames_in += 1;
                stats.bytes_in += payload.len() as u64;
                stdout.write_all(&payload).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
            LinkEvent::Disconnected(reason) => {
                info!("Peer link closed: {}", reason);
                break;
            }
        }
    }

    outbound.abort();
    Ok(stats)
}
