//! Identity persistence
//!
//! The relay mints an identity on first registration; peers keep it so the
//! next session registers under the same name.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::NetworkResult;
use crate::rendezvous::PeerIdentity;

/// Where a peer keeps its identity between sessions
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Stored identity, if one was saved
    async fn load(&self) -> NetworkResult<Option<PeerIdentity>>;

    /// Persist `identity`, replacing any previous one
    async fn save(&self, identity: &PeerIdentity) -> NetworkResult<()>;
}

/// Identity kept as the first line of a text file
#[derive(Debug, Clone)]
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl IdentityStore for FileIdentityStore {
    async fn load(&self) -> NetworkResult<Option<PeerIdentity>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No identity file at {:?}", self.path);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        Ok(content.lines().next().and_then(PeerIdentity::parse))
    }

    async fn save(&self, identity: &PeerIdentity) -> NetworkResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.path, format!("{}\n", identity)).await?;
        debug!("Saved identity {} to {:?}", identity, self.path);
        Ok(())
    }
}
