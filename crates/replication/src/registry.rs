//! Validated set of known peer endpoints, persisted across restarts.

use crate::normalize_peer;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Client;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default timeout for the admission liveness probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Peer membership capability.
///
/// Admission implies the peer most recently passed a liveness probe; there
/// is no continuous health tracking. The trait keeps the replicator
/// independent of the membership policy, so a health-tracking registry can
/// slot in later.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Probe `url` and admit it into the set on success. Returns whether
    /// admission succeeded; the set is unchanged when the probe fails.
    async fn admit(&self, url: &str) -> Result<bool>;

    /// Remove `url` if present. No error when absent.
    fn evict(&self, url: &str);

    /// Snapshot of the current peer set. Iteration order is unspecified.
    fn list(&self) -> Vec<String>;
}

/// File-backed peer registry: one normalized URL per line.
pub struct FilePeerRegistry {
    path: PathBuf,
    peers: RwLock<HashSet<String>>,
    client: Client,
    probe_timeout: Duration,
}

impl FilePeerRegistry {
    /// Load the registry persisted at `path`. Blank or malformed lines are
    /// skipped silently; a missing file starts an empty set.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self> {
        Self::open_with_probe_timeout(path, DEFAULT_PROBE_TIMEOUT)
    }

    pub fn open_with_probe_timeout<P: Into<PathBuf>>(
        path: P,
        probe_timeout: Duration,
    ) -> Result<Self> {
        let path = path.into();
        let peers = load_peers(&path);
        if !peers.is_empty() {
            info!("Loaded {} peers", peers.len());
        }

        Ok(Self {
            path,
            peers: RwLock::new(peers),
            client: Client::builder().build()?,
            probe_timeout,
        })
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Liveness probe against the peer's status endpoint.
    async fn probe(&self, peer: &str) -> bool {
        let url = format!("{peer}/status");
        match self
            .client
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!("Liveness probe failed for {peer}: {err}");
                false
            }
        }
    }

    /// Persist the set. Failures are logged and swallowed; the in-memory
    /// set is authoritative for this process.
    fn persist(&self, peers: &HashSet<String>) {
        if let Err(err) = write_atomically(&self.path, peers) {
            error!("Failed to save peers to {:?}: {err}", self.path);
        }
    }
}

#[async_trait]
impl Registry for FilePeerRegistry {
    async fn admit(&self, url: &str) -> Result<bool> {
        let peer = normalize_peer(url)?;

        if !self.probe(&peer).await {
            warn!("Rejecting peer {peer}: liveness probe failed");
            return Ok(false);
        }

        let mut peers = self.peers.write();
        peers.insert(peer.clone());
        self.persist(&peers);
        info!("Added peer: {peer}");
        Ok(true)
    }

    fn evict(&self, url: &str) {
        let Ok(peer) = normalize_peer(url) else {
            return;
        };

        let mut peers = self.peers.write();
        if peers.remove(&peer) {
            self.persist(&peers);
            info!("Removed peer: {peer}");
        }
    }

    fn list(&self) -> Vec<String> {
        self.peers.read().iter().cloned().collect()
    }
}

fn load_peers(path: &Path) -> HashSet<String> {
    let Ok(contents) = fs::read_to_string(path) else {
        return HashSet::new();
    };

    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn write_atomically(path: &Path, peers: &HashSet<String>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut contents = String::new();
    for peer in peers {
        contents.push_str(peer);
        contents.push('\n');
    }

    let tmp = path.with_extension("txt.tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
