//! Outbound push (broadcast) and inbound pull (sync) of files between this
//! node and each registered peer.

use crate::{Registry, ReplicationError};
use futures::future::join_all;
use permastore_store::{ContentStore, StoreError};
use permastore_types::Block;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Tunables for peer transfers. Timeouts are per call; there is no overall
/// deadline across peers.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Upload attempts per peer during a broadcast.
    pub retry_limit: usize,
    /// Fixed delay between upload attempts.
    pub retry_delay: Duration,
    /// Per-attempt upload timeout.
    pub upload_timeout: Duration,
    /// Timeout for fetching a peer's status during sync.
    pub status_timeout: Duration,
    /// Timeout for pulling one file from a peer.
    pub pull_timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            retry_delay: Duration::from_secs(2),
            upload_timeout: Duration::from_secs(30),
            status_timeout: Duration::from_secs(10),
            pull_timeout: Duration::from_secs(30),
        }
    }
}

/// Partition of peers after a broadcast. Best-effort: an all-failed
/// broadcast is still a normal result, not an error.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BroadcastReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

/// Status document served by a peer's `/status` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStatus {
    pub blockchain_length: u64,
    pub peers: Vec<String>,
    pub last_block: Option<Block>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Success,
    Failed,
}

/// Per-peer outcome of a sync pass.
#[derive(Debug, Clone, Serialize)]
pub struct PeerSyncOutcome {
    pub status: SyncStatus,
    /// Files newly pulled from this peer.
    pub files: u64,
}

/// Aggregate result of a sync pass. `failed` counts peers whose status
/// could not be fetched; individual pull failures are logged per peer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub synced: u64,
    pub failed: u64,
    pub peers: HashMap<String, PeerSyncOutcome>,
}

/// Outcome of pulling a single file from a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// Already stored locally; no network call was made.
    AlreadyPresent,
    /// Fetched from the peer and verified against the requested hash.
    Fetched,
    /// Transport or integrity failure; not retried within this pass.
    Failed,
}

impl PullOutcome {
    pub fn is_success(self) -> bool {
        !matches!(self, PullOutcome::Failed)
    }
}

/// Pushes files out to peers and pulls referenced files in, using the
/// content store as its data source and sink and the registry as its target
/// list. Holds a read-only view of both.
pub struct Replicator {
    client: Client,
    registry: Arc<dyn Registry>,
    store: Arc<ContentStore>,
    config: ReplicationConfig,
}

impl Replicator {
    pub fn new(
        registry: Arc<dyn Registry>,
        store: Arc<ContentStore>,
        config: ReplicationConfig,
    ) -> Result<Self, ReplicationError> {
        Ok(Self {
            client: Client::builder().build()?,
            registry,
            store,
            config,
        })
    }

    /// Upload the locally stored file `hash` to every registered peer.
    ///
    /// Peers are attempted concurrently; each peer's retry sequence is
    /// strictly sequential with a fixed delay between attempts, and its
    /// first success stops further retries. Fails only when the content is
    /// not stored locally.
    pub async fn broadcast_file(&self, hash: &str) -> Result<BroadcastReport, ReplicationError> {
        let bytes = self
            .store
            .get(hash)?
            .ok_or_else(|| ReplicationError::NotFound(hash.to_string()))?;
        let bytes = Arc::new(bytes);

        let attempts = self.registry.list().into_iter().map(|peer| {
            let bytes = bytes.clone();
            async move {
                let delivered = self.push_to_peer(&peer, hash, &bytes).await;
                (peer, delivered)
            }
        });

        let mut report = BroadcastReport::default();
        for (peer, delivered) in join_all(attempts).await {
            if delivered {
                report.succeeded.push(peer);
            } else {
                report.failed.push(peer);
            }
        }
        Ok(report)
    }

    /// Pull files referenced by each peer's most recent block.
    ///
    /// Deliberately narrow: only the tip block's transactions are examined,
    /// so hashes that appear solely in older blocks are not backfilled.
    pub async fn sync_files(&self) -> SyncReport {
        let tasks = self.registry.list().into_iter().map(|peer| async move {
            let outcome = self.sync_peer(&peer).await;
            (peer, outcome)
        });

        let mut report = SyncReport::default();
        for (peer, outcome) in join_all(tasks).await {
            match outcome {
                Ok(files) => {
                    info!("Synced with {peer}: {files} new files");
                    report.synced += files;
                    report.peers.insert(
                        peer,
                        PeerSyncOutcome {
                            status: SyncStatus::Success,
                            files,
                        },
                    );
                }
                Err(err) => {
                    warn!("Failed to sync with {peer}: {err}");
                    report.failed += 1;
                    report.peers.insert(
                        peer,
                        PeerSyncOutcome {
                            status: SyncStatus::Failed,
                            files: 0,
                        },
                    );
                }
            }
        }
        report
    }

    /// Pull one file from `peer`, verifying the received bytes against
    /// `hash`. Idempotent: an already-stored hash is a success without a
    /// network call. Failures are logged and contained, never retried
    /// within this call.
    pub async fn pull_file(&self, peer: &str, hash: &str) -> PullOutcome {
        if self.store.contains(hash) {
            return PullOutcome::AlreadyPresent;
        }

        match self.fetch_file(peer, hash).await {
            Ok(()) => {
                info!("Downloaded {hash} from {peer}");
                PullOutcome::Fetched
            }
            Err(err) => {
                warn!("Failed to download {hash} from {peer}: {err}");
                PullOutcome::Failed
            }
        }
    }

    async fn push_to_peer(&self, peer: &str, hash: &str, bytes: &[u8]) -> bool {
        for attempt in 1..=self.config.retry_limit.max(1) {
            match self.upload_once(peer, hash, bytes).await {
                Ok(()) => {
                    info!("File broadcast successful to {peer}");
                    return true;
                }
                Err(err) => {
                    warn!("Attempt {attempt} failed to send {hash} to {peer}: {err}");
                    if attempt < self.config.retry_limit {
                        sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        warn!(
            "Failed to broadcast {hash} to {peer} after {} attempts",
            self.config.retry_limit
        );
        false
    }

    async fn upload_once(
        &self,
        peer: &str,
        hash: &str,
        bytes: &[u8],
    ) -> Result<(), ReplicationError> {
        let form = Form::new().part("file", Part::bytes(bytes.to_vec()).file_name(hash.to_string()));
        let response = self
            .client
            .post(format!("{peer}/upload"))
            .timeout(self.config.upload_timeout)
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ReplicationError::Peer(format!(
                "peer {peer} returned status {} for upload",
                response.status()
            )));
        }
        Ok(())
    }

    async fn sync_peer(&self, peer: &str) -> Result<u64, ReplicationError> {
        let status = self.fetch_status(peer).await?;
        let Some(tip) = status.last_block else {
            return Ok(0);
        };

        let mut fetched = 0;
        for tx in &tip.transactions {
            let Some(hash) = tx.content_hash() else {
                continue;
            };
            if self.pull_file(peer, hash).await == PullOutcome::Fetched {
                fetched += 1;
            }
        }
        Ok(fetched)
    }

    async fn fetch_status(&self, peer: &str) -> Result<PeerStatus, ReplicationError> {
        let response = self
            .client
            .get(format!("{peer}/status"))
            .timeout(self.config.status_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ReplicationError::Peer(format!(
                "peer {peer} returned status {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    async fn fetch_file(&self, peer: &str, hash: &str) -> Result<(), ReplicationError> {
        let response = self
            .client
            .get(format!("{peer}/retrieve/{hash}"))
            .timeout(self.config.pull_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ReplicationError::Peer(format!(
                "peer {peer} returned status {} for {hash}",
                response.status()
            )));
        }

        let bytes = response.bytes().await?;
        match self.store.put_expecting(hash, &bytes) {
            Ok(()) => Ok(()),
            Err(StoreError::InvalidHash(actual)) if actual != hash => {
                Err(ReplicationError::Integrity {
                    expected: hash.to_string(),
                    actual,
                })
            }
            Err(err) => Err(err.into()),
        }
    }
}
