//! Peer replication for PermaStore nodes.
//!
//! Two pieces: the [`Registry`] of validated peer endpoints, persisted one
//! URL per line, and the [`Replicator`] that pushes stored files out to
//! every peer (broadcast) and pulls files referenced by peers' most recent
//! ledger activity (sync), hash-verified before acceptance.
//!
//! All peer operations are best-effort. One peer's failure never aborts or
//! affects another peer's attempt, and no failure is fatal to the process.

pub mod registry;
pub mod replicator;

pub use registry::{FilePeerRegistry, Registry};
pub use replicator::{
    BroadcastReport, PeerStatus, PeerSyncOutcome, PullOutcome, ReplicationConfig, Replicator,
    SyncReport, SyncStatus,
};

use anyhow::{anyhow, Result};
use url::Url;

/// Replication errors.
#[derive(thiserror::Error, Debug)]
pub enum ReplicationError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("storage error: {0}")]
    Store(#[from] permastore_store::StoreError),
    #[error("integrity mismatch for {expected}: content hashes to {actual}")]
    Integrity { expected: String, actual: String },
    #[error("content not stored locally: {0}")]
    NotFound(String),
    #[error("peer error: {0}")]
    Peer(String),
}

fn ensure_http_scheme(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{address}")
    }
}

/// Normalize a peer endpoint: prefix `http://` when no scheme is present,
/// drop path/query/fragment, trim trailing slashes.
pub fn normalize_peer(address: &str) -> Result<String> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("peer address cannot be empty"));
    }

    let candidate = ensure_http_scheme(trimmed);
    let mut url = Url::parse(&candidate)?;
    url.set_path("");
    url.set_query(None);
    url.set_fragment(None);
    let mut normalized = url.to_string();
    while normalized.ends_with('/') {
        normalized.pop();
    }
    Ok(normalized)
}
