//! Local hash-addressed file storage.
//!
//! Files live in a flat directory keyed by their lowercase hex SHA-256
//! digest. The hash is both the lookup key and the integrity check: entries
//! are immutable once written, and the only deletion path is an integrity
//! failure during a replication pull.

use permastore_types::content_hash;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Content store errors.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid content hash: {0:?}")]
    InvalidHash(String),
}

/// Flat on-disk map from content hash to file bytes.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Open the store rooted at `root`, creating the directory if needed.
    pub fn open<P: Into<PathBuf>>(root: P) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store `bytes` under their content hash and return the hash.
    ///
    /// A no-op if the entry already exists; entries are keyed by content so
    /// an existing file holds the same bytes.
    pub fn put(&self, bytes: &[u8]) -> Result<String, StoreError> {
        let hash = content_hash(bytes);
        let path = self.path_of(&hash)?;
        if !path.exists() {
            write_atomically(&path, bytes)?;
            debug!("Stored {} ({} bytes)", hash, bytes.len());
        }
        Ok(hash)
    }

    /// Store `bytes` under `expected`, then verify the recomputed hash.
    ///
    /// On mismatch the just-written file is discarded and the actual hash is
    /// returned in the error. Used by replication pulls, where the requested
    /// hash is the integrity contract.
    pub fn put_expecting(&self, expected: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_of(expected)?;
        write_atomically(&path, bytes)?;

        let actual = content_hash(bytes);
        if actual != expected {
            warn!("Hash mismatch for {expected}: content hashes to {actual}");
            fs::remove_file(&path)?;
            return Err(StoreError::InvalidHash(actual));
        }
        Ok(())
    }

    /// Read the bytes stored under `hash`, or `None` when absent.
    pub fn get(&self, hash: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_of(hash)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.path_of(hash).map(|path| path.exists()).unwrap_or(false)
    }

    /// Remove the entry for `hash` if present.
    pub fn remove(&self, hash: &str) -> Result<(), StoreError> {
        let path = self.path_of(hash)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Filesystem path for `hash`, after validating it as a 64-character
    /// lowercase hex digest. Rejecting anything else keeps lookups from
    /// escaping the store root.
    pub fn path_of(&self, hash: &str) -> Result<PathBuf, StoreError> {
        if hash.len() != 64 || !hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(StoreError::InvalidHash(hash.to_string()));
        }
        Ok(self.root.join(hash))
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
