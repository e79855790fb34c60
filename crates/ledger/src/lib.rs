//! Append-only ledger of storage events.
//!
//! The ledger is an ordered sequence of blocks persisted as a single JSON
//! document. Every mutation rewrites the document wholesale, via a temporary
//! file renamed into place so a crash mid-write never corrupts the persisted
//! copy. Persistence failures are logged and swallowed: the in-memory chain
//! still advances, so a crash immediately after a failed flush loses that
//! block.

use anyhow::Result;
use permastore_types::{block_hash, unix_now, Block, BlockIndex, Transaction, GENESIS_PREVIOUS_HASH};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Ordered, append-only record of storage events, organized into blocks.
///
/// Exclusively owns its block sequence. Callers share it behind a mutex held
/// across the in-memory mutation and the subsequent persistence write.
pub struct Ledger {
    path: PathBuf,
    chain: Vec<Block>,
    pending: Vec<Transaction>,
}

impl Ledger {
    /// Load the ledger persisted at `path`, or start a fresh chain.
    ///
    /// A missing file or a parse failure never fails startup: the condition
    /// is logged and the ledger starts empty. An empty chain immediately
    /// seals and persists the genesis block.
    pub fn open<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        let chain = load_chain(&path);

        let mut ledger = Self {
            path,
            chain,
            pending: Vec::new(),
        };

        if ledger.chain.is_empty() {
            info!("Creating genesis block");
            ledger.seal_block(GENESIS_PREVIOUS_HASH.to_string());
        } else {
            info!("Loaded ledger with {} blocks", ledger.chain.len());
            for index in ledger.divergent_blocks() {
                warn!("Block {index} does not chain onto its predecessor's hash");
            }
        }

        ledger
    }

    /// Wrap `payload` with a timestamp, append it to the pending buffer and
    /// immediately seal a new block containing the buffer. Returns the new
    /// block's index.
    ///
    /// Fails only if the current tip cannot be hashed; the pending
    /// transaction is retained for the next seal in that case.
    pub fn append_transaction(&mut self, payload: Value) -> Result<BlockIndex> {
        let tx = Transaction::new(payload);
        self.pending.push(tx);

        let previous_hash = match self.tip() {
            Some(tip) => block_hash(tip)?,
            None => GENESIS_PREVIOUS_HASH.to_string(),
        };

        let block = self.seal_block(previous_hash);
        Ok(block.index)
    }

    /// Seal the pending transaction buffer into a new block chained onto
    /// `previous_hash`, append it and persist the full chain.
    pub fn seal_block(&mut self, previous_hash: String) -> &Block {
        let block = Block {
            index: self.chain.len() as BlockIndex + 1,
            timestamp: unix_now(),
            transactions: std::mem::take(&mut self.pending),
            previous_hash,
        };

        info!("Created block {}", block.index);
        let slot = self.chain.len();
        self.chain.push(block);
        self.persist();

        &self.chain[slot]
    }

    /// The last block, or `None` for a pre-genesis (empty) ledger.
    pub fn tip(&self) -> Option<&Block> {
        self.chain.last()
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.chain
    }

    /// Indices of blocks whose `previous_hash` does not match the canonical
    /// hash of their predecessor.
    ///
    /// Chaining is advisory: divergence is reported, never rejected. Blocks
    /// that cannot be hashed are skipped.
    pub fn divergent_blocks(&self) -> Vec<BlockIndex> {
        self.chain
            .windows(2)
            .filter_map(|pair| match block_hash(&pair[0]) {
                Ok(hash) if pair[1].previous_hash != hash => Some(pair[1].index),
                _ => None,
            })
            .collect()
    }

    /// Rewrite the persisted document. Failures are logged and swallowed.
    fn persist(&self) {
        if let Err(err) = write_atomically(&self.path, &self.chain) {
            error!("Failed to save ledger to {:?}: {err:#}", self.path);
        }
    }
}

fn load_chain(path: &Path) -> Vec<Block> {
    if !path.exists() {
        return Vec::new();
    }

    match fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(chain) => chain,
            Err(err) => {
                error!("Failed to parse ledger at {path:?}: {err}");
                Vec::new()
            }
        },
        Err(err) => {
            error!("Failed to read ledger at {path:?}: {err}");
            Vec::new()
        }
    }
}

fn write_atomically(path: &Path, chain: &[Block]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec(chain)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests;
