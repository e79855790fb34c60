use crate::time::unix_now;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// One-based position of a block in the ledger.
pub type BlockIndex = u64;

/// Sentinel predecessor reference carried by the genesis block. Not a real
/// hash; the first block has nothing to chain onto.
pub const GENESIS_PREVIOUS_HASH: &str = "1";

/// A single recorded storage event.
///
/// The `data` payload is opaque to the ledger. File-referencing transactions
/// carry `hash`, `filename`, `content_type` and `size` fields; only the
/// replication layer interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub data: Value,
    pub timestamp: f64,
}

impl Transaction {
    /// Wrap a payload with the current timestamp.
    pub fn new(data: Value) -> Self {
        Self {
            data,
            timestamp: unix_now(),
        }
    }

    /// Content hash referenced by this transaction, if it is a
    /// file-referencing transaction.
    pub fn content_hash(&self) -> Option<&str> {
        self.data.get("hash").and_then(Value::as_str)
    }
}

/// A sealed batch of transactions plus a reference to its logical
/// predecessor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// One-based index; the block at chain position `i` has `index == i + 1`.
    pub index: BlockIndex,
    /// Seal time as fractional Unix seconds.
    pub timestamp: f64,
    /// Transactions bundled into this block.
    pub transactions: Vec<Transaction>,
    /// Canonical hash of the preceding block, or [`GENESIS_PREVIOUS_HASH`]
    /// for the genesis block. Advisory: recorded at seal time but never
    /// enforced on load.
    pub previous_hash: String,
}

impl Block {
    pub fn is_genesis(&self) -> bool {
        self.index == 1 && self.previous_hash == GENESIS_PREVIOUS_HASH
    }

    /// Canonical hash of this block. See [`block_hash`].
    pub fn hash(&self) -> Result<String, serde_json::Error> {
        block_hash(self)
    }
}

/// Canonical SHA-256 hash of a block, hex-encoded.
///
/// The block is serialized through `serde_json::Value`, whose object
/// representation orders keys lexicographically, so the digest is
/// deterministic regardless of field insertion order. Fails only if a
/// timestamp is non-finite.
pub fn block_hash(block: &Block) -> Result<String, serde_json::Error> {
    let canonical = serde_json::to_value(block)?;
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// SHA-256 content hash of raw bytes, hex-encoded. This is both the lookup
/// key and the integrity check for stored files.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn sample_block() -> Block {
        Block {
            index: 2,
            timestamp: 1_700_000_000.5,
            transactions: vec![Transaction {
                data: json!({"hash": "abc", "filename": "a.txt"}),
                timestamp: 1_700_000_000.25,
            }],
            previous_hash: "deadbeef".to_string(),
        }
    }

    #[test]
    fn hash_is_deterministic_across_key_insertion_order() {
        let mut forward = Map::new();
        forward.insert("hash".into(), json!("abc"));
        forward.insert("filename".into(), json!("a.txt"));

        let mut reverse = Map::new();
        reverse.insert("filename".into(), json!("a.txt"));
        reverse.insert("hash".into(), json!("abc"));

        let mut a = sample_block();
        a.transactions[0].data = Value::Object(forward);
        let mut b = sample_block();
        b.transactions[0].data = Value::Object(reverse);

        assert_eq!(block_hash(&a).unwrap(), block_hash(&b).unwrap());
    }

    #[test]
    fn hash_changes_when_any_field_changes() {
        let base = sample_block();
        let base_hash = block_hash(&base).unwrap();

        let mut changed = sample_block();
        changed.index = 3;
        assert_ne!(block_hash(&changed).unwrap(), base_hash);

        let mut changed = sample_block();
        changed.previous_hash = "feedface".to_string();
        assert_ne!(block_hash(&changed).unwrap(), base_hash);

        let mut changed = sample_block();
        changed.transactions.clear();
        assert_ne!(block_hash(&changed).unwrap(), base_hash);
    }

    #[test]
    fn content_hash_matches_known_digest() {
        // SHA-256 of the empty input.
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn transaction_exposes_content_hash() {
        let tx = Transaction::new(json!({"hash": "abc123", "size": 10}));
        assert_eq!(tx.content_hash(), Some("abc123"));

        let opaque = Transaction::new(json!({"note": "no file here"}));
        assert_eq!(opaque.content_hash(), None);
    }

    #[test]
    fn genesis_detection() {
        let genesis = Block {
            index: 1,
            timestamp: unix_now(),
            transactions: Vec::new(),
            previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
        };
        assert!(genesis.is_genesis());
        assert!(!sample_block().is_genesis());
    }
}
