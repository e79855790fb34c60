use super::*;
use permastore_types::GENESIS_PREVIOUS_HASH;
use serde_json::json;
use tempfile::TempDir;

fn ledger_path(dir: &TempDir) -> PathBuf {
    dir.path().join("ledger.json")
}

#[test]
fn open_creates_and_persists_genesis() {
    let dir = TempDir::new().unwrap();
    let ledger = Ledger::open(ledger_path(&dir));

    assert_eq!(ledger.len(), 1);
    let genesis = ledger.tip().unwrap();
    assert_eq!(genesis.index, 1);
    assert_eq!(genesis.previous_hash, GENESIS_PREVIOUS_HASH);
    assert!(genesis.transactions.is_empty());
    assert!(ledger_path(&dir).exists());
}

#[test]
fn append_adds_exactly_one_block_with_one_transaction() {
    let dir = TempDir::new().unwrap();
    let mut ledger = Ledger::open(ledger_path(&dir));

    let index = ledger
        .append_transaction(json!({"hash": "abc", "filename": "a.txt"}))
        .unwrap();

    assert_eq!(index, 2);
    assert_eq!(ledger.len(), 2);
    let tip = ledger.tip().unwrap();
    assert_eq!(tip.transactions.len(), 1);
    assert_eq!(tip.transactions[0].content_hash(), Some("abc"));

    let index = ledger.append_transaction(json!({"hash": "def"})).unwrap();
    assert_eq!(index, 3);
    assert_eq!(ledger.len(), 3);
    assert_eq!(ledger.tip().unwrap().transactions.len(), 1);
}

#[test]
fn appended_block_chains_onto_previous_tip_hash() {
    let dir = TempDir::new().unwrap();
    let mut ledger = Ledger::open(ledger_path(&dir));

    let genesis_hash = ledger.tip().unwrap().hash().unwrap();
    ledger.append_transaction(json!({"hash": "abc"})).unwrap();

    assert_eq!(ledger.tip().unwrap().previous_hash, genesis_hash);
    assert!(ledger.divergent_blocks().is_empty());
}

#[test]
fn reload_roundtrips_the_chain() {
    let dir = TempDir::new().unwrap();
    let path = ledger_path(&dir);

    {
        let mut ledger = Ledger::open(&path);
        ledger.append_transaction(json!({"hash": "abc"})).unwrap();
        ledger.append_transaction(json!({"hash": "def"})).unwrap();
    }

    let reloaded = Ledger::open(&path);
    assert_eq!(reloaded.len(), 3);
    assert_eq!(
        reloaded.tip().unwrap().transactions[0].content_hash(),
        Some("def")
    );
}

#[test]
fn corrupt_file_starts_a_fresh_chain() {
    let dir = TempDir::new().unwrap();
    let path = ledger_path(&dir);
    std::fs::write(&path, b"{not valid json").unwrap();

    let ledger = Ledger::open(&path);
    assert_eq!(ledger.len(), 1);
    assert!(ledger.tip().unwrap().is_genesis());
}

#[test]
fn chain_advances_in_memory_when_persistence_fails() {
    let dir = TempDir::new().unwrap();
    // A directory at the ledger path makes every rename-into-place fail.
    let path = ledger_path(&dir);
    std::fs::create_dir_all(&path).unwrap();

    let mut ledger = Ledger::open(&path);
    assert_eq!(ledger.len(), 1);

    let index = ledger.append_transaction(json!({"hash": "abc"})).unwrap();
    assert_eq!(index, 2);
    assert_eq!(ledger.len(), 2);
    assert_eq!(ledger.tip().unwrap().transactions[0].content_hash(), Some("abc"));
    assert!(path.is_dir());
}

#[test]
fn divergent_blocks_reports_tampered_chaining() {
    let dir = TempDir::new().unwrap();
    let path = ledger_path(&dir);

    {
        let mut ledger = Ledger::open(&path);
        ledger.append_transaction(json!({"hash": "abc"})).unwrap();
    }

    // Rewrite the second block's previous_hash behind the ledger's back.
    let mut chain: Vec<Block> =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    chain[1].previous_hash = "0000".to_string();
    std::fs::write(&path, serde_json::to_vec(&chain).unwrap()).unwrap();

    let ledger = Ledger::open(&path);
    assert_eq!(ledger.divergent_blocks(), vec![2]);
}
