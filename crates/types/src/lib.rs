//! PermaStore core data model.
//!
//! Defines the ledger block and transaction types shared by every crate in
//! the workspace, together with the canonical block hash used for chaining
//! and for cross-node agreement on block identity.

pub mod block;
pub mod time;

pub use block::{block_hash, content_hash, Block, BlockIndex, Transaction, GENESIS_PREVIOUS_HASH};
pub use time::unix_now;
