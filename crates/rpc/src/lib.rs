//! HTTP surface for a PermaStore node.
//!
//! Thin wrappers over the core: every handler only invokes ledger, store,
//! registry or replicator operations and maps their outcomes onto HTTP
//! responses.

pub mod server;

pub use server::{build_router, start_server, AppState, SharedState};
