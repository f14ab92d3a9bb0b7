//! Replicated SQL store: write batches travel through a consensus log, a
//! deterministic state machine applies them to an embedded SQLite database,
//! and snapshots move between nodes as checksummed compressed archives.

pub mod codec;
pub mod config;
pub mod events;
pub mod raft;
pub mod registry;
pub mod request;
pub mod snapshot;
pub mod state_machine;
pub mod store;
pub mod version;
