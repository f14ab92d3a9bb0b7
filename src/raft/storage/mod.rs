//! Raft persistence: file-backed log store and the SQL state machine adapter.
//!
//! Layout under the node's data dir:
//!
//! ```text
//! <data_dir>/raft/wal/entries.json      replicated log entries
//! <data_dir>/raft/wal/hard_state.json   persisted vote + committed pointer
//! <data_dir>/raft/state_machine.json    applied log id + membership
//! <data_dir>/raft/snapshots/            current archive + metadata + staging
//! ```

pub mod log;
pub mod state_machine;

use std::path::{Path, PathBuf};

use openraft::{ErrorSubject, ErrorVerb};

use crate::raft::types::NodeId;

pub use log::FileLogStore;
pub use state_machine::SqlStateMachine;

#[derive(Debug, Clone)]
pub struct RaftPaths {
    pub entries_json: PathBuf,
    pub hard_state_json: PathBuf,
    pub sm_meta_json: PathBuf,
    pub snapshot_meta_json: PathBuf,
    pub snapshot_archive: PathBuf,
    pub snapshot_staging_dir: PathBuf,
}

impl RaftPaths {
    pub fn new(data_dir: &Path) -> Self {
        let raft_dir = data_dir.join("raft");
        let wal_dir = raft_dir.join("wal");
        let snapshot_dir = raft_dir.join("snapshots");
        Self {
            entries_json: wal_dir.join("entries.json"),
            hard_state_json: wal_dir.join("hard_state.json"),
            sm_meta_json: raft_dir.join("state_machine.json"),
            snapshot_meta_json: snapshot_dir.join("archive_meta.json"),
            snapshot_archive: snapshot_dir.join("current.snap"),
            snapshot_staging_dir: snapshot_dir.join("staging"),
        }
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        if let Some(parent) = self.entries_json.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = self.snapshot_meta_json.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

pub(crate) fn io_err(
    subject: ErrorSubject<NodeId>,
    verb: ErrorVerb,
    err: std::io::Error,
) -> openraft::StorageError<NodeId> {
    openraft::StorageError::from_io_error(subject, verb, err)
}

pub(crate) async fn read_json<T: serde::de::DeserializeOwned + Send + 'static>(
    path: &Path,
) -> Result<Option<T>, std::io::Error> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)?;
        let v = serde_json::from_slice(&bytes).map_err(std::io::Error::other)?;
        Ok(Some(v))
    })
    .await
    .expect("spawn_blocking read_json")
}

pub(crate) async fn write_json<T: serde::Serialize>(
    path: &Path,
    value: &T,
) -> Result<(), std::io::Error> {
    let bytes = serde_json::to_vec_pretty(value).map_err(std::io::Error::other)?;
    write_bytes(path, &bytes).await
}

pub(crate) async fn read_bytes(path: &Path) -> Result<Vec<u8>, std::io::Error> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || std::fs::read(&path))
        .await
        .expect("spawn_blocking read_bytes")
}

/// Write-then-rename so a crash never leaves a torn file behind.
pub(crate) async fn write_bytes(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    let path = path.to_path_buf();
    let bytes = bytes.to_vec();
    tokio::task::spawn_blocking(move || {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(tmp, path)?;
        Ok(())
    })
    .await
    .expect("spawn_blocking write_bytes")
}
