//! File-backed Raft log store.
//!
//! The log lives in memory as a `BTreeMap` keyed by index and is mirrored to
//! two JSON files: the entry list and a combined hard-state record (vote plus
//! committed pointer), both written atomically. Configuration-service write
//! volume is low and snapshots purge the log regularly, so rewriting the
//! entry file per append stays cheap.

use std::{fmt::Debug, ops::RangeBounds, path::Path, sync::Arc};

use openraft::{
    storage::RaftLogStorage, ErrorSubject, ErrorVerb, LogId, LogState, RaftLogReader, Vote,
};
use tokio::sync::Mutex;

use super::{io_err, read_json, write_json, RaftPaths};
use crate::raft::types::{NodeId, TypeConfig};

type LogEntry = openraft::impls::Entry<TypeConfig>;

/// Vote and committed pointer, persisted together: both change rarely and
/// must survive restarts, and one file means one atomic rename.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
struct HardState {
    vote: Option<Vote<NodeId>>,
    committed: Option<LogId<NodeId>>,
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct EntryFile {
    #[serde(default)]
    purged_up_to: Option<LogId<NodeId>>,
    #[serde(default)]
    entries: Vec<LogEntry>,
}

#[derive(Debug, Default)]
struct LogVolume {
    purged_up_to: Option<LogId<NodeId>>,
    entries: std::collections::BTreeMap<u64, LogEntry>,
    hard_state: HardState,
}

impl LogVolume {
    fn to_entry_file(&self) -> EntryFile {
        EntryFile {
            purged_up_to: self.purged_up_to,
            entries: self.entries.values().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileLogStore {
    paths: RaftPaths,
    volume: Arc<Mutex<LogVolume>>,
}

impl FileLogStore {
    pub async fn open(data_dir: &Path) -> Result<Self, openraft::StorageError<NodeId>> {
        let paths = RaftPaths::new(data_dir);
        paths
            .ensure_dirs()
            .map_err(|e| io_err(ErrorSubject::Store, ErrorVerb::Write, e))?;

        let file = read_json::<EntryFile>(&paths.entries_json)
            .await
            .map_err(|e| io_err(ErrorSubject::Logs, ErrorVerb::Read, e))?
            .unwrap_or_default();
        let hard_state = read_json::<HardState>(&paths.hard_state_json)
            .await
            .map_err(|e| io_err(ErrorSubject::Vote, ErrorVerb::Read, e))?
            .unwrap_or_default();

        let volume = LogVolume {
            purged_up_to: file.purged_up_to,
            entries: file
                .entries
                .into_iter()
                .map(|ent| (ent.log_id.index, ent))
                .collect(),
            hard_state,
        };

        Ok(Self {
            paths,
            volume: Arc::new(Mutex::new(volume)),
        })
    }

    async fn flush_entries(&self) -> Result<(), openraft::StorageError<NodeId>> {
        let file = {
            let volume = self.volume.lock().await;
            volume.to_entry_file()
        };
        write_json(&self.paths.entries_json, &file)
            .await
            .map_err(|e| io_err(ErrorSubject::Logs, ErrorVerb::Write, e))
    }

    async fn flush_hard_state(&self) -> Result<(), openraft::StorageError<NodeId>> {
        let hard_state = {
            let volume = self.volume.lock().await;
            volume.hard_state.clone()
        };
        write_json(&self.paths.hard_state_json, &hard_state)
            .await
            .map_err(|e| io_err(ErrorSubject::Vote, ErrorVerb::Write, e))
    }
}

impl RaftLogReader<TypeConfig> for FileLogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + openraft::OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<LogEntry>, openraft::StorageError<NodeId>> {
        let volume = self.volume.lock().await;
        Ok(volume
            .entries
            .range(range)
            .map(|(_, ent)| ent.clone())
            .collect())
    }
}

impl RaftLogStorage<TypeConfig> for FileLogStore {
    type LogReader = FileLogStore;

    async fn get_log_state(
        &mut self,
    ) -> Result<LogState<TypeConfig>, openraft::StorageError<NodeId>> {
        let volume = self.volume.lock().await;
        let last_log_id = volume
            .entries
            .values()
            .next_back()
            .map(|ent| ent.log_id)
            .or(volume.purged_up_to);
        Ok(LogState {
            last_purged_log_id: volume.purged_up_to,
            last_log_id,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(
        &mut self,
        vote: &Vote<NodeId>,
    ) -> Result<(), openraft::StorageError<NodeId>> {
        self.volume.lock().await.hard_state.vote = Some(*vote);
        self.flush_hard_state().await
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, openraft::StorageError<NodeId>> {
        Ok(self.volume.lock().await.hard_state.vote)
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), openraft::StorageError<NodeId>> {
        self.volume.lock().await.hard_state.committed = committed;
        self.flush_hard_state().await
    }

    async fn read_committed(
        &mut self,
    ) -> Result<Option<LogId<NodeId>>, openraft::StorageError<NodeId>> {
        Ok(self.volume.lock().await.hard_state.committed)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: openraft::storage::LogFlushed<TypeConfig>,
    ) -> Result<(), openraft::StorageError<NodeId>>
    where
        I: IntoIterator<Item = LogEntry> + openraft::OptionalSend,
        I::IntoIter: openraft::OptionalSend,
    {
        {
            let mut volume = self.volume.lock().await;
            for ent in entries {
                volume.entries.insert(ent.log_id.index, ent);
            }
        }

        let flushed = self.flush_entries().await;
        callback.log_io_completed(
            flushed
                .as_ref()
                .map(|_| ())
                .map_err(|e| std::io::Error::other(e.to_string())),
        );
        flushed
    }

    async fn truncate(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), openraft::StorageError<NodeId>> {
        self.volume.lock().await.entries.split_off(&log_id.index);
        self.flush_entries().await
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), openraft::StorageError<NodeId>> {
        {
            let mut volume = self.volume.lock().await;
            // split_off keeps the tail; everything at or below log_id goes.
            let kept = volume.entries.split_off(&(log_id.index + 1));
            volume.entries = kept;
            volume.purged_up_to = Some(log_id);
        }
        self.flush_entries().await
    }
}

#[cfg(test)]
mod tests {
    use openraft::{CommittedLeaderId, EntryPayload};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{codec, request::WriteBatch};

    fn entry(index: u64) -> LogEntry {
        let req = WriteBatch::new("config").push("SELECT 1", vec![]).build(1);
        openraft::impls::Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
            payload: EntryPayload::Normal(codec::encode_entry(&req).unwrap()),
        }
    }

    async fn append_entries(store: &mut FileLogStore, entries: Vec<LogEntry>) {
        // Bypass the flush callback plumbing; tests only care about contents.
        let mut volume = store.volume.lock().await;
        for ent in entries {
            volume.entries.insert(ent.log_id.index, ent);
        }
        drop(volume);
        store.flush_entries().await.unwrap();
    }

    #[tokio::test]
    async fn log_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = FileLogStore::open(tmp.path()).await.unwrap();
        append_entries(&mut store, vec![entry(1), entry(2), entry(3)]).await;
        store
            .save_vote(&Vote::new(2, 1))
            .await
            .unwrap();

        let mut reopened = FileLogStore::open(tmp.path()).await.unwrap();
        let state = reopened.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id.unwrap().index, 3);
        assert_eq!(reopened.read_vote().await.unwrap(), Some(Vote::new(2, 1)));
    }

    #[tokio::test]
    async fn purge_drops_the_prefix_and_remembers_the_boundary() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = FileLogStore::open(tmp.path()).await.unwrap();
        append_entries(&mut store, vec![entry(1), entry(2), entry(3), entry(4)]).await;

        store
            .purge(LogId::new(CommittedLeaderId::new(1, 1), 2))
            .await
            .unwrap();

        let remaining = store.try_get_log_entries(..).await.unwrap();
        let indexes: Vec<u64> = remaining.iter().map(|e| e.log_id.index).collect();
        assert_eq!(indexes, vec![3, 4]);

        // Even with the whole log purged the state keeps the boundary.
        store
            .purge(LogId::new(CommittedLeaderId::new(1, 1), 4))
            .await
            .unwrap();
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id.unwrap().index, 4);
        assert_eq!(state.last_log_id.unwrap().index, 4);
    }

    #[tokio::test]
    async fn truncate_removes_the_conflicting_suffix() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = FileLogStore::open(tmp.path()).await.unwrap();
        append_entries(&mut store, vec![entry(1), entry(2), entry(3)]).await;

        store
            .truncate(LogId::new(CommittedLeaderId::new(1, 1), 2))
            .await
            .unwrap();

        let remaining = store.try_get_log_entries(..).await.unwrap();
        let indexes: Vec<u64> = remaining.iter().map(|e| e.log_id.index).collect();
        assert_eq!(indexes, vec![1]);
    }
}
