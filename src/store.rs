//! The embedded relational store: a local SQLite database owned by this node.
//!
//! Only the replicated state machine mutates it (inside apply or snapshot
//! restore) and only reads/snapshot-save read it. Nothing else in the process
//! touches the database file.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use rusqlite::{Connection, DatabaseName, params_from_iter};
use tracing::debug;

use crate::{
    registry::{decode_row_map, decoder_for},
    request::{Mutation, QueryKind, ReadDescriptor},
};

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    Sqlite(rusqlite::Error),
    UnknownResultType { result_type: String },
    EmptyBatch,
    LockPoisoned,
    Degraded,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Sqlite(e) => write!(f, "sqlite error: {e}"),
            Self::UnknownResultType { result_type } => {
                write!(f, "unknown result type: {result_type}")
            }
            Self::EmptyBatch => write!(f, "write contains no mutations"),
            Self::LockPoisoned => write!(f, "store lock poisoned"),
            Self::Degraded => write!(f, "local store degraded, node excluded from serving"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Sqlite(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl StoreError {
    /// Infrastructure-level failures imply local store corruption and must
    /// degrade the replica. Content-level failures (bad SQL, constraint
    /// violations) only fail the one request.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Io(_) | Self::LockPoisoned | Self::Degraded => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::SystemIoFailure
                    | rusqlite::ErrorCode::DatabaseCorrupt
                    | rusqlite::ErrorCode::NotADatabase
                    | rusqlite::ErrorCode::DiskFull
                    | rusqlite::ErrorCode::PermissionDenied
            ),
            Self::Sqlite(_) => false,
            Self::UnknownResultType { .. } | Self::EmptyBatch => false,
        }
    }
}

/// SQLite-backed store with the node's data directory layout:
/// `<data_dir>/store/replistore.db` plus SQLite's own side files.
pub struct SqlStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl std::fmt::Debug for SqlStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlStore")
            .field("db_path", &self.db_path)
            .finish()
    }
}

impl SqlStore {
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let store_dir = data_dir.join("store");
        fs::create_dir_all(&store_dir)?;
        let db_path = store_dir.join("replistore.db");

        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        debug!(db_path = %db_path.display(), "opened sql store");
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Apply one committed entry's mutations as a single transaction.
    ///
    /// `ordered` sorts by `sequence_no` ascending before executing; import
    /// batches pass `false` and run in submission order (rows are independent,
    /// the sort would only add cost). Either way the batch commits
    /// all-or-nothing.
    pub fn apply_batch(&self, mutations: &[Mutation], ordered: bool) -> Result<(), StoreError> {
        if mutations.is_empty() {
            return Err(StoreError::EmptyBatch);
        }

        let mut batch: Vec<&Mutation> = mutations.iter().collect();
        if ordered {
            batch.sort_by_key(|m| m.sequence_no);
        }

        let mut conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        let tx = conn.transaction()?;
        for mutation in batch {
            let values: Vec<rusqlite::types::Value> =
                mutation.args.iter().map(|a| a.to_sql_value()).collect();
            tx.execute(&mutation.sql, params_from_iter(values))?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Execute a read against the local store.
    ///
    /// Zero rows is an explicit result (`null` for one-row kinds, an empty
    /// array for row-set kinds), never an error.
    pub fn query(&self, descriptor: &ReadDescriptor) -> Result<serde_json::Value, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut stmt = conn.prepare(&descriptor.sql)?;
        let values: Vec<rusqlite::types::Value> =
            descriptor.args.iter().map(|a| a.to_sql_value()).collect();

        let decode = match descriptor.kind {
            QueryKind::ManyRows => decode_row_map,
            _ => decoder_for(&descriptor.result_type)?,
        };

        let mut rows: Vec<serde_json::Value> = stmt
            .query_map(params_from_iter(values), |row| decode(row))?
            .collect::<Result<_, _>>()?;

        match descriptor.kind {
            QueryKind::OneScalar | QueryKind::OneScalarWithArgs | QueryKind::OneMapped => {
                if rows.is_empty() {
                    Ok(serde_json::Value::Null)
                } else {
                    Ok(rows.swap_remove(0))
                }
            }
            QueryKind::ManyMapped | QueryKind::ManyScalar | QueryKind::ManyRows => {
                Ok(serde_json::Value::Array(rows))
            }
        }
    }

    /// Produce an internal SQLite backup of the live database at `dest`.
    ///
    /// Callers hold the exclusive snapshot lock so no apply mutates the store
    /// while the backup runs.
    pub fn backup_to(&self, dest: &Path) -> Result<(), StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        conn.backup(DatabaseName::Main, dest, None)?;
        Ok(())
    }

    /// Replace the live database content from a staged backup file.
    ///
    /// Goes through SQLite's restore primitive (never a raw file copy into a
    /// live-open database). Callers hold the exclusive snapshot lock.
    pub fn restore_from(&self, src: &Path) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        conn.restore(DatabaseName::Main, src, None::<fn(rusqlite::backup::Progress)>)?;
        Ok(())
    }
}
