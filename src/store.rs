//! Task progress store.
//!
//! A small relational store records per-file transfer progress so that
//! interrupted runs can resume. The pipelines only see the [`TaskStore`]
//! capability; the shipped bindings are SQLite-backed and in-memory.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Lifecycle status of a transfer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created but not yet scheduled.
    Pending,
    /// The sender has registered the task and may be uploading it.
    Uploading,
    /// The object is fully present in the bucket.
    Uploaded,
    /// The receiver is downloading the object.
    Downloading,
    /// The bytes are verified and placed; the task is permanently retired.
    Downloaded,
    /// The task failed and needs attention.
    Failed,
}

impl TaskStatus {
    /// Stable integer encoding used in the store.
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Pending => 0,
            Self::Uploading => 1,
            Self::Uploaded => 2,
            Self::Downloading => 3,
            Self::Downloaded => 4,
            Self::Failed => 5,
        }
    }

    /// Decode the stable integer encoding.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TaskStore`] on an unknown code.
    pub fn from_i64(code: i64) -> Result<Self> {
        match code {
            0 => Ok(Self::Pending),
            1 => Ok(Self::Uploading),
            2 => Ok(Self::Uploaded),
            3 => Ok(Self::Downloading),
            4 => Ok(Self::Downloaded),
            5 => Ok(Self::Failed),
            other => Err(SyncError::TaskStore(format!("unknown status code {other}"))),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Uploaded => "uploaded",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One row of the progress store, keyed by virtual name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Flat name of the byte window in the bucket and the VFS.
    pub virtual_name: String,
    /// Path of the source file on the sending machine.
    pub source_path: String,
    /// Size of the transferred window in bytes.
    pub source_size: u64,
    /// Sampled digest of the whole source file, empty when unknown.
    pub source_digest: String,
    /// Path of the destination file, empty until placement.
    pub destination_path: String,
    /// Size of the destination prefix before transfer (append tasks).
    pub destination_size: u64,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// Error text from the last failure, empty otherwise.
    pub error: String,
}

/// Aggregate per-status count and byte total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusSummary {
    /// Number of tasks in the status.
    pub count: u64,
    /// Sum of source sizes in the status.
    pub size: u64,
}

/// Capability over the progress store.
///
/// Implementations serialize access internally; concurrent upserts on
/// distinct keys are independent.
pub trait TaskStore: Send + Sync {
    /// Insert or fully update the record keyed by its virtual name.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TaskStore`] on storage failure.
    fn upsert(&self, record: &TaskRecord) -> Result<()>;

    /// Fetch one record by virtual name.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TaskStore`] on storage failure.
    fn get(&self, virtual_name: &str) -> Result<Option<TaskRecord>>;

    /// Remove one record by virtual name.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TaskStore`] on storage failure.
    fn delete(&self, virtual_name: &str) -> Result<()>;

    /// Virtual names of all permanently retired (downloaded) tasks.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TaskStore`] on storage failure.
    fn finished_virtual_names(&self) -> Result<Vec<String>>;

    /// Per-status counts and byte totals.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TaskStore`] on storage failure.
    fn status_summary(&self) -> Result<BTreeMap<TaskStatus, StatusSummary>>;
}

/// SQLite-backed progress store.
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    /// Open or create the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TaskStore`] if the database cannot be opened or
    /// migrated.
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Open an in-memory store (used by tests).
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::TaskStore`] if the database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                virtual_name TEXT PRIMARY KEY NOT NULL,
                source_path TEXT NOT NULL,
                source_size INTEGER NOT NULL,
                source_digest TEXT NOT NULL DEFAULT '',
                destination_path TEXT NOT NULL DEFAULT '',
                destination_size INTEGER NOT NULL DEFAULT 0,
                status INTEGER NOT NULL,
                error TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL DEFAULT (unixepoch()),
                updated_at INTEGER NOT NULL DEFAULT (unixepoch())
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::TaskStore("store mutex poisoned".into()))
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<(TaskRecord, i64)> {
    let status_code: i64 = row.get(6)?;
    Ok((
        TaskRecord {
            virtual_name: row.get(0)?,
            source_path: row.get(1)?,
            source_size: row.get::<_, i64>(2)?.max(0).unsigned_abs(),
            source_digest: row.get(3)?,
            destination_path: row.get(4)?,
            destination_size: row.get::<_, i64>(5)?.max(0).unsigned_abs(),
            status: TaskStatus::Pending,
            error: row.get(7)?,
        },
        status_code,
    ))
}

impl TaskStore for SqliteTaskStore {
    fn upsert(&self, record: &TaskRecord) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tasks (virtual_name, source_path, source_size, source_digest,
                                destination_path, destination_size, status, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(virtual_name) DO UPDATE SET
                source_path = excluded.source_path,
                source_size = excluded.source_size,
                source_digest = excluded.source_digest,
                destination_path = excluded.destination_path,
                destination_size = excluded.destination_size,
                status = excluded.status,
                error = excluded.error,
                updated_at = unixepoch()",
            params![
                record.virtual_name,
                record.source_path,
                i64::try_from(record.source_size).unwrap_or(i64::MAX),
                record.source_digest,
                record.destination_path,
                i64::try_from(record.destination_size).unwrap_or(i64::MAX),
                record.status.as_i64(),
                record.error,
            ],
        )?;
        Ok(())
    }

    fn get(&self, virtual_name: &str) -> Result<Option<TaskRecord>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT virtual_name, source_path, source_size, source_digest,
                        destination_path, destination_size, status, error
                 FROM tasks WHERE virtual_name = ?1",
                params![virtual_name],
                row_to_record,
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((mut record, code)) => {
                record.status = TaskStatus::from_i64(code)?;
                Ok(Some(record))
            }
        }
    }

    fn delete(&self, virtual_name: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM tasks WHERE virtual_name = ?1", params![virtual_name])?;
        Ok(())
    }

    fn finished_virtual_names(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT virtual_name FROM tasks WHERE status = ?1")?;
        let names = stmt
            .query_map(params![TaskStatus::Downloaded.as_i64()], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    fn status_summary(&self) -> Result<BTreeMap<TaskStatus, StatusSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*), COALESCE(SUM(source_size), 0)
             FROM tasks GROUP BY status",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut summary = BTreeMap::new();
        for (code, count, size) in rows {
            summary.insert(
                TaskStatus::from_i64(code)?,
                StatusSummary {
                    count: count.max(0).unsigned_abs(),
                    size: size.max(0).unsigned_abs(),
                },
            );
        }
        Ok(summary)
    }
}

/// In-memory progress store for tests and `--skip-store` runs.
#[derive(Default)]
pub struct MemoryTaskStore {
    records: Mutex<BTreeMap<String, TaskRecord>>,
}

impl MemoryTaskStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemoryTaskStore {
    fn upsert(&self, record: &TaskRecord) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| SyncError::TaskStore("store mutex poisoned".into()))?;
        records.insert(record.virtual_name.clone(), record.clone());
        Ok(())
    }

    fn get(&self, virtual_name: &str) -> Result<Option<TaskRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|_| SyncError::TaskStore("store mutex poisoned".into()))?;
        Ok(records.get(virtual_name).cloned())
    }

    fn delete(&self, virtual_name: &str) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| SyncError::TaskStore("store mutex poisoned".into()))?;
        records.remove(virtual_name);
        Ok(())
    }

    fn finished_virtual_names(&self) -> Result<Vec<String>> {
        let records = self
            .records
            .lock()
            .map_err(|_| SyncError::TaskStore("store mutex poisoned".into()))?;
        Ok(records
            .values()
            .filter(|r| r.status == TaskStatus::Downloaded)
            .map(|r| r.virtual_name.clone())
            .collect())
    }

    fn status_summary(&self) -> Result<BTreeMap<TaskStatus, StatusSummary>> {
        let records = self
            .records
            .lock()
            .map_err(|_| SyncError::TaskStore("store mutex poisoned".into()))?;
        let mut summary: BTreeMap<TaskStatus, StatusSummary> = BTreeMap::new();
        for record in records.values() {
            let entry = summary.entry(record.status).or_default();
            entry.count += 1;
            entry.size += record.source_size;
        }
        Ok(summary)
    }
}
