use std::time::Duration;

use rusqlite::{Connection, ErrorCode, OpenFlags};

use crate::error::SchedulerError;

/// Exclusive run lock for one source store, shared by every process.
///
/// The lock is an open exclusive transaction on a small SQLite file next to
/// the source store (`<source>.lock`). It is released when the value is
/// dropped, or by the OS when the holding process dies.
#[derive(Debug)]
pub struct RunLock {
    path: String,
    _conn: Connection,
}

impl RunLock {
    /// Lock file used for the store at `source`.
    pub fn path_for(source: &str) -> String {
        format!("{source}.lock")
    }

    /// Take the lock without waiting.
    ///
    /// Returns [`SchedulerError::RunInProgress`] while another run (in this or
    /// any other process) holds it.
    pub fn acquire(source: &str) -> Result<Self, SchedulerError> {
        let path = Self::path_for(source);
        let lock_err = |source: rusqlite::Error| match source {
            rusqlite::Error::SqliteFailure(e, _)
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                SchedulerError::RunInProgress { lock: path.clone() }
            }
            source => SchedulerError::Lock {
                path: path.clone(),
                source,
            },
        };

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(lock_err)?;
        conn.busy_timeout(Duration::ZERO).map_err(lock_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS run_lock (held INTEGER);
             BEGIN EXCLUSIVE;",
        )
        .map_err(lock_err)?;

        Ok(Self { path, _conn: conn })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}
