use nightshift_core::ConfigError;
use thiserror::Error;

/// A batch that could not be committed. The batch's transaction has been
/// rolled back when this is returned.
#[derive(Debug, Error)]
pub enum BatchError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A copy or delete touched a different number of rows than were selected.
    #[error("Verification failed on {table}: expected {expected} rows, found {found}")]
    Verification {
        table: String,
        expected: usize,
        found: usize,
    },

    /// The stores cannot commit a cross-store batch as one unit in this
    /// journal mode.
    #[error("Store '{schema}' uses journal_mode={mode}; moving rows between attached stores needs a rollback journal")]
    JournalMode { schema: String, mode: String },

    /// The blocking task running the batch died before reporting back.
    #[error("Batch worker failed: {0}")]
    Worker(String),
}

/// Errors surfaced by the scheduler engine and its handle.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The engine loop has exited; no more runs can be requested.
    #[error("Scheduler engine is not running")]
    EngineStopped,

    /// Another run against the same store holds the run lock.
    #[error("Another run is in progress (lock {lock} is held)")]
    RunInProgress { lock: String },

    #[error("Cannot take run lock {path}: {source}")]
    Lock {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
