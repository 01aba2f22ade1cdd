use std::time::Duration;

use nightshift_core::config::{DatabaseConfig, DbEndpoint};
use rusqlite::{Connection, OpenFlags};

use crate::error::BatchError;

/// Schema alias the migration target store is attached under.
pub const TARGET_SCHEMA: &str = "target";

/// Per-connection table holding the keys selected for the current batch.
pub const STAGING_TABLE: &str = "temp.nightshift_batch";

/// Opens connections to the source store (with the target store attached).
///
/// A fresh connection is opened for every batch and dropped right after the
/// batch commits or rolls back, so nothing is held open while the daemon waits
/// for the next day.
#[derive(Debug, Clone)]
pub struct Connector {
    source: DbEndpoint,
    target: Option<DbEndpoint>,
}

impl Connector {
    pub fn new(source: DbEndpoint, target: Option<DbEndpoint>) -> Self {
        Self { source, target }
    }

    pub fn from_config(config: &DatabaseConfig) -> Self {
        Self::new(config.source.clone(), config.target.clone())
    }

    /// Schema the migration target table lives in.
    pub fn target_schema(&self) -> &'static str {
        if self.target.is_some() {
            TARGET_SCHEMA
        } else {
            "main"
        }
    }

    /// Open the source store. The file must already exist.
    ///
    /// With a target attached, both stores must use a rollback journal: in
    /// WAL mode each attached store commits on its own, so a crash could keep
    /// a copy without its delete (or the reverse).
    pub fn open(&self) -> Result<Connection, BatchError> {
        let conn = Connection::open_with_flags(
            &self.source.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_millis(self.source.busy_timeout_ms))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        if let Some(target) = &self.target {
            conn.execute(
                &format!("ATTACH DATABASE ?1 AS {TARGET_SCHEMA}"),
                [&target.path],
            )?;
            for schema in ["main", TARGET_SCHEMA] {
                check_journal_mode(&conn, schema)?;
            }
        }
        init_staging(&conn)?;
        Ok(conn)
    }

    /// Open and close a connection to prove both stores are reachable.
    pub fn ping(&self) -> Result<(), BatchError> {
        let conn = self.open()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        if self.target.is_some() {
            conn.query_row(
                &format!("SELECT COUNT(*) FROM {TARGET_SCHEMA}.sqlite_master"),
                [],
                |_| Ok(()),
            )?;
        }
        Ok(())
    }
}

fn check_journal_mode(conn: &Connection, schema: &str) -> Result<(), BatchError> {
    let mode: String =
        conn.query_row(&format!("PRAGMA {schema}.journal_mode"), [], |r| r.get(0))?;
    if mode.eq_ignore_ascii_case("wal") {
        return Err(BatchError::JournalMode {
            schema: schema.to_string(),
            mode: mode.to_ascii_lowercase(),
        });
    }
    Ok(())
}

/// Create the batch staging table (idempotent, connection-local).
pub fn init_staging(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TEMP TABLE IF NOT EXISTS nightshift_batch (
            batch_key NOT NULL PRIMARY KEY
        );",
    )
}

/// Subquery yielding the keys staged for the current batch.
pub fn staged_keys() -> String {
    format!("SELECT batch_key FROM {STAGING_TABLE}")
}

/// Double-quote an identifier for interpolation into SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `schema."table"` with the table quoted.
pub fn qualified(schema: &str, table: &str) -> String {
    format!("{schema}.{}", quote_ident(table))
}
