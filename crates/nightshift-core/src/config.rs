use std::collections::{BTreeMap, HashSet};

use chrono::NaiveTime;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

pub const DEFAULT_CONFIG_PATH: &str = "nightshift.toml";
pub const ENV_PREFIX: &str = "NIGHTSHIFT_";
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_KEY_COLUMN: &str = "id";

/// Built-in handler names, in the order they are usually scheduled.
pub const DELETE_RESOURCE_HANDLER: &str = "delete_resource_handler";
pub const DELETE_WORKFLOW_HANDLER: &str = "delete_workflow_handler";
pub const MIGRATION_HANDLER: &str = "migration_handler";

/// Top-level config (nightshift.toml + NIGHTSHIFT_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NightshiftConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Per-handler sections, keyed by handler name.
    #[serde(default)]
    pub handlers: BTreeMap<String, HandlerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Daily wall-clock time at which the run starts.
    #[serde(default = "default_start_time", with = "time_of_day")]
    pub start_time: NaiveTime,
    /// Handler names, executed in this order.
    #[serde(default)]
    pub handlers: Vec<String>,
    /// Interpret start/cut-off times in UTC instead of the host's local time.
    #[serde(default)]
    pub use_utc: bool,
    /// How often the waiting trigger re-reads the clock.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            start_time: default_start_time(),
            handlers: Vec::new(),
            use_utc: false,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Store the handlers read from and delete in.
    pub source: DbEndpoint,
    /// Store migrated rows are written to. When absent the migration target
    /// table lives in the source store.
    #[serde(default)]
    pub target: Option<DbEndpoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbEndpoint {
    pub path: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl DbEndpoint {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence when set.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Colourise console output.
    #[serde(default = "bool_true")]
    pub ansi: bool,
    /// Write log lines to `<file>.YYYY-MM-DD` instead of stderr, starting a
    /// new file every day.
    #[serde(default)]
    pub file: Option<String>,
    /// Daily log files to keep; older ones are deleted (0 keeps all).
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            ansi: true,
            file: None,
            max_log_files: default_max_log_files(),
        }
    }
}

/// The built-in handler implementations a config section can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    /// Delete rows matching the predicate.
    Delete,
    /// Delete a parent row together with its dependent child rows.
    CascadeDelete,
    /// Copy rows into a target table, then delete them from the source.
    Migrate,
}

impl HandlerKind {
    /// Name the kind's implementation is registered under.
    pub fn builtin_name(&self) -> &'static str {
        match self {
            HandlerKind::Delete => DELETE_RESOURCE_HANDLER,
            HandlerKind::CascadeDelete => DELETE_WORKFLOW_HANDLER,
            HandlerKind::Migrate => MIGRATION_HANDLER,
        }
    }

    pub fn from_builtin_name(name: &str) -> Option<Self> {
        match name {
            DELETE_RESOURCE_HANDLER => Some(HandlerKind::Delete),
            DELETE_WORKFLOW_HANDLER => Some(HandlerKind::CascadeDelete),
            MIGRATION_HANDLER => Some(HandlerKind::Migrate),
            _ => None,
        }
    }
}

/// What a migration does when the target already holds a row with the same key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Overwrite the target row with the source row.
    #[default]
    Replace,
    /// Keep the target row as it is.
    Ignore,
}

/// One `[handlers.<name>]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Filled from the section key after loading.
    #[serde(skip)]
    pub name: String,
    /// Reuse a built-in implementation under a custom handler name.
    #[serde(default)]
    pub kind: Option<HandlerKind>,
    #[serde(default)]
    pub table: String,
    /// Primary key column; batches are selected in ascending key order.
    #[serde(default = "default_key_column")]
    pub key_column: String,
    /// SQL boolean expression selecting eligible rows.
    #[serde(default)]
    pub predicate: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// No new batch starts at or after this time of day.
    #[serde(default = "default_cut_off_time", with = "time_of_day")]
    pub cut_off_time: NaiveTime,
    /// Pause between two batches to relieve the database.
    #[serde(default)]
    pub pause_secs: u64,

    // --- migrate ------------------------------------------------------------
    #[serde(default)]
    pub target_table: Option<String>,
    /// Columns to copy; empty copies every column (`SELECT *`).
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub on_conflict: ConflictPolicy,

    // --- cascade_delete -----------------------------------------------------
    #[serde(default)]
    pub children: Vec<ChildTableConfig>,
    /// Delete only the dependent rows and keep the parent rows.
    #[serde(default)]
    pub retain_parent: bool,
}

/// A table whose rows reference the parent table through `foreign_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildTableConfig {
    pub table: String,
    /// Column in this table holding the parent's key.
    pub foreign_key: String,
    /// This table's own key; only used to match grandchildren.
    #[serde(default = "default_key_column")]
    pub key_column: String,
    /// Narrows which dependent rows are deleted.
    #[serde(default)]
    pub predicate: Option<String>,
    #[serde(default)]
    pub children: Vec<ChildTableConfig>,
    /// Keep this table's rows; only its descendants are deleted.
    #[serde(default)]
    pub retain: bool,
}

impl ChildTableConfig {
    pub fn new(table: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            foreign_key: foreign_key.into(),
            key_column: default_key_column(),
            predicate: None,
            children: Vec::new(),
            retain: false,
        }
    }
}

impl HandlerConfig {
    /// A section with every optional field at its default.
    pub fn new(
        name: impl Into<String>,
        table: impl Into<String>,
        predicate: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: None,
            table: table.into(),
            key_column: default_key_column(),
            predicate: predicate.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            cut_off_time: default_cut_off_time(),
            pause_secs: 0,
            target_table: None,
            columns: Vec::new(),
            on_conflict: ConflictPolicy::default(),
            children: Vec::new(),
            retain_parent: false,
        }
    }

    /// Declared kind, or the kind implied by a built-in handler name.
    pub fn effective_kind(&self) -> Option<HandlerKind> {
        self.kind.or_else(|| HandlerKind::from_builtin_name(&self.name))
    }

    pub fn validate(&self) -> Result<()> {
        if self.table.is_empty() {
            return Err(self.missing("table"));
        }
        if self.predicate.trim().is_empty() {
            return Err(self.missing("predicate"));
        }
        // bound as an SQLite LIMIT, which is a signed 64-bit integer
        if self.batch_size == 0 || i64::try_from(self.batch_size).is_err() {
            return Err(ConfigError::InvalidBatchSize {
                handler: self.name.clone(),
            });
        }
        self.check_ident(&self.table)?;
        self.check_ident(&self.key_column)?;

        match self.effective_kind() {
            Some(HandlerKind::Migrate) => {
                let target = self
                    .target_table
                    .as_deref()
                    .ok_or_else(|| self.missing("target_table"))?;
                self.check_ident(target)?;
                for column in &self.columns {
                    self.check_ident(column)?;
                }
                if !self.columns.is_empty() && !self.columns.contains(&self.key_column) {
                    return Err(ConfigError::KeyColumnNotCopied {
                        handler: self.name.clone(),
                        column: self.key_column.clone(),
                    });
                }
            }
            Some(HandlerKind::CascadeDelete) => {
                if self.children.is_empty() {
                    return Err(self.missing("children"));
                }
                self.check_children(&self.children)?;
            }
            Some(HandlerKind::Delete) | None => {}
        }
        Ok(())
    }

    fn check_children(&self, children: &[ChildTableConfig]) -> Result<()> {
        for child in children {
            self.check_ident(&child.table)?;
            self.check_ident(&child.foreign_key)?;
            self.check_ident(&child.key_column)?;
            self.check_children(&child.children)?;
        }
        Ok(())
    }

    fn check_ident(&self, value: &str) -> Result<()> {
        if is_identifier(value) {
            Ok(())
        } else {
            Err(ConfigError::InvalidIdentifier {
                handler: self.name.clone(),
                value: value.to_string(),
            })
        }
    }

    fn missing(&self, field: &'static str) -> ConfigError {
        ConfigError::MissingField {
            handler: self.name.clone(),
            field,
        }
    }
}

impl NightshiftConfig {
    /// Load config from a TOML file with NIGHTSHIFT_* env var overrides.
    ///
    /// Nested keys use a double underscore:
    /// `NIGHTSHIFT_SCHEDULER__START_TIME=03:30`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path.unwrap_or(DEFAULT_CONFIG_PATH);
        tracing::debug!(%path, "loading configuration");
        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::from_figment(figment)
    }

    /// Parse an in-memory TOML document (no env overrides).
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        Self::from_figment(Figment::from(Toml::string(toml)))
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let mut config: NightshiftConfig = figment
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        for (name, handler) in config.handlers.iter_mut() {
            handler.name = name.clone();
        }
        config.validate()?;
        Ok(config)
    }

    /// Check everything that can be checked without touching a database.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for name in &self.scheduler.handlers {
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::DuplicateHandler { name: name.clone() });
            }
            if !self.handlers.contains_key(name) {
                return Err(ConfigError::MissingHandlerConfig { name: name.clone() });
            }
        }
        for handler in self.handlers.values() {
            handler.validate()?;
        }
        Ok(())
    }

    pub fn handler(&self, name: &str) -> Option<&HandlerConfig> {
        self.handlers.get(name)
    }
}

/// Parse `HH:MM` or `HH:MM:SS`.
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime> {
    let invalid = || ConfigError::InvalidTime {
        value: value.to_string(),
    };
    let parts = value
        .trim()
        .split(':')
        .map(|p| p.parse::<u32>().map_err(|_| invalid()))
        .collect::<Result<Vec<_>>>()?;
    let (h, m, s) = match parts.as_slice() {
        [h, m] => (*h, *m, 0),
        [h, m, s] => (*h, *m, *s),
        _ => return Err(invalid()),
    };
    NaiveTime::from_hms_opt(h, m, s).ok_or_else(invalid)
}

/// Plain SQL identifier: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Serde adapter for `HH:MM[:SS]` strings.
mod time_of_day {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format("%H:%M:%S").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_time_of_day(&raw).map_err(serde::de::Error::custom)
    }
}

fn bool_true() -> bool {
    true
}
fn default_start_time() -> NaiveTime {
    NaiveTime::from_hms_opt(2, 0, 0).unwrap_or(NaiveTime::MIN)
}
fn default_cut_off_time() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 0, 0).unwrap_or(NaiveTime::MIN)
}
fn default_key_column() -> String {
    DEFAULT_KEY_COLUMN.to_string()
}
fn default_max_log_files() -> usize {
    7
}
fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [scheduler]
        start_time = "02:30"
        handlers = ["delete_resource_handler", "delete_workflow_handler", "migration_handler"]

        [database.source]
        path = "/tmp/source.db"

        [database.target]
        path = "/tmp/archive.db"
        busy_timeout_ms = 1000

        [handlers.delete_resource_handler]
        table = "work_resources"
        predicate = "deleted = 1"
        batch_size = 500

        [handlers.delete_workflow_handler]
        table = "workflow_items"
        predicate = "deleted = 1"
        cut_off_time = "22:15"

        [[handlers.delete_workflow_handler.children]]
        table = "workflow_steps"
        foreign_key = "item_id"

        [[handlers.delete_workflow_handler.children.children]]
        table = "workflow_actors"
        foreign_key = "step_id"

        [handlers.migration_handler]
        table = "orders"
        predicate = "status = 'COMPLETED'"
        target_table = "orders_archive"
        on_conflict = "ignore"
        batch_size = 5000
        cut_off_time = "22:30:00"
    "#;

    #[test]
    fn parses_two_and_three_part_times() {
        assert_eq!(
            parse_time_of_day("02:00").unwrap(),
            NaiveTime::from_hms_opt(2, 0, 0).unwrap()
        );
        assert_eq!(
            parse_time_of_day("23:59:30").unwrap(),
            NaiveTime::from_hms_opt(23, 59, 30).unwrap()
        );
    }

    #[test]
    fn rejects_malformed_times() {
        for bad in ["", "2", "25:00", "12:60", "1:2:3:4", "ab:cd", "12:00:61"] {
            assert!(
                matches!(parse_time_of_day(bad), Err(ConfigError::InvalidTime { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn loads_full_sample() {
        let config = NightshiftConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(
            config.scheduler.start_time,
            NaiveTime::from_hms_opt(2, 30, 0).unwrap()
        );
        assert_eq!(config.scheduler.handlers.len(), 3);
        assert_eq!(config.database.target.as_ref().unwrap().busy_timeout_ms, 1000);
        assert_eq!(config.database.source.busy_timeout_ms, DEFAULT_BUSY_TIMEOUT_MS);
        assert_eq!(config.logging.max_log_files, 7);
        assert!(config.logging.file.is_none());

        let delete = config.handler("delete_resource_handler").unwrap();
        assert_eq!(delete.name, "delete_resource_handler");
        assert_eq!(delete.key_column, "id");
        assert_eq!(delete.batch_size, 500);
        assert_eq!(delete.cut_off_time, NaiveTime::from_hms_opt(23, 0, 0).unwrap());

        let workflow = config.handler("delete_workflow_handler").unwrap();
        assert_eq!(workflow.effective_kind(), Some(HandlerKind::CascadeDelete));
        assert_eq!(workflow.children[0].children[0].table, "workflow_actors");
        assert_eq!(workflow.cut_off_time, NaiveTime::from_hms_opt(22, 15, 0).unwrap());

        let migration = config.handler("migration_handler").unwrap();
        assert_eq!(migration.on_conflict, ConflictPolicy::Ignore);
        assert_eq!(migration.target_table.as_deref(), Some("orders_archive"));
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nightshift.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = NightshiftConfig::load(path.to_str()).unwrap();
        assert_eq!(config.handlers.len(), 3);
    }

    #[test]
    fn invalid_cut_off_fails_to_load() {
        let toml = r#"
            [database.source]
            path = "x.db"
            [handlers.purge]
            table = "t"
            predicate = "1 = 1"
            cut_off_time = "24:00"
        "#;
        let err = NightshiftConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Load(ref m) if m.contains("24:00")));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut handler = HandlerConfig::new("purge", "t", "1 = 1");
        handler.batch_size = 0;
        assert!(matches!(
            handler.validate(),
            Err(ConfigError::InvalidBatchSize { .. })
        ));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn batch_size_beyond_sqlite_limit_is_rejected() {
        let mut handler = HandlerConfig::new("purge", "t", "1 = 1");
        handler.batch_size = usize::MAX;
        assert!(matches!(
            handler.validate(),
            Err(ConfigError::InvalidBatchSize { .. })
        ));
        handler.batch_size = i64::MAX as usize;
        handler.validate().unwrap();
    }

    #[test]
    fn migration_requires_target_table() {
        let handler = HandlerConfig::new(MIGRATION_HANDLER, "orders", "1 = 1");
        assert!(matches!(
            handler.validate(),
            Err(ConfigError::MissingField { field: "target_table", .. })
        ));
    }

    #[test]
    fn cascade_requires_children() {
        let mut handler = HandlerConfig::new("wf", "items", "1 = 1");
        handler.kind = Some(HandlerKind::CascadeDelete);
        assert!(matches!(
            handler.validate(),
            Err(ConfigError::MissingField { field: "children", .. })
        ));
    }

    #[test]
    fn identifiers_are_checked() {
        let handler = HandlerConfig::new("purge", "t; DROP TABLE x", "1 = 1");
        assert!(matches!(
            handler.validate(),
            Err(ConfigError::InvalidIdentifier { .. })
        ));
        assert!(is_identifier("_tb_work2"));
        assert!(!is_identifier("2tb"));
        assert!(!is_identifier("main.t"));
    }

    #[test]
    fn scheduled_handler_needs_a_section() {
        let toml = r#"
            [scheduler]
            handlers = ["purge"]
            [database.source]
            path = "x.db"
        "#;
        let err = NightshiftConfig::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, ConfigError::MissingHandlerConfig { ref name } if name == "purge"));
    }

    #[test]
    fn duplicate_scheduled_handler_is_rejected() {
        let toml = r#"
            [scheduler]
            handlers = ["purge", "purge"]
            [database.source]
            path = "x.db"
            [handlers.purge]
            table = "t"
            predicate = "1 = 1"
        "#;
        let err = NightshiftConfig::from_toml_str(toml).unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_HANDLER");
    }
}
