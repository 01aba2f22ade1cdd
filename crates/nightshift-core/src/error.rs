use thiserror::Error;

/// Problems with the configuration that prevent a run from starting.
///
/// Every variant is fatal: a run is never started with a configuration that
/// produced one of these.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Load(String),

    #[error("Invalid time of day '{value}' (expected HH:MM or HH:MM:SS)")]
    InvalidTime { value: String },

    #[error("Handler '{handler}': batch_size must be between 1 and 9223372036854775807")]
    InvalidBatchSize { handler: String },

    #[error("Handler '{handler}': '{value}' is not a valid SQL identifier")]
    InvalidIdentifier { handler: String, value: String },

    #[error("Handler '{handler}': missing required field '{field}'")]
    MissingField {
        handler: String,
        field: &'static str,
    },

    #[error("Handler '{handler}': column list must include the key column '{column}'")]
    KeyColumnNotCopied { handler: String, column: String },

    #[error("Handler '{name}' is scheduled but has no [handlers.{name}] section")]
    MissingHandlerConfig { name: String },

    #[error("Handler '{name}' is listed more than once")]
    DuplicateHandler { name: String },

    #[error("Unknown handler: {name}")]
    UnknownHandler { name: String },
}

impl ConfigError {
    /// Short error code used in log fields.
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Load(_) => "CONFIG_LOAD",
            ConfigError::InvalidTime { .. } => "INVALID_TIME",
            ConfigError::InvalidBatchSize { .. } => "INVALID_BATCH_SIZE",
            ConfigError::InvalidIdentifier { .. } => "INVALID_IDENTIFIER",
            ConfigError::MissingField { .. } => "MISSING_FIELD",
            ConfigError::KeyColumnNotCopied { .. } => "KEY_COLUMN_NOT_COPIED",
            ConfigError::MissingHandlerConfig { .. } => "MISSING_HANDLER_CONFIG",
            ConfigError::DuplicateHandler { .. } => "DUPLICATE_HANDLER",
            ConfigError::UnknownHandler { .. } => "UNKNOWN_HANDLER",
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
