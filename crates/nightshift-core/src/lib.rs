//! `nightshift-core`: configuration, configuration errors and shared identifiers
//! for the nightshift maintenance daemon.

pub mod config;
pub mod error;
pub mod types;

pub use config::{HandlerConfig, HandlerKind, NightshiftConfig};
pub use error::{ConfigError, Result};
pub use types::RunId;
