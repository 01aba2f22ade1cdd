use std::path::Path;

use anyhow::Context;
use nightshift_core::config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. With `file` set, events go to a
/// daily-rotated file (without colors) instead of stderr; keep the returned
/// guard alive until exit so buffered lines are flushed.
pub fn init(config: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("invalid log level {:?}", config.level))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let Some(file) = &config.file else {
        builder
            .with_ansi(config.ansi)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))?;
        return Ok(None);
    };

    let (dir, prefix) = split_log_path(file)?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("cannot create log directory {}", dir.display()))?;
    let mut appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix);
    if config.max_log_files > 0 {
        appender = appender.max_log_files(config.max_log_files);
    }
    let appender = appender
        .build(dir)
        .with_context(|| format!("cannot open log file {file}"))?;

    let (writer, guard) = tracing_appender::non_blocking(appender);
    builder
        .with_ansi(false)
        .with_writer(writer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))?;
    Ok(Some(guard))
}

/// Directory and file-name prefix of the rotated log files.
fn split_log_path(file: &str) -> anyhow::Result<(&Path, &str)> {
    let path = Path::new(file);
    let prefix = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("log file {file:?} has no file name"))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Ok((dir, prefix))
}
