//! provides logging helpers

use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// Rotated log files kept next to the active one.
const MAX_LOG_FILES: usize = 3;

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("log file path `{0}` has no file name")]
    InvalidPath(PathBuf),

    #[error("failed to create log file appender in `{dir}`: {source}")]
    Appender {
        dir: PathBuf,
        source: tracing_appender::rolling::InitError,
    },

    #[error("global tracing subscriber already installed: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// Create a daily rotating appender writing to `log_file`.
fn rolling_appender(log_file: &Path) -> Result<RollingFileAppender, LoggingError> {
    let file = log_file
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| LoggingError::InvalidPath(log_file.to_path_buf()))?;
    let dir = match log_file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file)
        .max_log_files(MAX_LOG_FILES)
        .build(dir)
        .map_err(|source| LoggingError::Appender {
            dir: dir.to_path_buf(),
            source,
        })
}

/// initiate the global tracing subscriber
///
/// Logs go to stderr, filtered by `RUST_LOG` (default `info`). When
/// `log_file` is given they are also written to a daily rotating file; the
/// returned guard must be held until exit so buffered lines get flushed.
pub fn init(log_file: Option<&Path>) -> Result<Option<WorkerGuard>, LoggingError> {
    let stderr_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(rolling_appender(path)?);
            let file_layer = layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter());
            (Some(file_layer), Some(guard))
        }
        None => (None, None),
    };

    registry().with(stderr_layer).with(file_layer).try_init()?;
    Ok(guard)
}
