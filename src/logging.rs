//! Tracing subscriber setup for the binary
//!
//! Logs go to stderr by default so stdout stays free for JSON output, or to a
//! non-blocking file appender when a log file is given. The filter comes
//! from `RUST_LOG` and falls back to `info`.

use std::io;
use std::path::Path;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

pub const DEFAULT_LOG_FILTER: &str = "info";

/// Build the filter from `RUST_LOG`, falling back to [`DEFAULT_LOG_FILTER`]
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Non-blocking writer appending to `path`, creating its directory
///
/// The returned guard flushes pending lines when dropped.
pub fn file_writer(path: &Path) -> io::Result<(NonBlocking, WorkerGuard)> {
    let file_name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Log path {} has no file name", path.display()),
        )
    })?;
    let dir = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    let appender = tracing_appender::rolling::never(dir, file_name);
    Ok(tracing_appender::non_blocking(appender))
}

/// Install the global subscriber
///
/// Keep the returned guard alive for the life of the process when logging to
/// a file. Falls back to stderr if the log file cannot be opened.
pub fn init_logging(json: bool, log_file: Option<&Path>) -> Option<WorkerGuard> {
    let (writer, guard) = match log_file.map(file_writer) {
        Some(Ok((writer, guard))) => (BoxMakeWriter::new(writer), Some(guard)),
        Some(Err(e)) => {
            eprintln!("Failed to open log file, logging to stderr: {}", e);
            (BoxMakeWriter::new(io::stderr), None)
        }
        None => (BoxMakeWriter::new(io::stderr), None),
    };

    let result = if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter())
            .with_target(true)
            .with_writer(writer)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_target(false)
            .with_ansi(log_file.is_none())
            .with_writer(writer)
            .try_init()
    };

    if let Err(e) = result {
        eprintln!("Logging already initialized: {}", e);
    }

    guard
}
