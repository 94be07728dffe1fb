//! Logging setup.
//!
//! Two layers: compact human logs on stderr and JSONL in
//! `~/.pyrun/logs/pyrun.jsonl`. Script output also goes to stderr, so the
//! stderr layer only shows warnings unless `PYRUN_DEBUG_LOG` is set.
//! `RUST_LOG` overrides the file filter.

use fs_err as fs;
use pyrun_core::config::{env_flag_enabled, DEBUG_LOG_ENV};
use pyrun_core::StorageConfig;
use std::env;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_FILE: &str = "pyrun.jsonl";

/// Keeps the file writer flushing; drop it last.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

pub fn init() -> LoggingGuard {
    let debug_enabled = env::var(DEBUG_LOG_ENV)
        .map(|value| env_flag_enabled(&value))
        .unwrap_or(false);

    let file_filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let stderr_level = if debug_enabled {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .with_filter(stderr_level);

    let (file_layer, file_guard) = match file_writer() {
        Some((writer, guard)) => {
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .with_target(true)
                .with_thread_names(true)
                .with_filter(file_filter);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    LoggingGuard {
        _file_guard: file_guard,
    }
}

/// Non-blocking writer for the JSONL log. Logging to a file is best effort;
/// without a home directory only stderr logging is installed.
fn file_writer() -> Option<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let storage = StorageConfig::from_home().ok()?;
    let dir = storage.logs_dir();
    if let Err(err) = fs::create_dir_all(&dir) {
        eprintln!("pyrun: file logging disabled: {}", err);
        return None;
    }
    let appender = tracing_appender::rolling::never(dir, LOG_FILE);
    Some(tracing_appender::non_blocking(appender))
}
