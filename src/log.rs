//! Structured logging for debugging foreman.
//!
//! Log levels:
//! - ERROR: Failures that stop a run (checkpoint corruption, setup errors)
//! - WARN: Recoverable problems (attempt failures, best-effort cleanup misses)
//! - INFO: Run lifecycle (session start/stop, dispatch, task outcomes)
//! - DEBUG: Detailed traces (slot accounting, prompts sizes, gate output)
//! - TRACE: Very detailed traces (raw provider output)
//!
//! Debug mode can be enabled with `--debug` flag or `FOREMAN_DEBUG=1` env var.
//! `FOREMAN_LOG` takes a full `EnvFilter` directive and wins over both.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "foreman.log";

/// Directory that holds the log file and the default state directory.
pub fn log_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".foreman"))
}

/// Whether debug mode was requested through the environment.
pub fn env_debug() -> bool {
    std::env::var("FOREMAN_DEBUG")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

/// Build the filter used by the file subscriber.
pub fn build_filter(debug: bool) -> EnvFilter {
    if let Ok(directive) = std::env::var("FOREMAN_LOG") {
        if let Ok(filter) = EnvFilter::try_new(directive) {
            return filter;
        }
    }
    let level = if debug || env_debug() { "debug" } else { "info" };
    EnvFilter::new(format!("foreman={level}"))
}

/// Initialize logging to ~/.foreman/foreman.log
pub fn init() -> Option<WorkerGuard> {
    init_with_debug(false)
}

/// Initialize logging with explicit debug mode setting.
///
/// Returns the appender guard; dropping it flushes buffered lines, so the
/// caller keeps it alive for the whole process. Returns `None` when there is
/// no home directory or a global subscriber is already installed.
pub fn init_with_debug(debug: bool) -> Option<WorkerGuard> {
    let dir = log_dir()?;
    std::fs::create_dir_all(&dir).ok()?;
    // Truncate file on startup
    let _ = std::fs::write(dir.join(LOG_FILE), "");

    let appender = tracing_appender::rolling::never(&dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(build_filter(debug))
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .try_init()
        .ok()?;

    Some(guard)
}
