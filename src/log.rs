//! Structured logging for debugging prflow.
//!
//! Log levels:
//! - ERROR: failures that stop an operation from completing
//! - WARN: unexpected but recoverable conditions
//! - INFO: dispatch, escalation, eviction and persistence events
//! - DEBUG: per-poll traces and host calls
//! - TRACE: raw host payloads
//!
//! Debug mode can be enabled with the `--debug` flag or `PRFLOW_DEBUG=1`.
//! `RUST_LOG` overrides both.

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE: &str = "prflow.log";

fn env_debug() -> bool {
    std::env::var("PRFLOW_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Filter directive used when `RUST_LOG` is unset.
pub fn default_directive(debug: bool) -> &'static str {
    if debug {
        "prflow=debug,info"
    } else {
        "prflow=info,warn"
    }
}

pub fn log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".prflow").join(LOG_FILE))
}

/// Initialize logging to ~/.prflow/prflow.log.
///
/// The returned guard flushes the background writer on drop and must be
/// held for the life of the process. Returns `None` when no home directory
/// exists or a subscriber is already installed.
pub fn init_with_debug(debug: bool) -> Option<WorkerGuard> {
    let debug_enabled = debug || env_debug();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_enabled)));

    let path = log_path()?;
    let dir = path.parent()?.to_path_buf();
    std::fs::create_dir_all(&dir).ok()?;
    // Truncate on startup
    std::fs::write(&path, "").ok()?;

    let appender = tracing_appender::rolling::never(&dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false),
        )
        .try_init()
        .ok()?;

    tracing::info!(debug = debug_enabled, "logging initialized");
    Some(guard)
}
