//! Log setup for the `veil` binary.
//!
//! `veil run` hosts a module for a whole lifecycle, so it gets
//! [`init_production`]: a JSON file under `~/.veil/logs` plus stderr.
//! `veil stage` and `veil clear` are one-shot and use [`init_cli`].
//!
//! Messages a module emits through its `veil.log` import are recorded under
//! the [`GUEST_LOG_TARGET`] target, so they can be filtered apart from host
//! events, e.g. `RUST_LOG=info,veil::module=warn`.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub use crate::loader::GUEST_LOG_TARGET;

/// File name prefix for the rotated run log.
const LOG_FILE_PREFIX: &str = "veil.log";

/// Filter used when `RUST_LOG` is unset: host events at `info`, module
/// messages down to `debug`.
pub const DEFAULT_FILTER: &str = "info,veil::module=debug";

/// Keeps the run log's background writer alive.
///
/// Dropping it flushes what the module and host logged so far.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install logging for `veil run`.
///
/// Lifecycle events and module messages go to
/// `{logs_dir}/veil.log.YYYY-MM-DD` as JSON (rotated daily) and to stderr.
///
/// # Errors
///
/// Fails if `logs_dir` cannot be created or a subscriber is already set.
pub fn init_production(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        anyhow::anyhow!(
            "failed to create logs directory {}: {e}",
            logs_dir.display()
        )
    })?;

    let (run_log, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX));

    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().json().with_writer(run_log))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))?;

    Ok(LoggingGuard { _guard: guard })
}

/// Install stderr logging for `veil stage` and `veil clear`.
///
/// Nothing is written to disk. A second call is a no-op.
pub fn init_cli() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .try_init();
}
