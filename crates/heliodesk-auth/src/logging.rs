//! Tracing subscriber setup for the host application.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Log file prefix inside the log directory (rotated daily).
const LOG_FILE_PREFIX: &str = "heliodesk.log";

/// `RUST_LOG` if set, otherwise `default_directive` (e.g. `"info"`).
///
/// # Errors
/// Returns an error if neither yields a valid filter.
pub fn build_filter(default_directive: &str) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .with_context(|| format!("Invalid log filter '{default_directive}'"))
}

/// Installs the global subscriber: stderr always, plus a daily-rolling file
/// in `log_dir` when given. Keep the returned guard alive for the lifetime of
/// the process or buffered file output is lost.
///
/// # Errors
/// Returns an error if the filter is invalid, the log directory cannot be
/// created, or a global subscriber is already installed.
pub fn init(default_directive: &str, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let registry = tracing_subscriber::registry()
        .with(build_filter(default_directive)?)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr));

    let Some(dir) = log_dir else {
        registry
            .try_init()
            .context("Failed to install tracing subscriber")?;
        return Ok(None);
    };

    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX));
    registry
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(Some(guard))
}
