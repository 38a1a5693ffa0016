//! Tracing subscriber setup.
//!
//! Logs go to a rotating file under the configured log directory and, when
//! running in the foreground, to stdout as well. `RUST_LOG` takes precedence
//! over the configured level.

use std::fs;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

/// Prefix of every log file name.
const LOG_FILE_PREFIX: &str = "termgate";

/// Keeps the background log writer alive. Flushes on drop.
#[must_use = "dropping the guard stops file logging"]
pub struct LogGuard {
    _worker: WorkerGuard,
}

/// Parses a rotation period name. Unknown names fall back to daily.
pub fn parse_rotation(name: &str) -> Rotation {
    match name.to_lowercase().as_str() {
        "minutely" => Rotation::MINUTELY,
        "hourly" => Rotation::HOURLY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}

/// Builds the rolling file appender described by `config`.
///
/// # Errors
///
/// Fails if the log directory cannot be created or opened.
pub fn file_appender(config: &Config) -> Result<RollingFileAppender> {
    let dir = config.log_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

    RollingFileAppender::builder()
        .rotation(parse_rotation(&config.log.rotation))
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(config.log.max_files.max(1))
        .build(&dir)
        .with_context(|| format!("Failed to open log file in {}", dir.display()))
}

/// Installs the global subscriber.
///
/// `foreground` adds a console layer on stdout.
///
/// # Errors
///
/// Fails if the log file cannot be opened or a global subscriber is
/// already installed.
pub fn init(config: &Config, foreground: bool) -> Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.daemon.log_level.to_lowercase()));

    let (writer, worker) = tracing_appender::non_blocking(file_appender(config)?);
    let file_layer = fmt::layer().with_writer(writer).with_ansi(false);
    let console_layer = foreground.then(|| fmt::layer().with_target(false));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LogGuard { _worker: worker })
}
