//! Logging initialisation
//!
//! Logs go to the configured file when a path is given and to stdout
//! otherwise. Timestamps are UTC, formatted like `10 Oct; 14:03:22`.
//! Development mode lowers the default level to `debug`; `RUST_LOG` overrides
//! either default.

use crate::config::LoggingConfig;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;
use time::macros::format_description;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Logging setup errors
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Failed to open log file {path}: {source}")]
    OpenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Default filter directive for the given mode
pub fn default_directive(development: bool) -> &'static str {
    if development {
        "debug"
    } else {
        "info"
    }
}

/// Install the global subscriber
///
/// Returns `Ok(false)` when a subscriber was already installed, in which case
/// nothing changes.
pub fn init_logging(config: &LoggingConfig) -> Result<bool, LoggingError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config.development)));

    let timer = UtcTime::new(format_description!(
        "[month padding:none] [month repr:short]; [hour]:[minute]:[second]"
    ));

    let file_layer = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::OpenFile {
                    path: path.clone(),
                    source,
                })?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_timer(timer.clone())
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    let stdout_layer = file_layer
        .is_none()
        .then(|| fmt::layer().with_target(false).with_timer(timer));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    Ok(installed)
}
