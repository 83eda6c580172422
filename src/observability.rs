//! Logging setup
//!
//! Library code only emits `tracing` events; binaries and tests call
//! [`init_tracing`] once to install a subscriber.

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{RabiaError, Result};
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber described by `config`
///
/// `RUST_LOG` takes precedence over the configured level when it is set.
/// Fails if a global subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| RabiaError::ServiceUnavailable {
            service: "tracing".to_string(),
            reason: format!("invalid log filter '{}': {e}", config.level),
        })?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match config.format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| RabiaError::ServiceUnavailable {
        service: "tracing".to_string(),
        reason: e.to_string(),
    })
}
