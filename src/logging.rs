//! Tracing subscriber setup

use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins over the configured level. Returns `Ok(false)` when a
/// subscriber was already installed.
pub fn init(config: &LoggingConfig) -> Result<bool> {
    let filter = build_filter(config)?;

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_ansi(config.ansi)
        .with_target(false)
        .finish();

    Ok(tracing::subscriber::set_global_default(subscriber).is_ok())
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level)
        .map_err(|e| Error::Config(format!("Invalid log level {:?}: {}", config.level, e)))
}
