//! Tracing subscriber setup
//!
//! `RUST_LOG` wins over the configured level; `-v` wins over both.

use crate::config::{LogConfig, LogEncoding};
use crate::error::{DroverError, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter for the given settings
pub fn filter(config: &LogConfig, verbose: bool) -> Result<EnvFilter> {
    if verbose {
        return Ok(EnvFilter::new("debug"));
    }
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            DroverError::config(format!("invalid log level '{}': {}", config.level, e))
        }),
    }
}

/// Install the global subscriber; call once at startup
pub fn init(config: &LogConfig, verbose: bool) -> Result<()> {
    let filter = filter(config, verbose)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.encoding {
        LogEncoding::Console => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
        LogEncoding::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init(),
    };
    installed.map_err(|e| DroverError::config(format!("failed to install logger: {}", e)))
}
