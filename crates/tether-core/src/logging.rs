//! Logging setup.
//!
//! Library code only emits `tracing` events. Binaries and tests call
//! [`init`] or [`init_test`] once to install a subscriber.

use crate::error::{Result, TetherError};
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset (e.g. `info`,
    /// `tether_core=debug`).
    pub level: String,
    /// Emit one JSON object per line instead of human-readable text.
    pub json: bool,
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            with_target: false,
        }
    }
}

/// Install the global subscriber. `RUST_LOG` overrides `config.level`.
pub fn init(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| TetherError::Config {
            message: format!("invalid log filter {:?}: {}", config.level, e),
        })?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target)
        .with_thread_ids(false);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
    result.map_err(|e| TetherError::Config {
        message: format!("logging already initialized: {}", e),
    })?;

    tracing::info!(level = %config.level, json = config.json, "Logging initialized");
    Ok(())
}

/// Initialize logging for tests (captured by the test harness).
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
