//! Tracing subscriber setup.

use std::env;
use std::str::FromStr;

use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{ConfidantError, Result};

/// Install the global fmt subscriber. `RUST_LOG` overrides the configured
/// level and `LOG_FORMAT=json` forces JSON output. Logs go to stderr so
/// command output on stdout stays clean.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let directive = env::var("RUST_LOG").unwrap_or_else(|_| config.level().to_string());
    let filter = EnvFilter::from_str(&directive)
        .map_err(|e| ConfidantError::config(format!("invalid log filter '{}': {}", directive, e)))?;

    let json = config.json() || env::var("LOG_FORMAT").is_ok_and(|f| f == "json");

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let result = if json {
        subscriber.json().try_init()
    } else {
        subscriber.try_init()
    };

    if let Err(e) = result {
        warn!(
            "Failed to initialize logging, potentially because it is already initialized: {}",
            e
        );
    }

    Ok(())
}
