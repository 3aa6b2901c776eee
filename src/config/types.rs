//! Configuration type definitions.

use knuffel::Decode;
use std::path::PathBuf;

use crate::error::ConfidantError;

pub const DEFAULT_DATABASE_PATH: &str = "./confidant.db";
pub const DEFAULT_SERVER_KEY_ENV: &str = "CONFIDANT_SERVER_KEY";
pub const DEFAULT_PASSPHRASE_ENV: &str = "CONFIDANT_KEY_PASSPHRASE";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_RETRY_LIMIT: u32 = 5;
pub const DEFAULT_RETRY_BACKOFF_SECS: u64 = 5;
pub const DEFAULT_RECONCILE_SCHEDULE: &str = "*/5 * * * *";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Expand tilde (~) prefix to the user's home directory.
/// Handles both "~" alone and "~/path/to/something" patterns.
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(path)
}

/// Main configuration structure parsed from confidant.kdl.
#[derive(Debug, Decode, Clone, Default)]
pub struct Config {
    #[knuffel(child)]
    pub database: Option<DatabaseConfig>,

    #[knuffel(child)]
    pub crypto: Option<CryptoConfig>,

    #[knuffel(child)]
    pub queue: Option<QueueConfig>,

    #[knuffel(child)]
    pub reconciler: Option<ReconcilerConfig>,

    #[knuffel(child)]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Decode, Clone, Default)]
pub struct DatabaseConfig {
    #[knuffel(property)]
    pub path: Option<String>,
}

/// Where the server finds its key material. Values are names of environment
/// variables, never the keys themselves.
#[derive(Debug, Decode, Clone, Default)]
pub struct CryptoConfig {
    #[knuffel(property(name = "server_key_env"))]
    pub server_key_env: Option<String>,

    #[knuffel(property(name = "passphrase_env"))]
    pub passphrase_env: Option<String>,
}

#[derive(Debug, Decode, Clone, Default)]
pub struct QueueConfig {
    #[knuffel(property(name = "poll_interval_ms"))]
    pub poll_interval_ms: Option<u64>,

    #[knuffel(property(name = "retry_limit"))]
    pub retry_limit: Option<u32>,

    #[knuffel(property(name = "retry_backoff_secs"))]
    pub retry_backoff_secs: Option<u64>,
}

#[derive(Debug, Decode, Clone, Default)]
pub struct ReconcilerConfig {
    /// Cron expression, 5-field (minutes) or 6/7-field (seconds).
    #[knuffel(property)]
    pub schedule: Option<String>,

    #[knuffel(property(name = "max_attempts"))]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Decode, Clone, Default)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset.
    #[knuffel(property)]
    pub level: Option<String>,

    /// "text" or "json".
    #[knuffel(property)]
    pub format: Option<String>,
}

impl LoggingConfig {
    pub fn level(&self) -> &str {
        self.level.as_deref().unwrap_or("info")
    }

    pub fn json(&self) -> bool {
        self.format.as_deref() == Some("json")
    }
}

impl Config {
    /// Path of the SQLite database, defaulting to "./confidant.db".
    /// Expands ~ to the user's home directory if present.
    pub fn db_path(&self) -> PathBuf {
        self.database
            .as_ref()
            .and_then(|d| d.path.as_deref())
            .map(expand_tilde)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH))
    }

    pub fn server_key_env(&self) -> &str {
        self.crypto
            .as_ref()
            .and_then(|c| c.server_key_env.as_deref())
            .unwrap_or(DEFAULT_SERVER_KEY_ENV)
    }

    pub fn passphrase_env(&self) -> &str {
        self.crypto
            .as_ref()
            .and_then(|c| c.passphrase_env.as_deref())
            .unwrap_or(DEFAULT_PASSPHRASE_ENV)
    }

    pub fn poll_interval_ms(&self) -> u64 {
        self.queue
            .as_ref()
            .and_then(|q| q.poll_interval_ms)
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS)
    }

    pub fn retry_limit(&self) -> u32 {
        self.queue
            .as_ref()
            .and_then(|q| q.retry_limit)
            .unwrap_or(DEFAULT_RETRY_LIMIT)
    }

    pub fn retry_backoff_secs(&self) -> u64 {
        self.queue
            .as_ref()
            .and_then(|q| q.retry_backoff_secs)
            .unwrap_or(DEFAULT_RETRY_BACKOFF_SECS)
    }

    pub fn reconcile_schedule(&self) -> &str {
        self.reconciler
            .as_ref()
            .and_then(|r| r.schedule.as_deref())
            .unwrap_or(DEFAULT_RECONCILE_SCHEDULE)
    }

    /// Failed attempts after which a pending cleanup entry is abandoned.
    pub fn max_attempts(&self) -> u32 {
        self.reconciler
            .as_ref()
            .and_then(|r| r.max_attempts)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS)
    }

    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }

    /// Get a setting value as string, keyed `node.property`.
    pub fn get(&self, key: &str) -> crate::error::Result<String> {
        let value = match key {
            "database.path" => self.db_path().to_string_lossy().to_string(),
            "crypto.server_key_env" => self.server_key_env().to_string(),
            "crypto.passphrase_env" => self.passphrase_env().to_string(),
            "queue.poll_interval_ms" => self.poll_interval_ms().to_string(),
            "queue.retry_limit" => self.retry_limit().to_string(),
            "queue.retry_backoff_secs" => self.retry_backoff_secs().to_string(),
            "reconciler.schedule" => self.reconcile_schedule().to_string(),
            "reconciler.max_attempts" => self.max_attempts().to_string(),
            "logging.level" => self.logging().level().to_string(),
            "logging.format" => {
                if self.logging().json() {
                    "json".to_string()
                } else {
                    "text".to_string()
                }
            }
            _ => {
                return Err(ConfidantError::config(format!(
                    "Unknown setting: {}. Valid settings: {}",
                    key,
                    Self::KEYS.join(", ")
                )));
            }
        };
        Ok(value)
    }

    pub const KEYS: &'static [&'static str] = &[
        "database.path",
        "crypto.server_key_env",
        "crypto.passphrase_env",
        "queue.poll_interval_ms",
        "queue.retry_limit",
        "queue.retry_backoff_secs",
        "reconciler.schedule",
        "reconciler.max_attempts",
        "logging.level",
        "logging.format",
    ];
}
