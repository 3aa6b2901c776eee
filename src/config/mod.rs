//! Configuration loading and management.

mod loader;
mod types;

pub use types::{
    Config, CryptoConfig, DatabaseConfig, LoggingConfig, QueueConfig, ReconcilerConfig,
};
