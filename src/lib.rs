//! confidant - versioned, encrypted configuration with integration delivery.
//!
//! This crate provides:
//! - Envelope encryption of secret values with per-project X25519 keys
//! - Append-only version histories with rollback per (entity, environment)
//! - An append-only event log, dispatched to Slack and webhook integrations
//! - A durable job queue and a reconciler that retries failed side effects
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use confidant::db::{Repository, init_in_memory};
//! use confidant::versions::{HistoryKey, VersionStore};
//!
//! fn main() -> confidant::Result<()> {
//!     let repo = Arc::new(Repository::new(init_in_memory()?));
//!     let versions = VersionStore::new(repo);
//!     let key = HistoryKey::new("entity-id", "environment-id");
//!
//!     if let Some(current) = versions.get_current(&key)? {
//!         println!("v{}: {}", current.version_number, current.value);
//!     }
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod commands;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod events;
pub mod integrations;
pub mod jobs;
pub mod logging;
pub mod reconciler;
pub mod service;
pub mod versions;

#[cfg(test)]
mod testing;

// Re-export commonly used types at the crate root
pub use config::Config;
pub use error::{ConfidantError, ErrorClass, Result};
pub use reconciler::{ReconcileReport, Reconciler};
pub use service::ConfigService;
