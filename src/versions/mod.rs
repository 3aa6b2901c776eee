//! Version history per (entity, environment).
//!
//! History is append-only. Version numbers start at 1 and grow by one per
//! mutation, relative to the highest number ever recorded, so an update after
//! a rollback never reuses an abandoned number. The current pointer selects the
//! active version; rollback only moves the pointer. Every mutation is a single
//! repository transaction, so no reader sees a new version without its pointer.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{ConfidantError, Result};

/// Address of one version history.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HistoryKey {
    pub entity_id: String,
    pub environment_id: String,
}

impl HistoryKey {
    pub fn new(entity_id: impl Into<String>, environment_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            environment_id: environment_id.into(),
        }
    }
}

impl fmt::Display for HistoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.entity_id, self.environment_id)
    }
}

/// An immutable historical value. For secrets `value` is an encoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Version {
    pub entity_id: String,
    pub environment_id: String,
    pub version_number: i64,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

/// Pointer and flags for one history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionHead {
    pub current: i64,
    pub highest: i64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackOutcome {
    /// Steps actually applied after clamping to version 1.
    pub applied: u32,
    /// Version number the pointer now selects.
    pub current: i64,
}

/// Persistence for version histories. Implemented by [`crate::db::Repository`].
///
/// The mutating methods are each atomic.
pub trait VersionRepository: Send + Sync {
    /// Every version of a history, newest first.
    fn find_entity_versions(&self, key: &HistoryKey) -> Result<Vec<Version>>;

    fn find_version(&self, key: &HistoryKey, version_number: i64) -> Result<Option<Version>>;

    fn find_head(&self, key: &HistoryKey) -> Result<Option<VersionHead>>;

    /// Insert version 1 and a head pointing at it. `AlreadyExists` when the
    /// history already has a head.
    fn create_history(&self, key: &HistoryKey, value: &str, created_by: &str) -> Result<Version>;

    /// Insert version `highest + 1` and point the head at it. `NotFound`
    /// when the history does not exist.
    fn append_version(&self, key: &HistoryKey, value: &str, created_by: &str) -> Result<Version>;

    /// `append_version` when the history exists, `create_history` otherwise,
    /// decided and written in one transaction.
    fn write_version(&self, key: &HistoryKey, value: &str, created_by: &str) -> Result<Version>;

    /// Point the head at an existing version.
    fn set_current_pointer(&self, key: &HistoryKey, version_number: i64) -> Result<()>;

    /// Move the head back by `min(count, current - 1)` and report the result.
    fn rollback_pointer(&self, key: &HistoryKey, count: u32) -> Result<RollbackOutcome>;

    fn set_enabled(&self, key: &HistoryKey, enabled: bool) -> Result<()>;

    /// Remove the histories of an entity, optionally restricted to one environment.
    fn delete_history(&self, entity_id: &str, environment_id: Option<&str>) -> Result<usize>;
}

/// Operations over version histories.
#[derive(Clone)]
pub struct VersionStore {
    repo: Arc<dyn VersionRepository>,
}

impl VersionStore {
    pub fn new(repo: Arc<dyn VersionRepository>) -> Self {
        Self { repo }
    }

    /// Start a history at version 1.
    pub fn create(&self, key: &HistoryKey, value: &str, created_by: &str) -> Result<Version> {
        self.repo.create_history(key, value, created_by)
    }

    /// Append a new version and make it current.
    pub fn update(&self, key: &HistoryKey, value: &str, created_by: &str) -> Result<Version> {
        self.repo.append_version(key, value, created_by)
    }

    /// Append to the history, or start it when none exists yet.
    pub fn write(&self, key: &HistoryKey, value: &str, created_by: &str) -> Result<Version> {
        self.repo.write_version(key, value, created_by)
    }

    /// Move the pointer back by up to `count` versions. Never fails on an
    /// oversized count; the applied amount is reported instead.
    pub fn rollback(&self, key: &HistoryKey, count: u32) -> Result<RollbackOutcome> {
        self.repo.rollback_pointer(key, count)
    }

    /// Point the history at a specific earlier (or later) version.
    pub fn restore(&self, key: &HistoryKey, version_number: i64) -> Result<Version> {
        let version = self.get_version(key, version_number)?;
        self.repo.set_current_pointer(key, version_number)?;
        Ok(version)
    }

    /// The version the pointer selects, or `None` when the history has never
    /// been written.
    pub fn get_current(&self, key: &HistoryKey) -> Result<Option<Version>> {
        let Some(head) = self.repo.find_head(key)? else {
            return Ok(None);
        };
        self.repo.find_version(key, head.current)
    }

    pub fn get_version(&self, key: &HistoryKey, version_number: i64) -> Result<Version> {
        self.repo
            .find_version(key, version_number)?
            .ok_or_else(|| {
                ConfidantError::not_found(format!(
                    "version {} of {} not found",
                    version_number, key
                ))
            })
    }

    /// Full history, newest first.
    pub fn history(&self, key: &HistoryKey) -> Result<Vec<Version>> {
        self.repo.find_entity_versions(key)
    }

    pub fn exists(&self, key: &HistoryKey) -> Result<bool> {
        Ok(self.repo.find_head(key)?.is_some())
    }

    pub fn set_enabled(&self, key: &HistoryKey, enabled: bool) -> Result<()> {
        self.repo.set_enabled(key, enabled)
    }

    pub fn is_enabled(&self, key: &HistoryKey) -> Result<bool> {
        self.repo
            .find_head(key)?
            .map(|head| head.enabled)
            .ok_or_else(|| ConfidantError::not_found(format!("no version history for {}", key)))
    }

    pub fn delete_entity_history(&self, entity_id: &str) -> Result<usize> {
        self.repo.delete_history(entity_id, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Repository, init_in_memory};

    fn store() -> (VersionStore, HistoryKey) {
        let repo = Repository::new(init_in_memory().unwrap());
        let (entity, env) = repo.seed_entity_for_tests();
        (VersionStore::new(Arc::new(repo)), HistoryKey::new(entity, env))
    }

    #[test]
    fn create_then_updates_advance_pointer() {
        let (store, key) = store();
        store.create(&key, "v0", "alice").unwrap();
        for i in 1..=4 {
            store.update(&key, &format!("v{}", i), "alice").unwrap();
        }

        let current = store.get_current(&key).unwrap().unwrap();
        assert_eq!(current.version_number, 5);
        assert_eq!(current.value, "v4");
        assert_eq!(store.history(&key).unwrap().len(), 5);
    }

    #[test]
    fn create_twice_is_rejected() {
        let (store, key) = store();
        store.create(&key, "a", "alice").unwrap();
        let err = store.create(&key, "b", "alice").unwrap_err();
        assert!(matches!(err, ConfidantError::AlreadyExists(_)));
    }

    #[test]
    fn missing_history_is_not_found() {
        let (store, key) = store();
        assert!(store.get_current(&key).unwrap().is_none());
        assert!(matches!(
            store.update(&key, "x", "alice"),
            Err(ConfidantError::NotFound(_))
        ));
        assert!(matches!(store.rollback(&key, 1), Err(ConfidantError::NotFound(_))));
        assert!(matches!(store.is_enabled(&key), Err(ConfidantError::NotFound(_))));
        assert!(matches!(
            store.set_enabled(&key, false),
            Err(ConfidantError::NotFound(_))
        ));
    }

    #[test]
    fn oversized_rollback_clamps_to_version_one() {
        let (store, key) = store();
        store.create(&key, "v1", "alice").unwrap();
        store.update(&key, "v2", "alice").unwrap();
        store.update(&key, "v3", "alice").unwrap();

        let outcome = store.rollback(&key, 10).unwrap();
        assert_eq!(outcome, RollbackOutcome { applied: 2, current: 1 });
        assert_eq!(store.get_current(&key).unwrap().unwrap().value, "v1");

        let again = store.rollback(&key, 1).unwrap();
        assert_eq!(again.applied, 0);
    }

    #[test]
    fn update_after_rollback_never_reuses_numbers() {
        let (store, key) = store();
        store.create(&key, "v1", "alice").unwrap();
        store.update(&key, "v2", "alice").unwrap();
        store.update(&key, "v3", "alice").unwrap();
        store.rollback(&key, 2).unwrap();

        let redo = store.update(&key, "v4", "bob").unwrap();
        assert_eq!(redo.version_number, 4);
        assert_eq!(store.get_current(&key).unwrap().unwrap().value, "v4");
        // abandoned versions are still there
        assert_eq!(store.get_version(&key, 3).unwrap().value, "v3");
    }

    #[test]
    fn enabled_flag_is_independent_of_pointer() {
        let (store, key) = store();
        store.create(&key, "v1", "alice").unwrap();
        store.update(&key, "v2", "alice").unwrap();
        assert!(store.is_enabled(&key).unwrap());

        store.set_enabled(&key, false).unwrap();
        assert!(!store.is_enabled(&key).unwrap());
        assert_eq!(store.get_current(&key).unwrap().unwrap().version_number, 2);
    }

    #[test]
    fn restore_points_at_requested_version() {
        let (store, key) = store();
        store.create(&key, "v1", "alice").unwrap();
        store.update(&key, "v2", "alice").unwrap();

        store.restore(&key, 1).unwrap();
        assert_eq!(store.get_current(&key).unwrap().unwrap().value, "v1");
        assert!(matches!(store.restore(&key, 9), Err(ConfidantError::NotFound(_))));
    }

    #[test]
    fn delete_history_removes_all_environments() {
        let (store, key) = store();
        store.create(&key, "v1", "alice").unwrap();
        assert_eq!(store.delete_entity_history(&key.entity_id).unwrap(), 1);
        assert!(!store.exists(&key).unwrap());
    }
}
