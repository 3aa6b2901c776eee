//! Integration metadata: the sealed `{config, pendingCleanup}` blob and the
//! optimistic read-modify-write cycle around it.
//!
//! The dispatcher (appending entries after a failed delivery) and the
//! reconciler (resolving entries) both rewrite the same blob. Every write goes
//! through [`MetadataStore::modify`], which re-reads the row, applies the
//! change to the freshly decrypted plaintext and writes it back only if the
//! row's `metadata_version` is still the one that was read. A lost race is
//! retried against the newer state, so neither writer drops the other's work.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{Integration, IntegrationRepository};
use crate::crypto::{PrivateKey, PublicKey, open_value, seal_value};
use crate::error::{ConfidantError, Result};
use crate::events::EventType;

const MAX_WRITE_ATTEMPTS: usize = 8;

/// One outstanding external side effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEntry {
    pub target_id: String,
    pub action: EventType,
    pub attempts: u32,
    pub first_seen_at: DateTime<Utc>,
}

impl PendingEntry {
    pub fn new(target_id: impl Into<String>, action: EventType) -> Self {
        Self {
            target_id: target_id.into(),
            action,
            attempts: 0,
            first_seen_at: Utc::now(),
        }
    }

    /// Entries are identified by what they owe, not by when they were seen.
    pub fn key(&self) -> (&str, EventType) {
        (&self.target_id, self.action)
    }
}

/// Decrypted integration metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationMetadata {
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub pending_cleanup: Vec<PendingEntry>,
}

impl IntegrationMetadata {
    pub fn new(config: Value) -> Self {
        Self {
            config,
            pending_cleanup: Vec::new(),
        }
    }

    /// Add an entry unless one with the same key is already pending.
    /// Returns whether the metadata changed.
    pub fn add_pending(&mut self, entry: PendingEntry) -> bool {
        if self.pending_cleanup.iter().any(|e| e.key() == entry.key()) {
            return false;
        }
        self.pending_cleanup.push(entry);
        true
    }
}

/// Seals integration metadata with the server keypair.
pub struct MetadataCipher {
    public: PublicKey,
    private: PrivateKey,
}

impl MetadataCipher {
    pub fn new(private: PrivateKey) -> Self {
        Self {
            public: private.public_key(),
            private,
        }
    }

    /// Build from the hex private key held in the environment variable `var`.
    pub fn from_env(var: &str) -> Result<Self> {
        let hex = std::env::var(var).map_err(|_| {
            ConfidantError::config(format!(
                "{} is not set; generate a server key with `confidant keygen`",
                var
            ))
        })?;
        Ok(Self::new(hex.parse()?))
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn seal(&self, metadata: &IntegrationMetadata) -> Result<String> {
        let plaintext = serde_json::to_string(metadata)?;
        seal_value(&plaintext, &self.public)
    }

    pub fn open(&self, blob: &str) -> Result<IntegrationMetadata> {
        let plaintext = open_value(blob, &self.private)?;
        serde_json::from_str(&plaintext)
            .map_err(|e| ConfidantError::decryption(format!("metadata is not valid JSON: {}", e)))
    }
}

/// Read-modify-write access to integration metadata.
#[derive(Clone)]
pub struct MetadataStore {
    repo: Arc<dyn IntegrationRepository>,
    cipher: Arc<MetadataCipher>,
}

impl MetadataStore {
    pub fn new(repo: Arc<dyn IntegrationRepository>, cipher: Arc<MetadataCipher>) -> Self {
        Self { repo, cipher }
    }

    pub fn cipher(&self) -> &MetadataCipher {
        &self.cipher
    }

    pub fn open(&self, integration: &Integration) -> Result<IntegrationMetadata> {
        self.cipher.open(&integration.encrypted_metadata)
    }

    pub fn load(&self, id: &str) -> Result<(Integration, IntegrationMetadata)> {
        let integration = self
            .repo
            .get_integration(id)?
            .ok_or_else(|| ConfidantError::not_found(format!("integration {} not found", id)))?;
        let metadata = self.open(&integration)?;
        Ok((integration, metadata))
    }

    /// Apply `change` to the latest metadata and persist it. `change` returns
    /// whether it modified anything; nothing is written when it did not. On a
    /// version conflict the row is re-read and `change` runs again.
    pub fn modify<F>(&self, id: &str, mut change: F) -> Result<bool>
    where
        F: FnMut(&mut IntegrationMetadata) -> bool,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let (integration, mut metadata) = self.load(id)?;
            if !change(&mut metadata) {
                return Ok(false);
            }

            let blob = self.cipher.seal(&metadata)?;
            if self
                .repo
                .update_integration_metadata(id, &blob, integration.metadata_version)?
            {
                return Ok(true);
            }

            debug!(
                integration_id = %id,
                attempt,
                "Metadata changed underneath us, retrying"
            );
        }

        Err(ConfidantError::conflict(format!("integration {}", id)))
    }

    /// Record a failed side effect. Duplicate `(targetId, action)` pairs keep
    /// the entry already pending.
    pub fn append_pending(&self, id: &str, entry: PendingEntry) -> Result<bool> {
        self.modify(id, |metadata| metadata.add_pending(entry.clone()))
    }
}
