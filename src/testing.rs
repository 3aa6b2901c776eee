//! Fakes and fixtures shared by unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;

use crate::crypto::generate_keypair;
use crate::db::{Repository, init_in_memory};
use crate::error::{ConfidantError, Result};
use crate::events::{Event, EventLog, EventQuery, EventStore, EventType, Dispatcher};
use crate::integrations::{
    Integration, IntegrationFilter, IntegrationHandler, IntegrationMetadata, IntegrationRegistry,
    IntegrationRepository, IntegrationType, MetadataCipher, MetadataStore, NewIntegration,
    PendingEntry,
};
use crate::jobs::SendOptions;

/// Handler that records what it receives and fails on demand.
pub struct FakeHandler {
    events: Mutex<Vec<Event>>,
    failures_left: AtomicUsize,
    fatal: bool,
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl FakeHandler {
    fn build(failures: usize, fatal: bool) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            failures_left: AtomicUsize::new(failures),
            fatal,
            gate: None,
        }
    }

    pub fn ok() -> Self {
        Self::build(0, false)
    }

    pub fn always_failing() -> Self {
        Self::build(usize::MAX, false)
    }

    pub fn fatal() -> Self {
        Self::build(usize::MAX, true)
    }

    /// Signals `entered`, then waits for `release` before succeeding.
    pub fn gated(entered: Arc<Notify>, release: Arc<Notify>) -> Self {
        Self {
            gate: Some((entered, release)),
            ..Self::ok()
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl IntegrationHandler for FakeHandler {
    async fn emit_event(
        &self,
        integration: &Integration,
        event: &Event,
        _metadata: &IntegrationMetadata,
    ) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());

        if let Some((entered, release)) = &self.gate {
            entered.notify_one();
            release.notified().await;
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        match (failing, self.fatal) {
            (false, _) => Ok(()),
            (true, false) => Err(ConfidantError::integration(&integration.id, "unreachable")),
            (true, true) => Err(ConfidantError::integration_rejected(&integration.id, "rejected")),
        }
    }
}

/// Integration repository that counts metadata writes and can fail listings.
pub struct CountingRepo {
    inner: Arc<Repository>,
    pub updates: AtomicUsize,
    pub fail_list: AtomicBool,
}

impl CountingRepo {
    pub fn new(inner: Arc<Repository>) -> Self {
        Self {
            inner,
            updates: AtomicUsize::new(0),
            fail_list: AtomicBool::new(false),
        }
    }
}

impl IntegrationRepository for CountingRepo {
    fn find_integrations(&self, filter: &IntegrationFilter) -> Result<Vec<Integration>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(ConfidantError::Db(rusqlite::Error::InvalidQuery));
        }
        self.inner.find_integrations(filter)
    }

    fn get_integration(&self, id: &str) -> Result<Option<Integration>> {
        self.inner.get_integration(id)
    }

    fn insert_integration(&self, integration: &NewIntegration) -> Result<Integration> {
        self.inner.insert_integration(integration)
    }

    fn update_integration_metadata(
        &self,
        id: &str,
        blob: &str,
        expected_version: i64,
    ) -> Result<bool> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.inner.update_integration_metadata(id, blob, expected_version)
    }

    fn set_integration_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        self.inner.set_integration_enabled(id, enabled)
    }

    fn delete_integration(&self, id: &str) -> Result<bool> {
        self.inner.delete_integration(id)
    }
}

/// An in-memory database plus a server key.
pub struct Fixture {
    pub repo: Arc<Repository>,
    pub cipher: Arc<MetadataCipher>,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            repo: Arc::new(Repository::new(init_in_memory().unwrap())),
            cipher: Arc::new(MetadataCipher::new(generate_keypair().private)),
        }
    }

    pub fn metadata_store(&self) -> MetadataStore {
        MetadataStore::new(self.repo.clone(), self.cipher.clone())
    }

    pub fn integration(
        &self,
        workspace_id: &str,
        kind: IntegrationType,
        notify_on: Vec<EventType>,
        pending: Vec<PendingEntry>,
    ) -> Integration {
        let mut metadata = IntegrationMetadata::new(json!({"url": "https://example.test/hook"}));
        metadata.pending_cleanup = pending;
        self.repo
            .insert_integration(&NewIntegration {
                workspace_id: workspace_id.to_string(),
                kind,
                name: format!("{} integration", kind),
                notify_on,
                encrypted_metadata: self.cipher.seal(&metadata).unwrap(),
            })
            .unwrap()
    }

    /// An integration this fixture's server key cannot open.
    pub fn integration_sealed_for_another_server(
        &self,
        workspace_id: &str,
        kind: IntegrationType,
    ) -> Integration {
        let foreign = MetadataCipher::new(generate_keypair().private);
        let mut metadata = IntegrationMetadata::new(json!({}));
        metadata.add_pending(PendingEntry::new("env-x", EventType::EnvironmentDeleted));
        self.repo
            .insert_integration(&NewIntegration {
                workspace_id: workspace_id.to_string(),
                kind,
                name: "foreign".to_string(),
                notify_on: vec![],
                encrypted_metadata: foreign.seal(&metadata).unwrap(),
            })
            .unwrap()
    }

    pub fn pending(&self, integration_id: &str) -> Vec<PendingEntry> {
        self.metadata_store()
            .load(integration_id)
            .unwrap()
            .1
            .pending_cleanup
    }

    pub fn events(&self, workspace_id: &str) -> Vec<Event> {
        self.repo
            .list_events(&EventQuery {
                workspace_id: Some(workspace_id.to_string()),
                ..Default::default()
            })
            .unwrap()
    }

    pub fn dispatcher(&self, registry: IntegrationRegistry) -> Dispatcher {
        Dispatcher::new(
            EventLog::new(self.repo.clone()),
            Arc::new(registry),
            self.repo.clone(),
            self.metadata_store(),
            self.repo.clone(),
            SendOptions {
                retry_limit: 3,
                retry_backoff_secs: 0,
            },
        )
    }
}
