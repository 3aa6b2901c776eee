//! The integration handler table.
//!
//! Built once at startup and passed to the dispatcher, the queue workers and
//! the reconciler. Adding an integration type means adding an
//! [`IntegrationType`] variant and a row here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{IntegrationHandler, IntegrationType, SlackHandler, WebhookHandler};
use crate::error::{ConfidantError, Result};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct IntegrationRegistry {
    handlers: HashMap<IntegrationType, Arc<dyn IntegrationHandler>>,
}

impl IntegrationRegistry {
    /// An empty table. Mostly useful for tests that register fakes.
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// The production table: one HTTP handler per integration type, sharing
    /// one client.
    pub fn with_defaults() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("confidant/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfidantError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self::empty()
            .with(IntegrationType::Slack, SlackHandler::new(client.clone()))
            .with(IntegrationType::Webhook, WebhookHandler::new(client)))
    }

    /// Add or replace the handler for `kind`.
    pub fn with(mut self, kind: IntegrationType, handler: impl IntegrationHandler + 'static) -> Self {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    /// Like [`with`](Self::with) for a handler the caller keeps a handle to.
    pub fn with_shared(mut self, kind: IntegrationType, handler: Arc<dyn IntegrationHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn resolve(&self, kind: IntegrationType) -> Result<Arc<dyn IntegrationHandler>> {
        self.handlers.get(&kind).cloned().ok_or_else(|| {
            ConfidantError::not_found(format!("no handler registered for {} integrations", kind))
        })
    }

    /// Registered types, in declaration order.
    pub fn kinds(&self) -> Vec<IntegrationType> {
        IntegrationType::ALL
            .into_iter()
            .filter(|kind| self.handlers.contains_key(kind))
            .collect()
    }
}
