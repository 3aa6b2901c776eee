//! Integrations: external systems that receive configuration-change events.
//!
//! Each integration row carries an encrypted metadata blob holding its
//! configuration and its `pendingCleanup` backlog. Handlers are resolved
//! through the [`IntegrationRegistry`] by [`IntegrationType`], never by
//! inspecting the handler itself.

pub mod metadata;
pub mod registry;
pub mod slack;
pub mod webhook;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::error::{ConfidantError, Result};
use crate::events::{Event, EventType, Severity};

pub use metadata::{IntegrationMetadata, MetadataCipher, MetadataStore, PendingEntry};
pub use registry::IntegrationRegistry;
pub use slack::SlackHandler;
pub use webhook::WebhookHandler;

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntegrationType {
    Slack,
    Webhook,
}

impl IntegrationType {
    pub const ALL: [IntegrationType; 2] = [IntegrationType::Slack, IntegrationType::Webhook];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationType::Slack => "slack",
            IntegrationType::Webhook => "webhook",
        }
    }

    /// Job queue that carries guaranteed deliveries for this type.
    pub fn queue_name(&self) -> String {
        format!("integration.{}", self.as_str())
    }

    /// Check that `config` has what the handler needs.
    pub fn validate_config(&self, config: &Value) -> Result<()> {
        let required = match self {
            IntegrationType::Slack => "webhookUrl",
            IntegrationType::Webhook => "url",
        };
        match config.get(required).and_then(Value::as_str) {
            Some(url) if url.starts_with("http://") || url.starts_with("https://") => Ok(()),
            Some(url) => Err(ConfidantError::validation(format!(
                "{} integration: '{}' is not an http(s) URL: {}",
                self, required, url
            ))),
            None => Err(ConfidantError::validation(format!(
                "{} integration requires config.{}",
                self, required
            ))),
        }
    }
}

impl fmt::Display for IntegrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntegrationType {
    type Err = ConfidantError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "slack" => Ok(IntegrationType::Slack),
            "webhook" => Ok(IntegrationType::Webhook),
            other => Err(ConfidantError::validation(format!(
                "unknown integration type: {}. Valid types: slack, webhook",
                other
            ))),
        }
    }
}

/// An integration row. `encrypted_metadata` is opaque outside [`metadata`].
#[derive(Debug, Clone)]
pub struct Integration {
    pub id: String,
    pub workspace_id: String,
    pub kind: IntegrationType,
    pub name: String,
    /// Event types this integration wants; empty means all of them.
    pub notify_on: Vec<EventType>,
    pub enabled: bool,
    pub encrypted_metadata: String,
    /// Incremented on every metadata write; the optimistic-concurrency token.
    pub metadata_version: i64,
    pub created_at: DateTime<Utc>,
}

impl Integration {
    pub fn subscribes_to(&self, event_type: EventType) -> bool {
        self.notify_on.is_empty() || self.notify_on.contains(&event_type)
    }
}

#[derive(Debug, Clone)]
pub struct NewIntegration {
    pub workspace_id: String,
    pub kind: IntegrationType,
    pub name: String,
    pub notify_on: Vec<EventType>,
    pub encrypted_metadata: String,
}

#[derive(Debug, Clone, Default)]
pub struct IntegrationFilter {
    pub workspace_id: Option<String>,
    pub kind: Option<IntegrationType>,
    pub enabled_only: bool,
}

impl IntegrationFilter {
    /// Every integration, enabled or not.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn active_in(workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: Some(workspace_id.into()),
            kind: None,
            enabled_only: true,
        }
    }
}

/// Persistence for integrations. Implemented by [`crate::db::Repository`].
pub trait IntegrationRepository: Send + Sync {
    fn find_integrations(&self, filter: &IntegrationFilter) -> Result<Vec<Integration>>;

    fn get_integration(&self, id: &str) -> Result<Option<Integration>>;

    fn insert_integration(&self, integration: &NewIntegration) -> Result<Integration>;

    /// Compare-and-swap the metadata blob. Returns `false` without writing
    /// when the stored version is no longer `expected_version`.
    fn update_integration_metadata(
        &self,
        id: &str,
        blob: &str,
        expected_version: i64,
    ) -> Result<bool>;

    fn set_integration_enabled(&self, id: &str, enabled: bool) -> Result<()>;

    fn delete_integration(&self, id: &str) -> Result<bool>;
}

// =============================================================================
// Handlers
// =============================================================================

/// Pushes configuration changes to one kind of external system.
///
/// Delivery is at-least-once: the same event (or the same pending
/// `(targetId, action)`) may arrive more than once and must be safe to repeat.
/// Errors should carry the right class: `ConfidantError::integration` for
/// transient failures, `ConfidantError::integration_rejected` for permanent ones.
#[async_trait]
pub trait IntegrationHandler: Send + Sync {
    async fn emit_event(
        &self,
        integration: &Integration,
        event: &Event,
        metadata: &IntegrationMetadata,
    ) -> Result<()>;

    /// Retry an outstanding side effect. By default the action is replayed as
    /// a synthesized event for the entry's target.
    async fn resolve_pending(
        &self,
        integration: &Integration,
        entry: &PendingEntry,
        metadata: &IntegrationMetadata,
    ) -> Result<()> {
        let event = synthesize_event(integration, entry);
        self.emit_event(integration, &event, metadata).await
    }
}

/// An unrecorded event standing in for a pending entry's original event.
pub fn synthesize_event(integration: &Integration, entry: &PendingEntry) -> Event {
    Event {
        id: 0,
        workspace_id: integration.workspace_id.clone(),
        source: entry.action.source(),
        event_type: entry.action,
        severity: Severity::Warn,
        triggerer: "reconciler".to_string(),
        target_id: entry.target_id.clone(),
        timestamp: Utc::now(),
        metadata: json!({
            "retry": true,
            "attempts": entry.attempts,
            "firstSeenAt": entry.first_seen_at,
        }),
    }
}

/// Map an HTTP response status to an integration error of the right class.
pub(crate) fn status_error(integration: &Integration, status: reqwest::StatusCode) -> ConfidantError {
    let message = format!("{} responded with HTTP {}", integration.kind, status);
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        ConfidantError::integration(&integration.id, message)
    } else {
        ConfidantError::integration_rejected(&integration.id, message)
    }
}

/// Read a string field of the integration config.
pub(crate) fn config_str<'a>(
    integration: &Integration,
    metadata: &'a IntegrationMetadata,
    field: &str,
) -> Result<&'a str> {
    metadata
        .config
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            ConfidantError::integration_rejected(
                &integration.id,
                format!("config.{} is missing", field),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integration_type_names_and_queues() {
        for kind in IntegrationType::ALL {
            assert_eq!(kind.as_str().parse::<IntegrationType>().unwrap(), kind);
        }
        assert_eq!(IntegrationType::Slack.queue_name(), "integration.slack");
        assert!("vercel".parse::<IntegrationType>().is_err());
    }

    #[test]
    fn config_validation_requires_url() {
        assert!(
            IntegrationType::Slack
                .validate_config(&json!({"webhookUrl": "https://hooks.slack.test/x"}))
                .is_ok()
        );
        assert!(IntegrationType::Slack.validate_config(&json!({})).is_err());
        assert!(
            IntegrationType::Webhook
                .validate_config(&json!({"url": "ftp://nope"}))
                .is_err()
        );
    }

    #[test]
    fn empty_notify_on_means_everything() {
        let mut integration = Integration {
            id: "i-1".into(),
            workspace_id: "ws".into(),
            kind: IntegrationType::Webhook,
            name: "hook".into(),
            notify_on: vec![],
            enabled: true,
            encrypted_metadata: String::new(),
            metadata_version: 0,
            created_at: Utc::now(),
        };
        assert!(integration.subscribes_to(EventType::SecretDeleted));

        integration.notify_on = vec![EventType::EnvironmentDeleted];
        assert!(integration.subscribes_to(EventType::EnvironmentDeleted));
        assert!(!integration.subscribes_to(EventType::SecretAdded));
    }

    #[test]
    fn retryable_statuses() {
        let integration = Integration {
            id: "i-1".into(),
            workspace_id: "ws".into(),
            kind: IntegrationType::Slack,
            name: "slack".into(),
            notify_on: vec![],
            enabled: true,
            encrypted_metadata: String::new(),
            metadata_version: 0,
            created_at: Utc::now(),
        };
        assert!(status_error(&integration, reqwest::StatusCode::BAD_GATEWAY).is_retryable());
        assert!(status_error(&integration, reqwest::StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(!status_error(&integration, reqwest::StatusCode::NOT_FOUND).is_retryable());
    }
}
