//! Append-only log of configuration-change events.
//!
//! Every successful mutation of a project, environment, secret, variable or
//! integration produces exactly one [`Event`]. Events are the audit trail and
//! the trigger for integration delivery (see [`dispatch`]). Recorded events
//! are never updated or deleted; the SQLite schema rejects both.

pub mod dispatch;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConfidantError, Result};

pub use dispatch::Dispatcher;

/// Identifier assigned by the log on append. Zero marks a synthesized event
/// that was never recorded (reconciler retries).
pub type EventId = i64;

// =============================================================================
// Closed enumerations
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    ProjectAdded,
    ProjectUpdated,
    ProjectDeleted,
    EnvironmentAdded,
    EnvironmentUpdated,
    EnvironmentDeleted,
    SecretAdded,
    SecretUpdated,
    SecretDeleted,
    VariableAdded,
    VariableUpdated,
    VariableDeleted,
    IntegrationAdded,
    IntegrationUpdated,
    IntegrationDeleted,
}

/// The kind of change, independent of what changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Added,
    Updated,
    Deleted,
}

impl EventType {
    pub const ALL: [EventType; 15] = [
        EventType::ProjectAdded,
        EventType::ProjectUpdated,
        EventType::ProjectDeleted,
        EventType::EnvironmentAdded,
        EventType::EnvironmentUpdated,
        EventType::EnvironmentDeleted,
        EventType::SecretAdded,
        EventType::SecretUpdated,
        EventType::SecretDeleted,
        EventType::VariableAdded,
        EventType::VariableUpdated,
        EventType::VariableDeleted,
        EventType::IntegrationAdded,
        EventType::IntegrationUpdated,
        EventType::IntegrationDeleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ProjectAdded => "PROJECT_ADDED",
            EventType::ProjectUpdated => "PROJECT_UPDATED",
            EventType::ProjectDeleted => "PROJECT_DELETED",
            EventType::EnvironmentAdded => "ENVIRONMENT_ADDED",
            EventType::EnvironmentUpdated => "ENVIRONMENT_UPDATED",
            EventType::EnvironmentDeleted => "ENVIRONMENT_DELETED",
            EventType::SecretAdded => "SECRET_ADDED",
            EventType::SecretUpdated => "SECRET_UPDATED",
            EventType::SecretDeleted => "SECRET_DELETED",
            EventType::VariableAdded => "VARIABLE_ADDED",
            EventType::VariableUpdated => "VARIABLE_UPDATED",
            EventType::VariableDeleted => "VARIABLE_DELETED",
            EventType::IntegrationAdded => "INTEGRATION_ADDED",
            EventType::IntegrationUpdated => "INTEGRATION_UPDATED",
            EventType::IntegrationDeleted => "INTEGRATION_DELETED",
        }
    }

    /// Event type for a change to a secret or variable.
    pub fn for_entity(is_secret: bool, change: Change) -> Self {
        match (is_secret, change) {
            (true, Change::Added) => EventType::SecretAdded,
            (true, Change::Updated) => EventType::SecretUpdated,
            (true, Change::Deleted) => EventType::SecretDeleted,
            (false, Change::Added) => EventType::VariableAdded,
            (false, Change::Updated) => EventType::VariableUpdated,
            (false, Change::Deleted) => EventType::VariableDeleted,
        }
    }

    pub fn source(&self) -> EventSource {
        match self {
            EventType::ProjectAdded | EventType::ProjectUpdated | EventType::ProjectDeleted => {
                EventSource::Project
            }
            EventType::EnvironmentAdded
            | EventType::EnvironmentUpdated
            | EventType::EnvironmentDeleted => EventSource::Environment,
            EventType::SecretAdded | EventType::SecretUpdated | EventType::SecretDeleted => {
                EventSource::Secret
            }
            EventType::VariableAdded | EventType::VariableUpdated | EventType::VariableDeleted => {
                EventSource::Variable
            }
            EventType::IntegrationAdded
            | EventType::IntegrationUpdated
            | EventType::IntegrationDeleted => EventSource::Integration,
        }
    }

    pub fn change(&self) -> Change {
        let name = self.as_str();
        if name.ends_with("_ADDED") {
            Change::Added
        } else if name.ends_with("_DELETED") {
            Change::Deleted
        } else {
            Change::Updated
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ConfidantError;

    fn from_str(s: &str) -> Result<Self> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ConfidantError::validation(format!("unknown event type: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventSource {
    Project,
    Environment,
    Secret,
    Variable,
    Integration,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Project => "PROJECT",
            EventSource::Environment => "ENVIRONMENT",
            EventSource::Secret => "SECRET",
            EventSource::Variable => "VARIABLE",
            EventSource::Integration => "INTEGRATION",
        }
    }
}

impl FromStr for EventSource {
    type Err = ConfidantError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PROJECT" => Ok(EventSource::Project),
            "ENVIRONMENT" => Ok(EventSource::Environment),
            "SECRET" => Ok(EventSource::Secret),
            "VARIABLE" => Ok(EventSource::Variable),
            "INTEGRATION" => Ok(EventSource::Integration),
            other => Err(ConfidantError::validation(format!(
                "unknown event source: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
        }
    }
}

impl FromStr for Severity {
    type Err = ConfidantError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "INFO" => Ok(Severity::Info),
            "WARN" => Ok(Severity::Warn),
            "ERROR" => Ok(Severity::Error),
            other => Err(ConfidantError::validation(format!(
                "unknown severity: {}",
                other
            ))),
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// An event before it has been recorded.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub workspace_id: String,
    pub event_type: EventType,
    pub severity: Severity,
    pub triggerer: String,
    pub target_id: String,
    pub metadata: Value,
}

impl NewEvent {
    pub fn new(
        workspace_id: impl Into<String>,
        event_type: EventType,
        triggerer: impl Into<String>,
        target_id: impl Into<String>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            event_type,
            severity: Severity::Info,
            triggerer: triggerer.into(),
            target_id: target_id.into(),
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Schema conformance. The only reason `record` may refuse an event.
    pub fn validate(&self) -> Result<()> {
        if self.workspace_id.trim().is_empty() {
            return Err(ConfidantError::validation("event workspace_id is empty"));
        }
        if self.triggerer.trim().is_empty() {
            return Err(ConfidantError::validation("event triggerer is empty"));
        }
        if self.target_id.trim().is_empty() {
            return Err(ConfidantError::validation("event target_id is empty"));
        }
        if !self.metadata.is_object() {
            return Err(ConfidantError::validation(
                "event metadata must be a JSON object",
            ));
        }
        Ok(())
    }
}

/// A recorded event. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: EventId,
    pub workspace_id: String,
    pub source: EventSource,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub severity: Severity,
    pub triggerer: String,
    pub target_id: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Value,
}

impl Event {
    /// Key receivers can use to drop duplicate deliveries. Recorded events use
    /// their id; synthesized retries use the (action, target) pair they replay.
    pub fn delivery_key(&self) -> String {
        if self.id > 0 {
            format!("evt-{}", self.id)
        } else {
            format!("cleanup-{}-{}", self.event_type, self.target_id)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub workspace_id: Option<String>,
    pub target_id: Option<String>,
    pub limit: Option<usize>,
}

/// Storage for the event log. Implemented by [`crate::db::Repository`].
pub trait EventStore: Send + Sync {
    /// Append an event and return it with its assigned id and timestamp.
    fn append_event(&self, event: &NewEvent) -> Result<Event>;

    /// Events matching the query, newest first.
    fn list_events(&self, query: &EventQuery) -> Result<Vec<Event>>;
}

/// The event log: validation in front of an append-only store.
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn EventStore>,
}

impl EventLog {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub fn record(&self, event: NewEvent) -> Result<Event> {
        event.validate()?;
        self.store.append_event(&event)
    }

    pub fn list(&self, query: &EventQuery) -> Result<Vec<Event>> {
        self.store.list_events(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_type_strings_match_wire_format() {
        for event_type in EventType::ALL {
            let wire = serde_json::to_value(event_type).unwrap();
            assert_eq!(wire, json!(event_type.as_str()));
            assert_eq!(event_type.as_str().parse::<EventType>().unwrap(), event_type);
        }
        assert!("SECRET_RENAMED".parse::<EventType>().is_err());
    }

    #[test]
    fn entity_event_types() {
        assert_eq!(
            EventType::for_entity(true, Change::Updated),
            EventType::SecretUpdated
        );
        assert_eq!(
            EventType::for_entity(false, Change::Deleted),
            EventType::VariableDeleted
        );
        assert_eq!(EventType::EnvironmentDeleted.source(), EventSource::Environment);
        assert_eq!(EventType::EnvironmentDeleted.change(), Change::Deleted);
        assert_eq!(EventType::IntegrationUpdated.change(), Change::Updated);
    }

    #[test]
    fn validation_rejects_incomplete_events() {
        let ok = NewEvent::new("ws", EventType::SecretAdded, "alice", "sec-1");
        assert!(ok.validate().is_ok());

        assert!(NewEvent::new("", EventType::SecretAdded, "alice", "sec-1")
            .validate()
            .is_err());
        assert!(NewEvent::new("ws", EventType::SecretAdded, " ", "sec-1")
            .validate()
            .is_err());
        assert!(ok.clone().with_metadata(json!([1, 2])).validate().is_err());
    }

    #[test]
    fn event_serializes_with_type_field() {
        let event = Event {
            id: 7,
            workspace_id: "ws".into(),
            source: EventSource::Secret,
            event_type: EventType::SecretUpdated,
            severity: Severity::Info,
            triggerer: "alice".into(),
            target_id: "sec-1".into(),
            timestamp: Utc::now(),
            metadata: json!({"version": 2}),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "SECRET_UPDATED");
        assert_eq!(value["targetId"], "sec-1");
        assert_eq!(event.delivery_key(), "evt-7");
    }
}
