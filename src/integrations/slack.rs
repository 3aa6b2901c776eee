//! Slack integration: a text message per event, via an incoming webhook.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::{Integration, IntegrationHandler, IntegrationMetadata, config_str, status_error};
use crate::error::{ConfidantError, Result};
use crate::events::{Change, Event};

pub struct SlackHandler {
    client: reqwest::Client,
}

impl SlackHandler {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Human-readable line for an event.
pub fn format_message(event: &Event) -> String {
    let verb = match event.event_type.change() {
        Change::Added => "added",
        Change::Updated => "updated",
        Change::Deleted => "deleted",
    };
    let subject = event.source.as_str().to_lowercase();
    let name = event
        .metadata
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or(&event.target_id);

    let mut message = format!("{} `{}` {} by {}", subject, name, verb, event.triggerer);
    if let Some(env) = event.metadata.get("environment").and_then(|v| v.as_str()) {
        message.push_str(&format!(" in `{}`", env));
    }
    if event.id == 0 {
        message.push_str(" (retry)");
    }
    message
}

#[async_trait]
impl IntegrationHandler for SlackHandler {
    async fn emit_event(
        &self,
        integration: &Integration,
        event: &Event,
        metadata: &IntegrationMetadata,
    ) -> Result<()> {
        let url = config_str(integration, metadata, "webhookUrl")?;
        let mut payload = json!({ "text": format_message(event) });
        if let Some(channel) = metadata.config.get("channel") {
            payload["channel"] = channel.clone();
        }

        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                ConfidantError::integration(&integration.id, format!("slack request failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(integration, status));
        }

        debug!(
            integration_id = %integration.id,
            event_type = %event.event_type,
            "Slack notification sent"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventSource, EventType, Severity};
    use chrono::Utc;

    #[test]
    fn message_names_the_change() {
        let event = Event {
            id: 3,
            workspace_id: "ws".into(),
            source: EventSource::Secret,
            event_type: EventType::SecretUpdated,
            severity: Severity::Info,
            triggerer: "alice".into(),
            target_id: "sec-1".into(),
            timestamp: Utc::now(),
            metadata: json!({"name": "DATABASE_URL", "environment": "production"}),
        };
        assert_eq!(
            format_message(&event),
            "secret `DATABASE_URL` updated by alice in `production`"
        );
    }
}
