//! Generic webhook integration.
//!
//! POSTs the event as JSON to `config.url`. Receivers get the event's
//! delivery key in `X-Confidant-Delivery` so they can drop duplicates, and an
//! HMAC-SHA256 of the body in `X-Confidant-Signature` when `config.secret` is set.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;

use super::{Integration, IntegrationHandler, IntegrationMetadata, config_str, status_error};
use crate::error::{ConfidantError, Result};
use crate::events::Event;

type HmacSha256 = Hmac<Sha256>;

pub const DELIVERY_HEADER: &str = "X-Confidant-Delivery";
pub const SIGNATURE_HEADER: &str = "X-Confidant-Signature";

pub struct WebhookHandler {
    client: reqwest::Client,
}

impl WebhookHandler {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// `sha256=<hex>` signature of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ConfidantError::validation(format!("invalid webhook secret: {}", e)))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

#[async_trait]
impl IntegrationHandler for WebhookHandler {
    async fn emit_event(
        &self,
        integration: &Integration,
        event: &Event,
        metadata: &IntegrationMetadata,
    ) -> Result<()> {
        let url = config_str(integration, metadata, "url")?;
        let body = serde_json::to_vec(event)?;

        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header(DELIVERY_HEADER, event.delivery_key());

        if let Some(secret) = metadata.config.get("secret").and_then(Value::as_str) {
            request = request.header(SIGNATURE_HEADER, sign(secret, &body)?);
        }

        let response = request.body(body).send().await.map_err(|e| {
            ConfidantError::integration(&integration.id, format!("webhook delivery failed: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(integration, status));
        }

        debug!(
            integration_id = %integration.id,
            event_type = %event.event_type,
            target_id = %event.target_id,
            status_code = status.as_u16(),
            "Webhook delivered"
        );
        Ok(())
    }
}
