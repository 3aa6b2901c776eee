//! Event dispatch to integrations.
//!
//! `publish` records the event, then delivers it twice over: once right away
//! to every subscribed integration (best effort; a failure becomes a pending
//! cleanup entry in that integration's metadata), and once through the job
//! queue, one job per integration on the queue of its type, for guaranteed
//! delivery. Handlers therefore see most events at least twice and must be
//! idempotent.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::{Event, EventLog, NewEvent};
use crate::error::{ConfidantError, Result};
use crate::integrations::{
    Integration, IntegrationFilter, IntegrationRegistry, IntegrationRepository, MetadataStore,
    PendingEntry,
};
use crate::jobs::{Job, JobQueue, QueueBackend, SendOptions};

/// Payload of an `integration.<type>` job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryJob {
    pub integration_id: String,
    pub event: Event,
}

pub struct Dispatcher {
    log: EventLog,
    registry: Arc<IntegrationRegistry>,
    integrations: Arc<dyn IntegrationRepository>,
    metadata: MetadataStore,
    queue: Arc<dyn QueueBackend>,
    send_options: SendOptions,
}

impl Dispatcher {
    pub fn new(
        log: EventLog,
        registry: Arc<IntegrationRegistry>,
        integrations: Arc<dyn IntegrationRepository>,
        metadata: MetadataStore,
        queue: Arc<dyn QueueBackend>,
        send_options: SendOptions,
    ) -> Self {
        Self {
            log,
            registry,
            integrations,
            metadata,
            queue,
            send_options,
        }
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Record an event and hand it to every subscribed integration. Only a
    /// failure to record is an error; delivery problems are logged and
    /// turned into pending cleanup.
    pub async fn publish(&self, event: NewEvent) -> Result<Event> {
        let event = self.log.record(event)?;

        let filter = IntegrationFilter::active_in(&event.workspace_id);
        let integrations: Vec<Integration> = match self.integrations.find_integrations(&filter) {
            Ok(found) => found
                .into_iter()
                .filter(|i| i.subscribes_to(event.event_type))
                .collect(),
            Err(e) => {
                error!(
                    event_id = event.id,
                    error = %e,
                    "Failed to look up integrations, event recorded but not dispatched"
                );
                return Ok(event);
            }
        };

        if integrations.is_empty() {
            return Ok(event);
        }

        join_all(
            integrations
                .iter()
                .map(|integration| self.deliver_now(integration, &event)),
        )
        .await;

        for integration in &integrations {
            self.enqueue(integration, &event);
        }

        Ok(event)
    }

    async fn deliver_now(&self, integration: &Integration, event: &Event) {
        let Err(e) = self.try_deliver(integration, event).await else {
            return;
        };

        warn!(
            integration_id = %integration.id,
            kind = %integration.kind,
            event_type = %event.event_type,
            target_id = %event.target_id,
            error = %e,
            "Integration delivery failed, recording pending cleanup"
        );

        let entry = PendingEntry::new(&event.target_id, event.event_type);
        if let Err(e) = self.metadata.append_pending(&integration.id, entry) {
            error!(
                integration_id = %integration.id,
                error = %e,
                "Failed to record pending cleanup"
            );
        }
    }

    async fn try_deliver(&self, integration: &Integration, event: &Event) -> Result<()> {
        let metadata = self.metadata.open(integration)?;
        let handler = self.registry.resolve(integration.kind)?;
        handler.emit_event(integration, event, &metadata).await
    }

    fn enqueue(&self, integration: &Integration, event: &Event) {
        let payload = DeliveryJob {
            integration_id: integration.id.clone(),
            event: event.clone(),
        };
        let result = serde_json::to_value(&payload)
            .map_err(ConfidantError::from)
            .and_then(|payload| {
                self.queue
                    .send(&integration.kind.queue_name(), &payload, self.send_options)
            });

        match result {
            Ok(job_id) => debug!(
                integration_id = %integration.id,
                event_id = event.id,
                job_id,
                "Queued event delivery"
            ),
            Err(e) => error!(
                integration_id = %integration.id,
                event_id = event.id,
                error = %e,
                "Failed to queue event delivery"
            ),
        }
    }

    /// Queue worker body: deliver one queued event. Errors propagate with
    /// their class so the queue retries only what can succeed.
    pub async fn deliver_job(&self, job: Job) -> Result<()> {
        let delivery: DeliveryJob = serde_json::from_value(job.payload).map_err(|e| {
            ConfidantError::validation(format!("malformed delivery job {}: {}", job.id, e))
        })?;

        let Some(integration) = self.integrations.get_integration(&delivery.integration_id)? else {
            debug!(
                integration_id = %delivery.integration_id,
                "Integration deleted before delivery, dropping job"
            );
            return Ok(());
        };
        if !integration.enabled {
            debug!(integration_id = %integration.id, "Integration disabled, dropping job");
            return Ok(());
        }

        self.try_deliver(&integration, &delivery.event).await
    }

    /// Start one delivery worker per registered integration type.
    pub fn register_workers(self: &Arc<Self>, queue: &JobQueue) -> Result<()> {
        for kind in self.registry.kinds() {
            let dispatcher = self.clone();
            queue.register_job(&kind.queue_name(), move |job| {
                let dispatcher = dispatcher.clone();
                async move { dispatcher.deliver_job(job).await }
            })?;
        }
        Ok(())
    }
}
