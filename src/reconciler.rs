//! Periodic retry of failed integration side effects.
//!
//! Each pass scans every integration, decrypts its metadata and retries the
//! entries in `pendingCleanup` through the integration's handler. Resolved
//! entries are removed; failed ones count an attempt and are abandoned, with a
//! warning, once they reach `max_attempts`. The new state is written back in a
//! single optimistic write per integration, merged with anything appended
//! while the pass was running.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::error::{ConfidantError, Result};
use crate::events::EventType;
use crate::integrations::{
    Integration, IntegrationFilter, IntegrationMetadata, IntegrationRegistry,
    IntegrationRepository, MetadataStore,
};
use crate::jobs::{JobQueue, ScheduleOptions};

/// Queue and schedule name of the recurring reconciliation job.
pub const JOB_NAME: &str = "reconcile-integrations";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Resolved,
    Failed { attempts: u32 },
    Abandoned,
}

type EntryKey = (String, EventType);

/// Counters for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub integrations_scanned: usize,
    pub integrations_with_pending: usize,
    pub resolved: usize,
    pub retried: usize,
    pub abandoned: usize,
    pub failed_integrations: usize,
    pub writes: usize,
}

pub struct Reconciler {
    integrations: Arc<dyn IntegrationRepository>,
    metadata: MetadataStore,
    registry: Arc<IntegrationRegistry>,
    max_attempts: u32,
}

impl Reconciler {
    pub fn new(
        integrations: Arc<dyn IntegrationRepository>,
        metadata: MetadataStore,
        registry: Arc<IntegrationRegistry>,
        max_attempts: u32,
    ) -> Self {
        Self {
            integrations,
            metadata,
            registry,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Run one pass. Fails only when the integrations cannot be listed;
    /// problems with a single integration are logged and counted.
    pub async fn run_once(&self) -> Result<ReconcileReport> {
        let integrations = self.integrations.find_integrations(&IntegrationFilter::all())?;
        let mut report = ReconcileReport {
            integrations_scanned: integrations.len(),
            ..Default::default()
        };

        for integration in &integrations {
            if let Err(e) = self.reconcile_integration(integration, &mut report).await {
                report.failed_integrations += 1;
                error!(
                    integration_id = %integration.id,
                    kind = %integration.kind,
                    error = %e,
                    "Failed to reconcile integration"
                );
            }
        }

        info!(
            scanned = report.integrations_scanned,
            resolved = report.resolved,
            retried = report.retried,
            abandoned = report.abandoned,
            failed = report.failed_integrations,
            "Reconciliation pass finished"
        );
        Ok(report)
    }

    async fn reconcile_integration(
        &self,
        integration: &Integration,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let metadata = self.metadata.open(integration)?;
        if metadata.pending_cleanup.is_empty() {
            return Ok(());
        }
        report.integrations_with_pending += 1;

        // without a handler every entry fails its attempt, so the backlog
        // still drains through abandonment
        let handler = self.registry.resolve(integration.kind);
        if let Err(e) = &handler {
            warn!(
                integration_id = %integration.id,
                kind = %integration.kind,
                error = %e,
                "No handler for pending cleanup"
            );
        }
        let mut outcomes: HashMap<EntryKey, Outcome> = HashMap::new();

        for entry in &metadata.pending_cleanup {
            let result = match &handler {
                Ok(handler) => handler.resolve_pending(integration, entry, &metadata).await,
                Err(e) => Err(ConfidantError::integration_rejected(
                    integration.id.clone(),
                    e.to_string(),
                )),
            };
            let outcome = match result {
                Ok(()) => {
                    debug!(
                        integration_id = %integration.id,
                        target_id = %entry.target_id,
                        action = %entry.action,
                        "Pending cleanup resolved"
                    );
                    Outcome::Resolved
                }
                Err(e) => {
                    let attempts = entry.attempts + 1;
                    if attempts >= self.max_attempts {
                        warn!(
                            integration_id = %integration.id,
                            target_id = %entry.target_id,
                            action = %entry.action,
                            attempts,
                            first_seen_at = %entry.first_seen_at,
                            error = %e,
                            "Abandoning pending cleanup after repeated failures"
                        );
                        Outcome::Abandoned
                    } else {
                        debug!(
                            integration_id = %integration.id,
                            target_id = %entry.target_id,
                            attempts,
                            error = %e,
                            "Pending cleanup still failing"
                        );
                        Outcome::Failed { attempts }
                    }
                }
            };
            outcomes.insert((entry.target_id.clone(), entry.action), outcome);
        }

        let written = self
            .metadata
            .modify(&integration.id, |current| apply_outcomes(current, &outcomes))?;

        for outcome in outcomes.values() {
            match outcome {
                Outcome::Resolved => report.resolved += 1,
                Outcome::Failed { .. } => report.retried += 1,
                Outcome::Abandoned => report.abandoned += 1,
            }
        }
        if written {
            report.writes += 1;
        }
        Ok(())
    }

    /// Register the worker and the recurring schedule. Reconciliation jobs
    /// are not retried; the next tick is the retry.
    pub fn register(self: &Arc<Self>, queue: &JobQueue, cron: &str) -> Result<()> {
        let reconciler = self.clone();
        queue.register_job(JOB_NAME, move |_job| {
            let reconciler = reconciler.clone();
            async move { reconciler.run_once().await.map(|_| ()) }
        })?;
        queue.schedule_job(
            JOB_NAME,
            cron,
            json!({}),
            ScheduleOptions {
                retry_limit: Some(0),
            },
        )
    }
}

/// Apply this pass's outcomes to the latest metadata. Entries the pass did
/// not see (appended concurrently) are left alone.
fn apply_outcomes(metadata: &mut IntegrationMetadata, outcomes: &HashMap<EntryKey, Outcome>) -> bool {
    let before = metadata.pending_cleanup.clone();

    metadata.pending_cleanup.retain_mut(|entry| {
        match outcomes.get(&(entry.target_id.clone(), entry.action)) {
            Some(Outcome::Resolved) | Some(Outcome::Abandoned) => false,
            Some(Outcome::Failed { attempts }) => {
                entry.attempts = entry.attempts.max(*attempts);
                true
            }
            None => true,
        }
    });

    metadata.pending_cleanup != before
}
