//! Reconcile command handler - one pass, run in the foreground.

use std::sync::Arc;

use super::{open_repository, server_cipher};
use crate::config::Config;
use crate::error::Result;
use crate::integrations::{IntegrationRegistry, MetadataStore};
use crate::reconciler::Reconciler;

pub async fn handle_reconcile(config: &Config, json: bool) -> Result<()> {
    let repo = open_repository(config)?;
    let metadata = MetadataStore::new(repo.clone(), server_cipher(config)?);
    let registry = Arc::new(IntegrationRegistry::with_defaults()?);

    let reconciler = Reconciler::new(repo, metadata, registry, config.max_attempts());
    let report = reconciler.run_once().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Reconciliation pass complete:");
    println!("  integrations scanned:      {}", report.integrations_scanned);
    println!("  with pending cleanup:      {}", report.integrations_with_pending);
    println!("  entries resolved:          {}", report.resolved);
    println!("  entries left for retry:    {}", report.retried);
    println!("  entries abandoned:         {}", report.abandoned);
    println!("  integrations failed:       {}", report.failed_integrations);
    println!("  metadata writes:           {}", report.writes);
    Ok(())
}
