//! Serve command handler - the long-running worker process.

use std::sync::Arc;

use tracing::{error, info};

use super::{open_repository, server_cipher};
use crate::config::Config;
use crate::error::Result;
use crate::events::{Dispatcher, EventLog};
use crate::integrations::{IntegrationRegistry, MetadataStore};
use crate::jobs::{JobQueue, QueueSettings, SendOptions};
use crate::reconciler::Reconciler;

/// Start the delivery workers and the reconciler schedule, then run until
/// Ctrl-C. Failing to register any worker is fatal.
pub async fn handle_serve(config: &Config) -> Result<()> {
    let repo = open_repository(config)?;
    let metadata = MetadataStore::new(repo.clone(), server_cipher(config)?);
    let registry = Arc::new(IntegrationRegistry::with_defaults()?);

    let settings = QueueSettings::from(config);
    let send_options = SendOptions {
        retry_limit: settings.retry_limit,
        retry_backoff_secs: settings.retry_backoff_secs,
    };
    let dispatcher = Arc::new(Dispatcher::new(
        EventLog::new(repo.clone()),
        registry.clone(),
        repo.clone(),
        metadata.clone(),
        repo.clone(),
        send_options,
    ));
    let reconciler = Arc::new(Reconciler::new(
        repo.clone(),
        metadata,
        registry,
        config.max_attempts(),
    ));

    let queue = JobQueue::start(repo, settings)?;
    let registered = dispatcher
        .register_workers(&queue)
        .and_then(|()| reconciler.register(&queue, config.reconcile_schedule()));
    if let Err(e) = registered {
        error!(error = %e, "Failed to register workers, shutting down");
        queue.stop().await;
        return Err(e);
    }

    info!(
        database = %config.db_path().display(),
        schedule = config.reconcile_schedule(),
        "confidant is running, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c().await?;

    info!("Shutting down, waiting for in-flight jobs");
    queue.stop().await;
    Ok(())
}
