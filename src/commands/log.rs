//! Log command handler - viewing recorded events.

use chrono_humanize::HumanTime;

use super::open_repository;
use crate::config::Config;
use crate::error::Result;
use crate::events::{EventLog, EventQuery};

/// Handle the log command - show recorded events from the DB
pub fn handle_log(
    config: &Config,
    limit: Option<usize>,
    workspace: Option<String>,
    target: Option<String>,
) -> Result<()> {
    let repo = open_repository(config)?;
    let log = EventLog::new(repo);

    let events = log.list(&EventQuery {
        workspace_id: workspace,
        target_id: target,
        limit,
    })?;

    if events.is_empty() {
        println!("No events recorded yet.");
        return Ok(());
    }

    println!("Event log:");
    for event in events {
        let age = HumanTime::from(event.timestamp);
        println!(
            "  {:>6} | {} | {:22} | {:5} | {:12} | {}",
            event.id,
            age,
            event.event_type,
            event.severity.as_str(),
            event.triggerer,
            event.target_id
        );
    }

    Ok(())
}
