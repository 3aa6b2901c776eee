//! Event log storage on SQLite. The table's triggers make it append-only.

use rusqlite::types::Value as SqlValue;
use rusqlite::{Row, params, params_from_iter};

use super::repository::{Repository, json_column, now, parse_column, timestamp, timestamp_column};
use crate::error::Result;
use crate::events::{Event, EventQuery, EventStore, NewEvent};

const EVENT_COLUMNS: &str =
    "id, workspace_id, source, event_type, severity, triggerer, target_id, metadata, created_at";

fn row_to_event(row: &Row) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        source: parse_column(row, 2)?,
        event_type: parse_column(row, 3)?,
        severity: parse_column(row, 4)?,
        triggerer: row.get(5)?,
        target_id: row.get(6)?,
        metadata: json_column(row, 7)?,
        timestamp: timestamp_column(row, 8)?,
    })
}

impl EventStore for Repository {
    fn append_event(&self, event: &NewEvent) -> Result<Event> {
        let created_at = now();
        let source = event.event_type.source();
        let metadata = serde_json::to_string(&event.metadata)?;

        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO events (workspace_id, source, event_type, severity, triggerer,
                                target_id, metadata, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                event.workspace_id,
                source.as_str(),
                event.event_type.as_str(),
                event.severity.as_str(),
                event.triggerer,
                event.target_id,
                metadata,
                timestamp(&created_at),
            ],
        )?;

        Ok(Event {
            id: conn.last_insert_rowid(),
            workspace_id: event.workspace_id.clone(),
            source,
            event_type: event.event_type,
            severity: event.severity,
            triggerer: event.triggerer.clone(),
            target_id: event.target_id.clone(),
            timestamp: created_at,
            metadata: event.metadata.clone(),
        })
    }

    fn list_events(&self, query: &EventQuery) -> Result<Vec<Event>> {
        let mut sql = format!("SELECT {} FROM events WHERE 1 = 1", EVENT_COLUMNS);
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(workspace_id) = &query.workspace_id {
            sql.push_str(" AND workspace_id = ?");
            args.push(SqlValue::Text(workspace_id.clone()));
        }
        if let Some(target_id) = &query.target_id {
            sql.push_str(" AND target_id = ?");
            args.push(SqlValue::Text(target_id.clone()));
        }
        sql.push_str(" ORDER BY id DESC");
        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            args.push(SqlValue::Integer(limit as i64));
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map(params_from_iter(args), row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }
}
