//! Version histories on SQLite.

use rusqlite::{Connection, OptionalExtension, Row, params};

use super::repository::{Repository, constraint_error, now, timestamp, timestamp_column};
use crate::error::{ConfidantError, Result};
use crate::versions::{HistoryKey, RollbackOutcome, Version, VersionHead, VersionRepository};

const VERSION_COLUMNS: &str =
    "entity_id, environment_id, version_number, value, created_at, created_by";

fn row_to_version(row: &Row) -> rusqlite::Result<Version> {
    Ok(Version {
        entity_id: row.get(0)?,
        environment_id: row.get(1)?,
        version_number: row.get(2)?,
        value: row.get(3)?,
        created_at: timestamp_column(row, 4)?,
        created_by: row.get(5)?,
    })
}

fn head(conn: &Connection, key: &HistoryKey) -> Result<Option<VersionHead>> {
    let result = conn
        .query_row(
            r#"
            SELECT current_version, highest_version, enabled
            FROM version_heads WHERE entity_id = ? AND environment_id = ?
            "#,
            params![key.entity_id, key.environment_id],
            |row| {
                Ok(VersionHead {
                    current: row.get(0)?,
                    highest: row.get(1)?,
                    enabled: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(result)
}

fn require_head(conn: &Connection, key: &HistoryKey) -> Result<VersionHead> {
    head(conn, key)?
        .ok_or_else(|| ConfidantError::not_found(format!("no version history for {}", key)))
}

fn insert_version(
    conn: &Connection,
    key: &HistoryKey,
    version_number: i64,
    value: &str,
    created_by: &str,
) -> Result<Version> {
    let version = Version {
        entity_id: key.entity_id.clone(),
        environment_id: key.environment_id.clone(),
        version_number,
        value: value.to_string(),
        created_at: now(),
        created_by: created_by.to_string(),
    };
    conn.execute(
        &format!(
            "INSERT INTO versions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            VERSION_COLUMNS
        ),
        params![
            version.entity_id,
            version.environment_id,
            version.version_number,
            version.value,
            timestamp(&version.created_at),
            version.created_by,
        ],
    )
    .map_err(|e| constraint_error(e, || format!("version {} of {}", version_number, key)))?;
    Ok(version)
}

/// Version 1 plus a head pointing at it. `AlreadyExists` when the history
/// already has a head. Runs inside the caller's transaction.
pub(super) fn start_history(
    conn: &Connection,
    key: &HistoryKey,
    value: &str,
    created_by: &str,
) -> Result<Version> {
    if head(conn, key)?.is_some() {
        return Err(ConfidantError::already_exists(format!(
            "version history for {} already exists",
            key
        )));
    }

    let version = insert_version(conn, key, 1, value, created_by)?;
    conn.execute(
        r#"
        INSERT INTO version_heads (entity_id, environment_id, current_version, highest_version, enabled)
        VALUES (?1, ?2, 1, 1, 1)
        "#,
        params![key.entity_id, key.environment_id],
    )?;
    Ok(version)
}

fn advance_history(
    conn: &Connection,
    key: &HistoryKey,
    head: VersionHead,
    value: &str,
    created_by: &str,
) -> Result<Version> {
    let next = head.highest + 1;
    let version = insert_version(conn, key, next, value, created_by)?;
    conn.execute(
        r#"
        UPDATE version_heads SET current_version = ?1, highest_version = ?1
        WHERE entity_id = ?2 AND environment_id = ?3
        "#,
        params![next, key.entity_id, key.environment_id],
    )?;
    Ok(version)
}

impl VersionRepository for Repository {
    fn find_entity_versions(&self, key: &HistoryKey) -> Result<Vec<Version>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM versions
            WHERE entity_id = ? AND environment_id = ?
            ORDER BY version_number DESC
            "#,
            VERSION_COLUMNS
        ))?;
        let versions = stmt
            .query_map(params![key.entity_id, key.environment_id], row_to_version)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(versions)
    }

    fn find_version(&self, key: &HistoryKey, version_number: i64) -> Result<Option<Version>> {
        let conn = self.lock()?;
        let result = conn
            .query_row(
                &format!(
                    r#"
                    SELECT {} FROM versions
                    WHERE entity_id = ? AND environment_id = ? AND version_number = ?
                    "#,
                    VERSION_COLUMNS
                ),
                params![key.entity_id, key.environment_id, version_number],
                row_to_version,
            )
            .optional()?;
        Ok(result)
    }

    fn find_head(&self, key: &HistoryKey) -> Result<Option<VersionHead>> {
        let conn = self.lock()?;
        head(&conn, key)
    }

    fn create_history(&self, key: &HistoryKey, value: &str, created_by: &str) -> Result<Version> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let version = start_history(&tx, key, value, created_by)?;
        tx.commit()?;
        Ok(version)
    }

    fn append_version(&self, key: &HistoryKey, value: &str, created_by: &str) -> Result<Version> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let head = require_head(&tx, key)?;
        let version = advance_history(&tx, key, head, value, created_by)?;
        tx.commit()?;
        Ok(version)
    }

    fn write_version(&self, key: &HistoryKey, value: &str, created_by: &str) -> Result<Version> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let version = match head(&tx, key)? {
            Some(head) => advance_history(&tx, key, head, value, created_by)?,
            None => start_history(&tx, key, value, created_by)?,
        };
        tx.commit()?;
        Ok(version)
    }

    fn set_current_pointer(&self, key: &HistoryKey, version_number: i64) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let head = require_head(&tx, key)?;
        if version_number < 1 || version_number > head.highest {
            return Err(ConfidantError::not_found(format!(
                "version {} of {} not found",
                version_number, key
            )));
        }
        tx.execute(
            "UPDATE version_heads SET current_version = ? WHERE entity_id = ? AND environment_id = ?",
            params![version_number, key.entity_id, key.environment_id],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn rollback_pointer(&self, key: &HistoryKey, count: u32) -> Result<RollbackOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let head = require_head(&tx, key)?;
        let applied = i64::from(count).min(head.current - 1);
        let current = head.current - applied;
        if applied > 0 {
            tx.execute(
                "UPDATE version_heads SET current_version = ? WHERE entity_id = ? AND environment_id = ?",
                params![current, key.entity_id, key.environment_id],
            )?;
        }

        tx.commit()?;
        Ok(RollbackOutcome {
            applied: applied as u32,
            current,
        })
    }

    fn set_enabled(&self, key: &HistoryKey, enabled: bool) -> Result<()> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE version_heads SET enabled = ? WHERE entity_id = ? AND environment_id = ?",
            params![enabled, key.entity_id, key.environment_id],
        )?;
        if rows == 0 {
            return Err(ConfidantError::not_found(format!(
                "no version history for {}",
                key
            )));
        }
        Ok(())
    }

    fn delete_history(&self, entity_id: &str, environment_id: Option<&str>) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let heads = match environment_id {
            Some(env) => {
                tx.execute(
                    "DELETE FROM versions WHERE entity_id = ? AND environment_id = ?",
                    params![entity_id, env],
                )?;
                tx.execute(
                    "DELETE FROM version_heads WHERE entity_id = ? AND environment_id = ?",
                    params![entity_id, env],
                )?
            }
            None => {
                tx.execute("DELETE FROM versions WHERE entity_id = ?", [entity_id])?;
                tx.execute("DELETE FROM version_heads WHERE entity_id = ?", [entity_id])?
            }
        };

        tx.commit()?;
        Ok(heads)
    }
}
