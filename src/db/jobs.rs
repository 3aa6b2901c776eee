//! Job and schedule storage on SQLite.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value;
use tracing::error;

use super::repository::{Repository, json_column, now, parse_column, timestamp, timestamp_column};
use crate::error::{ConfidantError, Result};
use crate::jobs::{Job, JobId, JobState, QueueBackend, Schedule, SendOptions, backoff_delay, crontab};

const JOB_COLUMNS: &str = "id, queue, payload, state, retry_count, retry_limit, \
     retry_backoff_secs, singleton_key, run_after, last_error, created_at";

fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        queue: row.get(1)?,
        payload: json_column(row, 2)?,
        state: parse_column(row, 3)?,
        retry_count: row.get(4)?,
        retry_limit: row.get(5)?,
        retry_backoff_secs: row.get::<_, i64>(6)?.max(0) as u64,
        singleton_key: row.get(7)?,
        run_after: timestamp_column(row, 8)?,
        last_error: row.get(9)?,
        created_at: timestamp_column(row, 10)?,
    })
}

fn row_to_schedule(row: &Row) -> rusqlite::Result<Schedule> {
    Ok(Schedule {
        name: row.get(0)?,
        cron: row.get(1)?,
        payload: json_column(row, 2)?,
        retry_limit: row.get(3)?,
        retry_backoff_secs: row.get::<_, i64>(4)?.max(0) as u64,
        next_run_at: timestamp_column(row, 5)?,
    })
}

fn load_job(conn: &Connection, job_id: JobId) -> Result<Option<Job>> {
    let result = conn
        .query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS),
            [job_id],
            row_to_job,
        )
        .optional()?;
    Ok(result)
}

fn insert_job(
    conn: &Connection,
    queue: &str,
    payload: &Value,
    options: SendOptions,
    singleton_key: Option<&str>,
) -> Result<JobId> {
    let created_at = timestamp(&now());
    conn.execute(
        r#"
        INSERT INTO jobs (queue, payload, state, retry_limit, retry_backoff_secs,
                          singleton_key, run_after, created_at)
        VALUES (?1, ?2, 'created', ?3, ?4, ?5, ?6, ?6)
        "#,
        params![
            queue,
            serde_json::to_string(payload)?,
            options.retry_limit,
            options.retry_backoff_secs as i64,
            singleton_key,
            created_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl QueueBackend for Repository {
    fn send(&self, queue: &str, payload: &Value, options: SendOptions) -> Result<JobId> {
        let conn = self.lock()?;
        insert_job(&conn, queue, payload, options, None)
    }

    fn fetch(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let next: Option<JobId> = tx
            .query_row(
                r#"
                SELECT id FROM jobs
                WHERE queue = ? AND state = 'created' AND run_after <= ?
                ORDER BY run_after, id
                LIMIT 1
                "#,
                params![queue, timestamp(&now)],
                |row| row.get(0),
            )
            .optional()?;

        let Some(job_id) = next else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE jobs SET state = 'active', started_at = ? WHERE id = ?",
            params![timestamp(&now), job_id],
        )?;
        let job = load_job(&tx, job_id)?;

        tx.commit()?;
        Ok(job)
    }

    fn complete(&self, job_id: JobId) -> Result<()> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE jobs SET state = 'completed', completed_at = ? WHERE id = ?",
            params![timestamp(&now()), job_id],
        )?;
        if rows == 0 {
            return Err(ConfidantError::not_found(format!("job {} not found", job_id)));
        }
        Ok(())
    }

    fn fail(
        &self,
        job_id: JobId,
        error: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<JobState> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let job = load_job(&tx, job_id)?
            .ok_or_else(|| ConfidantError::not_found(format!("job {} not found", job_id)))?;

        let state = if retryable && job.retry_count < job.retry_limit {
            let run_after = now + backoff_delay(job.retry_backoff_secs, job.retry_count);
            tx.execute(
                r#"
                UPDATE jobs
                SET state = 'created', retry_count = retry_count + 1, run_after = ?,
                    last_error = ?, started_at = NULL
                WHERE id = ?
                "#,
                params![timestamp(&run_after), error, job_id],
            )?;
            JobState::Created
        } else {
            tx.execute(
                "UPDATE jobs SET state = 'failed', last_error = ?, completed_at = ? WHERE id = ?",
                params![error, timestamp(&now), job_id],
            )?;
            JobState::Failed
        };

        tx.commit()?;
        Ok(state)
    }

    fn get_job(&self, job_id: JobId) -> Result<Option<Job>> {
        let conn = self.lock()?;
        load_job(&conn, job_id)
    }

    fn upsert_schedule(&self, schedule: &Schedule) -> Result<()> {
        let conn = self.lock()?;
        let updated_at = timestamp(&now());
        // An unchanged expression keeps its pending run time
        conn.execute(
            r#"
            INSERT INTO schedules (name, cron, payload, retry_limit, retry_backoff_secs,
                                   next_run_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            ON CONFLICT(name) DO UPDATE SET
                payload = excluded.payload,
                retry_limit = excluded.retry_limit,
                retry_backoff_secs = excluded.retry_backoff_secs,
                next_run_at = CASE WHEN schedules.cron = excluded.cron
                                   THEN schedules.next_run_at
                                   ELSE excluded.next_run_at END,
                cron = excluded.cron,
                updated_at = excluded.updated_at
            "#,
            params![
                schedule.name,
                schedule.cron,
                serde_json::to_string(&schedule.payload)?,
                schedule.retry_limit,
                schedule.retry_backoff_secs as i64,
                timestamp(&schedule.next_run_at),
                updated_at,
            ],
        )?;
        Ok(())
    }

    fn unschedule(&self, name: &str) -> Result<bool> {
        let conn = self.lock()?;
        let rows = conn.execute("DELETE FROM schedules WHERE name = ?", [name])?;
        Ok(rows > 0)
    }

    fn list_schedules(&self) -> Result<Vec<Schedule>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT name, cron, payload, retry_limit, retry_backoff_secs, next_run_at
            FROM schedules ORDER BY name
            "#,
        )?;
        let schedules = stmt
            .query_map([], row_to_schedule)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(schedules)
    }

    fn fire_due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let due = {
            let mut stmt = tx.prepare(
                r#"
                SELECT name, cron, payload, retry_limit, retry_backoff_secs, next_run_at
                FROM schedules WHERE next_run_at <= ? ORDER BY next_run_at, name
                "#,
            )?;
            stmt.query_map([timestamp(&now)], row_to_schedule)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let mut fired = Vec::new();
        for schedule in due {
            let next_run_at = match crontab::next_after(&schedule.cron, now) {
                Ok(next) => next,
                Err(e) => {
                    error!(schedule = %schedule.name, error = %e, "Skipping unusable schedule");
                    continue;
                }
            };

            let still_pending: bool = tx.query_row(
                r#"
                SELECT EXISTS(SELECT 1 FROM jobs
                              WHERE singleton_key = ? AND state IN ('created', 'active'))
                "#,
                [&schedule.name],
                |row| row.get(0),
            )?;
            if !still_pending {
                let options = SendOptions {
                    retry_limit: schedule.retry_limit,
                    retry_backoff_secs: schedule.retry_backoff_secs,
                };
                fired.push(insert_job(
                    &tx,
                    &schedule.name,
                    &schedule.payload,
                    options,
                    Some(&schedule.name),
                )?);
            }

            tx.execute(
                "UPDATE schedules SET next_run_at = ? WHERE name = ?",
                params![timestamp(&next_run_at), schedule.name],
            )?;
        }

        tx.commit()?;
        Ok(fired)
    }

    fn recover_active(&self) -> Result<usize> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE jobs SET state = 'created', started_at = NULL WHERE state = 'active'",
            [],
        )?;
        Ok(rows)
    }
}
