//! Database schema and initialization.

use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

const SCHEMA_VERSION: i32 = 2;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (or create) the database at `path` and bring its schema up to date.
pub fn init_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;

    // Owner-only: the file holds wrapped private keys and sealed metadata
    restrict_file_permissions(path)?;

    prepare(conn)
}

/// A private in-memory database, for tests and dry runs.
pub fn init_in_memory() -> Result<Connection> {
    prepare(Connection::open_in_memory()?)
}

fn prepare(conn: Connection) -> Result<Connection> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    let version = get_schema_version(&conn)?;
    if version == 0 {
        create_tables(&conn)?;
        set_schema_version(&conn, SCHEMA_VERSION)?;
    } else if version < SCHEMA_VERSION {
        migrate(&conn, version, SCHEMA_VERSION)?;
    }

    Ok(conn)
}

fn restrict_file_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    #[cfg(not(unix))]
    {
        let _ = path;
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    Ok(conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0))?)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?)",
        [version],
    )?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE schema_version (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        );

        CREATE TABLE projects (
            id TEXT PRIMARY KEY,
            workspace_id TEXT NOT NULL,
            slug TEXT NOT NULL,
            name TEXT NOT NULL,
            public_key TEXT NOT NULL,
            wrapped_private_key BLOB,
            store_private_key INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            UNIQUE(workspace_id, slug)
        );

        CREATE TABLE environments (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            slug TEXT NOT NULL,
            name TEXT NOT NULL,
            is_default INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            UNIQUE(project_id, slug)
        );

        -- At most one default environment per project
        CREATE UNIQUE INDEX idx_environments_default
            ON environments(project_id) WHERE is_default = 1;

        -- Secrets and variables
        CREATE TABLE entities (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            slug TEXT NOT NULL,
            is_secret INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(project_id, slug)
        );

        CREATE TABLE versions (
            entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
            environment_id TEXT NOT NULL REFERENCES environments(id) ON DELETE CASCADE,
            version_number INTEGER NOT NULL CHECK (version_number >= 1),
            value TEXT NOT NULL,
            created_at TEXT NOT NULL,
            created_by TEXT NOT NULL,
            PRIMARY KEY (entity_id, environment_id, version_number)
        );

        -- Current pointer and enabled flag per history
        CREATE TABLE version_heads (
            entity_id TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
            environment_id TEXT NOT NULL REFERENCES environments(id) ON DELETE CASCADE,
            current_version INTEGER NOT NULL,
            highest_version INTEGER NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (entity_id, environment_id),
            CHECK (current_version BETWEEN 1 AND highest_version)
        );

        CREATE TABLE events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            workspace_id TEXT NOT NULL,
            source TEXT NOT NULL,
            event_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            triggerer TEXT NOT NULL,
            target_id TEXT NOT NULL,
            metadata TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX idx_events_workspace ON events(workspace_id, id DESC);
        CREATE INDEX idx_events_target ON events(target_id);

        CREATE TRIGGER events_no_update BEFORE UPDATE ON events
        BEGIN
            SELECT RAISE(ABORT, 'events are append-only');
        END;

        CREATE TRIGGER events_no_delete BEFORE DELETE ON events
        BEGIN
            SELECT RAISE(ABORT, 'events are append-only');
        END;

        CREATE TABLE integrations (
            id TEXT PRIMARY KEY,
            workspace_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            name TEXT NOT NULL,
            notify_on TEXT NOT NULL DEFAULT '[]',
            enabled INTEGER NOT NULL DEFAULT 1,
            encrypted_metadata TEXT NOT NULL,
            metadata_version INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX idx_integrations_workspace ON integrations(workspace_id);

        CREATE TABLE jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            queue TEXT NOT NULL,
            payload TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT 'created',
            retry_count INTEGER NOT NULL DEFAULT 0,
            retry_limit INTEGER NOT NULL,
            retry_backoff_secs INTEGER NOT NULL,
            singleton_key TEXT,
            run_after TEXT NOT NULL,
            last_error TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT
        );

        CREATE INDEX idx_jobs_fetch ON jobs(queue, state, run_after);
        CREATE INDEX idx_jobs_singleton ON jobs(singleton_key, state);

        CREATE TABLE schedules (
            name TEXT PRIMARY KEY,
            cron TEXT NOT NULL,
            payload TEXT NOT NULL,
            retry_limit INTEGER NOT NULL,
            retry_backoff_secs INTEGER NOT NULL,
            next_run_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn migrate(conn: &Connection, from_version: i32, to_version: i32) -> Result<()> {
    for version in from_version..to_version {
        match version {
            1 => {
                // v1 -> v2: recurring schedules, and singleton keys so a slow
                // scheduled job does not pile up duplicates
                conn.execute("ALTER TABLE jobs ADD COLUMN singleton_key TEXT", [])?;
                conn.execute_batch(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_jobs_singleton ON jobs(singleton_key, state);

                    CREATE TABLE IF NOT EXISTS schedules (
                        name TEXT PRIMARY KEY,
                        cron TEXT NOT NULL,
                        payload TEXT NOT NULL,
                        retry_limit INTEGER NOT NULL,
                        retry_backoff_secs INTEGER NOT NULL,
                        next_run_at TEXT NOT NULL,
                        created_at TEXT NOT NULL,
                        updated_at TEXT NOT NULL
                    );
                    "#,
                )?;
            }
            _ => {
                // Unknown version, skip
            }
        }
    }
    set_schema_version(conn, to_version)?;
    Ok(())
}
