//! Repository for database CRUD operations.
//!
//! One connection behind a mutex, shared by every clone. The collaborator
//! traits live in sibling modules (`versions`, `events`, `integrations`,
//! `jobs`); this file holds the connection plumbing and the project catalog.

use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::{ConfigEntity, Environment, Project};
use super::versions::start_history;
use crate::error::{ConfidantError, Result};
use crate::versions::{HistoryKey, Version};

/// Repository over the confidant database.
#[derive(Clone)]
pub struct Repository {
    conn: Arc<Mutex<Connection>>,
}

impl Repository {
    /// Create a new repository with the given connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub(super) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ConfidantError::Other("database connection lock poisoned".to_string()))
    }

    // ========================================================================
    // Project operations
    // ========================================================================

    /// Insert a project together with its first, default environment.
    pub fn insert_project(&self, project: &Project, default_env: &Environment) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO projects (id, workspace_id, slug, name, public_key,
                                  wrapped_private_key, store_private_key, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                project.id,
                project.workspace_id,
                project.slug,
                project.name,
                project.public_key.to_string(),
                project.wrapped_private_key,
                project.store_private_key,
                timestamp(&project.created_at),
            ],
        )
        .map_err(|e| constraint_error(e, || format!("project '{}'", project.slug)))?;
        insert_environment_row(&tx, default_env)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let conn = self.lock()?;
        let result = conn
            .query_row(
                &format!("SELECT {} FROM projects WHERE id = ?", PROJECT_COLUMNS),
                [id],
                row_to_project,
            )
            .optional()?;
        Ok(result)
    }

    pub fn find_project(&self, workspace_id: &str, slug: &str) -> Result<Option<Project>> {
        let conn = self.lock()?;
        let result = conn
            .query_row(
                &format!(
                    "SELECT {} FROM projects WHERE workspace_id = ? AND slug = ?",
                    PROJECT_COLUMNS
                ),
                params![workspace_id, slug],
                row_to_project,
            )
            .optional()?;
        Ok(result)
    }

    // ========================================================================
    // Environment operations
    // ========================================================================

    pub fn insert_environment(&self, env: &Environment) -> Result<()> {
        let conn = self.lock()?;
        insert_environment_row(&conn, env)
    }

    pub fn get_environment(&self, id: &str) -> Result<Option<Environment>> {
        let conn = self.lock()?;
        let result = conn
            .query_row(
                &format!("SELECT {} FROM environments WHERE id = ?", ENVIRONMENT_COLUMNS),
                [id],
                row_to_environment,
            )
            .optional()?;
        Ok(result)
    }

    /// Environments of a project, default first.
    pub fn list_environments(&self, project_id: &str) -> Result<Vec<Environment>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM environments WHERE project_id = ? ORDER BY is_default DESC, slug",
            ENVIRONMENT_COLUMNS
        ))?;
        let envs = stmt
            .query_map([project_id], row_to_environment)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(envs)
    }

    /// Delete an environment. Version histories in it go with it.
    pub fn delete_environment(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let rows = conn.execute("DELETE FROM environments WHERE id = ?", [id])?;
        Ok(rows > 0)
    }

    // ========================================================================
    // Entity operations
    // ========================================================================

    /// Insert an entity together with version 1 of each `(environment_id,
    /// value)` history. Nothing is written unless all of it is.
    pub fn insert_entity(
        &self,
        entity: &ConfigEntity,
        histories: &[(String, String)],
        created_by: &str,
    ) -> Result<Vec<Version>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO entities (id, project_id, name, slug, is_secret, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                entity.id,
                entity.project_id,
                entity.name,
                entity.slug,
                entity.is_secret,
                timestamp(&entity.created_at),
            ],
        )
        .map_err(|e| constraint_error(e, || format!("{} '{}'", entity.kind(), entity.slug)))?;

        let mut versions = Vec::with_capacity(histories.len());
        for (environment_id, value) in histories {
            let key = HistoryKey::new(&entity.id, environment_id);
            versions.push(start_history(&tx, &key, value, created_by)?);
        }

        tx.commit()?;
        Ok(versions)
    }

    pub fn get_entity(&self, id: &str) -> Result<Option<ConfigEntity>> {
        let conn = self.lock()?;
        let result = conn
            .query_row(
                &format!("SELECT {} FROM entities WHERE id = ?", ENTITY_COLUMNS),
                [id],
                row_to_entity,
            )
            .optional()?;
        Ok(result)
    }

    pub fn list_entities(&self, project_id: &str) -> Result<Vec<ConfigEntity>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM entities WHERE project_id = ? ORDER BY slug",
            ENTITY_COLUMNS
        ))?;
        let entities = stmt
            .query_map([project_id], row_to_entity)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entities)
    }

    pub fn delete_entity(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let rows = conn.execute("DELETE FROM entities WHERE id = ?", [id])?;
        Ok(rows > 0)
    }

    /// A project with one environment and one secret, for version tests.
    #[cfg(test)]
    pub fn seed_entity_for_tests(&self) -> (String, String) {
        let created_at = now();
        let project = Project {
            id: "p-test".to_string(),
            workspace_id: "ws-test".to_string(),
            slug: "test".to_string(),
            name: "test".to_string(),
            public_key: crate::crypto::generate_keypair().public,
            wrapped_private_key: None,
            store_private_key: false,
            created_at,
        };
        let env = Environment {
            id: "env-test".to_string(),
            project_id: project.id.clone(),
            slug: "default".to_string(),
            name: "default".to_string(),
            is_default: true,
            created_at,
        };
        let entity = ConfigEntity {
            id: "ent-test".to_string(),
            project_id: project.id.clone(),
            name: "DATABASE_URL".to_string(),
            slug: "database-url".to_string(),
            is_secret: true,
            created_at,
        };
        self.insert_project(&project, &env).unwrap();
        self.insert_entity(&entity, &[], "test").unwrap();
        (entity.id, env.id)
    }
}

// ============================================================================
// Row helpers
// ============================================================================

const PROJECT_COLUMNS: &str =
    "id, workspace_id, slug, name, public_key, wrapped_private_key, store_private_key, created_at";
const ENVIRONMENT_COLUMNS: &str = "id, project_id, slug, name, is_default, created_at";
const ENTITY_COLUMNS: &str = "id, project_id, name, slug, is_secret, created_at";

fn insert_environment_row(conn: &Connection, env: &Environment) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO environments (id, project_id, slug, name, is_default, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            env.id,
            env.project_id,
            env.slug,
            env.name,
            env.is_default,
            timestamp(&env.created_at),
        ],
    )
    .map_err(|e| {
        if env.is_default {
            constraint_error(e, || "a default environment for this project".to_string())
        } else {
            constraint_error(e, || format!("environment '{}'", env.slug))
        }
    })?;
    Ok(())
}

fn row_to_project(row: &Row) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        slug: row.get(2)?,
        name: row.get(3)?,
        public_key: parse_column(row, 4)?,
        wrapped_private_key: row.get(5)?,
        store_private_key: row.get(6)?,
        created_at: timestamp_column(row, 7)?,
    })
}

fn row_to_environment(row: &Row) -> rusqlite::Result<Environment> {
    Ok(Environment {
        id: row.get(0)?,
        project_id: row.get(1)?,
        slug: row.get(2)?,
        name: row.get(3)?,
        is_default: row.get(4)?,
        created_at: timestamp_column(row, 5)?,
    })
}

fn row_to_entity(row: &Row) -> rusqlite::Result<ConfigEntity> {
    Ok(ConfigEntity {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        slug: row.get(3)?,
        is_secret: row.get(4)?,
        created_at: timestamp_column(row, 5)?,
    })
}

/// Current time at the precision the database keeps.
pub(super) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339, so stored timestamps order correctly as text.
pub(super) fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(super) fn timestamp_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Read a text column through `FromStr`.
pub(super) fn parse_column<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Read a JSON text column.
pub(super) fn json_column<T: serde::de::DeserializeOwned>(
    row: &Row,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Turn uniqueness violations into `AlreadyExists` and dangling references
/// into `NotFound`.
pub(super) fn constraint_error(e: rusqlite::Error, what: impl FnOnce() -> String) -> ConfidantError {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        match err.extended_code {
            rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                return ConfidantError::already_exists(format!("{} already exists", what()));
            }
            rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => {
                return ConfidantError::not_found(format!("{} refers to a missing row", what()));
            }
            _ => {}
        }
    }
    ConfidantError::Db(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;
    use crate::db::init_in_memory;
    use crate::versions::VersionRepository;

    fn repo() -> Repository {
        Repository::new(init_in_memory().unwrap())
    }

    fn project(slug: &str) -> (Project, Environment) {
        let project = Project {
            id: format!("p-{}", slug),
            workspace_id: "ws".to_string(),
            slug: slug.to_string(),
            name: slug.to_string(),
            public_key: generate_keypair().public,
            wrapped_private_key: Some(vec![1, 2, 3]),
            store_private_key: true,
            created_at: now(),
        };
        let env = Environment {
            id: format!("env-{}", slug),
            project_id: project.id.clone(),
            slug: "default".to_string(),
            name: "default".to_string(),
            is_default: true,
            created_at: now(),
        };
        (project, env)
    }

    #[test]
    fn project_round_trips_with_its_default_environment() {
        let repo = repo();
        let (project, env) = project("api");
        repo.insert_project(&project, &env).unwrap();

        let loaded = repo.find_project("ws", "api").unwrap().unwrap();
        assert_eq!(loaded.public_key, project.public_key);
        assert_eq!(loaded.wrapped_private_key, Some(vec![1, 2, 3]));
        assert_eq!(loaded.created_at, project.created_at);
        assert_eq!(repo.list_environments(&project.id).unwrap(), vec![env]);
    }

    #[test]
    fn duplicate_slugs_are_already_exists() {
        let repo = repo();
        let (project, env) = project("api");
        repo.insert_project(&project, &env).unwrap();

        let mut dup = project.clone();
        dup.id = "p-other".to_string();
        let mut dup_env = env.clone();
        dup_env.id = "env-other".to_string();
        dup_env.project_id = dup.id.clone();
        assert!(matches!(
            repo.insert_project(&dup, &dup_env),
            Err(ConfidantError::AlreadyExists(_))
        ));
        // the failed insert left nothing behind
        assert!(repo.get_project("p-other").unwrap().is_none());
    }

    #[test]
    fn entity_in_missing_project_is_not_found() {
        let repo = repo();
        let entity = ConfigEntity {
            id: "e-1".to_string(),
            project_id: "nope".to_string(),
            name: "X".to_string(),
            slug: "x".to_string(),
            is_secret: false,
            created_at: now(),
        };
        assert!(matches!(
            repo.insert_entity(&entity, &[], "alice"),
            Err(ConfidantError::NotFound(_))
        ));
    }

    #[test]
    fn entity_and_histories_are_written_together() {
        let repo = repo();
        let (project, env) = project("web");
        repo.insert_project(&project, &env).unwrap();
        let entity = ConfigEntity {
            id: "e-1".to_string(),
            project_id: project.id.clone(),
            name: "PORT".to_string(),
            slug: "port".to_string(),
            is_secret: false,
            created_at: now(),
        };

        let result = repo.insert_entity(
            &entity,
            &[
                (env.id.clone(), "8080".to_string()),
                ("env-missing".to_string(), "9090".to_string()),
            ],
            "alice",
        );
        assert!(matches!(result, Err(ConfidantError::NotFound(_))));
        assert!(repo.get_entity("e-1").unwrap().is_none());
        assert!(repo.find_head(&HistoryKey::new("e-1", &env.id)).unwrap().is_none());

        let versions = repo
            .insert_entity(&entity, &[(env.id.clone(), "8080".to_string())], "alice")
            .unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version_number, 1);
    }

    #[test]
    fn timestamps_sort_as_text() {
        let early = DateTime::parse_from_rfc3339("2026-01-01T09:00:00Z").unwrap().with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2026-01-01T10:00:00.5Z").unwrap().with_timezone(&Utc);
        assert!(timestamp(&early) < timestamp(&late));
        assert_eq!(timestamp(&early), "2026-01-01T09:00:00.000000Z");
    }
}
