//! Configuration service: the owner of every catalog and value mutation.
//!
//! Each successful mutation publishes exactly one event through the
//! [`Dispatcher`]. Publishing happens after the write has been committed, and
//! integration trouble never fails the mutation itself.

use std::sync::{Arc, LazyLock};

use age::secrecy::SecretString;
use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, info};
use uuid::Uuid;

use crate::crypto::{self, PrivateKey, generate_keypair};
use crate::db::{ConfigEntity, Environment, Project, Repository};
use crate::error::{ConfidantError, Result};
use crate::events::{Change, Dispatcher, EventType, NewEvent};
use crate::integrations::{
    Integration, IntegrationMetadata, IntegrationRepository, IntegrationType, MetadataStore,
    NewIntegration,
};
use crate::versions::{HistoryKey, RollbackOutcome, Version, VersionStore};

const DEFAULT_ENVIRONMENT: &str = "default";

static SLUG_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").expect("slug regex is valid at compile time")
});

/// Derive a slug from a display name: lowercase, runs of anything outside
/// `[a-z0-9]` collapsed to one `-`.
pub fn slugify(name: &str) -> Result<String> {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-').to_string();

    if !SLUG_PATTERN.is_match(&slug) {
        return Err(ConfidantError::validation(format!(
            "'{}' does not produce a valid slug",
            name
        )));
    }
    Ok(slug)
}

/// A freshly created project. The private key is only ever returned here.
#[derive(Debug)]
pub struct CreatedProject {
    pub project: Project,
    pub default_environment: Environment,
    pub private_key: PrivateKey,
}

/// How to obtain a project's private key when revealing a secret.
pub enum Unlock {
    /// The caller holds the key.
    Key(PrivateKey),
    /// Unwrap the key stored with the project.
    Passphrase(SecretString),
}

pub struct ConfigService {
    repo: Arc<Repository>,
    versions: VersionStore,
    metadata: MetadataStore,
    dispatcher: Arc<Dispatcher>,
}

impl ConfigService {
    pub fn new(repo: Arc<Repository>, metadata: MetadataStore, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            versions: VersionStore::new(repo.clone()),
            repo,
            metadata,
            dispatcher,
        }
    }

    pub fn versions(&self) -> &VersionStore {
        &self.versions
    }

    // ========================================================================
    // Projects and environments
    // ========================================================================

    /// Create a project with its keypair and a `default` environment. With a
    /// passphrase the private key is also stored, wrapped.
    pub async fn create_project(
        &self,
        workspace_id: &str,
        name: &str,
        actor: &str,
        passphrase: Option<SecretString>,
    ) -> Result<CreatedProject> {
        let slug = slugify(name)?;
        let keys = generate_keypair();
        let wrapped_private_key = passphrase
            .map(|passphrase| crypto::wrap_private_key(&keys.private, passphrase))
            .transpose()?;

        let created_at = chrono::Utc::now();
        let project = Project {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.to_string(),
            slug,
            name: name.to_string(),
            public_key: keys.public,
            store_private_key: wrapped_private_key.is_some(),
            wrapped_private_key,
            created_at,
        };
        let default_environment = Environment {
            id: Uuid::new_v4().to_string(),
            project_id: project.id.clone(),
            slug: DEFAULT_ENVIRONMENT.to_string(),
            name: DEFAULT_ENVIRONMENT.to_string(),
            is_default: true,
            created_at,
        };
        self.repo.insert_project(&project, &default_environment)?;

        info!(project_id = %project.id, slug = %project.slug, "Created project");
        self.dispatcher
            .publish(
                NewEvent::new(workspace_id, EventType::ProjectAdded, actor, &project.id).with_metadata(
                    json!({"name": project.slug, "storePrivateKey": project.store_private_key}),
                ),
            )
            .await?;

        Ok(CreatedProject {
            project,
            default_environment,
            private_key: keys.private,
        })
    }

    /// Add an environment. Only one environment per project may be the
    /// default; asking for a second is `AlreadyExists`.
    pub async fn create_environment(
        &self,
        project_id: &str,
        name: &str,
        is_default: bool,
        actor: &str,
    ) -> Result<Environment> {
        let project = self.project(project_id)?;
        let env = Environment {
            id: Uuid::new_v4().to_string(),
            project_id: project.id.clone(),
            slug: slugify(name)?,
            name: name.to_string(),
            is_default,
            created_at: chrono::Utc::now(),
        };
        self.repo.insert_environment(&env)?;

        self.dispatcher
            .publish(
                NewEvent::new(&project.workspace_id, EventType::EnvironmentAdded, actor, &env.id)
                    .with_metadata(json!({
                        "projectId": project.id,
                        "name": env.slug,
                        "environment": env.slug,
                    })),
            )
            .await?;
        Ok(env)
    }

    /// Delete a non-default environment and every version history in it.
    pub async fn delete_environment(&self, environment_id: &str, actor: &str) -> Result<()> {
        let env = self.environment(environment_id)?;
        if env.is_default {
            return Err(ConfidantError::validation(format!(
                "environment '{}' is the project default and cannot be deleted",
                env.slug
            )));
        }
        let project = self.project(&env.project_id)?;

        self.repo.delete_environment(&env.id)?;
        info!(environment_id = %env.id, slug = %env.slug, "Deleted environment");

        self.dispatcher
            .publish(
                NewEvent::new(&project.workspace_id, EventType::EnvironmentDeleted, actor, &env.id)
                    .with_metadata(json!({
                        "projectId": project.id,
                        "name": env.slug,
                        "environment": env.slug,
                    })),
            )
            .await?;
        Ok(())
    }

    // ========================================================================
    // Secrets and variables
    // ========================================================================

    /// Create a secret with version 1 in each listed environment. Values are
    /// sealed with the project key before they are stored.
    pub async fn create_secret(
        &self,
        project_id: &str,
        name: &str,
        values: &[(String, String)],
        actor: &str,
    ) -> Result<ConfigEntity> {
        self.create_entity(project_id, name, true, values, actor).await
    }

    /// Create a variable with version 1 in each listed environment.
    pub async fn create_variable(
        &self,
        project_id: &str,
        name: &str,
        values: &[(String, String)],
        actor: &str,
    ) -> Result<ConfigEntity> {
        self.create_entity(project_id, name, false, values, actor).await
    }

    async fn create_entity(
        &self,
        project_id: &str,
        name: &str,
        is_secret: bool,
        values: &[(String, String)],
        actor: &str,
    ) -> Result<ConfigEntity> {
        let project = self.project(project_id)?;
        let mut environments: Vec<Environment> = Vec::with_capacity(values.len());
        for (environment_id, _) in values {
            if environments.iter().any(|env| &env.id == environment_id) {
                return Err(ConfidantError::validation(format!(
                    "environment {} is listed more than once for '{}'",
                    environment_id, name
                )));
            }
            environments.push(self.environment_in(&project, environment_id)?);
        }

        let entity = ConfigEntity {
            id: Uuid::new_v4().to_string(),
            project_id: project.id.clone(),
            name: name.to_string(),
            slug: slugify(name)?,
            is_secret,
            created_at: chrono::Utc::now(),
        };
        let histories = environments
            .iter()
            .zip(values)
            .map(|(env, (_, value))| {
                Ok((env.id.clone(), self.encode_value(&project, &entity, value)?))
            })
            .collect::<Result<Vec<_>>>()?;
        self.repo.insert_entity(&entity, &histories, actor)?;

        let slugs: Vec<&str> = environments.iter().map(|env| env.slug.as_str()).collect();
        self.dispatcher
            .publish(
                NewEvent::new(
                    &project.workspace_id,
                    EventType::for_entity(is_secret, Change::Added),
                    actor,
                    &entity.id,
                )
                .with_metadata(json!({
                    "projectId": project.id,
                    "name": entity.name,
                    "environments": slugs,
                })),
            )
            .await?;
        Ok(entity)
    }

    /// Write a new value: append to the history, or start one when this
    /// environment has none yet.
    pub async fn set_value(
        &self,
        entity_id: &str,
        environment_id: &str,
        value: &str,
        actor: &str,
    ) -> Result<Version> {
        let (project, entity, env) = self.address(entity_id, environment_id)?;
        let key = HistoryKey::new(&entity.id, &env.id);
        let stored = self.encode_value(&project, &entity, value)?;

        let version = self.versions.write(&key, &stored, actor)?;
        debug!(history = %key, version = version.version_number, "Stored new version");

        self.publish_entity_update(
            &project,
            &entity,
            &env,
            actor,
            json!({"version": version.version_number}),
        )
        .await?;
        Ok(version)
    }

    /// Move the current pointer back. A rollback that applies nothing is not
    /// a mutation and publishes nothing.
    pub async fn rollback(
        &self,
        entity_id: &str,
        environment_id: &str,
        count: u32,
        actor: &str,
    ) -> Result<RollbackOutcome> {
        let (project, entity, env) = self.address(entity_id, environment_id)?;
        let outcome = self
            .versions
            .rollback(&HistoryKey::new(&entity.id, &env.id), count)?;

        if outcome.applied > 0 {
            self.publish_entity_update(
                &project,
                &entity,
                &env,
                actor,
                json!({"rollback": outcome.applied, "version": outcome.current}),
            )
            .await?;
        }
        Ok(outcome)
    }

    pub async fn set_enabled(
        &self,
        entity_id: &str,
        environment_id: &str,
        enabled: bool,
        actor: &str,
    ) -> Result<()> {
        let (project, entity, env) = self.address(entity_id, environment_id)?;
        self.versions
            .set_enabled(&HistoryKey::new(&entity.id, &env.id), enabled)?;

        self.publish_entity_update(&project, &entity, &env, actor, json!({"enabled": enabled}))
            .await
    }

    /// Delete a secret or variable together with all of its histories.
    pub async fn delete_entity(&self, entity_id: &str, actor: &str) -> Result<()> {
        let entity = self.entity(entity_id)?;
        let project = self.project(&entity.project_id)?;

        let histories = self.versions.delete_entity_history(&entity.id)?;
        self.repo.delete_entity(&entity.id)?;
        info!(entity_id = %entity.id, histories, "Deleted {}", entity.kind());

        self.dispatcher
            .publish(
                NewEvent::new(
                    &project.workspace_id,
                    EventType::for_entity(entity.is_secret, Change::Deleted),
                    actor,
                    &entity.id,
                )
                .with_metadata(json!({"projectId": project.id, "name": entity.name})),
            )
            .await?;
        Ok(())
    }

    /// Plaintext of a secret's current version, or `None` when the
    /// environment has no history for it.
    pub fn reveal_secret(
        &self,
        entity_id: &str,
        environment_id: &str,
        unlock: Unlock,
    ) -> Result<Option<String>> {
        let (project, entity, env) = self.address(entity_id, environment_id)?;
        if !entity.is_secret {
            return Err(ConfidantError::validation(format!(
                "'{}' is a variable, read it with current_value",
                entity.name
            )));
        }

        let Some(current) = self
            .versions
            .get_current(&HistoryKey::new(&entity.id, &env.id))?
        else {
            return Ok(None);
        };

        let private_key = match unlock {
            Unlock::Key(key) => key,
            Unlock::Passphrase(passphrase) => {
                let wrapped = project.wrapped_private_key.as_deref().ok_or_else(|| {
                    ConfidantError::validation(format!(
                        "project '{}' does not store its private key",
                        project.slug
                    ))
                })?;
                crypto::unwrap_private_key(wrapped, passphrase)?
            }
        };
        if private_key.public_key() != project.public_key {
            return Err(ConfidantError::decryption(format!(
                "key does not belong to project '{}'",
                project.slug
            )));
        }

        crypto::open_value(&current.value, &private_key).map(Some)
    }

    /// Current value of a variable.
    pub fn current_value(&self, entity_id: &str, environment_id: &str) -> Result<Option<String>> {
        let (_, entity, env) = self.address(entity_id, environment_id)?;
        if entity.is_secret {
            return Err(ConfidantError::validation(format!(
                "'{}' is a secret, read it with reveal_secret",
                entity.name
            )));
        }
        Ok(self
            .versions
            .get_current(&HistoryKey::new(&entity.id, &env.id))?
            .map(|version| version.value))
    }

    // ========================================================================
    // Integrations
    // ========================================================================

    /// Register an integration. The configuration is validated for its type
    /// and stored sealed with the server key.
    pub async fn create_integration(
        &self,
        workspace_id: &str,
        kind: IntegrationType,
        name: &str,
        config: Value,
        notify_on: Vec<EventType>,
        actor: &str,
    ) -> Result<Integration> {
        kind.validate_config(&config)?;
        let encrypted_metadata = self.metadata.cipher().seal(&IntegrationMetadata::new(config))?;

        let integration = self.repo.insert_integration(&NewIntegration {
            workspace_id: workspace_id.to_string(),
            kind,
            name: name.to_string(),
            notify_on,
            encrypted_metadata,
        })?;
        info!(integration_id = %integration.id, %kind, "Created integration");

        self.dispatcher
            .publish(
                NewEvent::new(workspace_id, EventType::IntegrationAdded, actor, &integration.id)
                    .with_metadata(json!({"name": integration.name, "kind": kind.as_str()})),
            )
            .await?;
        Ok(integration)
    }

    /// Remove an integration. Its pending cleanup goes with it.
    pub async fn delete_integration(&self, integration_id: &str, actor: &str) -> Result<()> {
        let integration = self.repo.get_integration(integration_id)?.ok_or_else(|| {
            ConfidantError::not_found(format!("integration {} not found", integration_id))
        })?;
        self.repo.delete_integration(&integration.id)?;

        self.dispatcher
            .publish(
                NewEvent::new(
                    &integration.workspace_id,
                    EventType::IntegrationDeleted,
                    actor,
                    &integration.id,
                )
                .with_metadata(json!({
                    "name": integration.name,
                    "kind": integration.kind.as_str(),
                })),
            )
            .await?;
        Ok(())
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    fn project(&self, id: &str) -> Result<Project> {
        self.repo
            .get_project(id)?
            .ok_or_else(|| ConfidantError::not_found(format!("project {} not found", id)))
    }

    fn environment(&self, id: &str) -> Result<Environment> {
        self.repo
            .get_environment(id)?
            .ok_or_else(|| ConfidantError::not_found(format!("environment {} not found", id)))
    }

    fn environment_in(&self, project: &Project, id: &str) -> Result<Environment> {
        let env = self.environment(id)?;
        if env.project_id != project.id {
            return Err(ConfidantError::not_found(format!(
                "environment {} not found in project '{}'",
                id, project.slug
            )));
        }
        Ok(env)
    }

    fn entity(&self, id: &str) -> Result<ConfigEntity> {
        self.repo
            .get_entity(id)?
            .ok_or_else(|| ConfidantError::not_found(format!("entity {} not found", id)))
    }

    /// Resolve an (entity, environment) pair within one project.
    fn address(
        &self,
        entity_id: &str,
        environment_id: &str,
    ) -> Result<(Project, ConfigEntity, Environment)> {
        let entity = self.entity(entity_id)?;
        let project = self.project(&entity.project_id)?;
        let env = self.environment_in(&project, environment_id)?;
        Ok((project, entity, env))
    }

    fn encode_value(&self, project: &Project, entity: &ConfigEntity, value: &str) -> Result<String> {
        if entity.is_secret {
            crypto::seal_value(value, &project.public_key)
        } else {
            Ok(value.to_string())
        }
    }

    async fn publish_entity_update(
        &self,
        project: &Project,
        entity: &ConfigEntity,
        env: &Environment,
        actor: &str,
        details: Value,
    ) -> Result<()> {
        let mut metadata = json!({
            "projectId": project.id,
            "name": entity.name,
            "environment": env.slug,
            "environmentId": env.id,
        });
        if let (Some(target), Some(extra)) = (metadata.as_object_mut(), details.as_object()) {
            target.extend(extra.clone());
        }

        self.dispatcher
            .publish(
                NewEvent::new(
                    &project.workspace_id,
                    EventType::for_entity(entity.is_secret, Change::Updated),
                    actor,
                    &entity.id,
                )
                .with_metadata(metadata),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs_are_lowercase_and_dashed() {
        assert_eq!(slugify("Database URL").unwrap(), "database-url");
        assert_eq!(slugify("  API__key!! v2 ").unwrap(), "api-key-v2");
        assert_eq!(slugify("prod").unwrap(), "prod");
    }

    #[test]
    fn names_without_alphanumerics_are_rejected() {
        assert!(matches!(slugify("!!!"), Err(ConfidantError::Validation(_))));
        assert!(matches!(slugify(""), Err(ConfidantError::Validation(_))));
    }
}
