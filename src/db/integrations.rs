//! Integration rows on SQLite.

use rusqlite::types::Value as SqlValue;
use rusqlite::{OptionalExtension, Row, params, params_from_iter};
use uuid::Uuid;

use super::repository::{Repository, json_column, now, parse_column, timestamp, timestamp_column};
use crate::error::{ConfidantError, Result};
use crate::integrations::{
    Integration, IntegrationFilter, IntegrationRepository, NewIntegration,
};

const INTEGRATION_COLUMNS: &str = "id, workspace_id, kind, name, notify_on, enabled, \
     encrypted_metadata, metadata_version, created_at";

fn row_to_integration(row: &Row) -> rusqlite::Result<Integration> {
    Ok(Integration {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        kind: parse_column(row, 2)?,
        name: row.get(3)?,
        notify_on: json_column(row, 4)?,
        enabled: row.get(5)?,
        encrypted_metadata: row.get(6)?,
        metadata_version: row.get(7)?,
        created_at: timestamp_column(row, 8)?,
    })
}

impl IntegrationRepository for Repository {
    fn find_integrations(&self, filter: &IntegrationFilter) -> Result<Vec<Integration>> {
        let mut sql = format!("SELECT {} FROM integrations WHERE 1 = 1", INTEGRATION_COLUMNS);
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(workspace_id) = &filter.workspace_id {
            sql.push_str(" AND workspace_id = ?");
            args.push(SqlValue::Text(workspace_id.clone()));
        }
        if let Some(kind) = filter.kind {
            sql.push_str(" AND kind = ?");
            args.push(SqlValue::Text(kind.as_str().to_string()));
        }
        if filter.enabled_only {
            sql.push_str(" AND enabled = 1");
        }
        sql.push_str(" ORDER BY created_at, id");

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let integrations = stmt
            .query_map(params_from_iter(args), row_to_integration)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(integrations)
    }

    fn get_integration(&self, id: &str) -> Result<Option<Integration>> {
        let conn = self.lock()?;
        let result = conn
            .query_row(
                &format!("SELECT {} FROM integrations WHERE id = ?", INTEGRATION_COLUMNS),
                [id],
                row_to_integration,
            )
            .optional()?;
        Ok(result)
    }

    fn insert_integration(&self, new: &NewIntegration) -> Result<Integration> {
        let integration = Integration {
            id: Uuid::new_v4().to_string(),
            workspace_id: new.workspace_id.clone(),
            kind: new.kind,
            name: new.name.clone(),
            notify_on: new.notify_on.clone(),
            enabled: true,
            encrypted_metadata: new.encrypted_metadata.clone(),
            metadata_version: 0,
            created_at: now(),
        };
        let created_at = timestamp(&integration.created_at);

        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO integrations (id, workspace_id, kind, name, notify_on, enabled,
                                      encrypted_metadata, metadata_version, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, 0, ?7, ?7)
            "#,
            params![
                integration.id,
                integration.workspace_id,
                integration.kind.as_str(),
                integration.name,
                serde_json::to_string(&integration.notify_on)?,
                integration.encrypted_metadata,
                created_at,
            ],
        )?;
        Ok(integration)
    }

    fn update_integration_metadata(
        &self,
        id: &str,
        blob: &str,
        expected_version: i64,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let rows = conn.execute(
            r#"
            UPDATE integrations
            SET encrypted_metadata = ?1, metadata_version = metadata_version + 1, updated_at = ?2
            WHERE id = ?3 AND metadata_version = ?4
            "#,
            params![blob, timestamp(&now()), id, expected_version],
        )?;
        Ok(rows == 1)
    }

    fn set_integration_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "UPDATE integrations SET enabled = ?, updated_at = ? WHERE id = ?",
            params![enabled, timestamp(&now()), id],
        )?;
        if rows == 0 {
            return Err(ConfidantError::not_found(format!(
                "integration {} not found",
                id
            )));
        }
        Ok(())
    }

    fn delete_integration(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let rows = conn.execute("DELETE FROM integrations WHERE id = ?", [id])?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_in_memory;
    use crate::events::EventType;
    use crate::integrations::IntegrationType;

    fn insert(repo: &Repository, workspace_id: &str, kind: IntegrationType) -> Integration {
        repo.insert_integration(&NewIntegration {
            workspace_id: workspace_id.to_string(),
            kind,
            name: "n".to_string(),
            notify_on: vec![EventType::SecretAdded, EventType::EnvironmentDeleted],
            encrypted_metadata: "blob-0".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn metadata_update_is_compare_and_swap() {
        let repo = Repository::new(init_in_memory().unwrap());
        let integration = insert(&repo, "ws", IntegrationType::Webhook);

        assert!(repo.update_integration_metadata(&integration.id, "blob-1", 0).unwrap());
        // a writer still holding version 0 loses
        assert!(!repo.update_integration_metadata(&integration.id, "blob-x", 0).unwrap());

        let stored = repo.get_integration(&integration.id).unwrap().unwrap();
        assert_eq!(stored.encrypted_metadata, "blob-1");
        assert_eq!(stored.metadata_version, 1);
        assert_eq!(stored.notify_on, integration.notify_on);
    }

    #[test]
    fn filters_narrow_the_listing() {
        let repo = Repository::new(init_in_memory().unwrap());
        let slack = insert(&repo, "ws", IntegrationType::Slack);
        insert(&repo, "ws", IntegrationType::Webhook);
        insert(&repo, "other", IntegrationType::Slack);
        repo.set_integration_enabled(&slack.id, false).unwrap();

        assert_eq!(repo.find_integrations(&IntegrationFilter::all()).unwrap().len(), 3);

        let active = repo.find_integrations(&IntegrationFilter::active_in("ws")).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].kind, IntegrationType::Webhook);

        let slack_only = repo
            .find_integrations(&IntegrationFilter {
                kind: Some(IntegrationType::Slack),
                ..IntegrationFilter::all()
            })
            .unwrap();
        assert_eq!(slack_only.len(), 2);
    }

    #[test]
    fn missing_integration_cannot_be_toggled() {
        let repo = Repository::new(init_in_memory().unwrap());
        assert!(matches!(
            repo.set_integration_enabled("nope", true),
            Err(ConfidantError::NotFound(_))
        ));
        assert!(!repo.delete_integration("nope").unwrap());
    }
}
