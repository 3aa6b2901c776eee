//! Catalog rows: projects, environments and the entities that own version
//! histories.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::crypto::PublicKey;

/// A project and its encryption key.
#[derive(Debug, Clone)]
pub struct Project {
    pub id: String,
    pub workspace_id: String,
    pub slug: String,
    pub name: String,
    pub public_key: PublicKey,
    /// age-wrapped private key, present only when `store_private_key` is set.
    pub wrapped_private_key: Option<Vec<u8>>,
    pub store_private_key: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub id: String,
    pub project_id: String,
    pub slug: String,
    pub name: String,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

/// A secret or a variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigEntity {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub slug: String,
    pub is_secret: bool,
    pub created_at: DateTime<Utc>,
}

impl ConfigEntity {
    pub fn kind(&self) -> &'static str {
        if self.is_secret { "secret" } else { "variable" }
    }
}
