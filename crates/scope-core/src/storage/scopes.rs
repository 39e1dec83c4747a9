//! Scope records and their datasource sets

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::database::Database;
use super::parse_ts;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub id: String,
    pub owner: String,
    pub name: String,
    pub datasources: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct ScopeStore<'a> {
    db: &'a Database,
}

impl<'a> ScopeStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn create(&self, owner: &str, name: &str, datasources: &[String]) -> Result<Scope> {
        let now = Utc::now();
        let scope = Scope {
            id: uuid::Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            name: name.to_string(),
            datasources: dedup_preserving_order(datasources),
            created_at: now,
            updated_at: now,
        };

        self.db.conn().execute(
            "INSERT INTO scopes (id, owner, name, datasources, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                scope.id,
                scope.owner,
                scope.name,
                serde_json::to_string(&scope.datasources)?,
                now.to_rfc3339(),
            ],
        )?;

        Ok(scope)
    }

    pub fn get(&self, id: &str) -> Result<Option<Scope>> {
        self.db
            .conn()
            .query_row(
                "SELECT id, owner, name, datasources, created_at, updated_at
                 FROM scopes WHERE id = ?1",
                [id],
                Self::map_row,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn list_for_owner(&self, owner: &str) -> Result<Vec<Scope>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT id, owner, name, datasources, created_at, updated_at
             FROM scopes WHERE owner = ?1 ORDER BY updated_at DESC",
        )?;
        let scopes = stmt
            .query_map([owner], Self::map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(scopes)
    }

    /// Replace a scope's datasource set. Returns false if the scope is gone.
    pub fn set_datasources(&self, id: &str, datasources: &[String]) -> Result<bool> {
        let updated = self.db.conn().execute(
            "UPDATE scopes SET datasources = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                serde_json::to_string(&dedup_preserving_order(datasources))?,
                Utc::now().to_rfc3339(),
                id,
            ],
        )?;
        Ok(updated > 0)
    }

    fn map_row(row: &rusqlite::Row) -> rusqlite::Result<Scope> {
        let datasources: String = row.get(3)?;
        let created_at: String = row.get(4)?;
        let updated_at: String = row.get(5)?;
        Ok(Scope {
            id: row.get(0)?,
            owner: row.get(1)?,
            name: row.get(2)?,
            datasources: serde_json::from_str(&datasources).unwrap_or_default(),
            created_at: parse_ts(&created_at),
            updated_at: parse_ts(&updated_at),
        })
    }
}

fn dedup_preserving_order(refs: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    refs.iter()
        .filter(|r| seen.insert(r.as_str()))
        .cloned()
        .collect()
}
