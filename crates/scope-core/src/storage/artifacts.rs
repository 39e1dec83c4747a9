//! Agent-produced artifacts (syntheses, drafts)

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::database::Database;
use super::{parse_json_column, parse_ts};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: String,
    pub scope_id: String,
    pub kind: String,
    pub title: String,
    pub content: Value,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update. `None` leaves the column unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArtifactPatch {
    pub title: Option<String>,
    pub content: Option<Value>,
    pub status: Option<String>,
}

pub struct ArtifactStore<'a> {
    db: &'a Database,
}

impl<'a> ArtifactStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn create(
        &self,
        scope_id: &str,
        kind: &str,
        title: &str,
        content: &Value,
        status: &str,
    ) -> Result<Artifact> {
        let now = Utc::now();
        let artifact = Artifact {
            id: uuid::Uuid::new_v4().to_string(),
            scope_id: scope_id.to_string(),
            kind: kind.to_string(),
            title: title.to_string(),
            content: content.clone(),
            status: status.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.db.conn().execute(
            "INSERT INTO artifacts (id, scope_id, kind, title, content, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                artifact.id,
                artifact.scope_id,
                artifact.kind,
                artifact.title,
                artifact.content.to_string(),
                artifact.status,
                now.to_rfc3339(),
            ],
        )?;
        Ok(artifact)
    }

    pub fn get(&self, id: &str) -> Result<Option<Artifact>> {
        self.db
            .conn()
            .query_row(
                "SELECT id, scope_id, kind, title, content, status, created_at, updated_at
                 FROM artifacts WHERE id = ?1",
                [id],
                Self::map_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Most recently updated first.
    pub fn list(&self, scope_id: &str, kind: Option<&str>, limit: usize) -> Result<Vec<Artifact>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT id, scope_id, kind, title, content, status, created_at, updated_at
             FROM artifacts
             WHERE scope_id = ?1 AND (?2 IS NULL OR kind = ?2)
             ORDER BY updated_at DESC, rowid DESC
             LIMIT ?3",
        )?;
        let artifacts = stmt
            .query_map(params![scope_id, kind, limit as i64], Self::map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(artifacts)
    }

    /// Apply a patch. Returns the updated artifact, or `None` if missing.
    pub fn update(&self, id: &str, patch: &ArtifactPatch) -> Result<Option<Artifact>> {
        let updated = self.db.conn().execute(
            "UPDATE artifacts SET
                title = COALESCE(?1, title),
                content = COALESCE(?2, content),
                status = COALESCE(?3, status),
                updated_at = ?4
             WHERE id = ?5",
            params![
                patch.title,
                patch.content.as_ref().map(Value::to_string),
                patch.status,
                Utc::now().to_rfc3339(),
                id,
            ],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        self.get(id)
    }

    fn map_row(row: &rusqlite::Row) -> rusqlite::Result<Artifact> {
        let content: String = row.get(4)?;
        let created_at: String = row.get(6)?;
        let updated_at: String = row.get(7)?;
        Ok(Artifact {
            id: row.get(0)?,
            scope_id: row.get(1)?,
            kind: row.get(2)?,
            title: row.get(3)?,
            content: parse_json_column(&content),
            status: row.get(5)?,
            created_at: parse_ts(&created_at),
            updated_at: parse_ts(&updated_at),
        })
    }
}
