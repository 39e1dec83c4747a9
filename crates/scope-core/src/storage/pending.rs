//! Server-owned pending write state, one row per conversation

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::database::Database;

pub struct PendingWriteStore<'a> {
    db: &'a Database,
}

impl<'a> PendingWriteStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Load the stored state. Unreadable rows are treated as absent.
    pub fn load<T: DeserializeOwned>(&self, conversation_id: &str) -> Result<Option<T>> {
        let raw: Option<String> = self
            .db
            .conn()
            .query_row(
                "SELECT actions FROM pending_writes WHERE conversation_id = ?1",
                [conversation_id],
                |row| row.get(0),
            )
            .optional()?;

        Ok(raw.and_then(|r| match serde_json::from_str(&r) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(conversation_id, error = %e, "Discarding unreadable pending write state");
                None
            }
        }))
    }

    /// Replace the stored state. `label` is a queryable state name.
    pub fn save<T: Serialize>(&self, conversation_id: &str, label: &str, state: &T) -> Result<()> {
        let json = serde_json::to_string(state).context("Failed to serialize pending write state")?;
        self.db.conn().execute(
            "INSERT INTO pending_writes (conversation_id, state, actions, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(conversation_id) DO UPDATE SET
                state = excluded.state,
                actions = excluded.actions,
                updated_at = excluded.updated_at",
            params![conversation_id, label, json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn clear(&self, conversation_id: &str) -> Result<()> {
        self.db.conn().execute(
            "DELETE FROM pending_writes WHERE conversation_id = ?1",
            [conversation_id],
        )?;
        Ok(())
    }

    pub fn label(&self, conversation_id: &str) -> Result<Option<String>> {
        self.db
            .conn()
            .query_row(
                "SELECT state FROM pending_writes WHERE conversation_id = ?1",
                [conversation_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }
}
