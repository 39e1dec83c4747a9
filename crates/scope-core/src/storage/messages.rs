//! Conversation and message persistence

use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use super::database::Database;
use super::parse_json_column;

/// Maximum messages replayed into model context.
pub const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub role: String,
    pub content: String,
    /// Ordered `{component, props}` descriptors for assistant turns.
    pub tool_calls: Option<Value>,
}

pub struct MessageStore<'a> {
    db: &'a Database,
}

impl<'a> MessageStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Create the conversation row if this is its first message.
    pub fn ensure_conversation(&self, conversation_id: &str, scope_id: &str) -> Result<()> {
        self.db.conn().execute(
            "INSERT OR IGNORE INTO conversations (id, scope_id, created_at) VALUES (?1, ?2, ?3)",
            params![conversation_id, scope_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn append(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
        tool_calls: Option<&Value>,
    ) -> Result<()> {
        self.db.conn().execute(
            "INSERT INTO messages (conversation_id, role, content, tool_calls, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                conversation_id,
                role,
                content,
                tool_calls.map(Value::to_string),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn set_title(&self, conversation_id: &str, title: &str) -> Result<bool> {
        let changed = self.db.conn().execute(
            "UPDATE conversations SET title = ?2 WHERE id = ?1",
            params![conversation_id, title],
        )?;
        Ok(changed > 0)
    }

    pub fn title(&self, conversation_id: &str) -> Result<Option<String>> {
        Ok(self
            .db
            .conn()
            .query_row(
                "SELECT title FROM conversations WHERE id = ?1",
                params![conversation_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten())
    }

    /// The most recent `limit` messages, oldest first.
    pub fn history(&self, conversation_id: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT role, content, tool_calls FROM (
                SELECT id, role, content, tool_calls FROM messages
                WHERE conversation_id = ?1 ORDER BY id DESC LIMIT ?2
             ) ORDER BY id ASC",
        )?;
        let messages = stmt
            .query_map(params![conversation_id, limit as i64], |row| {
                let tool_calls: Option<String> = row.get(2)?;
                Ok(StoredMessage {
                    role: row.get(0)?,
                    content: row.get(1)?,
                    tool_calls: tool_calls.as_deref().map(parse_json_column),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }
}
