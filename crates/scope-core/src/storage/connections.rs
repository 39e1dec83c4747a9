//! Per-user provider credentials
//!
//! One row per (user, provider). Rows are mutated in place on refresh and
//! replaced on reconnect; never duplicated.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use super::database::Database;
use super::{parse_json_column, parse_optional_ts, parse_ts};
use crate::integrations::Provider;

#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub user_id: String,
    pub provider: Provider,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    pub metadata: Value,
}

/// Connection status without secrets, for settings screens.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSummary {
    pub provider: Provider,
    pub metadata: Value,
    pub connected_at: DateTime<Utc>,
}

pub struct ConnectionStore<'a> {
    db: &'a Database,
}

impl<'a> ConnectionStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert or replace the credential for (user, provider).
    pub fn upsert(&self, credential: &Credential) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.db.conn().execute(
            "INSERT INTO connections
                (id, user_id, provider, access_token, refresh_token, expires_at, scope, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
             ON CONFLICT(user_id, provider) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                scope = excluded.scope,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at",
            params![
                uuid::Uuid::new_v4().to_string(),
                credential.user_id,
                credential.provider.storage_key(),
                credential.access_token,
                credential.refresh_token,
                credential.expires_at.map(|t| t.to_rfc3339()),
                credential.scope,
                credential.metadata.to_string(),
                now,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, user_id: &str, provider: Provider) -> Result<Option<Credential>> {
        let row = self
            .db
            .conn()
            .query_row(
                "SELECT access_token, refresh_token, expires_at, scope, metadata
                 FROM connections WHERE user_id = ?1 AND provider = ?2",
                params![user_id, provider.storage_key()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(
            |(access_token, refresh_token, expires_at, scope, metadata)| Credential {
                user_id: user_id.to_string(),
                provider,
                access_token,
                refresh_token,
                expires_at: parse_optional_ts(expires_at.as_deref()),
                scope,
                metadata: parse_json_column(&metadata),
            },
        ))
    }

    /// Connected providers for a user, in provider order.
    pub fn list_for_user(&self, user_id: &str) -> Result<Vec<ConnectionSummary>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT provider, metadata, created_at FROM connections
             WHERE user_id = ?1 ORDER BY provider",
        )?;
        let rows = stmt
            .query_map([user_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(provider, metadata, created_at)| {
                let provider = provider.parse::<Provider>().ok()?;
                Some(ConnectionSummary {
                    provider,
                    metadata: parse_json_column(&metadata),
                    connected_at: parse_ts(&created_at),
                })
            })
            .collect())
    }

    /// Persist a refreshed access token. A `None` refresh token keeps the
    /// stored one.
    pub fn update_tokens(
        &self,
        user_id: &str,
        provider: Provider,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let updated = self.db.conn().execute(
            "UPDATE connections SET
                access_token = ?1,
                refresh_token = COALESCE(?2, refresh_token),
                expires_at = ?3,
                updated_at = ?4
             WHERE user_id = ?5 AND provider = ?6",
            params![
                access_token,
                refresh_token,
                expires_at.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
                user_id,
                provider.storage_key(),
            ],
        )?;
        Ok(updated > 0)
    }

    pub fn delete(&self, user_id: &str, provider: Provider) -> Result<bool> {
        let deleted = self.db.conn().execute(
            "DELETE FROM connections WHERE user_id = ?1 AND provider = ?2",
            params![user_id, provider.storage_key()],
        )?;
        Ok(deleted > 0)
    }
}
