//! Signal rows
//!
//! `external_id` is the dedup key. Bulk sync inserts one record at a time
//! so a duplicate only affects its own row; webhook ingest upserts.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::{Map, Value};

use super::database::Database;
use super::{parse_optional_ts, parse_ts};
use crate::integrations::{Provider, Severity, Signal, SignalKind};

/// Result of inserting one signal. A duplicate is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// A persisted signal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSignal {
    pub id: String,
    pub scope_id: String,
    #[serde(flatten)]
    pub signal: Signal,
    pub has_embedding: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalQuery {
    pub scope_id: String,
    pub source: Option<Provider>,
    pub kind: Option<SignalKind>,
    pub limit: usize,
}

impl SignalQuery {
    pub fn for_scope(scope_id: impl Into<String>) -> Self {
        Self {
            scope_id: scope_id.into(),
            source: None,
            kind: None,
            limit: 20,
        }
    }
}

const SELECT_COLUMNS: &str = "id, scope_id, source, kind, severity, title, body, url, metadata,
     external_id, datasource_ref, source_ts, embedding IS NOT NULL, created_at";

pub struct SignalStore<'a> {
    db: &'a Database,
}

impl<'a> SignalStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a single signal. A unique-constraint hit on `external_id`
    /// yields [`InsertOutcome::Duplicate`]; any other failure is an error.
    pub fn insert(&self, scope_id: &str, signal: &Signal) -> Result<InsertOutcome> {
        let result = self.db.conn().execute(
            "INSERT INTO signals
                (id, scope_id, source, kind, severity, title, body, url, metadata,
                 external_id, datasource_ref, source_ts, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                uuid::Uuid::new_v4().to_string(),
                scope_id,
                signal.source.storage_key(),
                signal.kind.as_str(),
                signal.severity.map(|s| s.as_str()),
                signal.title,
                signal.body,
                signal.url,
                Value::Object(signal.metadata.clone()).to_string(),
                signal.external_id,
                signal.datasource_ref,
                signal.source_ts.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                Ok(InsertOutcome::Duplicate)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Insert or replace content on `external_id` conflict. The original
    /// row id is kept and returned.
    pub fn upsert(&self, scope_id: &str, signal: &Signal, embedding: Option<&[f32]>) -> Result<String> {
        let id: String = self.db.conn().query_row(
            "INSERT INTO signals
                (id, scope_id, source, kind, severity, title, body, url, metadata,
                 external_id, datasource_ref, source_ts, embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(external_id) DO UPDATE SET
                scope_id = excluded.scope_id,
                source = excluded.source,
                kind = excluded.kind,
                severity = excluded.severity,
                title = excluded.title,
                body = excluded.body,
                url = excluded.url,
                metadata = excluded.metadata,
                datasource_ref = COALESCE(excluded.datasource_ref, signals.datasource_ref),
                source_ts = excluded.source_ts,
                embedding = COALESCE(excluded.embedding, signals.embedding)
             RETURNING id",
            params![
                uuid::Uuid::new_v4().to_string(),
                scope_id,
                signal.source.storage_key(),
                signal.kind.as_str(),
                signal.severity.map(|s| s.as_str()),
                signal.title,
                signal.body,
                signal.url,
                Value::Object(signal.metadata.clone()).to_string(),
                signal.external_id,
                signal.datasource_ref,
                signal.source_ts.map(|t| t.to_rfc3339()),
                embedding.map(embedding_to_blob),
                Utc::now().to_rfc3339(),
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Delete every signal of a scope that came from one of `refs`.
    pub fn delete_by_datasources(&self, scope_id: &str, refs: &[String]) -> Result<usize> {
        let mut stmt = self
            .db
            .conn()
            .prepare("DELETE FROM signals WHERE scope_id = ?1 AND datasource_ref = ?2")?;
        let mut deleted = 0;
        for datasource in refs {
            deleted += stmt.execute(params![scope_id, datasource])?;
        }
        Ok(deleted)
    }

    pub fn get_by_external_id(&self, external_id: &str) -> Result<Option<StoredSignal>> {
        self.db
            .conn()
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM signals WHERE external_id = ?1"),
                [external_id],
                Self::map_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Newest first, optionally filtered by source and kind.
    pub fn list(&self, query: &SignalQuery) -> Result<Vec<StoredSignal>> {
        let mut stmt = self.db.conn().prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM signals
             WHERE scope_id = ?1
               AND (?2 IS NULL OR source = ?2)
               AND (?3 IS NULL OR kind = ?3)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?4"
        ))?;
        let signals = stmt
            .query_map(
                params![
                    query.scope_id,
                    query.source.map(|s| s.storage_key()),
                    query.kind.map(|k| k.as_str()),
                    query.limit as i64,
                ],
                Self::map_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(signals)
    }

    /// Case-insensitive substring match over title and body.
    pub fn search(&self, scope_id: &str, text: &str, limit: usize) -> Result<Vec<StoredSignal>> {
        let pattern = format!("%{}%", text.trim());
        let mut stmt = self.db.conn().prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM signals
             WHERE scope_id = ?1 AND (title LIKE ?2 OR body LIKE ?2)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?3"
        ))?;
        let signals = stmt
            .query_map(params![scope_id, pattern, limit as i64], Self::map_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(signals)
    }

    pub fn count_for_scope(&self, scope_id: &str) -> Result<usize> {
        let count: i64 = self.db.conn().query_row(
            "SELECT COUNT(*) FROM signals WHERE scope_id = ?1",
            [scope_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn embedding(&self, external_id: &str) -> Result<Option<Vec<f32>>> {
        let blob: Option<Option<Vec<u8>>> = self
            .db
            .conn()
            .query_row(
                "SELECT embedding FROM signals WHERE external_id = ?1",
                [external_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob.flatten().map(|b| blob_to_embedding(&b)))
    }

    fn map_row(row: &rusqlite::Row) -> rusqlite::Result<StoredSignal> {
        let source: String = row.get(2)?;
        let source = source.parse::<Provider>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let kind: String = row.get(3)?;
        let severity: Option<String> = row.get(4)?;
        let metadata: String = row.get(8)?;
        let source_ts: Option<String> = row.get(11)?;
        let created_at: String = row.get(13)?;

        Ok(StoredSignal {
            id: row.get(0)?,
            scope_id: row.get(1)?,
            signal: Signal {
                source,
                kind: SignalKind::parse(&kind).unwrap_or(SignalKind::Metadata),
                severity: severity.as_deref().and_then(Severity::parse),
                title: row.get(5)?,
                body: row.get(6)?,
                url: row.get(7)?,
                metadata: serde_json::from_str::<Map<String, Value>>(&metadata)
                    .unwrap_or_default(),
                external_id: row.get(9)?,
                datasource_ref: row.get(10)?,
                source_ts: parse_optional_ts(source_ts.as_deref()),
            },
            has_embedding: row.get(12)?,
            created_at: parse_ts(&created_at),
        })
    }
}

/// Pack an embedding as little-endian f32 bytes.
pub fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(external_id: &str, datasource: &str) -> Signal {
        Signal::new(Provider::GitHub, SignalKind::Ticket, external_id)
            .with_title(Some(format!("Issue {external_id}")))
            .with_body(Some("Checkout fails on retry".into()), 2000)
            .with_datasource(Some(datasource))
            .meta("repo", "acme/api")
    }

    #[test]
    fn test_duplicate_external_id_is_not_an_error() {
        let db = Database::in_memory().unwrap();
        let store = SignalStore::new(&db);

        let s = signal("github-issue-1", "github:acme/api");
        assert_eq!(store.insert("scope-1", &s).unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert("scope-1", &s).unwrap(), InsertOutcome::Duplicate);
        assert_eq!(store.count_for_scope("scope-1").unwrap(), 1);
    }

    #[test]
    fn test_upsert_keeps_row_id_and_replaces_content() {
        let db = Database::in_memory().unwrap();
        let store = SignalStore::new(&db);

        let first = signal("linear-abc", "linear:team:T1");
        let id = store.upsert("scope-1", &first, None).unwrap();

        let mut second = first.clone();
        second.title = Some("Renamed".into());
        let again = store.upsert("scope-1", &second, Some(&[0.5, -1.0])).unwrap();

        assert_eq!(id, again);
        let stored = store.get_by_external_id("linear-abc").unwrap().unwrap();
        assert_eq!(stored.signal.title.as_deref(), Some("Renamed"));
        assert!(stored.has_embedding);
        assert_eq!(store.embedding("linear-abc").unwrap(), Some(vec![0.5, -1.0]));
        assert_eq!(store.count_for_scope("scope-1").unwrap(), 1);
    }

    #[test]
    fn test_delete_by_datasource_is_scope_local() {
        let db = Database::in_memory().unwrap();
        let store = SignalStore::new(&db);
        store.insert("scope-1", &signal("a", "github:acme/api")).unwrap();
        store.insert("scope-1", &signal("b", "slack:C1")).unwrap();
        store.insert("scope-2", &signal("c", "github:acme/api")).unwrap();

        let deleted = store
            .delete_by_datasources("scope-1", &["github:acme/api".into()])
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.count_for_scope("scope-1").unwrap(), 1);
        assert_eq!(store.count_for_scope("scope-2").unwrap(), 1);
    }

    #[test]
    fn test_list_filters_and_search() {
        let db = Database::in_memory().unwrap();
        let store = SignalStore::new(&db);
        store.insert("scope-1", &signal("a", "github:acme/api")).unwrap();
        let slack = Signal::new(Provider::Slack, SignalKind::Message, "slack-C1-1")
            .with_body(Some("deploy is red".into()), 2000);
        store.insert("scope-1", &slack).unwrap();

        let mut query = SignalQuery::for_scope("scope-1");
        assert_eq!(store.list(&query).unwrap().len(), 2);

        query.source = Some(Provider::Slack);
        let only_slack = store.list(&query).unwrap();
        assert_eq!(only_slack.len(), 1);
        assert_eq!(only_slack[0].signal.kind, SignalKind::Message);

        let hits = store.search("scope-1", "CHECKOUT", 20).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].signal.external_id, "a");
        assert_eq!(hits[0].signal.metadata["repo"], "acme/api");
    }

    #[test]
    fn test_blob_round_trip_is_little_endian() {
        let blob = embedding_to_blob(&[1.0]);
        assert_eq!(blob, 1.0f32.to_le_bytes().to_vec());
        assert_eq!(blob_to_embedding(&blob), vec![1.0]);
    }
}
