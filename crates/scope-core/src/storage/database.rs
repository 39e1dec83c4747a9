//! SQLite connection and schema

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::Connection;

/// Database handle shared by async components. Lock, do the synchronous
/// work, drop the guard; never hold it across an `.await`.
pub type SharedDatabase = Arc<Mutex<Database>>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS connections (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    provider TEXT NOT NULL,
    access_token TEXT NOT NULL,
    refresh_token TEXT,
    expires_at TEXT,
    scope TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(user_id, provider)
);

CREATE TABLE IF NOT EXISTS scopes (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    name TEXT NOT NULL,
    datasources TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_scopes_owner ON scopes(owner);

CREATE TABLE IF NOT EXISTS signals (
    id TEXT PRIMARY KEY,
    scope_id TEXT NOT NULL,
    source TEXT NOT NULL,
    kind TEXT NOT NULL,
    severity TEXT,
    title TEXT,
    body TEXT,
    url TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    external_id TEXT NOT NULL UNIQUE,
    datasource_ref TEXT,
    source_ts TEXT,
    embedding BLOB,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_signals_scope ON signals(scope_id, created_at);
CREATE INDEX IF NOT EXISTS idx_signals_datasource ON signals(scope_id, datasource_ref);

CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    scope_id TEXT NOT NULL,
    title TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    tool_calls TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, id);

CREATE TABLE IF NOT EXISTS artifacts (
    id TEXT PRIMARY KEY,
    scope_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    title TEXT NOT NULL,
    content TEXT NOT NULL DEFAULT '{}',
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_artifacts_scope ON artifacts(scope_id, updated_at);

CREATE TABLE IF NOT EXISTS pending_writes (
    conversation_id TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    actions TEXT NOT NULL DEFAULT '[]',
    updated_at TEXT NOT NULL
);
";

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the database file and apply the schema.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Self::init(conn)
    }

    /// Private in-memory database, for tests and ephemeral runs.
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)
            .context("Failed to apply database schema")?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn shared(self) -> SharedDatabase {
        Arc::new(Mutex::new(self))
    }
}
