//! Persistence layer
//!
//! SQLite-based storage for:
//! - Provider credentials
//! - Scopes and their datasource sets
//! - Signals (dedup on external id)
//! - Conversations, messages and artifacts
//! - Pending write confirmations

use chrono::{DateTime, Utc};
use serde_json::Value;

pub mod artifacts;
pub mod connections;
mod database;
pub mod messages;
pub mod pending;
pub mod scopes;
pub mod signals;

pub use artifacts::{Artifact, ArtifactPatch, ArtifactStore};
pub use connections::{ConnectionStore, ConnectionSummary, Credential};
pub use database::{Database, SharedDatabase};
pub use messages::{MessageStore, StoredMessage};
pub use pending::PendingWriteStore;
pub use scopes::{Scope, ScopeStore};
pub use signals::{InsertOutcome, SignalQuery, SignalStore, StoredSignal};

/// Parse an RFC 3339 column, falling back to now for corrupt rows.
pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_optional_ts(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|r| DateTime::parse_from_rfc3339(r).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse a JSON text column; unreadable content becomes `null`.
pub(crate) fn parse_json_column(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or(Value::Null)
}
