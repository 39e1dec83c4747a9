//! Sync orchestrator
//!
//! Applies a datasource diff to a scope: signals from removed refs are
//! deleted, added refs are fetched per provider group and inserted one
//! record at a time. Every failure below the request boundary becomes a
//! string in the report; the run itself always completes.

use std::collections::BTreeMap;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::auth::TokenManager;
use crate::integrations::{DatasourceRef, FetchOutcome, Provider, ProviderClient, Signal};
use crate::storage::{InsertOutcome, SharedDatabase, SignalStore};

pub const NO_SIGNALS_MESSAGE: &str = "No signals found from the selected data sources";

/// Body of a sync trigger. Accepts both the camelCase UI names and the
/// short snake_case names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SyncRequest {
    #[serde(alias = "scopeId")]
    pub scope_id: String,
    #[serde(default, alias = "addedDatasources")]
    pub added: Vec<String>,
    #[serde(default, alias = "removedDatasources")]
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub ok: bool,
    pub inserted_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl SyncReport {
    fn from_parts(inserted_count: usize, errors: Vec<String>) -> Self {
        Self {
            ok: errors.is_empty(),
            inserted_count,
            errors,
        }
    }
}

/// Added and removed refs between two datasource sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasourceDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl DatasourceDiff {
    pub fn between(current: &[String], next: &[String]) -> Self {
        Self {
            added: next
                .iter()
                .filter(|r| !current.contains(r))
                .cloned()
                .collect(),
            removed: current
                .iter()
                .filter(|r| !next.contains(r))
                .cloned()
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Running result of the per-record insert fold.
#[derive(Debug, Default)]
struct InsertTally {
    inserted: usize,
    duplicates: usize,
    errors: Vec<String>,
}

impl InsertTally {
    fn record(mut self, signal: &Signal, result: anyhow::Result<InsertOutcome>) -> Self {
        match result {
            Ok(InsertOutcome::Inserted) => self.inserted += 1,
            Ok(InsertOutcome::Duplicate) => self.duplicates += 1,
            Err(e) => {
                let message = format!("{e:#}");
                tracing::error!(external_id = %signal.external_id, "Insert failed: {}", message);
                if !self.errors.contains(&message) {
                    self.errors.push(message);
                }
            }
        }
        self
    }
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    db: SharedDatabase,
    tokens: TokenManager,
    client: ProviderClient,
}

impl SyncOrchestrator {
    pub fn new(db: SharedDatabase, tokens: TokenManager, client: ProviderClient) -> Self {
        Self { db, tokens, client }
    }

    pub async fn sync(
        &self,
        user_id: &str,
        scope_id: &str,
        added: &[String],
        removed: &[String],
    ) -> SyncReport {
        let mut errors = Vec::new();

        if !removed.is_empty() {
            let deleted = {
                let db = self.db.lock();
                SignalStore::new(&db).delete_by_datasources(scope_id, removed)
            };
            match deleted {
                Ok(count) => tracing::info!(scope_id, count, "Removed signals for dropped datasources"),
                Err(e) => errors.push(format!("Delete failed: {e:#}")),
            }
        }

        if added.is_empty() {
            return SyncReport::from_parts(0, errors);
        }

        let mut groups: BTreeMap<Provider, Vec<DatasourceRef>> = BTreeMap::new();
        for raw in added {
            match DatasourceRef::parse(raw) {
                Ok(r) => groups.entry(r.provider()).or_default().push(r),
                Err(e) => {
                    tracing::warn!(datasource = %raw, "Skipping datasource: {}", e);
                    errors.push(e.to_string());
                }
            }
        }

        let fetches = groups
            .iter()
            .map(|(provider, refs)| self.fetch_group(user_id, *provider, refs));
        let mut fetched = FetchOutcome::default();
        for outcome in join_all(fetches).await {
            fetched.absorb(outcome);
        }
        let signals = fetched.signals;
        for message in fetched.failures {
            if !errors.contains(&message) {
                errors.push(message);
            }
        }

        tracing::info!(scope_id, count = signals.len(), "Fetched signals");

        if signals.is_empty() {
            if errors.is_empty() {
                errors.push(NO_SIGNALS_MESSAGE.to_string());
            }
            return SyncReport::from_parts(0, errors);
        }

        let tally = {
            let db = self.db.lock();
            let store = SignalStore::new(&db);
            signals.iter().fold(InsertTally::default(), |tally, signal| {
                tally.record(signal, store.insert(scope_id, signal))
            })
        };
        errors.extend(tally.errors);

        tracing::info!(
            scope_id,
            inserted = tally.inserted,
            duplicates = tally.duplicates,
            errors = errors.len(),
            "Sync complete"
        );
        SyncReport::from_parts(tally.inserted, errors)
    }

    /// One provider group: resolve a token, then fetch every ref. A token
    /// failure skips the whole group.
    async fn fetch_group(
        &self,
        user_id: &str,
        provider: Provider,
        refs: &[DatasourceRef],
    ) -> FetchOutcome {
        match self.tokens.get_valid_token(user_id, provider).await {
            Ok(token) => self.client.list_recent(provider, &token, refs).await,
            Err(e) => FetchOutcome::failed(e.to_string()),
        }
    }
}
