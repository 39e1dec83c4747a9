//! Webhook ingest pipeline
//!
//! The single-event counterpart of the sync orchestrator: one webhook
//! delivery becomes at most one signal, enriched with an embedding and
//! upserted on its external id so redeliveries converge on one row.

use std::sync::Arc;

use thiserror::Error;

use crate::integrations::{DatasourceError, MalformedPayload};
use crate::storage::{SharedDatabase, SignalStore};

mod embeddings;
mod verify;
mod webhook;

pub use embeddings::{Embedder, OpenAiEmbedder};
pub use verify::{verify_github, verify_slack};
pub use webhook::{check_signature, handshake, normalize, prepare, IngestJob, WebhookOutcome};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Missing scopeId")]
    MissingScope,
    #[error("{0}")]
    Malformed(String),
    #[error("unknown webhook provider \"{0}\"")]
    UnknownProvider(String),
    #[error("invalid signature: {0}")]
    BadSignature(String),
    #[error("failed to store signal: {0}")]
    Storage(String),
}

impl From<MalformedPayload> for IngestError {
    fn from(err: MalformedPayload) -> Self {
        IngestError::Malformed(err.to_string())
    }
}

impl From<DatasourceError> for IngestError {
    fn from(err: DatasourceError) -> Self {
        match err {
            DatasourceError::UnknownProvider(name) => IngestError::UnknownProvider(name),
            other => IngestError::Malformed(other.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct IngestPipeline {
    db: SharedDatabase,
    embedder: Option<Arc<dyn Embedder>>,
}

impl IngestPipeline {
    pub fn new(db: SharedDatabase, embedder: Option<Arc<dyn Embedder>>) -> Self {
        Self { db, embedder }
    }

    /// Embed and upsert one signal. Returns the stored row id.
    ///
    /// An embedding failure is logged and the signal is stored without one.
    pub async fn ingest(&self, job: IngestJob) -> Result<String, IngestError> {
        let embedding = match (&self.embedder, job.signal.embedding_text()) {
            (Some(embedder), Some(text)) => match embedder.embed(&text).await {
                Ok(vector) => Some(vector),
                Err(e) => {
                    tracing::warn!(
                        external_id = %job.signal.external_id,
                        "Embedding failed, storing without: {:#}",
                        e
                    );
                    None
                }
            },
            _ => None,
        };

        let id = {
            let db = self.db.lock();
            SignalStore::new(&db)
                .upsert(&job.scope_id, &job.signal, embedding.as_deref())
                .map_err(|e| IngestError::Storage(format!("{e:#}")))?
        };

        tracing::info!(
            source = %job.signal.source,
            external_id = %job.signal.external_id,
            scope_id = %job.scope_id,
            "Ingested webhook signal"
        );
        Ok(id)
    }

    /// Run [`IngestPipeline::ingest`] in the background.
    pub fn spawn(&self, job: IngestJob) -> tokio::task::JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move {
            if let Err(e) = pipeline.ingest(job).await {
                tracing::error!("Webhook ingest failed: {}", e);
            }
        })
    }
}
