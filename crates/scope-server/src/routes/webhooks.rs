//! Provider webhook receivers
//!
//! Signature and normalization run inline so a bad delivery gets its error
//! status. Embedding and storage run after the 202 is sent.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};

use scope_core::ingest::{check_signature, prepare, WebhookOutcome};

use super::path_provider;
use crate::error::AppError;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/:provider", post(receive))
}

async fn receive(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let provider = path_provider(&provider)?;

    check_signature(
        provider,
        &state.config.webhook_secrets,
        |name| headers.get(name).and_then(|v| v.to_str().ok()),
        &body,
    )?;

    let payload: Value = serde_json::from_slice(&body)?;
    match prepare(provider, &payload)? {
        WebhookOutcome::Challenge(challenge) => {
            tracing::info!(provider = %provider, "Answered webhook handshake");
            Ok(Json(challenge).into_response())
        }
        WebhookOutcome::Ignored => Ok(Json(json!({ "ok": true })).into_response()),
        WebhookOutcome::Accepted(job) => {
            tracing::debug!(
                provider = %provider,
                scope_id = %job.scope_id,
                external_id = %job.signal.external_id,
                "Accepted webhook"
            );
            state.ingest.spawn(job);
            Ok((StatusCode::ACCEPTED, Json(json!({ "ok": true }))).into_response())
        }
    }
}
