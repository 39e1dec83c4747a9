//! Stored signal queries

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};

use scope_core::integrations::SignalKind;
use scope_core::storage::{SignalQuery, SignalStore};
use scope_core::Provider;

use super::scopes::owned_scope;
use crate::auth::CurrentUser;
use crate::error::AppError;
use crate::types::{SignalsQuery, SignalsResponse};
use crate::AppState;

const MAX_LIMIT: usize = 200;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_signals))
}

async fn list_signals(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Query(params): Query<SignalsQuery>,
) -> Result<Json<SignalsResponse>, AppError> {
    let scope_id = params
        .scope_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest("scopeId is required".to_string()))?;
    owned_scope(&state, &user_id, &scope_id)?;

    let mut query = SignalQuery::for_scope(scope_id);
    if let Some(source) = params.source.as_deref().filter(|s| !s.is_empty()) {
        let provider: Provider = source
            .parse()
            .map_err(|_| AppError::BadRequest(format!("Unknown source: {source}")))?;
        query.source = Some(provider);
    }
    if let Some(kind) = params.kind.as_deref().filter(|k| !k.is_empty()) {
        query.kind = Some(
            SignalKind::parse(kind)
                .ok_or_else(|| AppError::BadRequest(format!("Unknown kind: {kind}")))?,
        );
    }
    if let Some(limit) = params.limit {
        query.limit = limit.clamp(1, MAX_LIMIT);
    }

    let signals = {
        let db = state.db.lock();
        SignalStore::new(&db).list(&query)?
    };
    Ok(Json(SignalsResponse { signals }))
}

#[cfg(test)]
mod tests {
    use crate::test_support::*;
    use axum::http::StatusCode;
    use scope_core::integrations::{Severity, Signal, SignalKind};
    use scope_core::storage::{ScopeStore, SignalStore};
    use scope_core::Provider;
    use serde_json::json;

    fn seed(state: &crate::AppState) -> String {
        let db = state.db.lock();
        let scope = ScopeStore::new(&db).create(USER, "Seeded", &[]).unwrap();
        let store = SignalStore::new(&db);
        for (i, (source, kind)) in [
            (Provider::GitHub, SignalKind::Ticket),
            (Provider::GitHub, SignalKind::Pr),
            (Provider::Slack, SignalKind::Message),
        ]
        .into_iter()
        .enumerate()
        {
            let signal = Signal::new(source, kind, format!("ext-{i}"))
                .with_title(Some(format!("Signal {i}")))
                .with_severity(Severity::Medium);
            store.insert(&scope.id, &signal).unwrap();
        }
        scope.id
    }

    #[tokio::test]
    async fn test_filters_by_source_and_kind() {
        let state = state("http://127.0.0.1:9");
        let scope_id = seed(&state);

        let (status, body) = send(
            &state,
            request("GET", &format!("/api/signals?scopeId={scope_id}&source=github"), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["signals"].as_array().unwrap().len(), 2);

        let (_, body) = send(
            &state,
            request("GET", &format!("/api/signals?scope_id={scope_id}&kind=message&limit=5"), None),
        )
        .await;
        let signals = body["signals"].as_array().unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0]["source"], json!("slack"));
    }

    #[tokio::test]
    async fn test_requires_scope_id() {
        let state = state("http://127.0.0.1:9");
        let (status, body) = send(&state, request("GET", "/api/signals", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "scopeId is required");
    }

    #[tokio::test]
    async fn test_rejects_unknown_kind() {
        let state = state("http://127.0.0.1:9");
        let scope_id = seed(&state);
        let (status, _) = send(
            &state,
            request("GET", &format!("/api/signals?scopeId={scope_id}&kind=tweet"), None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
