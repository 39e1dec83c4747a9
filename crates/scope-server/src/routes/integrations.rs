//! Integration connections: status, credential CRUD, resource discovery
//! and the OAuth redirect pair.

use axum::{
    extract::{Path, Query, State},
    response::Redirect,
    routing::{get, put},
    Json, Router,
};
use chrono::{Duration, Utc};
use futures::future::join_all;
use serde_json::{json, Value};

use scope_core::auth::decode_state;
use scope_core::storage::{ConnectionStore, Credential};

use super::path_provider;
use crate::auth::CurrentUser;
use crate::error::AppError;
use crate::types::{
    CallbackQuery, ConnectedResponse, ConnectionStatus, IntegrationStatusResponse,
    ResourcesResponse, StoreCredentialRequest,
};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .route("/resources", get(resources))
        .route("/:provider", put(store_credential).delete(disconnect))
        .route("/:provider/authorize", get(authorize))
}

/// The OAuth redirect lands here from the provider, without our headers.
pub fn callback_router() -> Router<AppState> {
    Router::new().route("/integrations/:provider/callback", get(callback))
}

async fn status(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<IntegrationStatusResponse>, AppError> {
    let summaries = {
        let db = state.db.lock();
        ConnectionStore::new(&db).list_for_user(&user_id)?
    };
    let connected = summaries
        .into_iter()
        .map(|summary| {
            (
                summary.provider.storage_key().to_string(),
                ConnectionStatus {
                    metadata: summary.metadata,
                    connected_at: summary.connected_at,
                },
            )
        })
        .collect();
    Ok(Json(IntegrationStatusResponse { connected }))
}

async fn store_credential(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(provider): Path<String>,
    Json(req): Json<StoreCredentialRequest>,
) -> Result<Json<Value>, AppError> {
    let provider = path_provider(&provider)?;
    if req.access_token.trim().is_empty() {
        return Err(AppError::BadRequest("access_token is required".to_string()));
    }

    let credential = Credential {
        user_id: user_id.clone(),
        provider,
        access_token: req.access_token,
        refresh_token: req.refresh_token.filter(|t| !t.is_empty()),
        expires_at: req.expires_in.map(|secs| Utc::now() + Duration::seconds(secs)),
        scope: req.scope,
        metadata: req.metadata.unwrap_or_else(|| json!({})),
    };
    state.tokens.store(&credential)?;
    tracing::info!(provider = %provider, user_id = %user_id, "Stored credential");
    Ok(Json(json!({ "ok": true })))
}

async fn disconnect(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(provider): Path<String>,
) -> Result<Json<Value>, AppError> {
    let provider = path_provider(&provider)?;
    if !state.tokens.disconnect(&user_id, provider)? {
        return Err(AppError::NotFound(format!(
            "{} is not connected",
            provider.display_name()
        )));
    }
    tracing::info!(provider = %provider, user_id = %user_id, "Disconnected integration");
    Ok(Json(json!({ "ok": true })))
}

/// Pickable datasources across every connected provider, fetched
/// concurrently. A provider whose token or listing fails contributes none.
async fn resources(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<ResourcesResponse>, AppError> {
    let providers: Vec<_> = {
        let db = state.db.lock();
        ConnectionStore::new(&db)
            .list_for_user(&user_id)?
            .into_iter()
            .map(|summary| summary.provider)
            .collect()
    };

    let listings = providers.into_iter().map(|provider| {
        let state = &state;
        let user_id = &user_id;
        async move {
            match state.tokens.get_valid_token(user_id, provider).await {
                Ok(token) => state.client.list_resources(provider, &token).await,
                Err(e) => {
                    tracing::warn!(provider = %provider, "Skipping resources: {}", e);
                    Vec::new()
                }
            }
        }
    });
    let resources = join_all(listings).await.into_iter().flatten().collect();
    Ok(Json(ResourcesResponse { resources }))
}

async fn authorize(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(provider): Path<String>,
) -> Result<Redirect, AppError> {
    let provider = path_provider(&provider)?;
    let oauth = state.tokens.oauth(provider).ok_or_else(|| {
        AppError::BadRequest(format!(
            "{} OAuth is not configured. Set its client id and secret in env.",
            provider.display_name()
        ))
    })?;
    let url = oauth.authorize_url(&state.config.app_url, &user_id)?;
    Ok(Redirect::temporary(url.as_str()))
}

async fn callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> Result<Json<ConnectedResponse>, AppError> {
    let provider = path_provider(&provider)?;
    if let Some(error) = query.error {
        return Err(AppError::BadRequest(format!("Authorization denied: {error}")));
    }
    let (Some(code), Some(raw_state)) = (query.code, query.state) else {
        return Err(AppError::BadRequest("Missing code or state".to_string()));
    };

    let oauth_state =
        decode_state(&raw_state).map_err(|e| AppError::BadRequest(format!("{e:#}")))?;
    if oauth_state.provider != provider {
        return Err(AppError::BadRequest("State does not match provider".to_string()));
    }

    let credential = state
        .tokens
        .complete_authorization(&oauth_state.user_id, provider, &state.config.app_url, &code)
        .await?;

    Ok(Json(ConnectedResponse {
        ok: true,
        provider: provider.storage_key().to_string(),
        metadata: credential.metadata,
    }))
}
