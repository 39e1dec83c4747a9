//! Scope management and sync triggers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, patch, post},
    Json, Router,
};

use scope_core::storage::{Scope, ScopeStore};
use scope_core::sync::{DatasourceDiff, SyncReport, SyncRequest};

use crate::auth::CurrentUser;
use crate::error::AppError;
use crate::types::{CreateScopeRequest, ScopeListResponse, ScopeResponse, UpdateDatasourcesRequest};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_scopes).post(create_scope))
        .route("/sync", post(sync_scope))
        .route("/:id", get(get_scope))
        .route("/:id/datasources", patch(update_datasources))
}

/// Load a scope owned by `user_id`. Other users' scopes read as missing.
pub(super) fn owned_scope(state: &AppState, user_id: &str, scope_id: &str) -> Result<Scope, AppError> {
    let scope = {
        let db = state.db.lock();
        ScopeStore::new(&db).get(scope_id)?
    };
    scope
        .filter(|s| s.owner == user_id)
        .ok_or_else(|| AppError::NotFound(format!("Scope {} not found", scope_id)))
}

async fn list_scopes(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<ScopeListResponse>, AppError> {
    let scopes = {
        let db = state.db.lock();
        ScopeStore::new(&db).list_for_owner(&user_id)?
    };
    Ok(Json(ScopeListResponse { scopes }))
}

async fn create_scope(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(req): Json<CreateScopeRequest>,
) -> Result<(StatusCode, Json<ScopeResponse>), AppError> {
    let name = req.name.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest("Scope name is required".to_string()));
    }

    let scope = {
        let db = state.db.lock();
        ScopeStore::new(&db).create(&user_id, name, &req.datasources)?
    };
    tracing::info!(scope_id = %scope.id, datasources = scope.datasources.len(), "Created scope");

    let sync = state
        .sync
        .sync(&user_id, &scope.id, &scope.datasources, &[])
        .await;
    Ok((StatusCode::CREATED, Json(ScopeResponse { scope, sync })))
}

async fn get_scope(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<Scope>, AppError> {
    owned_scope(&state, &user_id, &id).map(Json)
}

async fn update_datasources(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(id): Path<String>,
    Json(req): Json<UpdateDatasourcesRequest>,
) -> Result<Json<ScopeResponse>, AppError> {
    let current = owned_scope(&state, &user_id, &id)?;
    let diff = DatasourceDiff::between(&current.datasources, &req.datasources);

    let scope = {
        let db = state.db.lock();
        let store = ScopeStore::new(&db);
        store.set_datasources(&id, &req.datasources)?;
        store.get(&id)?
    }
    .ok_or_else(|| AppError::NotFound(format!("Scope {} not found", id)))?;

    let sync = if diff.is_empty() {
        SyncReport {
            ok: true,
            ..SyncReport::default()
        }
    } else {
        tracing::info!(
            scope_id = %id,
            added = diff.added.len(),
            removed = diff.removed.len(),
            "Datasources changed"
        );
        state
            .sync
            .sync(&user_id, &id, &diff.added, &diff.removed)
            .await
    };

    Ok(Json(ScopeResponse { scope, sync }))
}

async fn sync_scope(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(req): Json<SyncRequest>,
) -> Result<Json<SyncReport>, AppError> {
    if req.scope_id.trim().is_empty() {
        return Err(AppError::BadRequest("scopeId is required".to_string()));
    }
    owned_scope(&state, &user_id, &req.scope_id)?;

    let report = state
        .sync
        .sync(&user_id, &req.scope_id, &req.added, &req.removed)
        .await;
    Ok(Json(report))
}
