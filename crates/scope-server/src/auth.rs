//! Request identity
//!
//! An upstream auth layer sets `X-User-Id`; this middleware copies it into
//! request extensions. When `SCOPE_API_TOKEN` is configured every `/api`
//! request must also carry `Authorization: Bearer <token>`.

use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::AppError;
use crate::AppState;

/// User context attached to request extensions by middleware.
#[derive(Debug, Clone, Default)]
pub struct AuthenticatedUser {
    pub user_id: Option<String>,
}

/// Extractor for routes that act on behalf of a user. Rejects with 401
/// when no user id was supplied.
pub struct CurrentUser(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedUser>()
            .and_then(|user| user.user_id.clone())
            .map(CurrentUser)
            .ok_or_else(|| AppError::Unauthorized("Missing X-User-Id".to_string()))
    }
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Middleware that checks the API token and attaches user info.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = state.api_token.as_deref() {
        if bearer_token(&request) != Some(expected) {
            tracing::debug!(uri = %request.uri(), "Rejected request with missing or wrong API token");
            return AppError::Unauthorized("Invalid API token".to_string()).into_response();
        }
    }

    let user = AuthenticatedUser {
        user_id: request
            .headers()
            .get("X-User-Id")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string),
    };

    request.extensions_mut().insert(user);
    next.run(request).await
}
