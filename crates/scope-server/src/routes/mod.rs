//! API routes

use axum::Router;

use scope_core::Provider;

use crate::error::AppError;
use crate::AppState;

mod chat;
mod integrations;
mod scopes;
mod signals;
mod webhooks;

/// Build the API router for authenticated endpoints
pub fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/scopes", scopes::router())
        .nest("/signals", signals::router())
        .nest("/chat", chat::router())
        .nest("/integrations", integrations::router())
}

/// Endpoints called by providers rather than by a signed-in client
pub fn public_router() -> Router<AppState> {
    Router::new()
        .nest("/webhooks", webhooks::router())
        .merge(integrations::callback_router())
}

/// Provider named in a path segment. Unknown names are a missing route.
fn path_provider(raw: &str) -> Result<Provider, AppError> {
    raw.parse()
        .map_err(|_| AppError::NotFound(format!("Unknown provider: {raw}")))
}
