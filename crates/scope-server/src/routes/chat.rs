//! Chat endpoint with SSE streaming.

use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::post,
    Json, Router,
};
use futures::stream::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use scope_core::agent::{ChatRequest, ChatService, StreamEvent};

use super::scopes::owned_scope;
use crate::auth::CurrentUser;
use crate::error::AppError;
use crate::types::{TitleRequest, TitleResponse};
use crate::AppState;

const SSE_CHANNEL_BUFFER: usize = 256;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(chat))
        .route("/title", post(title))
}

fn chat_service(state: &AppState) -> Result<ChatService, AppError> {
    state
        .chat
        .clone()
        .ok_or_else(|| AppError::BadRequest("No model configured".to_string()))
}

async fn chat(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let service = chat_service(&state)?;
    if req.message.trim().is_empty() {
        return Err(AppError::BadRequest("Message is required".to_string()));
    }
    owned_scope(&state, &user_id, &req.scope_id)?;

    tracing::info!(
        scope_id = %req.scope_id,
        mode = ?req.mode,
        conversation_id = ?req.conversation_id,
        "Chat turn"
    );

    // The turn keeps running and persists its result if the client leaves.
    let (event_tx, event_rx) = mpsc::channel::<StreamEvent>(SSE_CHANNEL_BUFFER);
    tokio::spawn(async move {
        service.run_turn(&user_id, req, event_tx).await;
    });

    let stream = ReceiverStream::new(event_rx)
        .map(|event| Ok::<_, Infallible>(Event::default().data(event.data())));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn title(
    State(state): State<AppState>,
    CurrentUser(_user_id): CurrentUser,
    Json(req): Json<TitleRequest>,
) -> Result<Json<TitleResponse>, AppError> {
    let service = chat_service(&state)?;
    if req.message.trim().is_empty() {
        return Err(AppError::BadRequest("Message is required".to_string()));
    }
    let title = service
        .title_conversation(&req.conversation_id, &req.message)
        .await?;
    Ok(Json(TitleResponse { title }))
}
