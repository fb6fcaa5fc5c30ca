use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::Stream;
use serde_json::json;

use crate::errors::ApiError;
use crate::session::{self, QueryMode, QueryRequest};
use crate::state::AppState;
use super::query::{spawn_with_deadline, validate_question};

/// Non-streaming smart-mode query: the classifier picks RAG or the full
/// agent.
pub async fn smart_query(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_question(&req)?;
    let reply = session::run_smart_query(&state, &req).await?;
    Ok(Json(reply))
}

/// Non-streaming agent run returning the full reasoning trace.
pub async fn agent_query(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_question(&req)?;
    let reply = session::run_agent_trace(&state, &req).await?;
    Ok(Json(reply))
}

/// SSE stream, agent mode.
pub async fn agent_query_stream(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    validate_question(&req)?;
    let mode = QueryMode::parse(req.mode.as_deref(), QueryMode::Full)?;

    let idle = state.settings.stream_idle_timeout_secs;
    let (tx, rx) = super::super::sse::event_channel();
    spawn_with_deadline(
        state.clone(),
        tx.clone(),
        session::agent_stream_task(state, req, mode, tx),
    );

    Ok(super::super::sse::sse_response(rx, idle))
}

pub async fn create_conversation(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation_id = state.history.create().await?;
    tracing::info!("created conversation {}", conversation_id);
    Ok(Json(json!({
        "conversation_id": conversation_id,
        "message": "conversation created",
    })))
}
