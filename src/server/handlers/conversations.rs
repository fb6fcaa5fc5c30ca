use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::{json, Value};

use crate::errors::ApiError;
use crate::state::AppState;

pub async fn list_conversations(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let summaries = state.history.list().await?;
    let conversations: Vec<Value> = summaries
        .into_iter()
        .map(|s| {
            json!({
                "id": s.id,
                "title": s.title,
                "message_count": s.message_count,
                "last_time": s.last_time,
            })
        })
        .collect();

    Ok(Json(json!({ "success": true, "conversations": conversations })))
}

pub async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation = state.history.load(&conversation_id).await?;

    let messages: Vec<Value> = conversation
        .messages
        .iter()
        .map(|m| {
            json!({
                "role": m.role,
                "content": m.content,
                "timestamp": m.created_at,
            })
        })
        .collect();

    Ok(Json(json!({
        "success": true,
        "conversation_id": conversation.id,
        "title": conversation.title,
        "messages": messages,
    })))
}

pub async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.history.delete(&conversation_id).await?;
    Ok(Json(json!({ "success": true, "message": "conversation deleted" })))
}
