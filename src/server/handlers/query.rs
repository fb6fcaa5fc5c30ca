use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::Stream;
use serde_json::json;

use crate::agent::AgentEvent;
use crate::errors::ApiError;
use crate::rag::dedup_by_source;
use crate::session::{self, QueryRequest};
use crate::state::AppState;

/// Non-streaming one-shot RAG query.
pub async fn query(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_question(&req)?;
    let history = session::prompt_history_or_default(&req);
    let (answer, passages) = session::run_rag_query(&state, &req, &history).await?;

    let sources: Vec<serde_json::Value> = dedup_by_source(&passages)
        .iter()
        .map(|p| json!({ "source": p.source, "preview": preview(&p.text) }))
        .collect();

    Ok(Json(json!({
        "question": req.question,
        "answer": answer,
        "sources": sources,
    })))
}

/// SSE stream, RAG mode.
pub async fn query_stream(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    validate_question(&req)?;

    let idle = state.settings.stream_idle_timeout_secs;
    let (tx, rx) = super::super::sse::event_channel();
    spawn_with_deadline(
        state.clone(),
        tx.clone(),
        session::rag_stream_task(state, req, tx),
    );

    Ok(super::super::sse::sse_response(rx, idle))
}

pub(super) fn validate_question(req: &QueryRequest) -> Result<(), ApiError> {
    if req.question.trim().is_empty() {
        return Err(ApiError::BadRequest("question must not be empty".to_string()));
    }
    Ok(())
}

pub(super) fn preview(text: &str) -> String {
    text.chars().take(300).collect()
}

/// Run a stream producer under the whole-request deadline; on expiry the
/// client gets a terminal error frame instead of a silent stall.
pub(super) fn spawn_with_deadline(
    state: Arc<AppState>,
    tx: tokio::sync::mpsc::Sender<AgentEvent>,
    task: impl std::future::Future<Output = ()> + Send + 'static,
) {
    let deadline = Duration::from_secs(state.settings.request_timeout_secs);
    tokio::spawn(async move {
        if tokio::time::timeout(deadline, task).await.is_err() {
            let _ = tx
                .send(AgentEvent::new(
                    "error",
                    json!({ "message": "request timed out", "code": "provider_timeout" }),
                ))
                .await;
        }
    });
}
