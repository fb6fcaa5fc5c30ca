use std::sync::Arc;

use axum::extract::{Multipart, State};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::errors::ApiError;
use crate::rag::chunker::split_into_chunks;
use crate::rag::{ingest, PassageInput};
use crate::state::AppState;

pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let loaded = state.retriever.is_ready().await;
    Json(json!({ "vector_store_loaded": loaded }))
}

pub async fn upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {}", e)))?
    {
        let Some(filename) = field.file_name().map(sanitize_filename) else {
            continue;
        };
        if filename.is_empty() {
            return Err(ApiError::BadRequest("invalid file name".to_string()));
        }

        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("failed to read upload: {}", e)))?;

        let path = state.settings.documents_path.join(&filename);
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(ApiError::internal)?;

        index_upload(&state, &filename, &bytes).await;

        tracing::info!("stored upload {} ({} bytes)", filename, bytes.len());
        return Ok(Json(json!({
            "success": true,
            "filename": filename,
            "size": bytes.len(),
        })));
    }

    Err(ApiError::BadRequest("no file in upload".to_string()))
}

/// Make a fresh text upload searchable right away when an index is already
/// loaded; a full rebuild through build-start remains the authoritative
/// path. Failures only log, the upload itself has succeeded.
async fn index_upload(state: &AppState, filename: &str, bytes: &[u8]) {
    if !state.retriever.is_ready().await {
        return;
    }
    let Ok(text) = std::str::from_utf8(bytes) else {
        return;
    };

    let passages: Vec<PassageInput> = split_into_chunks(
        text,
        state.settings.chunk_size,
        state.settings.chunk_overlap,
    )
    .into_iter()
    .map(|chunk| PassageInput {
        text: chunk,
        source: filename.to_string(),
    })
    .collect();

    if let Err(err) = state.retriever.add(passages).await {
        tracing::warn!("incremental indexing of {} failed: {}", filename, err);
    }
}

/// Strip any path components a client smuggles into the filename.
fn sanitize_filename(raw: &str) -> String {
    std::path::Path::new(raw)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("")
        .to_string()
}

pub async fn build_start(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if !state.progress.try_begin() {
        return Json(json!({
            "success": false,
            "message": "a build is already running",
        }));
    }

    let config = state.ingest_config();
    let embedder = state.embedder.clone();
    let index = state.index.clone();
    let progress = state.progress.clone();
    tokio::spawn(async move {
        ingest::run_build(config, embedder, index, progress).await;
    });

    Json(json!({ "success": true, "message": "build started" }))
}

pub async fn build_progress(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.progress.snapshot())
}
