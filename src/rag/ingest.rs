//! Background knowledge-base builds.
//!
//! A build scans the documents directory, chunks and embeds every file,
//! and writes a brand-new index file. The shared index handle is swapped
//! only once the new index is complete, so readers never observe a
//! half-built store. A `CURRENT` marker records which index file to load
//! on the next startup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use crate::errors::ApiError;
use crate::llm::Embedder;
use super::chunker::split_into_chunks;
use super::index::{SharedIndex, SqliteVectorIndex, StoredPassage, VectorIndex};
use super::progress::BuildProgress;

const EMBED_BATCH: usize = 32;
const CURRENT_MARKER: &str = "CURRENT";
const TEXT_EXTENSIONS: [&str; 4] = ["txt", "md", "markdown", "text"];

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub documents_path: PathBuf,
    pub vector_db_path: PathBuf,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

/// Open the index recorded by the last successful build, if any.
pub async fn load_current_index(vector_db_path: &Path) -> Option<Arc<dyn VectorIndex>> {
    let marker = vector_db_path.join(CURRENT_MARKER);
    let filename = std::fs::read_to_string(marker).ok()?;
    let db_path = vector_db_path.join(filename.trim());
    if !db_path.exists() {
        return None;
    }

    match SqliteVectorIndex::open(db_path).await {
        Ok(index) => Some(Arc::new(index)),
        Err(err) => {
            tracing::warn!("failed to open existing vector index: {}", err);
            None
        }
    }
}

/// Run one build to completion, updating `progress` along the way. The
/// caller is responsible for having claimed the job via
/// `BuildProgress::try_begin`.
pub async fn run_build(
    config: IngestConfig,
    embedder: Arc<dyn Embedder>,
    index_handle: SharedIndex,
    progress: BuildProgress,
) {
    match build_inner(&config, embedder, &index_handle, &progress).await {
        Ok(total) => {
            tracing::info!("knowledge base build finished with {} chunks", total);
            progress.complete(total);
        }
        Err(err) => {
            tracing::error!("knowledge base build failed: {}", err);
            progress.fail(&err.to_string());
        }
    }
}

async fn build_inner(
    config: &IngestConfig,
    embedder: Arc<dyn Embedder>,
    index_handle: &SharedIndex,
    progress: &BuildProgress,
) -> Result<usize, ApiError> {
    let chunks = collect_chunks(config)?;
    if chunks.is_empty() {
        return Err(ApiError::BadRequest(
            "no processable documents found".to_string(),
        ));
    }

    let total = chunks.len();
    progress.advance(0, total, "embedding chunks");

    std::fs::create_dir_all(&config.vector_db_path).map_err(ApiError::internal)?;
    let index_name = format!("index-{}.db", Uuid::new_v4());
    let new_index = SqliteVectorIndex::open(config.vector_db_path.join(&index_name)).await?;

    let mut done = 0;
    for batch in chunks.chunks(EMBED_BATCH) {
        let texts: Vec<String> = batch.iter().map(|(text, _)| text.clone()).collect();
        let embeddings = embedder.embed(&texts).await?;

        let items: Vec<(StoredPassage, Vec<f32>)> = batch
            .iter()
            .zip(embeddings)
            .map(|((text, source), embedding)| {
                (
                    StoredPassage {
                        id: Uuid::new_v4().to_string(),
                        text: text.clone(),
                        source: source.clone(),
                    },
                    embedding,
                )
            })
            .collect();

        new_index.insert_batch(items).await?;
        done = (done + batch.len()).min(total);
        progress.advance(done, total, &format!("embedded {}/{} chunks", done, total));
    }

    std::fs::write(config.vector_db_path.join(CURRENT_MARKER), &index_name)
        .map_err(ApiError::internal)?;

    // Swap the shared handle; the write lock is held only for the pointer
    // exchange, never across an await on index work.
    {
        let mut guard = index_handle.write().await;
        *guard = Some(Arc::new(new_index));
    }

    cleanup_stale_indexes(&config.vector_db_path, &index_name);
    Ok(total)
}

fn collect_chunks(config: &IngestConfig) -> Result<Vec<(String, String)>, ApiError> {
    let mut chunks = Vec::new();
    let entries = std::fs::read_dir(&config.documents_path).map_err(|e| {
        ApiError::BadRequest(format!(
            "cannot read documents directory {}: {}",
            config.documents_path.display(),
            e
        ))
    })?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| TEXT_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    for path in paths {
        let Ok(text) = std::fs::read_to_string(&path) else {
            tracing::warn!("skipping unreadable document {}", path.display());
            continue;
        };
        let source = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("unknown")
            .to_string();

        for chunk in split_into_chunks(&text, config.chunk_size, config.chunk_overlap) {
            chunks.push((chunk, source.clone()));
        }
    }

    Ok(chunks)
}

fn cleanup_stale_indexes(vector_db_path: &Path, keep: &str) {
    let Ok(entries) = std::fs::read_dir(vector_db_path) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with("index-") && !name.starts_with(keep) {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}
