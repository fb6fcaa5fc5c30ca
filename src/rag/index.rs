//! Flat vector index behind the `VectorIndex` trait.
//!
//! The SQLite implementation stores embeddings as little-endian f32 blobs
//! and scans with cosine similarity. Search results carry a distance
//! (`1 - cosine`), lower is better. A rebuild constructs a fresh index file
//! out-of-place and the shared handle is swapped once it is complete.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;

use crate::errors::ApiError;

#[derive(Debug, Clone)]
pub struct StoredPassage {
    pub id: String,
    pub text: String,
    pub source: String,
}

#[derive(Debug, Clone)]
pub struct ScoredPassage {
    pub passage: StoredPassage,
    /// `1 - cosine(query, passage)`; lower means closer.
    pub distance: f32,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn insert_batch(&self, items: Vec<(StoredPassage, Vec<f32>)>) -> Result<(), ApiError>;

    async fn search(&self, query: &[f32], limit: usize) -> Result<Vec<ScoredPassage>, ApiError>;

    async fn count(&self) -> Result<usize, ApiError>;
}

/// Shared handle to the currently loaded index. `None` until a build has
/// completed; the write lock is held only for the pointer swap.
pub type SharedIndex = Arc<RwLock<Option<Arc<dyn VectorIndex>>>>;

pub fn shared_index(initial: Option<Arc<dyn VectorIndex>>) -> SharedIndex {
    Arc::new(RwLock::new(initial))
}

pub struct SqliteVectorIndex {
    pool: SqlitePool,
    #[allow(dead_code)]
    db_path: PathBuf,
}

impl SqliteVectorIndex {
    pub async fn open(db_path: PathBuf) -> Result<Self, ApiError> {
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(ApiError::internal)?;

        let index = Self { pool, db_path };
        index.init_schema().await?;
        Ok(index)
    }

    async fn init_schema(&self) -> Result<(), ApiError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS passages (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                source TEXT NOT NULL DEFAULT '',
                embedding BLOB NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(())
    }

    fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
        embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    fn deserialize_embedding(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() || a.is_empty() {
            return 0.0;
        }

        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        let denom = norm_a * norm_b;

        if denom <= f32::EPSILON {
            0.0
        } else {
            dot / denom
        }
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn insert_batch(&self, items: Vec<(StoredPassage, Vec<f32>)>) -> Result<(), ApiError> {
        if items.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(ApiError::internal)?;

        for (passage, embedding) in &items {
            let blob = Self::serialize_embedding(embedding);
            sqlx::query(
                "INSERT OR REPLACE INTO passages (id, content, source, embedding)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(&passage.id)
            .bind(&passage.text)
            .bind(&passage.source)
            .bind(&blob)
            .execute(&mut *tx)
            .await
            .map_err(ApiError::internal)?;
        }

        tx.commit().await.map_err(ApiError::internal)?;
        Ok(())
    }

    async fn search(&self, query: &[f32], limit: usize) -> Result<Vec<ScoredPassage>, ApiError> {
        let rows = sqlx::query("SELECT id, content, source, embedding FROM passages")
            .fetch_all(&self.pool)
            .await
            .map_err(ApiError::internal)?;

        let mut scored: Vec<ScoredPassage> = rows
            .iter()
            .filter_map(|row| {
                let embedding_bytes: Vec<u8> = row.get("embedding");
                if embedding_bytes.is_empty() {
                    return None;
                }
                let stored = Self::deserialize_embedding(&embedding_bytes);
                let distance = 1.0 - Self::cosine_similarity(query, &stored);

                Some(ScoredPassage {
                    passage: StoredPassage {
                        id: row.get("id"),
                        text: row.get("content"),
                        source: row.get("source"),
                    },
                    distance,
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit.max(1));

        Ok(scored)
    }

    async fn count(&self) -> Result<usize, ApiError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM passages")
            .fetch_one(&self.pool)
            .await
            .map_err(ApiError::internal)?;
        Ok(count as usize)
    }
}
