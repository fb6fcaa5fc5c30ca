//! Hybrid dense+sparse retrieval.
//!
//! Dense search supplies a candidate pool; BM25 scores the same pool; both
//! signals are min-max normalised over the pool and blended with a
//! configurable weight. Ranks are a dense 1..N sequence per query.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::errors::ApiError;
use crate::llm::Embedder;
use super::index::{SharedIndex, StoredPassage, VectorIndex};
use super::rewriter::QueryRewriter;
use super::sparse::Bm25;

#[derive(Debug, Clone, Serialize)]
pub struct Passage {
    pub text: String,
    pub source: String,
    /// Vector mode: dense distance, ascending with rank. Hybrid mode: the
    /// blended similarity, descending with rank.
    pub score: f32,
    pub rank: usize,
}

#[derive(Debug, Clone)]
pub struct PassageInput {
    pub text: String,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMethod {
    Vector,
    Hybrid,
}

impl SearchMethod {
    pub fn parse(raw: Option<&str>) -> Result<Self, ApiError> {
        match raw.map(str::trim).filter(|s| !s.is_empty()) {
            None => Ok(SearchMethod::Hybrid),
            Some("vector") => Ok(SearchMethod::Vector),
            Some("hybrid") => Ok(SearchMethod::Hybrid),
            Some(other) => Err(ApiError::BadRequest(format!(
                "unknown search method '{}' (expected vector or hybrid)",
                other
            ))),
        }
    }
}

pub struct Retriever {
    index: SharedIndex,
    embedder: Arc<dyn Embedder>,
    rewriter: QueryRewriter,
    alpha: f32,
}

impl Retriever {
    pub fn new(
        index: SharedIndex,
        embedder: Arc<dyn Embedder>,
        rewriter: QueryRewriter,
        alpha: f32,
    ) -> Self {
        Self {
            index,
            embedder,
            rewriter,
            alpha,
        }
    }

    pub async fn is_ready(&self) -> bool {
        self.index.read().await.is_some()
    }

    async fn current_index(&self) -> Result<Arc<dyn VectorIndex>, ApiError> {
        self.index
            .read()
            .await
            .clone()
            .ok_or(ApiError::IndexUnavailable)
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, ApiError> {
        self.embedder
            .embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::ProviderBadResponse("embedder returned no vectors".to_string()))
    }

    pub async fn search(
        &self,
        query: &str,
        k: usize,
        method: SearchMethod,
    ) -> Result<Vec<Passage>, ApiError> {
        let k = k.max(1);
        let rewritten = self.rewriter.rewrite(query);
        let index = self.current_index().await?;
        let embedding = self.embed_one(&rewritten).await?;

        match method {
            SearchMethod::Vector => {
                let hits = index.search(&embedding, k).await?;
                Ok(hits
                    .into_iter()
                    .enumerate()
                    .map(|(i, hit)| Passage {
                        text: hit.passage.text,
                        source: hit.passage.source,
                        score: hit.distance,
                        rank: i + 1,
                    })
                    .collect())
            }
            SearchMethod::Hybrid => {
                let pool_size = (k * 4).max(20);
                let pool = index.search(&embedding, pool_size).await?;
                if pool.is_empty() {
                    return Ok(Vec::new());
                }

                let texts: Vec<&str> = pool.iter().map(|hit| hit.passage.text.as_str()).collect();
                let sparse_raw = Bm25::fit(&texts).scores(&rewritten);
                let dense_raw: Vec<f32> = pool.iter().map(|hit| hit.distance).collect();

                let dense_norm = min_max_normalize(&dense_raw);
                let sparse_norm = min_max_normalize(&sparse_raw);

                let mut scored: Vec<(f32, f32, StoredPassage)> = pool
                    .into_iter()
                    .enumerate()
                    .map(|(i, hit)| {
                        let combined = self.alpha * (1.0 - dense_norm[i])
                            + (1.0 - self.alpha) * sparse_norm[i];
                        (combined, hit.distance, hit.passage)
                    })
                    .collect();

                // Descending by blended score; ties go to the closer dense
                // hit, then to lexicographic source order.
                scored.sort_by(|a, b| {
                    b.0.partial_cmp(&a.0)
                        .unwrap_or(Ordering::Equal)
                        .then_with(|| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
                        .then_with(|| a.2.source.cmp(&b.2.source))
                });

                Ok(scored
                    .into_iter()
                    .take(k)
                    .enumerate()
                    .map(|(i, (combined, _, passage))| Passage {
                        text: passage.text,
                        source: passage.source,
                        score: combined,
                        rank: i + 1,
                    })
                    .collect())
            }
        }
    }

    /// Forward new passages to the backing index.
    pub async fn add(&self, passages: Vec<PassageInput>) -> Result<(), ApiError> {
        if passages.is_empty() {
            return Ok(());
        }

        let index = self.current_index().await?;
        let texts: Vec<String> = passages.iter().map(|p| p.text.clone()).collect();
        let embeddings = self.embedder.embed(&texts).await?;

        let items = passages
            .into_iter()
            .zip(embeddings)
            .map(|(input, embedding)| {
                (
                    StoredPassage {
                        id: Uuid::new_v4().to_string(),
                        text: input.text,
                        source: input.source,
                    },
                    embedding,
                )
            })
            .collect();

        index.insert_batch(items).await
    }
}

/// Deduplicate by source for client-facing emission; the first occurrence
/// in rank order wins. The internal ranked list keeps duplicates.
pub fn dedup_by_source(passages: &[Passage]) -> Vec<Passage> {
    let mut seen = std::collections::HashSet::new();
    passages
        .iter()
        .filter(|p| seen.insert(p.source.clone()))
        .cloned()
        .collect()
}

fn min_max_normalize(values: &[f32]) -> Vec<f32> {
    let min = values.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if !min.is_finite() || !max.is_finite() || (max - min).abs() <= f32::EPSILON {
        return vec![0.5; values.len()];
    }
    values.iter().map(|v| (v - min) / (max - min)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::rag::index::{shared_index, ScoredPassage};

    struct FixedEmbedder;

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
            Ok(inputs.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    /// Index stub returning a preset candidate list regardless of the query
    /// embedding.
    struct FixedIndex {
        hits: Vec<ScoredPassage>,
    }

    #[async_trait]
    impl VectorIndex for FixedIndex {
        async fn insert_batch(
            &self,
            _items: Vec<(StoredPassage, Vec<f32>)>,
        ) -> Result<(), ApiError> {
            Ok(())
        }

        async fn search(
            &self,
            _query: &[f32],
            limit: usize,
        ) -> Result<Vec<ScoredPassage>, ApiError> {
            let mut hits = self.hits.clone();
            hits.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap());
            hits.truncate(limit);
            Ok(hits)
        }

        async fn count(&self) -> Result<usize, ApiError> {
            Ok(self.hits.len())
        }
    }

    fn hit(text: &str, source: &str, distance: f32) -> ScoredPassage {
        ScoredPassage {
            passage: StoredPassage {
                id: source.to_string(),
                text: text.to_string(),
                source: source.to_string(),
            },
            distance,
        }
    }

    fn retriever_over(hits: Vec<ScoredPassage>, alpha: f32) -> Retriever {
        let handle = shared_index(Some(Arc::new(FixedIndex { hits })));
        Retriever::new(
            handle,
            Arc::new(FixedEmbedder),
            QueryRewriter::with_default_rules(),
            alpha,
        )
    }

    #[tokio::test]
    async fn unbuilt_index_reports_unavailable() {
        let retriever = Retriever::new(
            shared_index(None),
            Arc::new(FixedEmbedder),
            QueryRewriter::with_default_rules(),
            0.5,
        );
        let err = retriever.search("q", 3, SearchMethod::Vector).await.unwrap_err();
        assert!(matches!(err, ApiError::IndexUnavailable));
    }

    #[tokio::test]
    async fn vector_ranks_are_dense_and_scores_monotone() {
        let retriever = retriever_over(
            vec![
                hit("a", "doc-a", 0.3),
                hit("b", "doc-b", 0.1),
                hit("c", "doc-c", 0.7),
            ],
            0.5,
        );

        let results = retriever.search("query", 5, SearchMethod::Vector).await.unwrap();
        assert_eq!(results.len(), 3);
        for (i, passage) in results.iter().enumerate() {
            assert_eq!(passage.rank, i + 1);
        }
        assert!(results.windows(2).all(|w| w[0].score <= w[1].score));
        assert_eq!(results[0].source, "doc-b");
    }

    #[tokio::test]
    async fn hybrid_ranks_are_dense_and_scores_monotone() {
        let retriever = retriever_over(
            vec![
                hit("alpha beta", "doc-a", 0.2),
                hit("gamma delta", "doc-b", 0.4),
                hit("epsilon zeta", "doc-c", 0.6),
            ],
            0.5,
        );

        let results = retriever.search("alpha", 3, SearchMethod::Hybrid).await.unwrap();
        assert_eq!(results.len(), 3);
        for (i, passage) in results.iter().enumerate() {
            assert_eq!(passage.rank, i + 1);
        }
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn hybrid_beats_vector_on_verbatim_phrase() {
        // The phrase lives in a passage the dense index considers mediocre.
        let hits = vec![
            hit("general text about machines", "doc-near", 0.1),
            hit("the quantum flux capacitor powers the drive", "doc-phrase", 0.5),
            hit("unrelated cooking recipe", "doc-far", 0.9),
        ];

        let vector_top = retriever_over(hits.clone(), 0.5)
            .search("quantum flux capacitor", 1, SearchMethod::Vector)
            .await
            .unwrap();
        assert_eq!(vector_top[0].source, "doc-near");

        let hybrid_top = retriever_over(hits, 0.5)
            .search("quantum flux capacitor", 1, SearchMethod::Hybrid)
            .await
            .unwrap();
        assert_eq!(hybrid_top[0].source, "doc-phrase");
    }

    #[tokio::test]
    async fn rewrite_feeds_retrieval() {
        // Passage full of canonical architecture names wins once the broad
        // query is rewritten to "CNN RNN Transformer GAN".
        let hits = vec![
            hit("随机文本，与主题无关", "doc-misc", 0.2),
            hit("CNN RNN Transformer GAN 是四种主要架构", "doc-arch", 0.3),
            hit("完全不相关的菜谱内容", "doc-far", 0.9),
        ];

        let top = retriever_over(hits, 0.5)
            .search("深度学习的主要架构", 1, SearchMethod::Hybrid)
            .await
            .unwrap();
        assert_eq!(top[0].source, "doc-arch");
    }

    #[tokio::test]
    async fn hybrid_ties_break_by_distance_then_source() {
        // No sparse signal at all: every candidate gets the flat 0.5
        // sparse score, so ordering falls back to distance, then source.
        let hits = vec![
            hit("aaa", "doc-z", 0.4),
            hit("bbb", "doc-a", 0.4),
            hit("ccc", "doc-m", 0.4),
        ];

        let results = retriever_over(hits, 0.5)
            .search("nothing-in-common", 3, SearchMethod::Hybrid)
            .await
            .unwrap();
        let sources: Vec<&str> = results.iter().map(|p| p.source.as_str()).collect();
        assert_eq!(sources, vec!["doc-a", "doc-m", "doc-z"]);
    }

    #[tokio::test]
    async fn add_embeds_and_forwards_to_index() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct RecordingIndex {
            inserted: AtomicUsize,
        }

        #[async_trait]
        impl VectorIndex for RecordingIndex {
            async fn insert_batch(
                &self,
                items: Vec<(StoredPassage, Vec<f32>)>,
            ) -> Result<(), ApiError> {
                self.inserted.fetch_add(items.len(), Ordering::SeqCst);
                Ok(())
            }

            async fn search(
                &self,
                _query: &[f32],
                _limit: usize,
            ) -> Result<Vec<ScoredPassage>, ApiError> {
                Ok(Vec::new())
            }

            async fn count(&self) -> Result<usize, ApiError> {
                Ok(self.inserted.load(Ordering::SeqCst))
            }
        }

        let recording = Arc::new(RecordingIndex {
            inserted: AtomicUsize::new(0),
        });
        let handle = shared_index(Some(recording.clone()));
        let retriever = Retriever::new(
            handle,
            Arc::new(FixedEmbedder),
            QueryRewriter::with_default_rules(),
            0.5,
        );

        retriever
            .add(vec![
                PassageInput { text: "one".into(), source: "doc".into() },
                PassageInput { text: "two".into(), source: "doc".into() },
            ])
            .await
            .unwrap();

        assert_eq!(recording.count().await.unwrap(), 2);
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let passages = vec![
            Passage { text: "a".into(), source: "s1".into(), score: 0.1, rank: 1 },
            Passage { text: "b".into(), source: "s2".into(), score: 0.2, rank: 2 },
            Passage { text: "c".into(), source: "s1".into(), score: 0.3, rank: 3 },
        ];
        let deduped = dedup_by_source(&passages);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].source, "s1");
        assert_eq!(deduped[0].text, "a");
        assert_eq!(deduped[1].source, "s2");
    }

    #[test]
    fn normalize_handles_flat_input() {
        assert_eq!(min_max_normalize(&[3.0, 3.0]), vec![0.5, 0.5]);
        let normed = min_max_normalize(&[1.0, 3.0]);
        assert_eq!(normed, vec![0.0, 1.0]);
    }
}
