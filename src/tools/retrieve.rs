use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::errors::ApiError;
use crate::rag::{Retriever, SearchMethod};
use super::{extract_arg, Tool, ToolOutput};

/// Knowledge-base lookup for the agent; wraps the hybrid retriever.
pub struct KnowledgeRetrieveTool {
    retriever: Arc<Retriever>,
    top_k: usize,
}

impl KnowledgeRetrieveTool {
    pub fn new(retriever: Arc<Retriever>, top_k: usize) -> Self {
        Self { retriever, top_k }
    }
}

#[async_trait]
impl Tool for KnowledgeRetrieveTool {
    fn name(&self) -> &str {
        "knowledge_retrieve"
    }

    fn description(&self) -> &str {
        "Search the local knowledge base. Input: the search query. \
         Returns the most relevant passages with their source documents."
    }

    async fn invoke(&self, input: &str) -> Result<ToolOutput, ApiError> {
        let query = extract_arg(input, &["query", "q"]);
        if query.is_empty() {
            return Err(ApiError::Tool("knowledge_retrieve needs a query".to_string()));
        }

        let passages = self
            .retriever
            .search(&query, self.top_k, SearchMethod::Hybrid)
            .await
            .map_err(|err| match err {
                ApiError::IndexUnavailable => {
                    ApiError::Tool("the knowledge base has not been built yet".to_string())
                }
                other => ApiError::Tool(other.to_string()),
            })?;

        if passages.is_empty() {
            return Ok(ToolOutput::text(
                "No relevant passages found in the knowledge base.",
            ));
        }

        let text = passages
            .iter()
            .map(|p| format!("{}. [{}] {}", p.rank, p.source, p.text))
            .collect::<Vec<_>>()
            .join("\n\n");

        let data = passages
            .iter()
            .map(|p| {
                json!({
                    "source": p.source,
                    "text": p.text,
                    "score": p.score,
                    "rank": p.rank,
                })
            })
            .collect();

        Ok(ToolOutput {
            text,
            data: Some(data),
        })
    }
}
