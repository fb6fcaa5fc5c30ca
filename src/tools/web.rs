use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::errors::ApiError;
use super::{extract_arg, Tool, ToolOutput};

/// Web search through an external gateway. When no gateway is configured
/// the tool stays registered and reports itself disabled instead of
/// erroring, so the agent can route around it.
pub struct WebSearchTool {
    gateway_url: Option<String>,
    client: Client,
}

impl WebSearchTool {
    pub fn new(gateway_url: Option<String>, timeout_secs: u64) -> Self {
        Self {
            gateway_url,
            client: Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for current information. Input: the search query. \
         Returns result titles, URLs and snippets."
    }

    async fn invoke(&self, input: &str) -> Result<ToolOutput, ApiError> {
        let Some(gateway) = &self.gateway_url else {
            return Ok(ToolOutput::text(
                "web_search is disabled: no search gateway is configured",
            ));
        };

        let query = extract_arg(input, &["query", "q"]);
        if query.is_empty() {
            return Err(ApiError::Tool("web_search needs a query".to_string()));
        }

        let url = format!(
            "{}?q={}",
            gateway.trim_end_matches('/'),
            urlencoding::encode(&query)
        );
        let res = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ApiError::Tool(format!("search gateway unreachable: {}", e)))?;

        if !res.status().is_success() {
            return Err(ApiError::Tool(format!(
                "search gateway returned {}",
                res.status()
            )));
        }

        let payload: Value = res
            .json()
            .await
            .map_err(|e| ApiError::Tool(format!("malformed search response: {}", e)))?;

        let mut lines = Vec::new();
        let mut data = Vec::new();
        if let Some(items) = payload.get("results").and_then(Value::as_array) {
            for (i, item) in items.iter().take(10).enumerate() {
                let title = item.get("title").and_then(Value::as_str).unwrap_or("");
                let url = item.get("url").and_then(Value::as_str).unwrap_or("");
                let snippet = item.get("snippet").and_then(Value::as_str).unwrap_or("");
                if title.is_empty() || url.is_empty() {
                    continue;
                }
                lines.push(format!("{}. {} ({})\n   {}", i + 1, title, url, snippet));
                data.push(json!({ "title": title, "url": url, "rank": i + 1 }));
            }
        }

        if lines.is_empty() {
            return Ok(ToolOutput::text("No web results found."));
        }

        Ok(ToolOutput {
            text: lines.join("\n"),
            data: Some(data),
        })
    }
}
