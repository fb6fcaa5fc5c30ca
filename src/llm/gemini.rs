use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::errors::ApiError;
use super::provider::{classify_status_error, classify_transport_error, LlmProvider, TokenReceiver};
use super::types::CompletionOptions;

/// Gemini-compatible backend over the generative-language REST API.
#[derive(Clone)]
pub struct GeminiProvider {
    base_url: String,
    api_key: String,
    client: Client,
    timeout_secs: u64,
}

impl GeminiProvider {
    pub fn new(base_url: String, api_key: String, timeout_secs: u64) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .build()
                .unwrap_or_default(),
            timeout_secs,
        }
    }

    fn generate_body(&self, prompt: &str, options: &CompletionOptions) -> Value {
        let mut generation = json!({
            "temperature": options.temperature,
            "maxOutputTokens": options.max_tokens,
        });
        if let Some(stop) = &options.stop {
            if let Some(obj) = generation.as_object_mut() {
                obj.insert("stopSequences".to_string(), json!(stop));
            }
        }
        json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": generation,
        })
    }
}

fn extract_text(payload: &Value) -> Option<String> {
    payload["candidates"][0]["content"]["parts"][0]["text"]
        .as_str()
        .map(str::to_string)
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, ApiError> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, options.model, self.api_key
        );
        let res = self
            .client
            .post(&url)
            .json(&self.generate_body(prompt, options))
            .send()
            .await
            .map_err(|e| classify_transport_error(e, self.timeout_secs))?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(classify_status_error(status, text));
        }

        let payload: Value = res
            .json()
            .await
            .map_err(|e| ApiError::ProviderBadResponse(e.to_string()))?;

        extract_text(&payload).ok_or_else(|| {
            ApiError::ProviderBadResponse("missing candidates[0].content".to_string())
        })
    }

    async fn stream_complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<TokenReceiver, ApiError> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, options.model, self.api_key
        );
        let res = self
            .client
            .post(&url)
            .json(&self.generate_body(prompt, options))
            .send()
            .await
            .map_err(|e| classify_transport_error(e, self.timeout_secs))?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(classify_status_error(status, text));
        }

        let (tx, rx) = mpsc::channel(32);
        let mut stream = res.bytes_stream();
        let timeout_secs = self.timeout_secs;

        tokio::spawn(async move {
            let mut pending = String::new();
            while let Some(item) = stream.next().await {
                match item {
                    Ok(bytes) => {
                        pending.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(pos) = pending.find('\n') {
                            let line = pending[..pos].trim().to_string();
                            pending.drain(..=pos);
                            let Some(data) = line.strip_prefix("data: ") else {
                                continue;
                            };
                            if let Ok(chunk) = serde_json::from_str::<Value>(data) {
                                if let Some(token) = extract_text(&chunk) {
                                    if !token.is_empty() && tx.send(Ok(token)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(Err(classify_transport_error(e, timeout_secs)))
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn embed(&self, inputs: &[String], model: &str) -> Result<Vec<Vec<f32>>, ApiError> {
        let url = format!(
            "{}/models/{}:batchEmbedContents?key={}",
            self.base_url, model, self.api_key
        );
        let requests: Vec<Value> = inputs
            .iter()
            .map(|input| {
                json!({
                    "model": format!("models/{}", model),
                    "content": { "parts": [{ "text": input }] },
                })
            })
            .collect();

        let res = self
            .client
            .post(&url)
            .json(&json!({ "requests": requests }))
            .send()
            .await
            .map_err(|e| classify_transport_error(e, self.timeout_secs))?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(classify_status_error(status, text));
        }

        let payload: Value = res
            .json()
            .await
            .map_err(|e| ApiError::ProviderBadResponse(e.to_string()))?;

        let embeddings: Vec<Vec<f32>> = payload["embeddings"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item["values"].as_array())
                    .map(|vals| {
                        vals.iter()
                            .filter_map(|v| v.as_f64().map(|f| f as f32))
                            .collect()
                    })
                    .collect()
            })
            .unwrap_or_default();

        if embeddings.len() != inputs.len() {
            return Err(ApiError::ProviderBadResponse(format!(
                "expected {} embeddings, got {}",
                inputs.len(),
                embeddings.len()
            )));
        }

        Ok(embeddings)
    }
}
