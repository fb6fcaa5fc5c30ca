use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::errors::ApiError;
use super::provider::{classify_status_error, classify_transport_error, LlmProvider, TokenReceiver};
use super::types::CompletionOptions;

/// Local Ollama backend over its native `/api/generate` endpoint.
#[derive(Clone)]
pub struct OllamaProvider {
    base_url: String,
    client: Client,
    timeout_secs: u64,
}

impl OllamaProvider {
    pub fn new(base_url: String, timeout_secs: u64) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .build()
                .unwrap_or_default(),
            timeout_secs,
        }
    }

    fn generate_body(&self, prompt: &str, options: &CompletionOptions, stream: bool) -> Value {
        let mut generation = json!({
            "temperature": options.temperature,
            "num_predict": options.max_tokens,
        });
        if let Some(stop) = &options.stop {
            if let Some(obj) = generation.as_object_mut() {
                obj.insert("stop".to_string(), json!(stop));
            }
        }
        json!({
            "model": options.model,
            "prompt": prompt,
            "stream": stream,
            "options": generation,
        })
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, ApiError> {
        let url = format!("{}/api/generate", self.base_url);
        let res = self
            .client
            .post(&url)
            .json(&self.generate_body(prompt, options, false))
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

        payload["response"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ApiError::ProviderBadResponse("missing response field".to_string()))
    }

    async fn stream_complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<TokenReceiver, ApiError> {
        let url = format!("{}/api/generate", self.base_url);
        let res = self
            .client
            .post(&url)
            .json(&self.generate_body(prompt, options, true))
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
            // Ollama streams newline-delimited JSON objects.
            let mut pending = String::new();
            while let Some(item) = stream.next().await {
                match item {
                    Ok(bytes) => {
                        pending.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(pos) = pending.find('\n') {
                            let line = pending[..pos].trim().to_string();
                            pending.drain(..=pos);
                            if line.is_empty() {
                                continue;
                            }
                            if let Ok(chunk) = serde_json::from_str::<Value>(&line) {
                                if let Some(token) = chunk["response"].as_str() {
                                    if !token.is_empty()
                                        && tx.send(Ok(token.to_string())).await.is_err()
                                    {
                                        return;
                                    }
                                }
                                if chunk["done"].as_bool() == Some(true) {
                                    return;
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
        let url = format!("{}/api/embeddings", self.base_url);
        let mut embeddings = Vec::with_capacity(inputs.len());

        for input in inputs {
            let res = self
                .client
                .post(&url)
                .json(&json!({ "model": model, "prompt": input }))
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

            let vector = payload["embedding"]
                .as_array()
                .map(|vals| {
                    vals.iter()
                        .filter_map(|v| v.as_f64().map(|f| f as f32))
                        .collect::<Vec<f32>>()
                })
                .ok_or_else(|| {
                    ApiError::ProviderBadResponse("missing embedding field".to_string())
                })?;
            embeddings.push(vector);
        }

        Ok(embeddings)
    }
}
