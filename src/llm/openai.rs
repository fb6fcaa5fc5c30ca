use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::errors::ApiError;
use super::provider::{classify_status_error, classify_transport_error, LlmProvider, TokenReceiver};
use super::types::CompletionOptions;

/// OpenAI-compatible chat-completions backend. Also serves any service
/// speaking the same wire protocol (the deepseek variant reuses it with a
/// different base URL and name).
#[derive(Clone)]
pub struct OpenAiProvider {
    name: &'static str,
    base_url: String,
    api_key: String,
    client: Client,
    timeout_secs: u64,
}

impl OpenAiProvider {
    pub fn new(base_url: String, api_key: String, timeout_secs: u64) -> Self {
        Self::with_name("openai", base_url, api_key, timeout_secs)
    }

    pub fn with_name(
        name: &'static str,
        base_url: String,
        api_key: String,
        timeout_secs: u64,
    ) -> Self {
        Self {
            name,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: Client::builder()
                .timeout(Duration::from_secs(timeout_secs))
                .build()
                .unwrap_or_default(),
            timeout_secs,
        }
    }

    fn chat_body(&self, prompt: &str, options: &CompletionOptions, stream: bool) -> Value {
        let mut body = json!({
            "model": options.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
            "stream": stream,
        });
        if let Some(stop) = &options.stop {
            if let Some(obj) = body.as_object_mut() {
                obj.insert("stop".to_string(), json!(stop));
            }
        }
        body
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        self.name
    }

    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, ApiError> {
        let url = format!("{}/chat/completions", self.base_url);
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.chat_body(prompt, options, false))
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

        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                ApiError::ProviderBadResponse("missing choices[0].message.content".to_string())
            })
    }

    async fn stream_complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<TokenReceiver, ApiError> {
        let url = format!("{}/chat/completions", self.base_url);
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.chat_body(prompt, options, true))
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
            // Carry partial lines across chunk boundaries.
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
                            if line == "data: [DONE]" {
                                return;
                            }
                            if let Some(data) = line.strip_prefix("data: ") {
                                if let Ok(chunk) = serde_json::from_str::<Value>(data) {
                                    if let Some(content) =
                                        chunk["choices"][0]["delta"]["content"].as_str()
                                    {
                                        if !content.is_empty()
                                            && tx.send(Ok(content.to_string())).await.is_err()
                                        {
                                            return;
                                        }
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
        let url = format!("{}/embeddings", self.base_url);
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": model, "input": inputs }))
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

        let mut embeddings = Vec::new();
        if let Some(data) = payload["data"].as_array() {
            for item in data {
                if let Some(vals) = item["embedding"].as_array() {
                    embeddings.push(
                        vals.iter()
                            .filter_map(|v| v.as_f64().map(|f| f as f32))
                            .collect(),
                    );
                }
            }
        }

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
