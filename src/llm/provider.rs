use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::ApiError;
use super::types::CompletionOptions;

pub type TokenReceiver = mpsc::Receiver<Result<String, ApiError>>;

/// Uniform interface over chat/completion backends.
///
/// `stream_complete` yields tokens in the backend's native granularity over
/// a bounded channel; the sequence is finite and dropping the receiver
/// cancels the producer task at its next send. Errors are reported upward
/// without retry; retry policy belongs to the session layer.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name (e.g. "openai", "ollama").
    fn name(&self) -> &str;

    /// Completion, returning the full text.
    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, ApiError>;

    /// Streaming completion.
    async fn stream_complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<TokenReceiver, ApiError>;

    /// Generate embeddings for a batch of inputs.
    async fn embed(&self, inputs: &[String], model: &str) -> Result<Vec<Vec<f32>>, ApiError>;
}

/// Map a reqwest failure onto the provider error taxonomy.
pub(super) fn classify_transport_error(err: reqwest::Error, timeout_secs: u64) -> ApiError {
    if err.is_timeout() {
        ApiError::ProviderTimeout(timeout_secs)
    } else if err.is_connect() || err.is_request() {
        ApiError::ProviderUnreachable(err.to_string())
    } else {
        ApiError::ProviderBadResponse(err.to_string())
    }
}

/// Map a non-2xx provider response onto the error taxonomy.
pub(super) fn classify_status_error(status: reqwest::StatusCode, body: String) -> ApiError {
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        ApiError::ProviderAuth(body)
    } else {
        ApiError::ProviderBadResponse(format!("status {}: {}", status, body))
    }
}
