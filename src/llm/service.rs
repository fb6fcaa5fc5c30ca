use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{ProviderKind, Settings};
use crate::errors::ApiError;
use super::gemini::GeminiProvider;
use super::ollama::OllamaProvider;
use super::openai::OpenAiProvider;
use super::provider::LlmProvider;

/// Holds one instance per configured backend and resolves request-level
/// provider selectors, falling back to the default from `Settings`.
pub struct ProviderRouter {
    default: ProviderKind,
    openai: Option<Arc<dyn LlmProvider>>,
    gemini: Option<Arc<dyn LlmProvider>>,
    ollama: Arc<dyn LlmProvider>,
    deepseek: Option<Arc<dyn LlmProvider>>,
}

impl ProviderRouter {
    pub fn from_settings(settings: &Settings) -> Self {
        let timeout = settings.llm_timeout_secs;

        let openai: Option<Arc<dyn LlmProvider>> = (!settings.openai_api_key.is_empty())
            .then(|| {
                Arc::new(OpenAiProvider::new(
                    settings.openai_api_base.clone(),
                    settings.openai_api_key.clone(),
                    timeout,
                )) as Arc<dyn LlmProvider>
            });
        let gemini: Option<Arc<dyn LlmProvider>> = (!settings.gemini_api_key.is_empty())
            .then(|| {
                Arc::new(GeminiProvider::new(
                    settings.gemini_api_base.clone(),
                    settings.gemini_api_key.clone(),
                    timeout,
                )) as Arc<dyn LlmProvider>
            });
        // Deepseek speaks the openai chat-completions protocol.
        let deepseek: Option<Arc<dyn LlmProvider>> = (!settings.deepseek_api_key.is_empty())
            .then(|| {
                Arc::new(OpenAiProvider::with_name(
                    "deepseek",
                    settings.deepseek_api_url.clone(),
                    settings.deepseek_api_key.clone(),
                    timeout,
                )) as Arc<dyn LlmProvider>
            });
        let ollama: Arc<dyn LlmProvider> =
            Arc::new(OllamaProvider::new(settings.ollama_api_url.clone(), timeout));

        Self {
            default: settings.provider,
            openai,
            gemini,
            ollama,
            deepseek,
        }
    }

    /// Resolve a request-level selector; `None` means the configured default.
    pub fn get(&self, selector: Option<&str>) -> Result<Arc<dyn LlmProvider>, ApiError> {
        let kind = match selector {
            Some(raw) => raw
                .parse::<ProviderKind>()
                .map_err(|e| ApiError::BadRequest(e.to_string()))?,
            None => self.default,
        };

        self.for_kind(kind).ok_or_else(|| {
            ApiError::BadRequest(format!("provider '{}' is not configured", kind.as_str()))
        })
    }

    fn for_kind(&self, kind: ProviderKind) -> Option<Arc<dyn LlmProvider>> {
        match kind {
            ProviderKind::OpenAi => self.openai.clone(),
            ProviderKind::Gemini => self.gemini.clone(),
            ProviderKind::Ollama => Some(self.ollama.clone()),
            ProviderKind::Deepseek => self.deepseek.clone(),
        }
    }
}

/// Embedding seam consumed by the retriever; production wiring goes through
/// the default provider, tests substitute a deterministic implementation.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ApiError>;
}

pub struct ProviderEmbedder {
    provider: Arc<dyn LlmProvider>,
    model: String,
}

impl ProviderEmbedder {
    pub fn new(provider: Arc<dyn LlmProvider>, model: String) -> Self {
        Self { provider, model }
    }
}

#[async_trait]
impl Embedder for ProviderEmbedder {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ApiError> {
        self.provider.embed(inputs, &self.model).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_settings;

    #[test]
    fn unconfigured_provider_is_rejected() {
        let router = ProviderRouter::from_settings(&test_settings());
        assert!(router.get(Some("openai")).is_err());
        assert!(router.get(Some("nonsense")).is_err());
        // Ollama needs no credentials and is always available.
        assert_eq!(router.get(Some("ollama")).unwrap().name(), "ollama");
        assert_eq!(router.get(None).unwrap().name(), "ollama");
    }

    #[test]
    fn deepseek_reuses_openai_wire_protocol() {
        let mut settings = test_settings();
        settings.deepseek_api_key = "sk-ds".to_string();
        let router = ProviderRouter::from_settings(&settings);
        assert_eq!(router.get(Some("deepseek")).unwrap().name(), "deepseek");
    }
}
