use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::errors::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Gemini,
    Ollama,
    Deepseek,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Deepseek => "deepseek",
        }
    }
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "gemini" => Ok(ProviderKind::Gemini),
            "ollama" => Ok(ProviderKind::Ollama),
            "deepseek" => Ok(ProviderKind::Deepseek),
            other => Err(ConfigError(format!(
                "unsupported MODEL_PROVIDER '{}' (expected openai, gemini, ollama or deepseek)",
                other
            ))),
        }
    }
}

/// Runtime knobs, loaded once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub provider: ProviderKind,
    pub llm_model: String,
    pub embedding_model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_k: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub hybrid_alpha: f32,
    pub max_iterations: usize,

    pub vector_db_path: PathBuf,
    pub conversations_path: PathBuf,
    pub documents_path: PathBuf,

    pub openai_api_key: String,
    pub openai_api_base: String,
    pub gemini_api_key: String,
    pub gemini_api_base: String,
    pub ollama_api_url: String,
    pub ollama_model: String,
    pub deepseek_api_key: String,
    pub deepseek_api_url: String,
    pub search_gateway_url: Option<String>,

    pub llm_timeout_secs: u64,
    pub tool_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub stream_idle_timeout_secs: u64,

    pub port: u16,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let provider = read_var("MODEL_PROVIDER")
            .map(|raw| raw.parse())
            .transpose()?
            .unwrap_or(ProviderKind::OpenAi);

        let settings = Settings {
            provider,
            llm_model: read_var("LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            embedding_model: read_var("EMBEDDING_MODEL")
                .unwrap_or_else(|| "text-embedding-3-small".to_string()),
            temperature: parse_var("TEMPERATURE", 0.7)?,
            max_tokens: parse_var("MAX_TOKENS", 1000)?,
            top_k: parse_var("TOP_K", 3)?,
            chunk_size: parse_var("CHUNK_SIZE", 500)?,
            chunk_overlap: parse_var("CHUNK_OVERLAP", 50)?,
            hybrid_alpha: parse_var("HYBRID_ALPHA", 0.5)?,
            max_iterations: parse_var("MAX_ITERATIONS", 10)?,
            vector_db_path: read_var("VECTOR_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./vector_db")),
            conversations_path: read_var("CONVERSATIONS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./conversations.db")),
            documents_path: read_var("DOCUMENTS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./documents")),
            openai_api_key: read_var("OPENAI_API_KEY").unwrap_or_default(),
            openai_api_base: read_var("OPENAI_API_BASE")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            gemini_api_key: read_var("GEMINI_API_KEY").unwrap_or_default(),
            gemini_api_base: read_var("GEMINI_API_BASE").unwrap_or_else(|| {
                "https://generativelanguage.googleapis.com/v1beta".to_string()
            }),
            ollama_api_url: read_var("OLLAMA_API_URL")
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            ollama_model: read_var("OLLAMA_MODEL").unwrap_or_else(|| "gemma3:4b".to_string()),
            deepseek_api_key: read_var("DEEPSEEK_API_KEY").unwrap_or_default(),
            deepseek_api_url: read_var("DEEPSEEK_API_URL")
                .unwrap_or_else(|| "https://api.deepseek.com/v1".to_string()),
            search_gateway_url: read_var("SEARCH_GATEWAY_URL"),
            llm_timeout_secs: parse_var("LLM_TIMEOUT_SECS", 120)?,
            tool_timeout_secs: parse_var("TOOL_TIMEOUT_SECS", 30)?,
            request_timeout_secs: parse_var("REQUEST_TIMEOUT_SECS", 300)?,
            stream_idle_timeout_secs: parse_var("STREAM_IDLE_TIMEOUT_SECS", 60)?,
            port: parse_var("PORT", 8000)?,
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.provider {
            ProviderKind::OpenAi if self.openai_api_key.is_empty() => {
                return Err(ConfigError("OPENAI_API_KEY is not set".to_string()));
            }
            ProviderKind::Gemini if self.gemini_api_key.is_empty() => {
                return Err(ConfigError("GEMINI_API_KEY is not set".to_string()));
            }
            ProviderKind::Deepseek if self.deepseek_api_key.is_empty() => {
                return Err(ConfigError("DEEPSEEK_API_KEY is not set".to_string()));
            }
            _ => {}
        }

        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError(format!(
                "TEMPERATURE must be within [0, 2], got {}",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError("MAX_TOKENS must be at least 1".to_string()));
        }
        if self.top_k == 0 {
            return Err(ConfigError("TOP_K must be at least 1".to_string()));
        }
        if self.max_iterations == 0 {
            return Err(ConfigError("MAX_ITERATIONS must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.hybrid_alpha) {
            return Err(ConfigError(format!(
                "HYBRID_ALPHA must be within [0, 1], got {}",
                self.hybrid_alpha
            )));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(ConfigError(format!(
                "CHUNK_OVERLAP ({}) must be smaller than CHUNK_SIZE ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }

        Ok(())
    }
}

fn read_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match read_var(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| ConfigError(format!("invalid {}: {}", key, e))),
        None => Ok(default),
    }
}

#[cfg(test)]
pub(crate) fn test_settings() -> Settings {
    Settings {
        provider: ProviderKind::Ollama,
        llm_model: "gpt-4o-mini".to_string(),
        embedding_model: "text-embedding-3-small".to_string(),
        temperature: 0.7,
        max_tokens: 1000,
        top_k: 3,
        chunk_size: 500,
        chunk_overlap: 50,
        hybrid_alpha: 0.5,
        max_iterations: 10,
        vector_db_path: PathBuf::from("./vector_db"),
        conversations_path: PathBuf::from("./conversations.db"),
        documents_path: PathBuf::from("./documents"),
        openai_api_key: String::new(),
        openai_api_base: "https://api.openai.com/v1".to_string(),
        gemini_api_key: String::new(),
        gemini_api_base: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        ollama_api_url: "http://localhost:11434".to_string(),
        ollama_model: "gemma3:4b".to_string(),
        deepseek_api_key: String::new(),
        deepseek_api_url: "https://api.deepseek.com/v1".to_string(),
        search_gateway_url: None,
        llm_timeout_secs: 120,
        tool_timeout_secs: 30,
        request_timeout_secs: 300,
        stream_idle_timeout_secs: 60,
        port: 8000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parsing() {
        assert_eq!("OpenAI".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert_eq!(" ollama ".parse::<ProviderKind>().unwrap(), ProviderKind::Ollama);
        assert!("mystery".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn remote_provider_requires_key() {
        let mut settings = test_settings();
        settings.provider = ProviderKind::OpenAi;
        assert!(settings.validate().is_err());

        settings.openai_api_key = "sk-test".to_string();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn numeric_ranges_enforced() {
        let mut settings = test_settings();
        settings.temperature = 2.5;
        assert!(settings.validate().is_err());

        let mut settings = test_settings();
        settings.hybrid_alpha = 1.5;
        assert!(settings.validate().is_err());

        let mut settings = test_settings();
        settings.chunk_overlap = 500;
        assert!(settings.validate().is_err());
    }
}
