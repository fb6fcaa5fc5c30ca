pub mod file;
pub mod retrieve;
pub mod web;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::ApiError;

/// What a tool hands back to the agent: display text for the model's
/// observation, plus optional structured rows for the client.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub text: String,
    pub data: Option<Vec<Value>>,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            data: None,
        }
    }
}

/// A named capability the agent can invoke. Tools receive the model's
/// serialised input as a single string, are side-effect-free with respect
/// to conversation state, and must stay within the registry timeout.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Shown to the model in the tool catalogue.
    fn description(&self) -> &str;

    async fn invoke(&self, input: &str) -> Result<ToolOutput, ApiError>;
}

/// Ordered tool dispatch. Order matters: it is the order the catalogue is
/// presented to the model, which the session layer uses to bias modes.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    by_name: HashMap<String, usize>,
    timeout: Duration,
}

impl ToolRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tools: Vec::new(),
            by_name: HashMap::new(),
            timeout,
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.by_name.contains_key(&name) {
            tracing::warn!("tool '{}' registered twice, keeping the first", name);
            return;
        }
        self.by_name.insert(name, self.tools.len());
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.by_name.get(name).map(|&idx| self.tools[idx].clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    /// One line per tool, in registration order, for the ReAct prompt.
    pub fn catalogue(&self) -> String {
        self.tools
            .iter()
            .map(|t| format!("- {}: {}", t.name(), t.description()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Look up and run a tool under the registry timeout.
    pub async fn invoke(&self, name: &str, input: &str) -> Result<ToolOutput, ApiError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ApiError::Tool(format!("unknown tool '{}'", name)))?;

        match tokio::time::timeout(self.timeout, tool.invoke(input)).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Tool(format!(
                "tool '{}' timed out after {}s",
                name,
                self.timeout.as_secs()
            ))),
        }
    }
}

/// Tool inputs arrive either as a bare string or as a JSON object from the
/// model; pull the named key out when it is the latter.
pub(crate) fn extract_arg(input: &str, keys: &[&str]) -> String {
    let trimmed = input.trim();
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        for key in keys {
            if let Some(value) = map.get(*key).and_then(Value::as_str) {
                return value.trim().to_string();
            }
        }
    }
    trimmed.trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the input back"
        }

        async fn invoke(&self, input: &str) -> Result<ToolOutput, ApiError> {
            Ok(ToolOutput::text(input.to_string()))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "Takes too long"
        }

        async fn invoke(&self, _input: &str) -> Result<ToolOutput, ApiError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ToolOutput::text("late"))
        }
    }

    #[tokio::test]
    async fn dispatch_and_catalogue_follow_registration_order() {
        let mut registry = ToolRegistry::new(Duration::from_secs(5));
        registry.register(Arc::new(EchoTool));

        assert_eq!(registry.names(), vec!["echo"]);
        assert!(registry.catalogue().starts_with("- echo:"));

        let output = registry.invoke("echo", "hi").await.unwrap();
        assert_eq!(output.text, "hi");

        let err = registry.invoke("missing", "hi").await.unwrap_err();
        assert!(matches!(err, ApiError::Tool(_)));
    }

    #[tokio::test]
    async fn slow_tool_hits_registry_timeout() {
        let mut registry = ToolRegistry::new(Duration::from_millis(20));
        registry.register(Arc::new(SlowTool));

        let err = registry.invoke("slow", "").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn arg_extraction_handles_json_and_plain_input() {
        assert_eq!(extract_arg(r#"{"query": "rust"}"#, &["query"]), "rust");
        assert_eq!(extract_arg(r#"{"q": "rust"}"#, &["query", "q"]), "rust");
        assert_eq!(extract_arg("plain text", &["query"]), "plain text");
        assert_eq!(extract_arg("\"quoted\"", &["query"]), "quoted");
    }
}
