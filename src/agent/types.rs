use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// One recorded step of the ReAct loop. A step either carries a tool call
/// (and eventually its observation) or is the terminal step that produced
/// the final answer.
#[derive(Debug, Clone, Serialize)]
pub struct ReActStep {
    pub step: usize,
    pub thought: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation_data: Option<Vec<Value>>,
}

/// A structured trace event pushed to the stream while the loop runs.
#[derive(Debug, Clone, Serialize)]
pub struct AgentEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
}

impl AgentEvent {
    pub fn new(kind: &str, data: Value) -> Self {
        Self {
            kind: kind.to_string(),
            data,
            step: None,
        }
    }

    pub fn at_step(kind: &str, data: Value, step: usize) -> Self {
        Self {
            kind: kind.to_string(),
            data,
            step: Some(step),
        }
    }
}

/// Where trace events go. `detached` drops them, for the non-streaming
/// endpoints that only need the final outcome.
#[derive(Clone)]
pub struct EventSink {
    tx: Option<mpsc::Sender<AgentEvent>>,
}

impl EventSink {
    pub fn streaming(tx: mpsc::Sender<AgentEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn detached() -> Self {
        Self { tx: None }
    }

    /// False once the receiver is gone, which is how client disconnects
    /// propagate into the loop.
    pub async fn emit(&self, event: AgentEvent) -> bool {
        match &self.tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => true,
        }
    }
}

/// Outcome of a full agent invocation.
#[derive(Debug, Clone, Serialize)]
pub struct AgentOutcome {
    pub success: bool,
    pub answer: String,
    pub steps: Vec<ReActStep>,
    pub tools_used: Vec<String>,
    pub iterations: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reflection: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub max_iterations: usize,
    pub enable_reflection: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            enable_reflection: true,
        }
    }
}
