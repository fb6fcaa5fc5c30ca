//! The bounded ReAct loop: prompt, stream, parse, dispatch, observe.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::errors::ApiError;
use crate::llm::{CompletionOptions, LlmProvider};
use crate::tools::ToolRegistry;
use super::parser::{final_answer_offset, parse_react_output, Decision};
use super::prompts::{parse_reflection, react_prompt, reflection_prompt, BUDGET_EXHAUSTED};
use super::types::{AgentConfig, AgentEvent, AgentOutcome, EventSink, ReActStep};

const OBSERVATION_PREVIEW_CHARS: usize = 500;

pub struct AgentLoop {
    provider: Arc<dyn LlmProvider>,
    options: CompletionOptions,
    registry: Arc<ToolRegistry>,
    config: AgentConfig,
    preamble: String,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        options: CompletionOptions,
        registry: Arc<ToolRegistry>,
        config: AgentConfig,
        preamble: String,
    ) -> Self {
        Self {
            provider,
            options,
            registry,
            config,
            preamble,
        }
    }

    /// Run to completion, pushing trace events into `sink`.
    ///
    /// Termination guarantee: at most `max_iterations` steps, and exactly
    /// one of final answer / budget-exhausted message / error reaches the
    /// sink. Tool failures are fed back as observations and never end the
    /// run; provider failures do. A dead sink (client gone) aborts with
    /// `Cancelled`.
    pub async fn run(
        &self,
        question: &str,
        chat_history: &str,
        sink: &EventSink,
    ) -> Result<AgentOutcome, ApiError> {
        let mut prompt = react_prompt(
            &self.preamble,
            &chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            chat_history,
            &self.registry.catalogue(),
            question,
        );

        let mut steps: Vec<ReActStep> = Vec::new();
        let mut tools_used: Vec<String> = Vec::new();
        let mut observation_cache: HashMap<(String, String), (String, Option<Vec<Value>>)> =
            HashMap::new();
        let mut final_answer: Option<String> = None;

        self.emit(sink, AgentEvent::new("start", json!("reasoning started")))
            .await?;

        let mut iterations = 0;
        while iterations < self.config.max_iterations {
            iterations += 1;
            tracing::info!(iteration = iterations, "agent iteration started");

            self.emit(
                sink,
                AgentEvent::at_step(
                    "iteration",
                    json!({ "iteration": iterations, "max": self.config.max_iterations }),
                    iterations,
                ),
            )
            .await?;

            let output = self.stream_iteration(&prompt, iterations, sink).await?;
            let parsed = parse_react_output(&output);

            match parsed.decision {
                Decision::Final(answer) => {
                    steps.push(ReActStep {
                        step: iterations,
                        thought: parsed.thought,
                        tool: None,
                        tool_input: None,
                        observation: None,
                        observation_data: None,
                    });
                    final_answer = Some(answer);
                    break;
                }
                Decision::Act { tool, input } => {
                    self.emit(
                        sink,
                        AgentEvent::at_step(
                            "action",
                            json!({ "tool": tool, "input": input }),
                            iterations,
                        ),
                    )
                    .await?;

                    let key = (tool.clone(), input.clone());
                    let (observation, data) = match observation_cache.get(&key) {
                        Some(cached) => cached.clone(),
                        None => {
                            let result = self.dispatch(&tool, &input, &mut tools_used).await;
                            observation_cache.insert(key, result.clone());
                            result
                        }
                    };

                    self.emit(
                        sink,
                        AgentEvent::at_step(
                            "observation",
                            json!({
                                "text": preview(&observation),
                                "data": data,
                            }),
                            iterations,
                        ),
                    )
                    .await?;

                    steps.push(ReActStep {
                        step: iterations,
                        thought: parsed.thought,
                        tool: Some(tool),
                        tool_input: Some(input),
                        observation: Some(observation.clone()),
                        observation_data: data,
                    });

                    prompt = format!(
                        "{}\n\n{}\n\nObservation: {}\n\nContinue the reasoning:",
                        prompt, output, observation
                    );
                }
                Decision::None => {
                    // The model produced neither marker; its text is the
                    // best answer we will get.
                    let answer = if parsed.thought.is_empty() {
                        output.trim().to_string()
                    } else {
                        parsed.thought.clone()
                    };
                    steps.push(ReActStep {
                        step: iterations,
                        thought: parsed.thought,
                        tool: None,
                        tool_input: None,
                        observation: None,
                        observation_data: None,
                    });
                    final_answer = Some(answer);
                    break;
                }
            }
        }

        let success = final_answer.is_some();
        let answer = match final_answer {
            Some(answer) if !answer.is_empty() => answer,
            _ => {
                // Budget exhausted: fall back to the last thought when the
                // trajectory produced one.
                steps
                    .iter()
                    .rev()
                    .map(|s| s.thought.trim())
                    .find(|t| !t.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| BUDGET_EXHAUSTED.to_string())
            }
        };

        let reflection = if success && self.config.enable_reflection
            && steps.len() >= self.config.max_iterations / 2
        {
            self.reflect(question, &answer, &tools_used, sink).await?
        } else {
            None
        };

        self.emit(
            sink,
            AgentEvent::new(
                "meta",
                json!({ "tools_used": tools_used, "iterations": iterations }),
            ),
        )
        .await?;
        self.emit(sink, AgentEvent::new("done", json!(answer.clone())))
            .await?;

        Ok(AgentOutcome {
            success,
            answer,
            steps,
            tools_used,
            iterations,
            reflection,
        })
    }

    /// Stream one completion, switching to token-level answer emission the
    /// moment a `Final Answer:` marker shows up in the buffer.
    async fn stream_iteration(
        &self,
        prompt: &str,
        iteration: usize,
        sink: &EventSink,
    ) -> Result<String, ApiError> {
        self.emit(sink, AgentEvent::at_step("thinking_start", Value::Null, iteration))
            .await?;

        let mut rx = match self.provider.stream_complete(prompt, &self.options).await {
            Ok(rx) => rx,
            Err(err) => {
                self.emit_error(sink, &err).await;
                return Err(err);
            }
        };

        let mut output = String::new();
        let mut answering = false;

        while let Some(item) = rx.recv().await {
            match item {
                Ok(token) => {
                    output.push_str(&token);
                    if answering {
                        self.emit(
                            sink,
                            AgentEvent::at_step("answer_token", json!(token), iteration),
                        )
                        .await?;
                    } else if let Some(offset) = final_answer_offset(&output) {
                        answering = true;
                        self.emit(sink, AgentEvent::at_step("answer_start", Value::Null, iteration))
                            .await?;
                        let head = output[offset..].trim_start();
                        if !head.is_empty() {
                            self.emit(
                                sink,
                                AgentEvent::at_step("answer_token", json!(head), iteration),
                            )
                            .await?;
                        }
                    }
                }
                Err(err) => {
                    self.emit_error(sink, &err).await;
                    return Err(err);
                }
            }
        }

        self.emit(
            sink,
            AgentEvent::at_step("thinking_end", json!(output.clone()), iteration),
        )
        .await?;

        Ok(output)
    }

    /// Tool dispatch. Unknown tools and tool failures become observations.
    async fn dispatch(
        &self,
        tool: &str,
        input: &str,
        tools_used: &mut Vec<String>,
    ) -> (String, Option<Vec<Value>>) {
        if self.registry.get(tool).is_none() {
            let known = self.registry.names().join(", ");
            return (
                format!("unknown tool '{}', available tools: {}", tool, known),
                None,
            );
        }

        if !tools_used.iter().any(|t| t == tool) {
            tools_used.push(tool.to_string());
        }

        match self.registry.invoke(tool, input).await {
            Ok(output) => (output.text, output.data),
            Err(err) => {
                tracing::warn!(tool, "tool failed: {}", err);
                (format!("tool '{}' failed: {}", tool, err), None)
            }
        }
    }

    /// One reflection pass. Never rewrites prior steps; verdict problems
    /// default to approved.
    async fn reflect(
        &self,
        question: &str,
        answer: &str,
        tools_used: &[String],
        sink: &EventSink,
    ) -> Result<Option<String>, ApiError> {
        self.emit(sink, AgentEvent::new("reflecting", json!("checking the answer")))
            .await?;

        let verdict = match self
            .provider
            .complete(&reflection_prompt(question, answer, tools_used), &self.options)
            .await
        {
            Ok(raw) => parse_reflection(&raw),
            Err(err) => {
                tracing::warn!("reflection pass failed: {}", err);
                None
            }
        };

        self.emit(
            sink,
            AgentEvent::new(
                "reflection_result",
                json!({
                    "approved": verdict.is_none(),
                    "suggestion": verdict,
                }),
            ),
        )
        .await?;

        Ok(verdict)
    }

    async fn emit(&self, sink: &EventSink, event: AgentEvent) -> Result<(), ApiError> {
        if sink.emit(event).await {
            Ok(())
        } else {
            Err(ApiError::Cancelled)
        }
    }

    async fn emit_error(&self, sink: &EventSink, err: &ApiError) {
        let _ = sink
            .emit(AgentEvent::new(
                "error",
                json!({
                    "message": "the language model backend failed",
                    "code": err.code(),
                }),
            ))
            .await;
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() <= OBSERVATION_PREVIEW_CHARS {
        text.to_string()
    } else {
        text.chars().take(OBSERVATION_PREVIEW_CHARS).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::llm::TokenReceiver;
    use crate::tools::{Tool, ToolOutput};

    /// Provider that replays scripted outputs, one per stream call.
    struct ScriptedProvider {
        outputs: Vec<Vec<&'static str>>,
        calls: AtomicUsize,
        fail: bool,
    }

    impl ScriptedProvider {
        fn new(outputs: Vec<Vec<&'static str>>) -> Self {
            Self {
                outputs,
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                outputs: Vec::new(),
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            _prompt: &str,
            _options: &CompletionOptions,
        ) -> Result<String, ApiError> {
            Ok("APPROVED".to_string())
        }

        async fn stream_complete(
            &self,
            _prompt: &str,
            _options: &CompletionOptions,
        ) -> Result<TokenReceiver, ApiError> {
            if self.fail {
                return Err(ApiError::ProviderUnreachable("scripted failure".to_string()));
            }
            let idx = self.calls.fetch_add(1, Ordering::SeqCst);
            let script = self
                .outputs
                .get(idx)
                .or_else(|| self.outputs.last())
                .cloned()
                .unwrap_or_default();

            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                for token in script {
                    if tx.send(Ok(token.to_string())).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }

        async fn embed(&self, _inputs: &[String], _model: &str) -> Result<Vec<Vec<f32>>, ApiError> {
            Err(ApiError::Internal("not used".to_string()))
        }
    }

    struct CountingTool {
        invocations: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &str {
            "knowledge_retrieve"
        }

        fn description(&self) -> &str {
            "stub"
        }

        async fn invoke(&self, _input: &str) -> Result<ToolOutput, ApiError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(ToolOutput::text("nothing relevant"))
        }
    }

    fn registry_with_counter() -> (Arc<ToolRegistry>, Arc<AtomicUsize>) {
        let invocations = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new(Duration::from_secs(5));
        registry.register(Arc::new(CountingTool {
            invocations: invocations.clone(),
        }));
        (Arc::new(registry), invocations)
    }

    fn agent(provider: ScriptedProvider, registry: Arc<ToolRegistry>, max: usize) -> AgentLoop {
        AgentLoop::new(
            Arc::new(provider),
            CompletionOptions::new("test-model"),
            registry,
            AgentConfig {
                max_iterations: max,
                enable_reflection: false,
            },
            "You are a knowledge-base assistant.".to_string(),
        )
    }

    async fn run_collecting(
        agent: &AgentLoop,
        question: &str,
    ) -> (Result<AgentOutcome, ApiError>, Vec<AgentEvent>) {
        let (tx, mut rx) = mpsc::channel(256);
        let sink = EventSink::streaming(tx);
        let outcome = agent.run(question, "", &sink).await;
        drop(sink);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (outcome, events)
    }

    #[tokio::test]
    async fn bounded_run_emits_budget_message() {
        let (registry, invocations) = registry_with_counter();
        let provider = ScriptedProvider::new(vec![vec![
            "Action: knowledge_retrieve\nAction Input: x",
        ]]);
        let agent = agent(provider, registry, 3);

        let (outcome, events) = run_collecting(&agent, "loop forever").await;
        let outcome = outcome.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.steps.len(), 3);
        assert_eq!(outcome.answer, BUDGET_EXHAUSTED);

        let actions = events.iter().filter(|e| e.kind == "action").count();
        assert_eq!(actions, 3);

        // Identical (tool, input) pairs replay the cached observation.
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        let last = events.last().unwrap();
        assert_eq!(last.kind, "done");
        assert_eq!(last.data, json!(BUDGET_EXHAUSTED));
    }

    #[tokio::test]
    async fn final_answer_streams_tokens() {
        let (registry, _) = registry_with_counter();
        let provider = ScriptedProvider::new(vec![vec![
            "Thought: I know this.\nFinal Answer: Par",
            "is",
        ]]);
        let agent = agent(provider, registry, 5);

        let (outcome, events) = run_collecting(&agent, "capital of France?").await;
        let outcome = outcome.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.answer, "Paris");
        assert_eq!(outcome.iterations, 1);

        let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
        let answer_start = kinds.iter().position(|k| *k == "answer_start").unwrap();
        let first_token = kinds.iter().position(|k| *k == "answer_token").unwrap();
        let done = kinds.iter().position(|k| *k == "done").unwrap();
        assert!(answer_start < first_token);
        assert!(first_token < done);
        assert_eq!(done, kinds.len() - 1);

        let tokens: Vec<String> = events
            .iter()
            .filter(|e| e.kind == "answer_token")
            .map(|e| e.data.as_str().unwrap().to_string())
            .collect();
        assert_eq!(tokens.join(""), "Paris");
    }

    #[tokio::test]
    async fn tool_then_final_answer() {
        let (registry, invocations) = registry_with_counter();
        let provider = ScriptedProvider::new(vec![
            vec!["Thought: look it up\nAction: knowledge_retrieve\nAction Input: {\"query\": \"bm25\"}"],
            vec!["Thought: found it\nFinal Answer: BM25 is a ranking function."],
        ]);
        let agent = agent(provider, registry, 5);

        let (outcome, events) = run_collecting(&agent, "what is bm25?").await;
        let outcome = outcome.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.answer, "BM25 is a ranking function.");
        assert_eq!(outcome.tools_used, vec!["knowledge_retrieve"]);
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        // Per-iteration ordering holds.
        let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
        let action = kinds.iter().position(|k| *k == "action").unwrap();
        let observation = kinds.iter().position(|k| *k == "observation").unwrap();
        assert!(action < observation);
        assert_eq!(*kinds.last().unwrap(), "done");
    }

    #[tokio::test]
    async fn unknown_tool_becomes_observation() {
        let (registry, _) = registry_with_counter();
        let provider = ScriptedProvider::new(vec![
            vec!["Action: teleport\nAction Input: home"],
            vec!["Final Answer: gave up on teleporting"],
        ]);
        let agent = agent(provider, registry, 5);

        let (outcome, events) = run_collecting(&agent, "q").await;
        let outcome = outcome.unwrap();

        assert!(outcome.success);
        assert!(outcome.tools_used.is_empty());

        let observation = events
            .iter()
            .find(|e| e.kind == "observation")
            .unwrap();
        assert!(observation.data["text"]
            .as_str()
            .unwrap()
            .contains("unknown tool 'teleport'"));
    }

    #[tokio::test]
    async fn output_without_markers_is_the_answer() {
        let (registry, _) = registry_with_counter();
        let provider = ScriptedProvider::new(vec![vec!["It is simply 42."]]);
        let agent = agent(provider, registry, 5);

        let (outcome, _) = run_collecting(&agent, "q").await;
        let outcome = outcome.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.answer, "It is simply 42.");
        assert_eq!(outcome.iterations, 1);
    }

    #[tokio::test]
    async fn provider_failure_terminates_with_error_event() {
        let (registry, _) = registry_with_counter();
        let agent = agent(ScriptedProvider::failing(), registry, 5);

        let (outcome, events) = run_collecting(&agent, "q").await;
        assert!(outcome.is_err());

        let last = events.last().unwrap();
        assert_eq!(last.kind, "error");
        assert_eq!(last.data["code"], json!("provider_unreachable"));
        assert!(!events.iter().any(|e| e.kind == "done"));
    }

    #[tokio::test]
    async fn reflection_runs_on_long_trajectories() {
        let (registry, _) = registry_with_counter();
        let provider = ScriptedProvider::new(vec![
            vec!["Action: knowledge_retrieve\nAction Input: a"],
            vec!["Action: knowledge_retrieve\nAction Input: b"],
            vec!["Final Answer: grounded answer"],
        ]);
        let mut agent = agent(provider, registry, 4);
        agent.config.enable_reflection = true;

        let (outcome, events) = run_collecting(&agent, "q").await;
        let outcome = outcome.unwrap();

        assert!(outcome.success);
        assert!(outcome.reflection.is_none());

        let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
        let reflecting = kinds.iter().position(|k| *k == "reflecting").unwrap();
        let result = kinds.iter().position(|k| *k == "reflection_result").unwrap();
        let done = kinds.iter().position(|k| *k == "done").unwrap();
        assert!(reflecting < result && result < done);
    }
}
