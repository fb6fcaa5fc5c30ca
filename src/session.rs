//! Session orchestration: mode routing, prompt assembly, history handling
//! and persistence around one query.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::agent::{AgentConfig, AgentEvent, AgentLoop, AgentOutcome, EventSink};
use crate::errors::ApiError;
use crate::history::StoredMessage;
use crate::llm::answer::{parse_answer, REFUSAL};
use crate::llm::{CompletionOptions, LlmProvider};
use crate::rag::{dedup_by_source, Passage, SearchMethod};
use crate::state::AppState;
use crate::tools::file::{FileListTool, FileReadTool};
use crate::tools::retrieve::KnowledgeRetrieveTool;
use crate::tools::web::WebSearchTool;
use crate::tools::ToolRegistry;

const HISTORY_WINDOW: i64 = 6;
const SOURCE_PREVIEW_CHARS: usize = 300;

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryTurn {
    pub role: String,
    pub content: String,
}

/// Body shared by the query endpoints; agent endpoints use the extra knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub max_iterations: Option<usize>,
    #[serde(default)]
    pub enable_reflection: Option<bool>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub history: Option<Vec<HistoryTurn>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryMode {
    Rag,
    Smart,
    Full,
    Research,
    Manager,
}

impl QueryMode {
    pub fn parse(raw: Option<&str>, default: QueryMode) -> Result<Self, ApiError> {
        match raw.map(str::trim).filter(|s| !s.is_empty()) {
            None => Ok(default),
            Some("rag") | Some("simple") => Ok(QueryMode::Rag),
            Some("smart") => Ok(QueryMode::Smart),
            Some("full") => Ok(QueryMode::Full),
            Some("research") => Ok(QueryMode::Research),
            Some("manager") => Ok(QueryMode::Manager),
            Some(other) => Err(ApiError::BadRequest(format!("unknown mode '{}'", other))),
        }
    }
}

/// The smart-mode classifier: anything time-sensitive, web-flavoured,
/// action-oriented or referring back to the conversation goes to the full
/// agent; plain knowledge questions stay on the cheap RAG path.
pub fn classify_smart(question: &str) -> QueryMode {
    const TIME_TERMS: [&str; 10] = [
        "today", "latest", "current", "recent", "news", "this week", "最新", "今天", "现在", "新闻",
    ];
    const ACTION_TERMS: [&str; 16] = [
        "analyze", "analyse", "compare", "summarize", "summarise", "create", "write", "generate",
        "organize", "organise", "分析", "对比", "总结", "生成", "创建", "整理",
    ];
    const FOLLOW_UP_TERMS: [&str; 8] = [
        "earlier", "previous question", "you said", "just asked", "刚才", "之前", "上一个", "前面",
    ];
    const WEB_TERMS: [&str; 4] = ["http://", "https://", "www.", "搜索"];

    let lowered = question.to_lowercase();
    let hit = |terms: &[&str]| terms.iter().any(|t| lowered.contains(t));

    if hit(&TIME_TERMS) || hit(&ACTION_TERMS) || hit(&FOLLOW_UP_TERMS) || hit(&WEB_TERMS) {
        QueryMode::Full
    } else {
        QueryMode::Rag
    }
}

/// RAG prompt: role preamble, prior turns, source-prefixed context, the
/// question, then the strict JSON-answer instructions that the response
/// parser expects.
pub fn build_rag_prompt(
    passages: &[Passage],
    history: &[StoredMessage],
    question: &str,
) -> String {
    let mut prompt = String::from(
        "You are a professional knowledge-base assistant. Answer the user's \
         question using only the context provided below.\n\n",
    );

    if !history.is_empty() {
        prompt.push_str("Conversation so far:\n");
        for message in history {
            let speaker = if message.role == "assistant" {
                "Assistant"
            } else {
                "User"
            };
            prompt.push_str(&format!("{}: {}\n", speaker, message.content));
        }
        prompt.push('\n');
    }

    prompt.push_str("Context:\n");
    let blocks: Vec<String> = passages
        .iter()
        .map(|p| format!("[source: {}] {}", p.source, p.text))
        .collect();
    prompt.push_str(&blocks.join("\n\n"));

    prompt.push_str(&format!("\n\nQuestion:\n{}\n\n", question));
    prompt.push_str(&format!(
        "Respond with a single valid JSON object and nothing else, exactly in \
         this shape:\n{{\"answer\": \"your answer here\"}}\n\
         Rules:\n\
         1. Output only the JSON object, with no surrounding text.\n\
         2. Base the answer strictly on the context above; do not use outside knowledge.\n\
         3. If the context does not contain the answer, the answer field must be: \
         \"{}\".",
        REFUSAL
    ));

    prompt
}

pub struct ResolvedConversation {
    pub id: String,
    pub created: bool,
}

/// Reuse the supplied conversation id (an unknown id silently starts a new
/// conversation under that id), or mint a fresh one.
pub async fn resolve_conversation(
    state: &AppState,
    requested: Option<&str>,
) -> Result<ResolvedConversation, ApiError> {
    match requested.map(str::trim).filter(|s| !s.is_empty()) {
        Some(id) => Ok(ResolvedConversation {
            id: id.to_string(),
            created: false,
        }),
        None => Ok(ResolvedConversation {
            id: state.history.create().await?,
            created: true,
        }),
    }
}

/// Prior turns for prompt assembly: the explicit request history wins over
/// the stored one, both trimmed to the most recent six messages.
pub async fn prompt_history(
    state: &AppState,
    conversation_id: &str,
    supplied: &Option<Vec<HistoryTurn>>,
) -> Result<Vec<StoredMessage>, ApiError> {
    if supplied.is_some() {
        return Ok(prompt_history_from_request(supplied));
    }
    state.history.history(conversation_id, HISTORY_WINDOW).await
}

fn format_history(messages: &[StoredMessage]) -> String {
    messages
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let speaker = if m.role == "assistant" { "Assistant" } else { "User" };
            format!("{}. {}: {}", i + 1, speaker, m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn completion_options(state: &AppState, provider: &dyn LlmProvider, model: Option<&str>) -> CompletionOptions {
    let model = model
        .map(str::to_string)
        .unwrap_or_else(|| {
            if provider.name() == "ollama" {
                state.settings.ollama_model.clone()
            } else {
                state.settings.llm_model.clone()
            }
        });

    CompletionOptions::new(model)
        .with_temperature(state.settings.temperature)
        .with_max_tokens(state.settings.max_tokens)
}

/// Tool set and system preamble per agent mode; ordering biases the model.
pub fn build_agent_setup(state: &AppState, mode: QueryMode) -> (Arc<ToolRegistry>, String) {
    let timeout = Duration::from_secs(state.settings.tool_timeout_secs);
    let retrieve = Arc::new(KnowledgeRetrieveTool::new(
        state.retriever.clone(),
        state.settings.top_k,
    ));
    let web = Arc::new(WebSearchTool::new(
        state.settings.search_gateway_url.clone(),
        state.settings.tool_timeout_secs,
    ));
    let file_read = Arc::new(FileReadTool::new(state.settings.documents_path.clone()));
    let file_list = Arc::new(FileListTool::new(state.settings.documents_path.clone()));

    let mut registry = ToolRegistry::new(timeout);
    let preamble = match mode {
        QueryMode::Research => {
            registry.register(web);
            registry.register(retrieve);
            "You are a research assistant. Prefer web_search for fresh or \
             external information and back it with the local knowledge base."
        }
        QueryMode::Manager => {
            registry.register(retrieve);
            registry.register(file_read);
            registry.register(file_list);
            "You are a document manager for the local knowledge base. Use the \
             file tools to inspect documents before drawing conclusions."
        }
        _ => {
            registry.register(retrieve);
            registry.register(web);
            registry.register(file_read);
            registry.register(file_list);
            "You are an autonomous knowledge-base assistant with access to tools."
        }
    };

    (Arc::new(registry), preamble.to_string())
}

fn agent_config(state: &AppState, req: &QueryRequest) -> AgentConfig {
    AgentConfig {
        max_iterations: req.max_iterations.unwrap_or(state.settings.max_iterations).max(1),
        enable_reflection: req.enable_reflection.unwrap_or(true),
    }
}

/// Non-streaming RAG answer, with a single retry on provider timeout.
pub async fn run_rag_query(
    state: &AppState,
    req: &QueryRequest,
    history: &[StoredMessage],
) -> Result<(String, Vec<Passage>), ApiError> {
    let method = SearchMethod::parse(req.method.as_deref())?;
    let top_k = req.top_k.unwrap_or(state.settings.top_k).max(1);
    let passages = state.retriever.search(&req.question, top_k, method).await?;

    let prompt = build_rag_prompt(&passages, history, &req.question);
    let provider = state.providers.get(req.provider.as_deref())?;
    let options = completion_options(state, provider.as_ref(), req.model.as_deref());

    let raw = match provider.complete(&prompt, &options).await {
        Err(err) if err.is_timeout() => {
            tracing::warn!("provider timed out, retrying once");
            provider.complete(&prompt, &options).await?
        }
        other => other?,
    };

    Ok((parse_answer(&raw), passages))
}

/// Full agent run for the non-streaming endpoints.
pub async fn run_agent_query(
    state: &AppState,
    req: &QueryRequest,
    mode: QueryMode,
    history: &[StoredMessage],
    sink: &EventSink,
) -> Result<AgentOutcome, ApiError> {
    let (registry, preamble) = build_agent_setup(state, mode);
    let provider = state.providers.get(req.provider.as_deref())?;
    let options = completion_options(state, provider.as_ref(), req.model.as_deref());

    let agent = AgentLoop::new(provider, options, registry, agent_config(state, req), preamble);
    agent.run(&req.question, &format_history(history), sink).await
}

/// Producer for `POST /api/query-stream`: sources, per-character content,
/// then done; the assistant turn is persisted only after a complete run.
pub async fn rag_stream_task(
    state: Arc<AppState>,
    req: QueryRequest,
    tx: mpsc::Sender<AgentEvent>,
) {
    let sink = EventSink::streaming(tx);
    if let Err(err) = rag_stream_inner(&state, &req, &sink).await {
        emit_stream_error(&sink, &err).await;
    }
}

async fn rag_stream_inner(
    state: &AppState,
    req: &QueryRequest,
    sink: &EventSink,
) -> Result<(), ApiError> {
    let conversation = resolve_conversation(state, req.conversation_id.as_deref()).await?;
    let history = prompt_history(state, &conversation.id, &req.history).await?;
    state.history.append(&conversation.id, "user", &req.question).await?;

    if conversation.created {
        emit(sink, AgentEvent::new("conversation_id", json!(conversation.id))).await?;
    }

    stream_rag_body(state, req, &history, &conversation.id, sink).await
}

/// Shared tail of both RAG-shaped streams: sources, content, persistence,
/// done. A failed emit means the client is gone, so the assistant turn is
/// discarded rather than persisted.
async fn stream_rag_body(
    state: &AppState,
    req: &QueryRequest,
    history: &[StoredMessage],
    conversation_id: &str,
    sink: &EventSink,
) -> Result<(), ApiError> {
    let (answer, passages) = run_rag_query(state, req, history).await?;

    let sources: Vec<serde_json::Value> = dedup_by_source(&passages)
        .iter()
        .map(|p| {
            json!({
                "source": p.source,
                "preview": p.text.chars().take(SOURCE_PREVIEW_CHARS).collect::<String>(),
            })
        })
        .collect();
    emit(sink, AgentEvent::new("sources", json!(sources))).await?;

    for ch in answer.chars() {
        emit(sink, AgentEvent::new("content", json!(ch.to_string()))).await?;
    }

    state.history.append(conversation_id, "assistant", &answer).await?;
    emit(sink, AgentEvent::new("done", serde_json::Value::Null)).await?;
    Ok(())
}

/// Producer for `POST /api/agent/query-stream`.
pub async fn agent_stream_task(
    state: Arc<AppState>,
    req: QueryRequest,
    mode: QueryMode,
    tx: mpsc::Sender<AgentEvent>,
) {
    let sink = EventSink::streaming(tx);
    if let Err(err) = agent_stream_inner(&state, &req, mode, &sink).await {
        emit_stream_error(&sink, &err).await;
    }
}

async fn agent_stream_inner(
    state: &AppState,
    req: &QueryRequest,
    mode: QueryMode,
    sink: &EventSink,
) -> Result<(), ApiError> {
    let mode = match mode {
        QueryMode::Smart => classify_smart(&req.question),
        other => other,
    };

    let conversation = resolve_conversation(state, req.conversation_id.as_deref()).await?;
    let history = prompt_history(state, &conversation.id, &req.history).await?;
    state.history.append(&conversation.id, "user", &req.question).await?;

    if conversation.created {
        emit(sink, AgentEvent::new("conversation_id", json!(conversation.id))).await?;
    }

    if mode == QueryMode::Rag {
        // Smart routing picked the plain RAG path; reuse its stream shape.
        return stream_rag_body(state, req, &history, &conversation.id, sink).await;
    }

    let outcome = run_agent_query(state, req, mode, &history, sink).await?;
    state
        .history
        .append(&conversation.id, "assistant", &outcome.answer)
        .await?;
    Ok(())
}

/// `POST /api/agent/smart-query`: classify, answer, persist when a
/// conversation id was supplied.
pub async fn run_smart_query(
    state: &AppState,
    req: &QueryRequest,
) -> Result<serde_json::Value, ApiError> {
    let mode = classify_smart(&req.question);
    let persist_id = req
        .conversation_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let history = match &persist_id {
        Some(id) => {
            let history = prompt_history(state, id, &req.history).await?;
            state.history.append(id, "user", &req.question).await?;
            history
        }
        None => prompt_history_from_request(&req.history),
    };

    match mode {
        QueryMode::Rag => {
            let (answer, _) = run_rag_query(state, req, &history).await?;
            if let Some(id) = &persist_id {
                state.history.append(id, "assistant", &answer).await?;
            }
            Ok(json!({
                "success": true,
                "answer": answer,
                "tools_used": ["knowledge_retrieve"],
                "iterations": 1,
                "is_simple": true,
            }))
        }
        _ => {
            let outcome =
                run_agent_query(state, req, QueryMode::Full, &history, &EventSink::detached())
                    .await?;
            if let Some(id) = &persist_id {
                if outcome.success {
                    state.history.append(id, "assistant", &outcome.answer).await?;
                }
            }
            Ok(json!({
                "success": outcome.success,
                "answer": outcome.answer,
                "tools_used": outcome.tools_used,
                "iterations": outcome.iterations,
                "is_simple": false,
            }))
        }
    }
}

/// `POST /api/agent/query`: a full run with the trace in the response body.
pub async fn run_agent_trace(
    state: &AppState,
    req: &QueryRequest,
) -> Result<serde_json::Value, ApiError> {
    let mode = QueryMode::parse(req.mode.as_deref(), QueryMode::Full)?;
    let mode = match mode {
        QueryMode::Smart => classify_smart(&req.question),
        QueryMode::Rag => QueryMode::Full,
        other => other,
    };

    let persist_id = req
        .conversation_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let history = match &persist_id {
        Some(id) => {
            let history = prompt_history(state, id, &req.history).await?;
            state.history.append(id, "user", &req.question).await?;
            history
        }
        None => prompt_history_from_request(&req.history),
    };

    let outcome = run_agent_query(state, req, mode, &history, &EventSink::detached()).await?;
    if let Some(id) = &persist_id {
        if outcome.success {
            state.history.append(id, "assistant", &outcome.answer).await?;
        }
    }

    Ok(json!({
        "success": outcome.success,
        "answer": outcome.answer,
        "thought_process": outcome.steps,
        "tools_used": outcome.tools_used,
        "iterations": outcome.iterations,
        "final_reflection": outcome.reflection,
    }))
}

/// History for endpoints that never touch the store: whatever the request
/// supplied, trimmed to the window.
pub fn prompt_history_or_default(req: &QueryRequest) -> Vec<StoredMessage> {
    prompt_history_from_request(&req.history)
}

fn prompt_history_from_request(supplied: &Option<Vec<HistoryTurn>>) -> Vec<StoredMessage> {
    let Some(turns) = supplied else {
        return Vec::new();
    };
    let skip = turns.len().saturating_sub(HISTORY_WINDOW as usize);
    turns[skip..]
        .iter()
        .map(|t| StoredMessage {
            role: t.role.clone(),
            content: t.content.clone(),
            created_at: String::new(),
        })
        .collect()
}

async fn emit(sink: &EventSink, event: AgentEvent) -> Result<(), ApiError> {
    if sink.emit(event).await {
        Ok(())
    } else {
        Err(ApiError::Cancelled)
    }
}

/// Terminal error frame; cancellation stays silent per policy.
async fn emit_stream_error(sink: &EventSink, err: &ApiError) {
    match err {
        ApiError::Cancelled => {}
        ApiError::ProviderUnreachable(_) | ApiError::ProviderTimeout(_) | ApiError::ProviderAuth(_) => {
            let _ = sink
                .emit(AgentEvent::new(
                    "error",
                    json!({
                        "message": "the language model backend is unavailable",
                        "code": err.code(),
                    }),
                ))
                .await;
        }
        ApiError::IndexUnavailable => {
            let _ = sink
                .emit(AgentEvent::new(
                    "error",
                    json!({
                        "message": "the knowledge base has not been built yet",
                        "code": err.code(),
                    }),
                ))
                .await;
        }
        other => {
            let _ = sink
                .emit(AgentEvent::new(
                    "error",
                    json!({ "message": other.to_string(), "code": other.code() }),
                ))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smart_classifier_routes_time_sensitive_to_agent() {
        assert_eq!(classify_smart("what is the latest rust release?"), QueryMode::Full);
        assert_eq!(classify_smart("今天的新闻有什么"), QueryMode::Full);
    }

    #[test]
    fn smart_classifier_routes_actions_and_followups_to_agent() {
        assert_eq!(classify_smart("please analyze the document layout"), QueryMode::Full);
        assert_eq!(classify_smart("帮我总结知识库"), QueryMode::Full);
        assert_eq!(classify_smart("what was my previous question?"), QueryMode::Full);
    }

    #[test]
    fn smart_classifier_defaults_to_rag() {
        assert_eq!(classify_smart("what is a transformer?"), QueryMode::Rag);
        assert_eq!(classify_smart("什么是深度学习"), QueryMode::Rag);
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(QueryMode::parse(None, QueryMode::Rag).unwrap(), QueryMode::Rag);
        assert_eq!(QueryMode::parse(Some("research"), QueryMode::Full).unwrap(), QueryMode::Research);
        assert_eq!(QueryMode::parse(Some("simple"), QueryMode::Full).unwrap(), QueryMode::Rag);
        assert!(QueryMode::parse(Some("turbo"), QueryMode::Rag).is_err());
    }

    #[test]
    fn rag_prompt_contains_sections_in_order() {
        let passages = vec![
            Passage { text: "BM25 ranks by term frequency.".into(), source: "ir.md".into(), score: 0.1, rank: 1 },
            Passage { text: "Vectors capture meaning.".into(), source: "embed.md".into(), score: 0.2, rank: 2 },
        ];
        let history = vec![StoredMessage {
            role: "user".into(),
            content: "hi".into(),
            created_at: String::new(),
        }];

        let prompt = build_rag_prompt(&passages, &history, "what is BM25?");

        let context_pos = prompt.find("Context:").unwrap();
        let question_pos = prompt.find("Question:").unwrap();
        let json_pos = prompt.find("{\"answer\":").unwrap();
        assert!(context_pos < question_pos && question_pos < json_pos);
        assert!(prompt.contains("[source: ir.md]"));
        assert!(prompt.contains("User: hi"));
    }

    #[test]
    fn history_formatting_numbers_turns() {
        let messages = vec![
            StoredMessage { role: "user".into(), content: "a".into(), created_at: String::new() },
            StoredMessage { role: "assistant".into(), content: "b".into(), created_at: String::new() },
        ];
        assert_eq!(format_history(&messages), "1. User: a\n2. Assistant: b");
    }
}
