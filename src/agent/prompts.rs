//! Prompt templates for the ReAct loop.

/// Emitted when the loop runs out of iterations with no final answer.
pub const BUDGET_EXHAUSTED: &str = "Reached the iteration limit without a final answer.";

pub fn react_prompt(
    preamble: &str,
    current_datetime: &str,
    chat_history: &str,
    tool_catalogue: &str,
    question: &str,
) -> String {
    let history = if chat_history.trim().is_empty() {
        "(no prior conversation)"
    } else {
        chat_history
    };

    format!(
        "{preamble}\n\
\n\
Current date and time: {current_datetime}\n\
\n\
Conversation so far:\n\
{history}\n\
\n\
Available tools:\n\
{tool_catalogue}\n\
\n\
Rules you must follow:\n\
1. If the question refers to the conversation above, answer from it directly without tools.\n\
2. Ground every claim in tool observations or the conversation; never invent sources, URLs or facts.\n\
3. Use exactly this format, one action per turn:\n\
Thought: your reasoning\n\
Action: tool name\n\
Action Input: the tool input (plain text or a JSON object)\n\
4. After an Observation is provided, continue with another Thought.\n\
5. When the observations contain the answer, finish with:\n\
Thought: your conclusion\n\
Final Answer: the answer, citing the source file or URL from the observations\n\
6. If the observations contain nothing relevant, say so in the Final Answer instead of guessing.\n\
\n\
Question: {question}\n\
\n\
Begin."
    )
}

pub fn reflection_prompt(question: &str, answer: &str, tools_used: &[String]) -> String {
    let tools = if tools_used.is_empty() {
        "none".to_string()
    } else {
        tools_used.join(", ")
    };

    format!(
        "Review the answer below for grounding.\n\
\n\
Question: {question}\n\
Answer: {answer}\n\
Tools used: {tools}\n\
\n\
Check strictly:\n\
1. Is the answer based only on tool observations or the conversation?\n\
2. Are all cited sources real file names or URLs that appeared in observations?\n\
3. Is there any invented or speculative content?\n\
\n\
If the answer is fully grounded, reply with exactly: APPROVED\n\
Otherwise reply with: RETRY: a one-line reason"
    )
}

/// Parse a reflection verdict; `None` means approved.
pub fn parse_reflection(raw: &str) -> Option<String> {
    if raw.to_uppercase().contains("APPROVED") {
        return None;
    }
    raw.split_once("RETRY:")
        .map(|(_, suggestion)| suggestion.trim().to_string())
        .filter(|s| !s.is_empty())
}
