//! Line-oriented parsing of ReAct model output.
//!
//! A small state machine walks the completion line by line:
//! `reading_thought` until an `Action:` or `Final Answer:` marker,
//! `reading_action` / `reading_input` for the tool call, `done` once a
//! final answer swallows the rest of the text.

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// `Final Answer:` seen; the answer is everything after the marker.
    Final(String),
    /// `Action:` (+ optional `Action Input:`) seen.
    Act { tool: String, input: String },
    /// Neither marker appeared before the output ended.
    None,
}

#[derive(Debug, Clone)]
pub struct ParsedOutput {
    pub thought: String,
    pub decision: Decision,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    ReadingThought,
    ReadingAction,
    ReadingInput,
    Done,
}

pub fn parse_react_output(text: &str) -> ParsedOutput {
    let mut state = State::ReadingThought;
    let mut thought_lines: Vec<String> = Vec::new();
    let mut tool = String::new();
    let mut input_lines: Vec<String> = Vec::new();
    let mut final_lines: Vec<String> = Vec::new();

    for line in text.lines() {
        if state == State::Done {
            final_lines.push(line.to_string());
            continue;
        }

        let stripped = line.trim_start();

        if let Some(rest) = stripped.strip_prefix("Final Answer:") {
            state = State::Done;
            let rest = rest.trim_start();
            if !rest.is_empty() {
                final_lines.push(rest.to_string());
            }
            continue;
        }

        if let Some(rest) = stripped.strip_prefix("Action:") {
            tool = rest.trim().to_string();
            state = State::ReadingAction;
            continue;
        }

        if let Some(rest) = stripped.strip_prefix("Action Input:") {
            input_lines.push(rest.trim().to_string());
            state = State::ReadingInput;
            continue;
        }

        match state {
            State::ReadingThought => {
                let content = match stripped.strip_prefix("Thought:") {
                    Some(rest) => rest.trim(),
                    None => stripped.trim_end(),
                };
                if !content.is_empty() {
                    thought_lines.push(content.to_string());
                }
            }
            // Multi-line JSON inputs continue until the next marker.
            State::ReadingInput => {
                if !stripped.is_empty() {
                    input_lines.push(stripped.to_string());
                }
            }
            State::ReadingAction | State::Done => {}
        }
    }

    let thought = thought_lines.join("\n").trim().to_string();

    let decision = if state == State::Done {
        Decision::Final(final_lines.join("\n").trim().to_string())
    } else if !tool.is_empty() {
        Decision::Act {
            tool,
            input: input_lines.join("\n").trim().to_string(),
        }
    } else {
        Decision::None
    };

    ParsedOutput { thought, decision }
}

/// Byte offset just past the first `Final Answer:` marker, used by the
/// streaming path to switch into token-by-token answer emission.
pub fn final_answer_offset(buffer: &str) -> Option<usize> {
    const MARKER: &str = "Final Answer:";
    buffer.find(MARKER).map(|pos| pos + MARKER.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tool_call_with_json_input() {
        let output = "Thought: I should look this up.\nAction: knowledge_retrieve\nAction Input: {\"query\": \"transformers\"}";
        let parsed = parse_react_output(output);

        assert_eq!(parsed.thought, "I should look this up.");
        assert_eq!(
            parsed.decision,
            Decision::Act {
                tool: "knowledge_retrieve".to_string(),
                input: "{\"query\": \"transformers\"}".to_string(),
            }
        );
    }

    #[test]
    fn parses_final_answer_spanning_lines() {
        let output = "Thought: done now\nFinal Answer: The answer is 42.\nWith a second line.";
        let parsed = parse_react_output(output);

        assert_eq!(parsed.thought, "done now");
        assert_eq!(
            parsed.decision,
            Decision::Final("The answer is 42.\nWith a second line.".to_string())
        );
    }

    #[test]
    fn final_answer_wins_over_later_action_text() {
        let output = "Final Answer: stop here\nAction: web_search";
        let parsed = parse_react_output(output);
        // Everything after the final marker is answer text, not a new action.
        assert_eq!(
            parsed.decision,
            Decision::Final("stop here\nAction: web_search".to_string())
        );
    }

    #[test]
    fn no_marker_means_no_decision() {
        let parsed = parse_react_output("Just some musings\nacross two lines");
        assert_eq!(parsed.decision, Decision::None);
        assert_eq!(parsed.thought, "Just some musings\nacross two lines");
    }

    #[test]
    fn multiline_action_input_is_joined() {
        let output = "Action: file_read\nAction Input: {\n\"path\": \"a.txt\"\n}";
        let parsed = parse_react_output(output);
        match parsed.decision {
            Decision::Act { tool, input } => {
                assert_eq!(tool, "file_read");
                assert!(input.contains("a.txt"));
                assert!(serde_json::from_str::<serde_json::Value>(&input).is_ok());
            }
            other => panic!("expected Act, got {:?}", other),
        }
    }

    #[test]
    fn action_without_input_gets_empty_string() {
        let parsed = parse_react_output("Action: file_list");
        assert_eq!(
            parsed.decision,
            Decision::Act {
                tool: "file_list".to_string(),
                input: String::new(),
            }
        );
    }

    #[test]
    fn offset_points_past_marker() {
        let buffer = "Thought: hm\nFinal Answer: yes";
        let offset = final_answer_offset(buffer).unwrap();
        assert_eq!(&buffer[offset..], " yes");
        assert!(final_answer_offset("no marker").is_none());
    }
}
