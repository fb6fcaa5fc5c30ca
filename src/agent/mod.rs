pub mod parser;
pub mod prompts;
pub mod runtime;
pub mod types;

pub use runtime::AgentLoop;
pub use types::{AgentConfig, AgentEvent, AgentOutcome, EventSink, ReActStep};
