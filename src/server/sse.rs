//! Bridge between producer tasks and the SSE response body.
//!
//! Producers push `AgentEvent` frames into a bounded channel; the HTTP
//! writer drains it and owns flushing. When the client disconnects axum
//! drops the stream, the receiver dies, and the producer's next send
//! fails, cancelling it at the next safe boundary.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::Stream;
use tokio::sync::mpsc;

use crate::agent::AgentEvent;

pub const EVENT_CHANNEL_CAPACITY: usize = 64;

pub fn event_channel() -> (mpsc::Sender<AgentEvent>, mpsc::Receiver<AgentEvent>) {
    mpsc::channel(EVENT_CHANNEL_CAPACITY)
}

/// Wrap a frame receiver as a `text/event-stream` response. Every frame
/// becomes one `data: {json}` line followed by a blank line. Keep-alive
/// comments go out at a quarter of the idle timeout so proxies between us
/// and the client never see a silent connection.
pub fn sse_response(
    mut rx: mpsc::Receiver<AgentEvent>,
    idle_timeout_secs: u64,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let payload = serde_json::to_string(&event)
                .unwrap_or_else(|_| r#"{"type":"error","data":"serialization failed"}"#.to_string());
            yield Ok(Event::default().data(payload));
        }
    };

    let interval = Duration::from_secs((idle_timeout_secs / 4).max(1));
    Sse::new(stream).keep_alive(KeepAlive::new().interval(interval))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_serialize_with_type_data_and_optional_step() {
        let event = AgentEvent::at_step("action", json!({"tool": "web_search"}), 2);
        let payload = serde_json::to_string(&event).unwrap();
        assert_eq!(
            payload,
            r#"{"type":"action","data":{"tool":"web_search"},"step":2}"#
        );

        let event = AgentEvent::new("done", serde_json::Value::Null);
        let payload = serde_json::to_string(&event).unwrap();
        assert_eq!(payload, r#"{"type":"done","data":null}"#);
    }
}
