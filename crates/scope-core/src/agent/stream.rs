//! Streaming delivery protocol
//!
//! One request, one append-only event stream. Frames are `data: {json}\n\n`
//! and the stream always ends with the literal `data: [DONE]\n\n`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::tools::UiDescriptor;

pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental assistant text
    Text { content: String },
    /// A whole UI descriptor
    ToolCall { component: String, props: Value },
    /// Informational; the stream continues
    Error { error: String },
    /// Terminal sentinel
    Done,
}

impl StreamEvent {
    pub fn text(content: impl Into<String>) -> Self {
        StreamEvent::Text {
            content: content.into(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        StreamEvent::Error {
            error: error.into(),
        }
    }

    /// Payload after `data: `.
    pub fn data(&self) -> String {
        match self {
            StreamEvent::Done => DONE_SENTINEL.to_string(),
            event => serde_json::to_string(event).unwrap_or_else(|e| {
                tracing::error!("Failed to serialize stream event: {}", e);
                String::from(r#"{"type":"error","error":"unserializable event"}"#)
            }),
        }
    }

    pub fn to_sse_frame(&self) -> String {
        format!("data: {}\n\n", self.data())
    }
}

impl From<UiDescriptor> for StreamEvent {
    fn from(ui: UiDescriptor) -> Self {
        StreamEvent::ToolCall {
            component: ui.component,
            props: ui.props,
        }
    }
}

/// Parse one line of an SSE body. Blank lines, comments and unknown
/// payloads yield `None`.
pub fn parse_sse_line(line: &str) -> Option<StreamEvent> {
    let data = line.strip_prefix("data:")?.trim();
    if data == DONE_SENTINEL {
        return Some(StreamEvent::Done);
    }
    serde_json::from_str(data).ok()
}

/// One assistant message as persisted: all text plus ordered descriptors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantTurn {
    pub text: String,
    pub tool_calls: Vec<UiDescriptor>,
}

impl AssistantTurn {
    /// Descriptors as stored in the `tool_calls` column, if any.
    pub fn tool_calls_json(&self) -> Option<Value> {
        if self.tool_calls.is_empty() {
            return None;
        }
        serde_json::to_value(&self.tool_calls).ok()
    }
}

/// Folds a stream into an [`AssistantTurn`], released only at `Done`.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    turn: AssistantTurn,
    finished: bool,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: &StreamEvent) -> Option<AssistantTurn> {
        if self.finished {
            return None;
        }
        match event {
            StreamEvent::Text { content } => self.turn.text.push_str(content),
            StreamEvent::ToolCall { component, props } => self
                .turn
                .tool_calls
                .push(UiDescriptor::new(component.clone(), props.clone())),
            StreamEvent::Error { .. } => {}
            StreamEvent::Done => {
                self.finished = true;
                return Some(std::mem::take(&mut self.turn));
            }
        }
        None
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Server-side end of a chat stream.
///
/// Forwards every event to the client while accumulating the assistant
/// turn. A dropped client stops forwarding but not accumulation, so the
/// turn is still persisted.
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
    accumulator: StreamAccumulator,
    client_connected: bool,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            tx,
            accumulator: StreamAccumulator::new(),
            client_connected: true,
        }
    }

    /// A sink that only accumulates. Used for internal model calls whose
    /// output must not reach the client.
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self {
            tx,
            accumulator: StreamAccumulator::new(),
            client_connected: false,
        }
    }

    /// Returns the finished turn when `event` is the sentinel.
    pub async fn send(&mut self, event: StreamEvent) -> Option<AssistantTurn> {
        let turn = self.accumulator.push(&event);
        if self.client_connected && self.tx.send(event).await.is_err() {
            tracing::debug!("Client disconnected; finishing turn without streaming");
            self.client_connected = false;
        }
        turn
    }

    pub fn is_finished(&self) -> bool {
        self.accumulator.is_finished()
    }
}
