//! OpenAI-compatible chat completions client
//!
//! Streams `chat/completions` with `stream: true`. Text deltas are
//! forwarded as they arrive; tool-call argument fragments are accumulated
//! by index and emitted whole when the choice finishes.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::types::{
    AiToolCall, ChatModel, FinishReason, ModelMessage, ModelRequest, Role, StreamPart,
};
use crate::config::ModelConfig;

pub struct OpenAiCompatClient {
    http: reqwest::Client,
    config: ModelConfig,
}

impl OpenAiCompatClient {
    pub fn new(http: reqwest::Client, config: ModelConfig) -> Self {
        Self { http, config }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn build_body(&self, request: &ModelRequest) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(message_to_wire).collect();
        let mut body = json!({
            "model": self.config.model,
            "stream": true,
            "messages": messages,
        });
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.input_schema,
                        }
                    })
                })
                .collect();
        }
        body
    }
}

fn message_to_wire(message: &ModelMessage) -> Value {
    match message.role {
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id,
            "content": message.content,
        }),
        Role::Assistant if !message.tool_calls.is_empty() => json!({
            "role": "assistant",
            "content": message.content,
            "tool_calls": message.tool_calls.iter().map(|call| json!({
                "id": call.id,
                "type": "function",
                "function": {"name": call.name, "arguments": call.arguments.to_string()},
            })).collect::<Vec<_>>(),
        }),
        role => json!({ "role": role.as_str(), "content": message.content }),
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatClient {
    async fn stream_turn(&self, request: ModelRequest) -> Result<mpsc::UnboundedReceiver<StreamPart>> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(&self.build_body(&request))
            .send()
            .await
            .context("Failed to send chat completion request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            anyhow::bail!("Chat completion failed ({}): {}", status, body);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut stream = response.bytes_stream();
        tokio::spawn(async move {
            let mut parser = ChatDeltaParser::default();
            let mut buffer = String::new();

            while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::error!("Model stream read error: {}", e);
                        let _ = tx.send(StreamPart::Error {
                            error: format!("Model stream read error: {e}"),
                        });
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(newline) = buffer.find('\n') {
                    let line: String = buffer.drain(..=newline).collect();
                    for part in parser.feed_line(line.trim_end()) {
                        if tx.send(part).is_err() {
                            return;
                        }
                    }
                }
            }

            for part in parser.feed_line(buffer.trim_end()).into_iter().chain(parser.finish()) {
                let _ = tx.send(part);
            }
        });

        Ok(rx)
    }
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Turns `data:` lines of a chat-completions stream into [`StreamPart`]s.
#[derive(Debug, Default)]
pub(crate) struct ChatDeltaParser {
    calls: BTreeMap<u64, PartialCall>,
    finished: bool,
}

impl ChatDeltaParser {
    pub(crate) fn feed_line(&mut self, line: &str) -> Vec<StreamPart> {
        let Some(data) = line.strip_prefix("data:").map(str::trim) else {
            return Vec::new();
        };
        if data.is_empty() || self.finished {
            return Vec::new();
        }
        if data == "[DONE]" {
            return self.finish();
        }

        let json: Value = match serde_json::from_str(data) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("Skipping unparseable model stream line: {}", e);
                return Vec::new();
            }
        };

        if let Some(error) = json.get("error") {
            self.finished = true;
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error");
            return vec![StreamPart::Error {
                error: format!("Model API error: {message}"),
            }];
        }

        let Some(choice) = json.pointer("/choices/0") else {
            return Vec::new();
        };

        let mut parts = Vec::new();
        if let Some(delta) = choice.get("delta") {
            if let Some(content) = delta.get("content").and_then(Value::as_str) {
                if !content.is_empty() {
                    parts.push(StreamPart::TextDelta {
                        delta: content.to_string(),
                    });
                }
            }
            for call in delta
                .get("tool_calls")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
                let partial = self.calls.entry(index).or_default();
                if let Some(id) = call.get("id").and_then(Value::as_str) {
                    partial.id = id.to_string();
                }
                if let Some(name) = call.pointer("/function/name").and_then(Value::as_str) {
                    partial.name.push_str(name);
                }
                if let Some(args) = call.pointer("/function/arguments").and_then(Value::as_str) {
                    partial.arguments.push_str(args);
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            parts.extend(self.complete(FinishReason::parse(reason)));
        }
        parts
    }

    /// Flush pending tool calls and close the turn, once.
    pub(crate) fn finish(&mut self) -> Vec<StreamPart> {
        if self.finished {
            return Vec::new();
        }
        let reason = if self.calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        };
        self.complete(reason)
    }

    fn complete(&mut self, reason: FinishReason) -> Vec<StreamPart> {
        self.finished = true;
        let mut parts: Vec<StreamPart> = std::mem::take(&mut self.calls)
            .into_iter()
            .map(|(index, call)| {
                let arguments = if call.arguments.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&call.arguments).unwrap_or_else(|e| {
                        tracing::warn!(tool = %call.name, "Tool arguments are not valid JSON: {}", e);
                        json!({})
                    })
                };
                StreamPart::ToolCall(AiToolCall {
                    id: if call.id.is_empty() {
                        format!("call_{index}")
                    } else {
                        call.id
                    },
                    name: call.name,
                    arguments,
                })
            })
            .collect();
        parts.push(StreamPart::Finish { reason });
        parts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::types::AiTool;
    use httpmock::prelude::*;

    fn data(value: Value) -> String {
        format!("data: {value}")
    }

    #[test]
    fn test_tool_call_fragments_accumulate_by_index() {
        let mut parser = ChatDeltaParser::default();
        let mut parts = Vec::new();
        for line in [
            data(json!({"choices": [{"delta": {"content": "Looking"}}]})),
            data(json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_a", "function": {"name": "search_signals", "arguments": "{\"scope_"}}
            ]}}]})),
            data(json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "id\":\"s1\",\"query\":\"bug\"}"}}
            ]}}]})),
            data(json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]})),
            "data: [DONE]".to_string(),
        ] {
            parts.extend(parser.feed_line(&line));
        }

        assert_eq!(
            parts,
            vec![
                StreamPart::TextDelta { delta: "Looking".into() },
                StreamPart::ToolCall(AiToolCall {
                    id: "call_a".into(),
                    name: "search_signals".into(),
                    arguments: json!({"scope_id": "s1", "query": "bug"}),
                }),
                StreamPart::Finish { reason: FinishReason::ToolCalls },
            ]
        );
    }

    #[test]
    fn test_done_without_finish_reason_still_finishes() {
        let mut parser = ChatDeltaParser::default();
        assert!(parser.feed_line(": keep-alive").is_empty());
        parser.feed_line(&data(json!({"choices": [{"delta": {"content": "hi"}}]})));
        assert_eq!(
            parser.feed_line("data: [DONE]"),
            vec![StreamPart::Finish { reason: FinishReason::Stop }]
        );
        assert!(parser.finish().is_empty());
    }

    #[test]
    fn test_wire_messages_carry_tool_metadata() {
        let call = AiToolCall {
            id: "c1".into(),
            name: "get_artifact".into(),
            arguments: json!({"artifact_id": "a1"}),
        };
        let assistant = message_to_wire(&ModelMessage::assistant("", vec![call]));
        assert_eq!(assistant["tool_calls"][0]["function"]["arguments"], r#"{"artifact_id":"a1"}"#);

        let tool = message_to_wire(&ModelMessage::tool_result("c1", &json!({"ok": true})));
        assert_eq!(tool["tool_call_id"], "c1");
    }

    #[tokio::test]
    async fn test_streams_from_server() {
        let server = MockServer::start_async().await;
        let body = [
            data(json!({"choices": [{"delta": {"content": "Found "}}]})),
            data(json!({"choices": [{"delta": {"content": "3 issues."}, "finish_reason": "stop"}]})),
            "data: [DONE]".to_string(),
        ]
        .join("\n\n");
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .header("authorization", "Bearer sk-test")
                    .body_includes("\"stream\":true")
                    .body_includes("\"name\":\"search_signals\"");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body(body);
            })
            .await;

        let client = OpenAiCompatClient::new(
            reqwest::Client::new(),
            ModelConfig {
                base_url: server.url("/v1"),
                api_key: "sk-test".into(),
                model: "gpt-4o".into(),
            },
        );
        let request = ModelRequest {
            messages: vec![ModelMessage::user("what broke?")],
            tools: vec![AiTool {
                name: "search_signals".into(),
                description: "Search".into(),
                input_schema: json!({"type": "object"}),
            }],
        };
        let mut rx = client.stream_turn(request).await.unwrap();
        let mut text = String::new();
        let mut finished = false;
        while let Some(part) = rx.recv().await {
            match part {
                StreamPart::TextDelta { delta } => text.push_str(&delta),
                StreamPart::Finish { .. } => finished = true,
                other => panic!("unexpected part {other:?}"),
            }
        }

        mock.assert_async().await;
        assert_eq!(text, "Found 3 issues.");
        assert!(finished);
    }
}
