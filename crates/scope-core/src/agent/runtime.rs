//! Model/tool loop
//!
//! Streams one model step at a time, dispatches requested tools through
//! the registry and feeds results back until the model stops calling
//! tools, a confirmation form is shown, or the step budget runs out.

use std::sync::Arc;

use anyhow::Result;

use super::gate::{PendingWrite, WriteGate};
use super::policy::TranscriptEntry;
use super::stream::{EventSink, StreamEvent};
use crate::ai::{ChatModel, ModelMessage, ModelRequest, StreamPart};
use crate::tools::{ToolContext, ToolRegistry, UiDescriptor};

pub const CHAT_MAX_STEPS: usize = 25;
pub const WORKFLOW_MAX_STEPS: usize = 12;

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub max_steps: usize,
    /// Forward text deltas to the client as they arrive.
    pub stream_text: bool,
    /// Offer the tool catalogue to the model.
    pub with_tools: bool,
}

impl RunOptions {
    pub fn chat() -> Self {
        Self {
            max_steps: CHAT_MAX_STEPS,
            stream_text: true,
            with_tools: true,
        }
    }

    pub fn workflow() -> Self {
        Self {
            max_steps: WORKFLOW_MAX_STEPS,
            stream_text: false,
            with_tools: true,
        }
    }

    /// Single step, no tools.
    pub fn completion() -> Self {
        Self {
            max_steps: 1,
            stream_text: false,
            with_tools: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct RunOutput {
    pub text: String,
    /// Render results in emission order.
    pub ui: Vec<UiDescriptor>,
    pub transcript: Vec<TranscriptEntry>,
    pub steps: usize,
    pub form_shown: bool,
}

#[derive(Clone)]
pub struct AgentRuntime {
    model: Arc<dyn ChatModel>,
    registry: ToolRegistry,
}

impl AgentRuntime {
    pub fn new(model: Arc<dyn ChatModel>, registry: ToolRegistry) -> Self {
        Self { model, registry }
    }

    pub fn model(&self) -> &Arc<dyn ChatModel> {
        &self.model
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Run the loop. `ctx` must carry `gate` as its write guard.
    pub async fn run(
        &self,
        system: String,
        conversation: Vec<ModelMessage>,
        ctx: &ToolContext,
        gate: &WriteGate,
        sink: &mut EventSink,
        options: RunOptions,
    ) -> Result<RunOutput> {
        let mut messages = Vec::with_capacity(conversation.len() + 1);
        messages.push(ModelMessage::system(system));
        messages.extend(conversation);
        let tools = if options.with_tools {
            self.registry.ai_tools()
        } else {
            Vec::new()
        };

        let mut output = RunOutput::default();

        for step in 1..=options.max_steps {
            output.steps = step;
            let mut rx = self
                .model
                .stream_turn(ModelRequest {
                    messages: messages.clone(),
                    tools: tools.clone(),
                })
                .await?;

            let mut text = String::new();
            let mut calls = Vec::new();
            while let Some(part) = rx.recv().await {
                match part {
                    StreamPart::TextDelta { delta } => {
                        if options.stream_text {
                            sink.send(StreamEvent::text(delta.clone())).await;
                        }
                        text.push_str(&delta);
                    }
                    StreamPart::ToolCall(call) => calls.push(call),
                    StreamPart::Finish { reason } => {
                        tracing::debug!(step, ?reason, "Model step finished");
                    }
                    StreamPart::Error { error } => {
                        tracing::warn!(step, "Model stream error: {}", error);
                        sink.send(StreamEvent::error(error)).await;
                    }
                }
            }

            output.text.push_str(&text);
            messages.push(ModelMessage::assistant(text, calls.clone()));
            if calls.is_empty() {
                return Ok(output);
            }

            for call in calls {
                output.transcript.push(TranscriptEntry::ToolCall {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                });
                let outcome = self.registry.dispatch(&call.name, call.arguments, ctx).await;
                if let Some(ui) = outcome.ui {
                    if let Some(pending) = PendingWrite::from_form(&ui) {
                        gate.form_shown(vec![pending]);
                        output.form_shown = true;
                    }
                    sink.send(ui.clone().into()).await;
                    output.ui.push(ui);
                }
                messages.push(ModelMessage::tool_result(call.id, &outcome.result.to_value()));
            }

            if output.form_shown {
                tracing::info!(step, "Confirmation form shown; ending turn");
                return Ok(output);
            }
        }

        tracing::warn!(max_steps = options.max_steps, "Agent loop hit step limit");
        Ok(output)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted model for loop tests.

    use super::*;
    use crate::ai::{AiToolCall, FinishReason};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;

    pub(crate) enum Step {
        Text(&'static str),
        Call(&'static str, Value),
    }

    /// Plays back one scripted step list per model call and records the
    /// requests it saw.
    #[derive(Default)]
    pub(crate) struct ScriptedModel {
        turns: Mutex<VecDeque<Vec<Step>>>,
        pub(crate) requests: Mutex<Vec<ModelRequest>>,
    }

    impl ScriptedModel {
        pub(crate) fn new(turns: Vec<Vec<Step>>) -> Arc<Self> {
            Arc::new(Self {
                turns: Mutex::new(turns.into()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn stream_turn(&self, request: ModelRequest) -> Result<mpsc::UnboundedReceiver<StreamPart>> {
            self.requests.lock().push(request);
            let steps = self.turns.lock().pop_front().unwrap_or_default();
            let (tx, rx) = mpsc::unbounded_channel();
            for (i, step) in steps.into_iter().enumerate() {
                let part = match step {
                    Step::Text(delta) => StreamPart::TextDelta { delta: delta.into() },
                    Step::Call(name, arguments) => StreamPart::ToolCall(AiToolCall {
                        id: format!("call-{i}"),
                        name: name.into(),
                        arguments,
                    }),
                };
                let _ = tx.send(part);
            }
            let _ = tx.send(StreamPart::Finish {
                reason: FinishReason::Stop,
            });
            Ok(rx)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{ScriptedModel, Step};
    use super::*;
    use crate::agent::gate::GateState;
    use crate::storage::Database;
    use crate::tools::test_context;
    use serde_json::json;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_loop_streams_text_and_ui_then_stops() {
        let model = ScriptedModel::new(vec![
            vec![
                Step::Text("Found "),
                Step::Call(
                    "render_signal_list",
                    json!({"signals": [{"source": "github", "title": "Crash"}]}),
                ),
            ],
            vec![Step::Text("3 issues.")],
        ]);
        let runtime = AgentRuntime::new(model.clone(), ToolRegistry::new());
        let db = Database::in_memory().unwrap().shared();
        let gate = Arc::new(WriteGate::default());
        let ctx = test_context(&db, "http://127.0.0.1:9").with_guard(gate.clone());
        let (tx, mut rx) = mpsc::channel(16);
        let mut sink = EventSink::new(tx);

        let output = runtime
            .run("sys".into(), vec![ModelMessage::user("hi")], &ctx, &gate, &mut sink, RunOptions::chat())
            .await
            .unwrap();

        assert_eq!(output.text, "Found 3 issues.");
        assert_eq!(output.steps, 2);
        assert_eq!(output.ui[0].component, "signal_list");
        assert!(!output.form_shown);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[1], StreamEvent::ToolCall { component, .. } if component == "signal_list"));

        // The tool result is fed back before the second step.
        let second = &model.requests.lock()[1];
        assert_eq!(second.messages.last().unwrap().tool_call_id.as_deref(), Some("call-1"));
    }

    #[tokio::test]
    async fn test_form_ends_turn_and_records_pending_write() {
        let model = ScriptedModel::new(vec![
            vec![Step::Call(
                "render_form",
                json!({
                    "title": "Post update",
                    "action": "post_slack_message",
                    "fields_json": "[{\"name\":\"channel_id\",\"label\":\"Channel\",\"value\":\"C1\"}]"
                }),
            )],
            vec![Step::Text("should never run")],
        ]);
        let runtime = AgentRuntime::new(model.clone(), ToolRegistry::new());
        let db = Database::in_memory().unwrap().shared();
        let gate = Arc::new(WriteGate::default());
        let ctx = test_context(&db, "http://127.0.0.1:9").with_guard(gate.clone());
        let (tx, _rx) = mpsc::channel(16);
        let mut sink = EventSink::new(tx);

        let output = runtime
            .run("sys".into(), Vec::new(), &ctx, &gate, &mut sink, RunOptions::chat())
            .await
            .unwrap();

        assert!(output.form_shown);
        assert_eq!(model.requests.lock().len(), 1);
        let GateState::FormShown { pending } = gate.finish() else {
            panic!("expected form_shown");
        };
        assert_eq!(pending[0].fields["channel_id"], "C1");
    }

    #[tokio::test]
    async fn test_step_limit() {
        let looping = (0..3)
            .map(|_| vec![Step::Call("list_artifacts", json!({}))])
            .collect();
        let model = ScriptedModel::new(looping);
        let runtime = AgentRuntime::new(model.clone(), ToolRegistry::new());
        let db = Database::in_memory().unwrap().shared();
        let gate = Arc::new(WriteGate::default());
        let ctx = test_context(&db, "http://127.0.0.1:9").with_guard(gate.clone());
        let (tx, _rx) = mpsc::channel(16);
        let mut sink = EventSink::new(tx);

        let options = RunOptions {
            max_steps: 2,
            ..RunOptions::chat()
        };
        let output = runtime
            .run("sys".into(), Vec::new(), &ctx, &gate, &mut sink, options)
            .await
            .unwrap();
        assert_eq!(output.steps, 2);
        assert_eq!(output.transcript.len(), 2);
    }
}
