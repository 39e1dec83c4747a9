//! Agent turn handling
//!
//! One chat request is one turn:
//! 1. persist the user message and advance the confirmation gate
//! 2. run the selected mode, streaming events to the client
//! 3. persist the gate and the accumulated assistant message
//!
//! The stream always ends with the `[DONE]` sentinel, even on failure.

pub mod gate;
pub mod modes;
pub mod policy;
pub mod prompts;
pub mod runtime;
pub mod stream;

use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use tokio::sync::mpsc;

pub use gate::{GateState, PendingWrite, WriteGate, CONFIRMATION_PREFIX};
pub use modes::ChatMode;
pub use policy::{audit_transcript, PolicyViolation, TranscriptEntry};
pub use runtime::{AgentRuntime, RunOptions, RunOutput};
pub use stream::{parse_sse_line, AssistantTurn, EventSink, StreamAccumulator, StreamEvent};

use crate::ai::{ChatModel, ModelMessage, ModelRequest, StreamPart};
use crate::auth::TokenManager;
use crate::integrations::ProviderClient;
use crate::storage::{messages::HISTORY_LIMIT, MessageStore, ScopeStore, SharedDatabase, StoredMessage};
use crate::tools::ToolContext;

const TITLE_MAX_CHARS: usize = 60;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(alias = "scopeId")]
    pub scope_id: String,
    #[serde(default, alias = "conversationId")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub mode: ChatMode,
}

impl ChatRequest {
    fn conversation(&self) -> Option<&str> {
        self.conversation_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

#[derive(Clone)]
pub struct ChatService {
    db: SharedDatabase,
    tokens: TokenManager,
    client: ProviderClient,
    runtime: AgentRuntime,
}

impl ChatService {
    pub fn new(
        db: SharedDatabase,
        tokens: TokenManager,
        client: ProviderClient,
        runtime: AgentRuntime,
    ) -> Self {
        Self {
            db,
            tokens,
            client,
            runtime,
        }
    }

    pub fn model(&self) -> &Arc<dyn ChatModel> {
        self.runtime.model()
    }

    /// Run one turn, sending events to `tx`. Returns the persisted
    /// assistant turn.
    pub async fn run_turn(
        &self,
        user_id: &str,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> AssistantTurn {
        let mut sink = EventSink::new(tx);
        let conversation_id = request.conversation().map(str::to_string);

        let state = match self.begin_turn(&request) {
            Ok(state) => state,
            Err(e) => {
                tracing::error!("Failed to start chat turn: {:#}", e);
                sink.send(StreamEvent::error(format!("Failed to load conversation: {e}")))
                    .await;
                GateState::Idle
            }
        };
        let mut transcript = match &state {
            GateState::Confirmed { authorized } => authorized
                .iter()
                .map(|w| TranscriptEntry::Form {
                    action: w.capability.name().to_string(),
                })
                .collect(),
            _ => Vec::new(),
        };
        transcript.push(TranscriptEntry::User(request.message.clone()));

        let gate = Arc::new(WriteGate::new(state));
        let ctx = ToolContext::new(
            self.db.clone(),
            self.tokens.clone(),
            self.client.clone(),
            user_id,
            request.scope_id.clone(),
        )
        .with_guard(gate.clone());

        match self.run_mode(&request, &ctx, &gate, &mut sink).await {
            Ok(entries) => {
                transcript.extend(entries);
                for violation in audit_transcript(&transcript) {
                    tracing::warn!(
                        tool = %violation.tool,
                        reason = ?violation.reason,
                        "Confirmation policy violation (blocked)"
                    );
                }
            }
            Err(e) => {
                tracing::error!(mode = ?request.mode, "Chat turn failed: {:#}", e);
                sink.send(StreamEvent::error(format!("{e:#}"))).await;
            }
        }

        let final_state = gate.finish();
        let turn = sink.send(StreamEvent::Done).await.unwrap_or_default();

        if let Some(conversation_id) = conversation_id.as_deref() {
            let db = self.db.lock();
            if let Err(e) = final_state.save(&db, conversation_id) {
                tracing::error!(conversation_id, "Failed to save confirmation state: {:#}", e);
            }
            let tool_calls = turn.tool_calls_json();
            if let Err(e) = MessageStore::new(&db).append(
                conversation_id,
                "assistant",
                &turn.text,
                tool_calls.as_ref(),
            ) {
                tracing::error!(conversation_id, "Failed to save assistant message: {:#}", e);
            }
        }
        turn
    }

    /// Persist the user message and advance the gate.
    fn begin_turn(&self, request: &ChatRequest) -> Result<GateState> {
        let Some(conversation_id) = request.conversation() else {
            return Ok(GateState::Idle);
        };
        let db = self.db.lock();
        let messages = MessageStore::new(&db);
        messages.ensure_conversation(conversation_id, &request.scope_id)?;
        messages.append(conversation_id, "user", &request.message, None)?;
        let state = GateState::load(&db, conversation_id)?.on_user_message(&request.message);
        tracing::debug!(conversation_id, state = state.label(), "Confirmation gate advanced");
        Ok(state)
    }

    async fn run_mode(
        &self,
        request: &ChatRequest,
        ctx: &ToolContext,
        gate: &WriteGate,
        sink: &mut EventSink,
    ) -> Result<Vec<TranscriptEntry>> {
        let (datasources, history) = {
            let db = self.db.lock();
            let datasources = ScopeStore::new(&db)
                .get(&request.scope_id)?
                .map(|scope| scope.datasources)
                .unwrap_or_default();
            let history = match request.conversation() {
                Some(id) => MessageStore::new(&db)
                    .history(id, HISTORY_LIMIT)?
                    .iter()
                    .filter_map(model_message)
                    .collect(),
                None => vec![ModelMessage::user(request.message.as_str())],
            };
            (datasources, history)
        };

        tracing::info!(
            mode = ?request.mode,
            scope_id = %request.scope_id,
            history = history.len(),
            "Running chat turn"
        );
        modes::ModeRun {
            runtime: &self.runtime,
            ctx,
            gate,
            message: &request.message,
            datasources: &datasources,
            history,
        }
        .run(request.mode, sink)
        .await
    }

    /// Generate and store a short title for a conversation.
    pub async fn title_conversation(&self, conversation_id: &str, message: &str) -> Result<String> {
        let title = generate_title(self.runtime.model().as_ref(), message).await;
        MessageStore::new(&self.db.lock()).set_title(conversation_id, &title)?;
        Ok(title)
    }
}

/// Stored message as model context. Rendered components are summarised so
/// the model knows what the user saw.
fn model_message(stored: &StoredMessage) -> Option<ModelMessage> {
    match stored.role.as_str() {
        "user" => Some(ModelMessage::user(stored.content.as_str())),
        "assistant" => {
            let components: Vec<&str> = stored
                .tool_calls
                .as_ref()
                .and_then(|v| v.as_array())
                .into_iter()
                .flatten()
                .filter_map(|c| c.get("component").and_then(|c| c.as_str()))
                .collect();
            let mut content = stored.content.clone();
            if !components.is_empty() {
                if !content.is_empty() {
                    content.push_str("\n\n");
                }
                content.push_str(&format!("[Displayed: {}]", components.join(", ")));
            }
            Some(ModelMessage::assistant(content, Vec::new()))
        }
        _ => None,
    }
}

fn fallback_title(message: &str) -> String {
    if message.chars().count() > 50 {
        let head: String = message.chars().take(47).collect();
        format!("{head}...")
    } else {
        message.to_string()
    }
}

/// Ask the model for a 3-6 word title, falling back to the truncated
/// message when the model fails or rambles.
pub async fn generate_title(model: &dyn ChatModel, message: &str) -> String {
    let request = ModelRequest {
        messages: vec![ModelMessage::user(prompts::title_prompt(message))],
        tools: Vec::new(),
    };
    let mut title = String::new();
    match model.stream_turn(request).await {
        Ok(mut rx) => {
            while let Some(part) = rx.recv().await {
                if let StreamPart::TextDelta { delta } = part {
                    title.push_str(&delta);
                }
            }
        }
        Err(e) => tracing::error!("Title generation failed: {:#}", e),
    }
    let title = title.trim();
    if title.is_empty() || title.chars().count() > TITLE_MAX_CHARS {
        fallback_title(message)
    } else {
        title.to_string()
    }
}
