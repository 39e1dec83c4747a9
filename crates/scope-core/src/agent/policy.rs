//! Transcript audit for the confirmation contract
//!
//! Replays a conversation independently of the live gate and flags every
//! write invocation that was not preceded by a shown form and a
//! confirming user message.

use serde::Serialize;
use serde_json::Value;

use super::gate::CONFIRMATION_PREFIX;
use crate::tools::{Capability, ToolKind};

#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEntry {
    User(String),
    /// A tool invocation by the model.
    ToolCall { name: String, arguments: Value },
    /// A confirmation form shown to the user for `action`.
    Form { action: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationReason {
    /// No form for this action was shown.
    NoForm,
    /// A form was shown but the user never confirmed it.
    NotConfirmed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyViolation {
    /// Index of the offending entry.
    pub position: usize,
    pub tool: String,
    pub reason: ViolationReason,
}

fn is_write(name: &str) -> bool {
    Capability::from_name(name).is_some_and(|cap| cap.kind() == ToolKind::Write)
}

pub fn audit_transcript(entries: &[TranscriptEntry]) -> Vec<PolicyViolation> {
    let mut shown: Vec<String> = Vec::new();
    let mut confirmed: Vec<String> = Vec::new();
    let mut violations = Vec::new();

    for (position, entry) in entries.iter().enumerate() {
        match entry {
            TranscriptEntry::User(message) => {
                confirmed = if message.starts_with(CONFIRMATION_PREFIX) {
                    std::mem::take(&mut shown)
                } else {
                    shown.clear();
                    Vec::new()
                };
            }
            TranscriptEntry::Form { action } => shown.push(action.clone()),
            TranscriptEntry::ToolCall { name, arguments } => {
                if name == Capability::RenderForm.name() {
                    if let Some(action) = arguments.get("action").and_then(Value::as_str) {
                        shown.push(action.to_string());
                    }
                    continue;
                }
                if !is_write(name) {
                    continue;
                }
                if let Some(index) = confirmed.iter().position(|a| a == name) {
                    confirmed.remove(index);
                    continue;
                }
                let reason = if shown.iter().any(|a| a == name) {
                    ViolationReason::NotConfirmed
                } else {
                    ViolationReason::NoForm
                };
                tracing::warn!(tool = %name, ?reason, "Write invoked without confirmation");
                violations.push(PolicyViolation {
                    position,
                    tool: name.clone(),
                    reason,
                });
            }
        }
    }
    violations
}
