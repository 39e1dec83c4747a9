//! Chat, synthesize, draft and orchestrate
//!
//! Every mode reports progress through the same [`EventSink`]; the caller
//! sends the terminal sentinel.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::gate::{PendingWrite, WriteGate};
use super::policy::TranscriptEntry;
use super::prompts;
use super::runtime::{AgentRuntime, RunOptions, RunOutput};
use super::stream::{EventSink, StreamEvent};
use crate::ai::ModelMessage;
use crate::storage::ArtifactStore;
use crate::tools::{Capability, ToolContext, UiDescriptor};

pub const DEFAULT_SYNTHESIS_QUERY: &str = "Analyze and synthesize all signals";
pub const DEFAULT_DRAFT_PROMPT: &str = "Write a product document based on the signals";

const UNPARSEABLE_PLAN: &str =
    "I couldn't parse that into actions. Please be more specific about what you'd like to do.";
const EMPTY_PLAN: &str = "No actions identified. Please describe what you'd like to do, e.g. 'Create a Linear issue about updating the command palette'.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    #[default]
    Chat,
    Synthesize,
    Draft,
    Orchestrate,
}

/// Everything a mode needs for one turn.
pub(super) struct ModeRun<'a> {
    pub runtime: &'a AgentRuntime,
    pub ctx: &'a ToolContext,
    pub gate: &'a WriteGate,
    pub message: &'a str,
    pub datasources: &'a [String],
    pub history: Vec<ModelMessage>,
}

impl ModeRun<'_> {
    pub async fn run(self, mode: ChatMode, sink: &mut EventSink) -> Result<Vec<TranscriptEntry>> {
        match mode {
            ChatMode::Chat => self.chat(sink).await,
            ChatMode::Synthesize => self.synthesize(sink).await,
            ChatMode::Draft => self.draft(sink).await,
            ChatMode::Orchestrate => self.orchestrate(sink).await,
        }
    }

    async fn chat(self, sink: &mut EventSink) -> Result<Vec<TranscriptEntry>> {
        let mut system = prompts::chat_system_prompt(&self.ctx.scope_id, self.datasources);
        if let Some(note) = prompts::confirmed_actions_note(&self.gate.authorized()) {
            system.push_str(&note);
        }
        let output = self
            .runtime
            .run(system, self.history, self.ctx, self.gate, sink, RunOptions::chat())
            .await?;
        Ok(output.transcript)
    }

    async fn workflow(&self, system: String, input: &str, sink: &mut EventSink) -> Result<RunOutput> {
        self.runtime
            .run(
                system,
                vec![ModelMessage::user(input)],
                self.ctx,
                self.gate,
                sink,
                RunOptions::workflow(),
            )
            .await
    }

    fn save_artifact(&self, kind: &str, title: &str, content: &Value, status: &str) -> Option<String> {
        let db = self.ctx.db.lock();
        match ArtifactStore::new(&db).create(&self.ctx.scope_id, kind, title, content, status) {
            Ok(artifact) => {
                tracing::info!(artifact_id = %artifact.id, kind, "Artifact saved");
                Some(artifact.id)
            }
            Err(e) => {
                tracing::error!(kind, "Failed to save artifact: {:#}", e);
                None
            }
        }
    }

    async fn synthesize(self, sink: &mut EventSink) -> Result<Vec<TranscriptEntry>> {
        let query = non_empty_or(self.message, DEFAULT_SYNTHESIS_QUERY);
        let system = prompts::synthesis_prompt(&self.ctx.scope_id, self.datasources);
        let output = self.workflow(system, query, sink).await?;

        self.save_artifact(
            "synthesis",
            &format!("Synthesis: {query}"),
            &json!({ "summary": output.text, "uiResults": output.ui, "query": query }),
            "draft",
        );
        let summary = non_empty_or(&output.text, "Synthesis complete.");
        sink.send(StreamEvent::text(summary)).await;
        Ok(output.transcript)
    }

    async fn draft(self, sink: &mut EventSink) -> Result<Vec<TranscriptEntry>> {
        let prompt = non_empty_or(self.message, DEFAULT_DRAFT_PROMPT);
        let system = prompts::draft_prompt(&self.ctx.scope_id, self.datasources);
        let output = self.workflow(system, prompt, sink).await?;

        let artifact_id = self.save_artifact(
            "draft",
            &format!("Draft: {prompt}"),
            &json!({ "document": output.text, "uiResults": output.ui, "prompt": prompt }),
            "draft",
        );

        if output.ui.is_empty() && !output.text.is_empty() {
            let sections = markdown_sections(&output.text);
            if sections.is_empty() {
                sink.send(StreamEvent::text(output.text.clone())).await;
            } else {
                let mut props = json!({
                    "title": format!("Draft: {prompt}"),
                    "sections": sections,
                    "status": "draft",
                });
                if let Some(id) = artifact_id {
                    props["artifactId"] = Value::String(id);
                }
                sink.send(UiDescriptor::new("draft_card", props).into()).await;
            }
        }
        Ok(output.transcript)
    }

    async fn orchestrate(self, sink: &mut EventSink) -> Result<Vec<TranscriptEntry>> {
        let authorized = self.gate.authorized();
        if !authorized.is_empty() {
            return self.execute_confirmed(authorized, sink).await;
        }

        let mut quiet = EventSink::detached();
        let parsed = self
            .runtime
            .run(
                prompts::orchestrate_parser_prompt(self.datasources),
                vec![ModelMessage::user(self.message)],
                self.ctx,
                self.gate,
                &mut quiet,
                RunOptions::completion(),
            )
            .await?;

        let Some(actions) = parse_action_plan(&parsed.text) else {
            sink.send(StreamEvent::text(UNPARSEABLE_PLAN)).await;
            return Ok(Vec::new());
        };
        if actions.is_empty() {
            sink.send(StreamEvent::text(EMPTY_PLAN)).await;
            return Ok(Vec::new());
        }

        let steps: Vec<Value> = actions
            .iter()
            .map(|a| {
                json!({
                    "service": a.service,
                    "title": a.action,
                    "description": Value::Object(a.payload.clone()).to_string(),
                    "payload": a.payload,
                })
            })
            .collect();
        let plan = UiDescriptor::new("action_plan", json!({ "actions": steps }));
        sink.send(plan.into()).await;

        let mut transcript = Vec::new();
        let mut pending = Vec::new();
        let mut unsupported = Vec::new();
        for action in &actions {
            let Some(capability) = action.capability() else {
                unsupported.push(format!("{} {}", action.service, action.action));
                continue;
            };
            let form = action.form(capability);
            if let Some(write) = PendingWrite::from_form(&form) {
                pending.push(write);
            }
            transcript.push(TranscriptEntry::Form {
                action: capability.name().to_string(),
            });
            sink.send(form.into()).await;
        }

        self.save_artifact(
            "orchestration_plan",
            &format!("Orchestration: {} actions", actions.len()),
            &json!({ "actions": actions, "results": [] }),
            "pending",
        );

        let mut reply = if pending.is_empty() {
            String::from("None of these actions can be executed.")
        } else {
            format!(
                "Review the {} planned action(s) above. Edit any field, then reply starting with {} to execute.",
                pending.len(),
                super::gate::CONFIRMATION_PREFIX,
            )
        };
        if !unsupported.is_empty() {
            reply.push_str(&format!("\n\nSkipped unsupported actions: {}", unsupported.join(", ")));
        }
        self.gate.form_shown(pending);
        sink.send(StreamEvent::text(reply)).await;
        Ok(transcript)
    }

    /// Run each confirmed write once, through the gate.
    async fn execute_confirmed(
        &self,
        authorized: Vec<PendingWrite>,
        sink: &mut EventSink,
    ) -> Result<Vec<TranscriptEntry>> {
        let registry = self.runtime.registry();
        let mut transcript = Vec::new();
        let mut results = Vec::new();
        let mut lines = Vec::new();

        for write in authorized {
            let name = write.capability.name();
            let arguments = Value::Object(write.fields);
            transcript.push(TranscriptEntry::ToolCall {
                name: name.to_string(),
                arguments: arguments.clone(),
            });
            let outcome = registry.dispatch(name, arguments, self.ctx).await;
            let value = outcome.result.to_value();
            let status = if outcome.result.is_error {
                let message = value
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("failed");
                format!("failed ({message})")
            } else {
                "completed".to_string()
            };
            let service = write
                .capability
                .write_provider()
                .map(|p| p.storage_key())
                .unwrap_or_default();
            lines.push(format!("- **{service}** {name}: {status}"));
            results.push(json!({ "service": service, "action": name, "status": status, "output": value }));
        }

        self.save_artifact(
            "orchestration_plan",
            &format!("Orchestration: {} actions", results.len()),
            &json!({ "results": results }),
            "executed",
        );
        sink.send(StreamEvent::text(lines.join("\n"))).await;
        Ok(transcript)
    }
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value
    }
}

/// One action proposed by the orchestration parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedAction {
    pub service: String,
    pub action: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl PlannedAction {
    pub fn capability(&self) -> Option<Capability> {
        match (self.service.as_str(), self.action.as_str()) {
            ("linear", "create_issue") => Some(Capability::CreateLinearIssue),
            ("slack", "post_message") => Some(Capability::PostSlackMessage),
            ("github", "create_issue") => Some(Capability::CreateGithubIssue),
            ("notion", "create_page") => Some(Capability::CreateNotionPage),
            _ => None,
        }
    }

    /// Confirmation form prefilled with the payload.
    fn form(&self, capability: Capability) -> UiDescriptor {
        let fields: Vec<Value> = self
            .payload
            .iter()
            .map(|(name, value)| {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                json!({ "name": name, "label": field_label(name), "value": value })
            })
            .collect();
        UiDescriptor::new(
            "form",
            json!({
                "title": format!("{} {}", self.service, self.action.replace('_', " ")),
                "action": capability.name(),
                "fields": fields,
            }),
        )
    }
}

/// `channel_id` -> `Channel id`
fn field_label(name: &str) -> String {
    let spaced = name.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => spaced,
    }
}

/// Extract the outermost `[...]` from a model reply. No brackets means no
/// actions; brackets that don't hold a valid action list mean `None`.
pub fn parse_action_plan(raw: &str) -> Option<Vec<PlannedAction>> {
    let (Some(start), Some(end)) = (raw.find('['), raw.rfind(']')) else {
        return Some(Vec::new());
    };
    if end < start {
        return Some(Vec::new());
    }
    serde_json::from_str(&raw[start..=end]).ok()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DraftSection {
    pub heading: String,
    pub content: String,
}

/// Split markdown into sections at `#` to `###` headings. Text before the
/// first heading is dropped.
pub fn markdown_sections(markdown: &str) -> Vec<DraftSection> {
    let mut sections = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in markdown.lines() {
        if let Some(heading) = heading_text(line) {
            if let Some((heading, body)) = current.take() {
                sections.push(DraftSection {
                    heading,
                    content: body.join("\n").trim().to_string(),
                });
            }
            current = Some((heading.to_string(), Vec::new()));
        } else if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }
    if let Some((heading, body)) = current {
        sections.push(DraftSection {
            heading,
            content: body.join("\n").trim().to_string(),
        });
    }
    sections
}

fn heading_text(line: &str) -> Option<&str> {
    let hashes = line.len() - line.trim_start_matches('#').len();
    if !(1..=3).contains(&hashes) {
        return None;
    }
    let rest = &line[hashes..];
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let text = rest.trim();
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_action_plan() {
        let raw = "Sure:\n```json\n[{\"service\":\"slack\",\"action\":\"post_message\",\"payload\":{\"channel_id\":\"C1\",\"text\":\"hi\"}}]\n```";
        let actions = parse_action_plan(raw).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].capability(), Some(Capability::PostSlackMessage));

        assert_eq!(parse_action_plan("nothing to do"), Some(Vec::new()));
        assert_eq!(parse_action_plan("[not json]"), None);
        assert_eq!(parse_action_plan("[]"), Some(Vec::new()));
    }

    #[test]
    fn test_unknown_service_has_no_capability() {
        let action = PlannedAction {
            service: "jira".into(),
            action: "create_issue".into(),
            payload: Map::new(),
        };
        assert_eq!(action.capability(), None);
    }

    #[test]
    fn test_plan_form_is_a_pending_write() {
        let action = PlannedAction {
            service: "linear".into(),
            action: "create_issue".into(),
            payload: Map::from_iter([
                ("linear_id".to_string(), json!("T1")),
                ("priority".to_string(), json!(3)),
            ]),
        };
        let form = action.form(Capability::CreateLinearIssue);
        assert_eq!(form.props["title"], "linear create issue");
        assert_eq!(form.props["fields"][0]["label"], "Linear id");
        let pending = PendingWrite::from_form(&form).unwrap();
        assert_eq!(pending.capability, Capability::CreateLinearIssue);
        assert_eq!(pending.fields["priority"], "3");
    }

    #[test]
    fn test_markdown_sections() {
        let md = "Preamble\n# Problem\nUsers churn.\n\n## Impact\n- a\n- b\n#### Not a heading\n#NoSpace\n";
        let sections = markdown_sections(md);
        assert_eq!(
            sections,
            vec![
                DraftSection {
                    heading: "Problem".into(),
                    content: "Users churn.".into(),
                },
                DraftSection {
                    heading: "Impact".into(),
                    content: "- a\n- b\n#### Not a heading\n#NoSpace".into(),
                },
            ]
        );
        assert!(markdown_sections("no headings here").is_empty());
    }
}
