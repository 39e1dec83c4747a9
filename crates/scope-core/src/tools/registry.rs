//! Static tool registry
//!
//! Every capability the agent can call is one [`Capability`] variant.
//! Dispatch matches on the variant's [`ToolKind`], so adding a capability
//! without deciding its kind and implementation does not compile.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{live, read, render, write};
use crate::ai::AiTool;
use crate::auth::{TokenError, TokenManager};
use crate::integrations::{Provider, ProviderClient, ProviderError};
use crate::storage::SharedDatabase;

/// Default per-call timeout.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// What a capability may do when invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    /// Datastore or live provider query. Safe without confirmation.
    Read,
    /// Pure `{component, props}` descriptor.
    Render,
    /// External side effect. Requires a confirmed form.
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    SearchSignals,
    GetSignalsByScope,
    GetScopeDatasources,
    ListArtifacts,
    GetArtifact,
    UpdateArtifact,
    QueryGithub,
    QuerySlack,
    QueryNotion,
    RenderInsightCard,
    RenderLinearCard,
    RenderSignalList,
    RenderActionPlan,
    RenderDraftCard,
    RenderForm,
    CreateLinearIssue,
    PostSlackMessage,
    CreateGithubIssue,
    CreateNotionPage,
}

impl Capability {
    pub const ALL: [Capability; 19] = [
        Capability::SearchSignals,
        Capability::GetSignalsByScope,
        Capability::GetScopeDatasources,
        Capability::ListArtifacts,
        Capability::GetArtifact,
        Capability::UpdateArtifact,
        Capability::QueryGithub,
        Capability::QuerySlack,
        Capability::QueryNotion,
        Capability::RenderInsightCard,
        Capability::RenderLinearCard,
        Capability::RenderSignalList,
        Capability::RenderActionPlan,
        Capability::RenderDraftCard,
        Capability::RenderForm,
        Capability::CreateLinearIssue,
        Capability::PostSlackMessage,
        Capability::CreateGithubIssue,
        Capability::CreateNotionPage,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Capability::SearchSignals => "search_signals",
            Capability::GetSignalsByScope => "get_signals_by_scope",
            Capability::GetScopeDatasources => "get_scope_datasources",
            Capability::ListArtifacts => "list_artifacts",
            Capability::GetArtifact => "get_artifact",
            Capability::UpdateArtifact => "update_artifact",
            Capability::QueryGithub => "query_github",
            Capability::QuerySlack => "query_slack",
            Capability::QueryNotion => "query_notion",
            Capability::RenderInsightCard => "render_insight_card",
            Capability::RenderLinearCard => "render_linear_card",
            Capability::RenderSignalList => "render_signal_list",
            Capability::RenderActionPlan => "render_action_plan",
            Capability::RenderDraftCard => "render_draft_card",
            Capability::RenderForm => "render_form",
            Capability::CreateLinearIssue => "create_linear_issue",
            Capability::PostSlackMessage => "post_slack_message",
            Capability::CreateGithubIssue => "create_github_issue",
            Capability::CreateNotionPage => "create_notion_page",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|cap| cap.name() == name)
    }

    pub fn kind(&self) -> ToolKind {
        match self {
            Capability::SearchSignals
            | Capability::GetSignalsByScope
            | Capability::GetScopeDatasources
            | Capability::ListArtifacts
            | Capability::GetArtifact
            | Capability::UpdateArtifact
            | Capability::QueryGithub
            | Capability::QuerySlack
            | Capability::QueryNotion => ToolKind::Read,
            Capability::RenderInsightCard
            | Capability::RenderLinearCard
            | Capability::RenderSignalList
            | Capability::RenderActionPlan
            | Capability::RenderDraftCard
            | Capability::RenderForm => ToolKind::Render,
            Capability::CreateLinearIssue
            | Capability::PostSlackMessage
            | Capability::CreateGithubIssue
            | Capability::CreateNotionPage => ToolKind::Write,
        }
    }

    /// The render capability that must precede this one, for writes.
    pub fn requires(&self) -> Option<Capability> {
        match self.kind() {
            ToolKind::Write => Some(Capability::RenderForm),
            ToolKind::Read | ToolKind::Render => None,
        }
    }

    /// Provider a write capability acts on.
    pub fn write_provider(&self) -> Option<Provider> {
        match self {
            Capability::CreateLinearIssue => Some(Provider::Linear),
            Capability::PostSlackMessage => Some(Provider::Slack),
            Capability::CreateGithubIssue => Some(Provider::GitHub),
            Capability::CreateNotionPage => Some(Provider::Notion),
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Capability::SearchSignals => "Search for signals in the current scope by keyword. Returns matching signals with title, source, body, and metadata. Use this when the user asks about specific topics.",
            Capability::GetSignalsByScope => "Get all signals for a scope, ordered by most recent. Optionally filter by source (github, slack, linear, notion, gmail). Use this to get an overview of all data in a scope.",
            Capability::GetScopeDatasources => "Get the list of datasources (GitHub repos, Slack channels, Linear teams, Notion pages, Gmail labels) configured for a scope. Returns each datasource's provider and resource identifier. Use this to discover what data sources are available before querying them.",
            Capability::ListArtifacts => "List all artifacts in a scope. Optionally filter by kind (synthesis, draft, orchestration_plan). Returns id, kind, title, status, and timestamps. Pass empty string for kind to list all.",
            Capability::GetArtifact => "Fetch a single artifact by its ID. Artifacts are saved outputs from synthesis, drafting, or orchestration workflows.",
            Capability::UpdateArtifact => "Update an existing artifact. Can change title, content (JSON object), or status. Pass empty string for fields you do not want to change.",
            Capability::QueryGithub => "Read live data from a GitHub repository. endpoint is one of commits, pulls, issues, readme, tree, or a file path (e.g. src/main.rs). Use the repo from the scope datasources (owner/name).",
            Capability::QuerySlack => "Read recent messages from a Slack channel. Optionally pass query to keep only messages containing that text. Pass empty string for query to get all recent messages.",
            Capability::QueryNotion => "Read a Notion page: title, url, last edited time, and body text.",
            Capability::RenderInsightCard => "Display an insight card with severity, description, and inline evidence. evidence_json is a JSON array of objects with source (github/slack/linear/notion), title (the specific issue/PR/message name), and optional severity (high/medium/low). Each piece of evidence shows where this insight comes from. Evidence can be reused across multiple insight cards.",
            Capability::RenderLinearCard => "Display a Linear ticket card with status, assignee, and priority info. Pass empty string for optional fields.",
            Capability::RenderSignalList => "Display a list of signals as a table. Pass signals_json as a JSON string array of objects, each with source, title, and optional severity fields.",
            Capability::RenderActionPlan => "Display an action plan with cross-service actions. Pass actions_json as a JSON string array of objects, each with service, title, description, and optional payload fields.",
            Capability::RenderDraftCard => "Display a structured document with collapsible sections. Pass sections_json as a JSON string array of objects, each with heading and content fields. Status should be draft or final.",
            Capability::RenderForm => "Display an editable confirmation form to the user BEFORE executing any write action. The user can review and edit all fields, then click Confirm. Pass title, description, action (the write tool to execute, e.g. 'create_linear_issue'), and fields_json as a JSON string array of objects with name, label, value, and optional type (text/textarea/select) and options (for select).",
            Capability::CreateLinearIssue => "Create a new issue in Linear. Pass linear_id (the ID from datasources; a team ID or project ID both work), title and description. Optional: priority (0=none,1=urgent,2=high,3=medium,4=low). Only call after the user confirmed a render_form for this action.",
            Capability::PostSlackMessage => "Post a message to a Slack channel. Only call after the user confirmed a render_form for this action.",
            Capability::CreateGithubIssue => "Create an issue in a GitHub repository (owner/name). Only call after the user confirmed a render_form for this action.",
            Capability::CreateNotionPage => "Create a page in a Notion database with a title and optional paragraph content. Only call after the user confirmed a render_form for this action.",
        }
    }

    pub fn parameters_schema(&self) -> Value {
        let (properties, required): (Value, &[&str]) = match self {
            Capability::SearchSignals => (
                json!({
                    "scope_id": {"type": "string", "description": "Scope to search"},
                    "query": {"type": "string", "description": "Keyword to match in title or body"}
                }),
                &["query"],
            ),
            Capability::GetSignalsByScope => (
                json!({
                    "scope_id": {"type": "string"},
                    "source": {"type": "string", "description": "Provider filter, or empty string for all"}
                }),
                &[],
            ),
            Capability::GetScopeDatasources => (json!({"scope_id": {"type": "string"}}), &[]),
            Capability::ListArtifacts => (
                json!({
                    "scope_id": {"type": "string"},
                    "kind": {"type": "string", "description": "synthesis, draft, orchestration_plan, or empty string"}
                }),
                &[],
            ),
            Capability::GetArtifact => (json!({"artifact_id": {"type": "string"}}), &["artifact_id"]),
            Capability::UpdateArtifact => (
                json!({
                    "artifact_id": {"type": "string"},
                    "title": {"type": "string"},
                    "content": {"type": "string", "description": "JSON object as a string"},
                    "status": {"type": "string"}
                }),
                &["artifact_id"],
            ),
            Capability::QueryGithub => (
                json!({
                    "repo": {"type": "string", "description": "owner/name"},
                    "endpoint": {"type": "string", "description": "commits, pulls, issues, readme, tree, or a file path"}
                }),
                &["repo", "endpoint"],
            ),
            Capability::QuerySlack => (
                json!({
                    "channel_id": {"type": "string"},
                    "query": {"type": "string", "description": "Text filter, or empty string"}
                }),
                &["channel_id"],
            ),
            Capability::QueryNotion => (json!({"page_id": {"type": "string"}}), &["page_id"]),
            Capability::RenderInsightCard => (
                json!({
                    "title": {"type": "string"},
                    "description": {"type": "string"},
                    "severity": {"type": "string", "enum": ["high", "medium", "low"]},
                    "signal_count": {"type": "string"},
                    "evidence_json": {"type": "string"}
                }),
                &["title", "description", "severity"],
            ),
            Capability::RenderLinearCard => (
                json!({
                    "ticket_id": {"type": "string"},
                    "title": {"type": "string"},
                    "status": {"type": "string"},
                    "assignee": {"type": "string"},
                    "priority": {"type": "string"}
                }),
                &["ticket_id", "title", "status"],
            ),
            Capability::RenderSignalList => (json!({"signals_json": {"type": "string"}}), &["signals_json"]),
            Capability::RenderActionPlan => (json!({"actions_json": {"type": "string"}}), &["actions_json"]),
            Capability::RenderDraftCard => (
                json!({
                    "title": {"type": "string"},
                    "sections_json": {"type": "string"},
                    "status": {"type": "string"},
                    "artifact_id": {"type": "string"}
                }),
                &["title", "sections_json"],
            ),
            Capability::RenderForm => (
                json!({
                    "title": {"type": "string"},
                    "description": {"type": "string"},
                    "action": {"type": "string", "description": "Write tool to run after confirmation"},
                    "fields_json": {"type": "string"}
                }),
                &["title", "action", "fields_json"],
            ),
            Capability::CreateLinearIssue => (
                json!({
                    "linear_id": {"type": "string"},
                    "title": {"type": "string"},
                    "description": {"type": "string"},
                    "priority": {"type": "string"}
                }),
                &["linear_id", "title"],
            ),
            Capability::PostSlackMessage => (
                json!({
                    "channel_id": {"type": "string"},
                    "text": {"type": "string"}
                }),
                &["channel_id", "text"],
            ),
            Capability::CreateGithubIssue => (
                json!({
                    "repo": {"type": "string"},
                    "title": {"type": "string"},
                    "body": {"type": "string"}
                }),
                &["repo", "title"],
            ),
            Capability::CreateNotionPage => (
                json!({
                    "database_id": {"type": "string"},
                    "title": {"type": "string"},
                    "content": {"type": "string"}
                }),
                &["database_id", "title"],
            ),
        };
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

/// Tool execution result
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub output: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: false,
        }
    }

    /// Structured success envelope with `ok=true` and `data`.
    pub fn success_data(data: Value) -> Self {
        Self::success(json!({ "ok": true, "data": data }).to_string())
    }

    /// Structured error envelope with an explicit code.
    pub fn error_with_code(code: &str, msg: impl std::fmt::Display) -> Self {
        Self {
            output: json!({
                "ok": false,
                "error": { "code": code, "message": msg.to_string() }
            })
            .to_string(),
            is_error: true,
        }
    }

    pub fn invalid_parameters(msg: impl std::fmt::Display) -> Self {
        Self::error_with_code("invalid_parameters", msg)
    }

    pub fn not_connected(provider: Provider) -> Self {
        let name = provider.display_name();
        Self::error_with_code(
            "not_connected",
            format!("{name} not connected. Connect {name} in Settings first."),
        )
    }

    /// Output as JSON for the model. Plain text becomes a JSON string.
    pub fn to_value(&self) -> Value {
        serde_json::from_str(&self.output).unwrap_or_else(|_| Value::String(self.output.clone()))
    }

    /// Error code of a structured error envelope.
    pub fn error_code(&self) -> Option<String> {
        if !self.is_error {
            return None;
        }
        self.to_value()
            .pointer("/error/code")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

impl From<TokenError> for ToolResult {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::NotConnected(provider) => ToolResult::not_connected(provider),
            TokenError::RefreshFailed(_) => ToolResult::error_with_code("token_expired", err),
            TokenError::Storage(_) => ToolResult::error_with_code("tool_error", err),
        }
    }
}

impl From<ProviderError> for ToolResult {
    fn from(err: ProviderError) -> Self {
        ToolResult::error_with_code("provider_error", err)
    }
}

/// Parse tool parameters, returning a ToolResult error on failure
pub fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ToolResult> {
    serde_json::from_value(params)
        .map_err(|e| ToolResult::invalid_parameters(format!("Invalid parameters: {}", e)))
}

/// `{component, props}` descriptor produced by render capabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiDescriptor {
    pub component: String,
    pub props: Value,
}

impl UiDescriptor {
    pub fn new(component: impl Into<String>, props: Value) -> Self {
        Self {
            component: component.into(),
            props,
        }
    }

    /// The write tool a `form` descriptor asks to confirm.
    pub fn form_action(&self) -> Option<&str> {
        if self.component != "form" {
            return None;
        }
        self.props.get("action").and_then(Value::as_str)
    }
}

/// Server-side authority over write invocations.
///
/// `authorize` consumes one authorization for `capability` and returns
/// the user-edited field values to apply, or `None` when the write has
/// not been confirmed.
pub trait WriteGuard: Send + Sync {
    fn authorize(&self, capability: Capability) -> Option<Map<String, Value>>;
}

/// Guard that refuses every write.
pub struct DenyWrites;

impl WriteGuard for DenyWrites {
    fn authorize(&self, _capability: Capability) -> Option<Map<String, Value>> {
        None
    }
}

/// Context for tool execution
#[derive(Clone)]
pub struct ToolContext {
    pub db: SharedDatabase,
    pub tokens: TokenManager,
    pub client: ProviderClient,
    pub user_id: String,
    pub scope_id: String,
    pub guard: Arc<dyn WriteGuard>,
    /// Optional per-call timeout override
    pub timeout: Option<Duration>,
}

impl ToolContext {
    pub fn new(
        db: SharedDatabase,
        tokens: TokenManager,
        client: ProviderClient,
        user_id: impl Into<String>,
        scope_id: impl Into<String>,
    ) -> Self {
        Self {
            db,
            tokens,
            client,
            user_id: user_id.into(),
            scope_id: scope_id.into(),
            guard: Arc::new(DenyWrites),
            timeout: None,
        }
    }

    pub fn with_guard(mut self, guard: Arc<dyn WriteGuard>) -> Self {
        self.guard = guard;
        self
    }

    /// Scope a tool call targets. Tools are confined to the conversation's
    /// scope; naming any other scope is rejected.
    pub(crate) fn scope(&self, requested: Option<&str>) -> Result<&str, ToolResult> {
        match requested.map(str::trim).filter(|s| !s.is_empty()) {
            None => Ok(&self.scope_id),
            Some(id) if id == self.scope_id => Ok(&self.scope_id),
            Some(id) => Err(ToolResult::error_with_code(
                "access_denied",
                format!("Scope '{id}' is not the current scope"),
            )),
        }
    }
}

/// Result of one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub capability: Option<Capability>,
    pub result: ToolResult,
    /// Set for successful render calls.
    pub ui: Option<UiDescriptor>,
}

impl DispatchOutcome {
    fn plain(capability: Option<Capability>, result: ToolResult) -> Self {
        Self {
            capability,
            result,
            ui: None,
        }
    }
}

/// Registry of every [`Capability`].
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    default_timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            default_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// All capabilities as model tool definitions.
    pub fn ai_tools(&self) -> Vec<AiTool> {
        Capability::ALL
            .iter()
            .map(|cap| AiTool {
                name: cap.name().to_string(),
                description: cap.description().to_string(),
                input_schema: cap.parameters_schema(),
            })
            .collect()
    }

    /// Look up and run a capability by wire name, with timeout.
    pub async fn dispatch(&self, name: &str, params: Value, ctx: &ToolContext) -> DispatchOutcome {
        let Some(capability) = Capability::from_name(name) else {
            tracing::warn!(tool = name, "Unknown tool requested");
            return DispatchOutcome::plain(
                None,
                ToolResult::error_with_code("unknown_tool", format!("Unknown tool: {name}")),
            );
        };

        let timeout = ctx.timeout.unwrap_or(self.default_timeout);
        let start = Instant::now();
        tracing::info!(tool = name, kind = ?capability.kind(), "Dispatching tool");

        let outcome = match tokio::time::timeout(timeout, run(capability, params, ctx)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    tool = name,
                    timeout_secs = timeout.as_secs(),
                    "Tool execution timed out"
                );
                DispatchOutcome::plain(
                    Some(capability),
                    ToolResult::error_with_code(
                        "timeout",
                        format!("Tool '{}' timed out after {} seconds", name, timeout.as_secs()),
                    ),
                )
            }
        };

        tracing::debug!(
            tool = name,
            is_error = outcome.result.is_error,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Tool finished"
        );
        outcome
    }
}

async fn run(capability: Capability, params: Value, ctx: &ToolContext) -> DispatchOutcome {
    match capability.kind() {
        ToolKind::Read => {
            let result = match capability {
                Capability::QueryGithub | Capability::QuerySlack | Capability::QueryNotion => {
                    live::execute(capability, params, ctx).await
                }
                _ => read::execute(capability, params, ctx),
            };
            DispatchOutcome::plain(Some(capability), result)
        }
        ToolKind::Render => match render::render(capability, &params) {
            Ok(descriptor) => DispatchOutcome {
                capability: Some(capability),
                result: ToolResult::success(json!(descriptor).to_string()),
                ui: Some(descriptor),
            },
            Err(result) => DispatchOutcome::plain(Some(capability), result),
        },
        ToolKind::Write => {
            let Some(overrides) = ctx.guard.authorize(capability) else {
                tracing::warn!(tool = capability.name(), "Write blocked: no confirmation");
                return DispatchOutcome::plain(
                    Some(capability),
                    ToolResult::error_with_code(
                        "confirmation_required",
                        format!(
                            "'{}' requires confirmation. Call render_form for this action and wait for the user's CONFIRMED: reply.",
                            capability.name()
                        ),
                    ),
                );
            };
            let params = apply_overrides(params, overrides);
            DispatchOutcome::plain(Some(capability), write::execute(capability, params, ctx).await)
        }
    }
}

/// Confirmed field values win over the model's arguments.
fn apply_overrides(params: Value, overrides: Map<String, Value>) -> Value {
    let mut merged = match params {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    merged.extend(overrides);
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use crate::tools::test_context as context;

    #[test]
    fn test_names_round_trip_and_are_unique() {
        for cap in Capability::ALL {
            assert_eq!(Capability::from_name(cap.name()), Some(cap));
        }
        let tools = ToolRegistry::new().ai_tools();
        let mut names: Vec<_> = tools.iter().map(|t| t.name.clone()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), Capability::ALL.len());
    }

    #[test]
    fn test_writes_require_form() {
        for cap in Capability::ALL {
            match cap.kind() {
                ToolKind::Write => {
                    assert_eq!(cap.requires(), Some(Capability::RenderForm));
                    assert!(cap.write_provider().is_some());
                }
                _ => assert_eq!(cap.requires(), None),
            }
        }
    }

    #[test]
    fn test_tool_result_envelopes() {
        let ok = ToolResult::success_data(json!({"n": 1}));
        assert_eq!(ok.to_value()["data"]["n"], 1);
        assert_eq!(ok.error_code(), None);

        let err = ToolResult::not_connected(Provider::GitHub);
        assert_eq!(err.error_code().as_deref(), Some("not_connected"));
        assert_eq!(
            err.to_value()["error"]["message"],
            "GitHub not connected. Connect GitHub in Settings first."
        );
    }

    #[test]
    fn test_parse_params_reports_invalid() {
        #[derive(Debug, Deserialize)]
        struct Params {
            #[allow(dead_code)]
            repo: String,
        }
        let err = parse_params::<Params>(json!({})).unwrap_err();
        assert_eq!(err.error_code().as_deref(), Some("invalid_parameters"));
        assert!(err.output.contains("Invalid parameters"));
    }

    #[test]
    fn test_overrides_win() {
        let mut overrides = Map::new();
        overrides.insert("title".into(), json!("Edited"));
        let merged = apply_overrides(json!({"title": "Draft", "repo": "a/b"}), overrides);
        assert_eq!(merged, json!({"title": "Edited", "repo": "a/b"}));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_tool_error() {
        let db = Database::in_memory().unwrap().shared();
        let outcome = ToolRegistry::new()
            .dispatch("delete_everything", json!({}), &context(&db, "http://127.0.0.1:9"))
            .await;
        assert_eq!(outcome.capability, None);
        assert_eq!(outcome.result.error_code().as_deref(), Some("unknown_tool"));
    }

    #[tokio::test]
    async fn test_render_returns_descriptor() {
        let db = Database::in_memory().unwrap().shared();
        let outcome = ToolRegistry::new()
            .dispatch(
                "render_signal_list",
                json!({"signals_json": "[{\"source\":\"github\",\"title\":\"Bug\"}]"}),
                &context(&db, "http://127.0.0.1:9"),
            )
            .await;
        let ui = outcome.ui.unwrap();
        assert_eq!(ui.component, "signal_list");
        assert_eq!(outcome.result.to_value()["props"]["signals"][0]["title"], "Bug");
    }

    #[tokio::test]
    async fn test_write_without_confirmation_is_blocked() {
        let server = httpmock::MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.path_includes("/");
                then.status(200);
            })
            .await;
        let db = Database::in_memory().unwrap().shared();
        let outcome = ToolRegistry::new()
            .dispatch(
                "post_slack_message",
                json!({"channel_id": "C1", "text": "hi"}),
                &context(&db, &server.base_url()),
            )
            .await;

        assert_eq!(
            outcome.result.error_code().as_deref(),
            Some("confirmation_required")
        );
        mock.assert_calls_async(0).await;
    }
}
