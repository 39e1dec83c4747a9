//! Datastore read tools
//!
//! `update_artifact` lives here too: it edits the scope's own outputs and
//! has no external side effect, so it needs no confirmation.

use serde::Deserialize;
use serde_json::{json, Value};

use super::registry::{parse_params, Capability, ToolContext, ToolResult};
use crate::integrations::Provider;
use crate::storage::{Artifact, ArtifactPatch, ArtifactStore, ScopeStore, SignalQuery, SignalStore};

const SEARCH_LIMIT: usize = 20;
const SCOPE_SIGNAL_LIMIT: usize = 50;
const ARTIFACT_LIST_LIMIT: usize = 20;

#[derive(Deserialize)]
struct SearchParams {
    #[serde(default)]
    scope_id: Option<String>,
    query: String,
}

#[derive(Deserialize)]
struct ScopeParams {
    #[serde(default)]
    scope_id: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    kind: Option<String>,
}

#[derive(Deserialize)]
struct ArtifactParams {
    artifact_id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    status: Option<String>,
}

/// Empty strings mean "not given".
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

pub(super) fn execute(capability: Capability, params: Value, ctx: &ToolContext) -> ToolResult {
    let result = match capability {
        Capability::SearchSignals => search_signals(params, ctx),
        Capability::GetSignalsByScope => signals_by_scope(params, ctx),
        Capability::GetScopeDatasources => scope_datasources(params, ctx),
        Capability::ListArtifacts => list_artifacts(params, ctx),
        Capability::GetArtifact => get_artifact(params, ctx),
        Capability::UpdateArtifact => update_artifact(params, ctx),
        other => Err(ToolResult::error_with_code(
            "tool_error",
            format!("'{}' is not a datastore tool", other.name()),
        )),
    };
    result.unwrap_or_else(|e| e)
}

fn storage_error(err: anyhow::Error) -> ToolResult {
    tracing::error!("Tool storage error: {:#}", err);
    ToolResult::error_with_code("tool_error", format!("{err:#}"))
}

fn search_signals(params: Value, ctx: &ToolContext) -> Result<ToolResult, ToolResult> {
    let params: SearchParams = parse_params(params)?;
    let scope_id = ctx.scope(params.scope_id.as_deref())?;
    let db = ctx.db.lock();
    let signals = SignalStore::new(&db)
        .search(scope_id, &params.query, SEARCH_LIMIT)
        .map_err(storage_error)?;
    Ok(ToolResult::success_data(json!(signals)))
}

fn signals_by_scope(params: Value, ctx: &ToolContext) -> Result<ToolResult, ToolResult> {
    let params: ScopeParams = parse_params(params)?;
    let scope_id = ctx.scope(params.scope_id.as_deref())?;
    let source = match non_empty(params.source) {
        Some(raw) => Some(
            raw.parse::<Provider>()
                .map_err(ToolResult::invalid_parameters)?,
        ),
        None => None,
    };

    let query = SignalQuery {
        source,
        limit: SCOPE_SIGNAL_LIMIT,
        ..SignalQuery::for_scope(scope_id)
    };
    let db = ctx.db.lock();
    let signals = SignalStore::new(&db).list(&query).map_err(storage_error)?;
    Ok(ToolResult::success_data(json!(signals)))
}

fn scope_datasources(params: Value, ctx: &ToolContext) -> Result<ToolResult, ToolResult> {
    let params: ScopeParams = parse_params(params)?;
    let scope_id = ctx.scope(params.scope_id.as_deref())?;
    let db = ctx.db.lock();
    let scope = ScopeStore::new(&db).get(scope_id).map_err(storage_error)?;

    let datasources: Vec<Value> = scope
        .map(|s| s.datasources)
        .unwrap_or_default()
        .into_iter()
        .map(|raw| {
            let (provider, resource) = raw.split_once(':').unwrap_or((raw.as_str(), ""));
            json!({ "ref": raw, "provider": provider, "resource": resource })
        })
        .collect();
    Ok(ToolResult::success_data(json!({ "datasources": datasources })))
}

fn list_artifacts(params: Value, ctx: &ToolContext) -> Result<ToolResult, ToolResult> {
    let params: ScopeParams = parse_params(params)?;
    let scope_id = ctx.scope(params.scope_id.as_deref())?;
    let kind = non_empty(params.kind);
    let db = ctx.db.lock();
    let artifacts = ArtifactStore::new(&db)
        .list(scope_id, kind.as_deref(), ARTIFACT_LIST_LIMIT)
        .map_err(storage_error)?;

    let summaries: Vec<Value> = artifacts
        .iter()
        .map(|a| {
            json!({
                "id": a.id,
                "kind": a.kind,
                "title": a.title,
                "status": a.status,
                "created_at": a.created_at,
                "updated_at": a.updated_at,
            })
        })
        .collect();
    Ok(ToolResult::success_data(json!(summaries)))
}

/// Load an artifact that belongs to the context scope.
fn owned_artifact(store: &ArtifactStore, id: &str, ctx: &ToolContext) -> Result<Artifact, ToolResult> {
    match store.get(id).map_err(storage_error)? {
        Some(artifact) if artifact.scope_id == ctx.scope_id => Ok(artifact),
        _ => Err(ToolResult::error_with_code(
            "not_found",
            format!("Artifact not found: {id}"),
        )),
    }
}

fn get_artifact(params: Value, ctx: &ToolContext) -> Result<ToolResult, ToolResult> {
    let params: ArtifactParams = parse_params(params)?;
    let db = ctx.db.lock();
    let artifact = owned_artifact(&ArtifactStore::new(&db), &params.artifact_id, ctx)?;
    Ok(ToolResult::success_data(json!(artifact)))
}

fn update_artifact(params: Value, ctx: &ToolContext) -> Result<ToolResult, ToolResult> {
    let params: ArtifactParams = parse_params(params)?;
    let content = match params.content {
        Some(Value::String(raw)) if raw.trim().is_empty() => None,
        // Content that is not JSON is stored as a string.
        Some(Value::String(raw)) => Some(serde_json::from_str(&raw).unwrap_or(Value::String(raw))),
        Some(Value::Null) | None => None,
        Some(other) => Some(other),
    };
    let patch = ArtifactPatch {
        title: non_empty(params.title),
        content,
        status: non_empty(params.status),
    };

    let db = ctx.db.lock();
    let store = ArtifactStore::new(&db);
    owned_artifact(&store, &params.artifact_id, ctx)?;
    let updated = store
        .update(&params.artifact_id, &patch)
        .map_err(storage_error)?;
    Ok(ToolResult::success_data(json!(updated)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::{Signal, SignalKind};
    use crate::storage::Database;
    use crate::tools::test_context;

    fn seeded() -> ToolContext {
        let db = Database::in_memory().unwrap().shared();
        {
            let conn = db.lock();
            let signals = SignalStore::new(&conn);
            for (id, source, title) in [
                ("github-issue-1", Provider::GitHub, "Checkout fails on Safari"),
                ("slack-C1-1.0", Provider::Slack, "checkout is down again"),
                ("linear-L1", Provider::Linear, "Onboarding polish"),
            ] {
                let signal = Signal::new(source, SignalKind::Ticket, id).with_title(Some(title.into()));
                signals.insert("s1", &signal).unwrap();
            }
            let other = Signal::new(Provider::GitHub, SignalKind::Ticket, "github-issue-9")
                .with_title(Some("Checkout in other scope".into()));
            signals.insert("s2", &other).unwrap();
        }
        test_context(&db, "http://127.0.0.1:9")
    }

    #[test]
    fn test_search_is_confined_to_scope() {
        let ctx = seeded();
        let result = execute(Capability::SearchSignals, json!({"query": "checkout"}), &ctx);
        let data = result.to_value()["data"].clone();
        assert_eq!(data.as_array().unwrap().len(), 2);

        let denied = execute(
            Capability::SearchSignals,
            json!({"scope_id": "s2", "query": "checkout"}),
            &ctx,
        );
        assert_eq!(denied.error_code().as_deref(), Some("access_denied"));
    }

    #[test]
    fn test_signals_by_scope_filters_source() {
        let ctx = seeded();
        let all = execute(Capability::GetSignalsByScope, json!({"source": ""}), &ctx);
        assert_eq!(all.to_value()["data"].as_array().unwrap().len(), 3);

        let slack = execute(Capability::GetSignalsByScope, json!({"source": "slack"}), &ctx);
        let data = slack.to_value()["data"].clone();
        assert_eq!(data.as_array().unwrap().len(), 1);
        assert_eq!(data[0]["source"], "slack");

        let bad = execute(Capability::GetSignalsByScope, json!({"source": "jira"}), &ctx);
        assert_eq!(bad.error_code().as_deref(), Some("invalid_parameters"));
    }

    #[test]
    fn test_scope_datasources_split_refs() {
        let ctx = seeded();
        ctx.db.lock().conn().execute(
            "INSERT INTO scopes (id, owner, name, datasources, created_at, updated_at)
             VALUES ('s1', 'u1', 'Checkout', '[\"github:acme/api\",\"linear:project:P1\"]', '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
            [],
        ).unwrap();

        let result = execute(Capability::GetScopeDatasources, json!({}), &ctx);
        let list = result.to_value()["data"]["datasources"].clone();
        assert_eq!(
            list,
            json!([
                {"ref": "github:acme/api", "provider": "github", "resource": "acme/api"},
                {"ref": "linear:project:P1", "provider": "linear", "resource": "project:P1"}
            ])
        );
    }

    #[test]
    fn test_update_artifact_empty_means_unchanged() {
        let ctx = seeded();
        let artifact = {
            let db = ctx.db.lock();
            ArtifactStore::new(&db)
                .create("s1", "draft", "PRD", &json!({"sections": []}), "draft")
                .unwrap()
        };

        let result = execute(
            Capability::UpdateArtifact,
            json!({"artifact_id": artifact.id, "title": "", "content": "", "status": "final"}),
            &ctx,
        );
        let data = result.to_value()["data"].clone();
        assert_eq!(data["title"], "PRD");
        assert_eq!(data["status"], "final");
        assert_eq!(data["content"], json!({"sections": []}));

        let listed = execute(Capability::ListArtifacts, json!({"kind": "draft"}), &ctx);
        assert_eq!(listed.to_value()["data"][0]["status"], "final");
    }

    #[test]
    fn test_artifact_from_other_scope_is_not_found() {
        let ctx = seeded();
        let foreign = {
            let db = ctx.db.lock();
            ArtifactStore::new(&db)
                .create("s2", "synthesis", "Other", &json!({}), "draft")
                .unwrap()
        };
        let result = execute(Capability::GetArtifact, json!({"artifact_id": foreign.id}), &ctx);
        assert_eq!(result.error_code().as_deref(), Some("not_found"));
    }
}
