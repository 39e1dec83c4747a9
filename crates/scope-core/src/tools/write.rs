//! Write tools
//!
//! Only reachable through [`super::ToolRegistry::dispatch`] after the
//! write guard has released a confirmed authorization.

use serde::Deserialize;
use serde_json::Value;

use super::live::token;
use super::registry::{parse_params, Capability, ToolContext, ToolResult};
use crate::integrations::{github, linear, notion, slack, Provider};

#[derive(Deserialize)]
struct LinearIssueParams {
    linear_id: String,
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    priority: Option<Value>,
}

#[derive(Deserialize)]
struct SlackMessageParams {
    channel_id: String,
    text: String,
}

#[derive(Deserialize)]
struct GithubIssueParams {
    repo: String,
    title: String,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Deserialize)]
struct NotionPageParams {
    database_id: String,
    title: String,
    #[serde(default)]
    content: Option<String>,
}

/// Priority as a number or numeric string; anything else is unset.
fn priority(raw: Option<Value>) -> Option<i64> {
    match raw? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(super) async fn execute(capability: Capability, params: Value, ctx: &ToolContext) -> ToolResult {
    let result = match capability {
        Capability::CreateLinearIssue => create_linear_issue(params, ctx).await,
        Capability::PostSlackMessage => post_slack_message(params, ctx).await,
        Capability::CreateGithubIssue => create_github_issue(params, ctx).await,
        Capability::CreateNotionPage => create_notion_page(params, ctx).await,
        other => Err(ToolResult::error_with_code(
            "tool_error",
            format!("'{}' is not a write tool", other.name()),
        )),
    };
    match &result {
        Ok(_) => tracing::info!(tool = capability.name(), "Write executed"),
        Err(e) => tracing::warn!(tool = capability.name(), output = %e.output, "Write failed"),
    }
    result.unwrap_or_else(|e| e)
}

async fn create_linear_issue(params: Value, ctx: &ToolContext) -> Result<ToolResult, ToolResult> {
    let params: LinearIssueParams = parse_params(params)?;
    let token = token(ctx, Provider::Linear).await?;
    let issue = linear::create_issue(
        &ctx.client,
        &token,
        &params.linear_id,
        &params.title,
        params.description.as_deref().unwrap_or_default(),
        priority(params.priority),
    )
    .await?;
    Ok(ToolResult::success_data(issue))
}

async fn post_slack_message(params: Value, ctx: &ToolContext) -> Result<ToolResult, ToolResult> {
    let params: SlackMessageParams = parse_params(params)?;
    let token = token(ctx, Provider::Slack).await?;
    let posted = slack::post_message(&ctx.client, &token, &params.channel_id, &params.text).await?;
    Ok(ToolResult::success_data(posted))
}

async fn create_github_issue(params: Value, ctx: &ToolContext) -> Result<ToolResult, ToolResult> {
    let params: GithubIssueParams = parse_params(params)?;
    let token = token(ctx, Provider::GitHub).await?;
    let issue = github::create_issue(
        &ctx.client,
        &token,
        &params.repo,
        &params.title,
        params.body.as_deref().unwrap_or_default(),
    )
    .await?;
    Ok(ToolResult::success_data(issue))
}

async fn create_notion_page(params: Value, ctx: &ToolContext) -> Result<ToolResult, ToolResult> {
    let params: NotionPageParams = parse_params(params)?;
    let token = token(ctx, Provider::Notion).await?;
    let page = notion::create_page(
        &ctx.client,
        &token,
        &params.database_id,
        &params.title,
        params.content.as_deref().unwrap_or_default(),
    )
    .await?;
    Ok(ToolResult::success_data(page))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ConnectionStore, Credential, Database};
    use crate::tools::test_context;
    use httpmock::prelude::*;
    use serde_json::json;

    #[test]
    fn test_priority_accepts_numbers_and_strings() {
        assert_eq!(priority(Some(json!(2))), Some(2));
        assert_eq!(priority(Some(json!(" 3 "))), Some(3));
        assert_eq!(priority(Some(json!(""))), None);
        assert_eq!(priority(None), None);
    }

    #[tokio::test]
    async fn test_github_issue_posts_to_repo() {
        let server = MockServer::start_async().await;
        let create = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/github/repos/acme/api/issues")
                    .header("authorization", "Bearer gho-1")
                    .json_body(json!({"title": "Safari crash", "body": ""}));
                then.status(201).json_body(json!({
                    "id": 100, "number": 12, "title": "Safari crash",
                    "html_url": "https://github.com/acme/api/issues/12", "state": "open"
                }));
            })
            .await;

        let db = Database::in_memory().unwrap().shared();
        ConnectionStore::new(&db.lock())
            .upsert(&Credential {
                user_id: "u1".into(),
                provider: Provider::GitHub,
                access_token: "gho-1".into(),
                refresh_token: None,
                expires_at: None,
                scope: None,
                metadata: json!({}),
            })
            .unwrap();

        let result = execute(
            Capability::CreateGithubIssue,
            json!({"repo": "acme/api", "title": "Safari crash"}),
            &test_context(&db, &server.base_url()),
        )
        .await;

        create.assert_async().await;
        assert_eq!(result.to_value()["data"]["number"], 12);
    }

    #[tokio::test]
    async fn test_provider_failure_is_provider_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/slack/chat.postMessage");
                then.status(200)
                    .json_body(json!({"ok": false, "error": "channel_not_found"}));
            })
            .await;

        let db = Database::in_memory().unwrap().shared();
        ConnectionStore::new(&db.lock())
            .upsert(&Credential {
                user_id: "u1".into(),
                provider: Provider::Slack,
                access_token: "xoxb-1".into(),
                refresh_token: None,
                expires_at: None,
                scope: None,
                metadata: json!({}),
            })
            .unwrap();

        let result = execute(
            Capability::PostSlackMessage,
            json!({"channel_id": "C404", "text": "hi"}),
            &test_context(&db, &server.base_url()),
        )
        .await;
        assert_eq!(result.error_code().as_deref(), Some("provider_error"));
        assert_eq!(
            result.to_value()["error"]["message"],
            "Slack error: channel_not_found"
        );
    }
}
