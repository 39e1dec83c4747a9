//! Live provider reads
//!
//! Each call fetches a fresh token through the token manager, then hands
//! off to the adapter's query function.

use serde::Deserialize;
use serde_json::Value;

use super::registry::{parse_params, Capability, ToolContext, ToolResult};
use crate::integrations::{github, notion, slack, Provider};

#[derive(Deserialize)]
struct GithubParams {
    repo: String,
    #[serde(default)]
    endpoint: String,
}

#[derive(Deserialize)]
struct SlackParams {
    channel_id: String,
    #[serde(default)]
    query: Option<String>,
}

#[derive(Deserialize)]
struct NotionParams {
    page_id: String,
}

pub(super) async fn execute(capability: Capability, params: Value, ctx: &ToolContext) -> ToolResult {
    let result = match capability {
        Capability::QueryGithub => query_github(params, ctx).await,
        Capability::QuerySlack => query_slack(params, ctx).await,
        Capability::QueryNotion => query_notion(params, ctx).await,
        other => Err(ToolResult::error_with_code(
            "tool_error",
            format!("'{}' is not a live query tool", other.name()),
        )),
    };
    result.unwrap_or_else(|e| e)
}

pub(super) async fn token(ctx: &ToolContext, provider: Provider) -> Result<String, ToolResult> {
    ctx.tokens
        .get_valid_token(&ctx.user_id, provider)
        .await
        .map_err(ToolResult::from)
}

async fn query_github(params: Value, ctx: &ToolContext) -> Result<ToolResult, ToolResult> {
    let params: GithubParams = parse_params(params)?;
    let token = token(ctx, Provider::GitHub).await?;
    let data = github::query(&ctx.client, &token, &params.repo, &params.endpoint).await?;
    Ok(ToolResult::success_data(data))
}

async fn query_slack(params: Value, ctx: &ToolContext) -> Result<ToolResult, ToolResult> {
    let params: SlackParams = parse_params(params)?;
    let token = token(ctx, Provider::Slack).await?;
    let data = slack::query(&ctx.client, &token, &params.channel_id, params.query.as_deref()).await?;
    Ok(ToolResult::success_data(data))
}

async fn query_notion(params: Value, ctx: &ToolContext) -> Result<ToolResult, ToolResult> {
    let params: NotionParams = parse_params(params)?;
    let token = token(ctx, Provider::Notion).await?;
    let data = notion::query(&ctx.client, &token, &params.page_id).await?;
    Ok(ToolResult::success_data(data))
}
