//! Linear adapter
//!
//! All team and project refs of one sync share a single GraphQL query.
//! Linear takes the raw token in `Authorization` (no `Bearer` prefix).

use serde_json::{json, Value};

use super::{
    array_items, id_at, json_at, names_at, parse_timestamp, str_at, str_field, DatasourceRef,
    DatasourceTarget, FetchOutcome, MalformedPayload, Provider, ProviderClient, ProviderError,
    Resource, Severity, Signal, SignalKind,
};

const BODY_LIMIT: usize = 2000;

const ISSUE_FIELDS: &str = "id title description url priority createdAt
        state { name }
        assignee { name }
        team { id name }
        project { id name }
        labels { nodes { name } }";

/// POST a GraphQL document. A non-empty `errors` array is a rejection.
async fn graphql(
    client: &ProviderClient,
    token: &str,
    query: &str,
    variables: Value,
) -> Result<Value, ProviderError> {
    let request = client
        .http()
        .post(&client.endpoints().linear)
        .header(reqwest::header::AUTHORIZATION, token)
        .json(&json!({ "query": query, "variables": variables }));
    let body = client.send_json(Provider::Linear, request).await?;

    if let Some(first) = body.get("errors").and_then(|e| e.get(0)) {
        return Err(ProviderError::Rejected {
            provider: Provider::Linear,
            message: str_field(first, "message").unwrap_or_else(|| "mutation failed".into()),
        });
    }
    Ok(body)
}

/// Split refs into team ids and project ids.
fn partition(refs: &[DatasourceRef]) -> (Vec<String>, Vec<String>) {
    let mut teams = Vec::new();
    let mut projects = Vec::new();
    for r in refs {
        match r.target() {
            DatasourceTarget::Team(id) => teams.push(id.clone()),
            DatasourceTarget::Project(id) => projects.push(id.clone()),
            _ => {}
        }
    }
    (teams, projects)
}

/// Build the issues query for whichever of the two id lists is non-empty.
fn issues_query(has_teams: bool, has_projects: bool) -> String {
    let mut params = Vec::new();
    let mut filters = Vec::new();
    if has_teams {
        params.push("$teamIds: [ID!]");
        filters.push("{ team: { id: { in: $teamIds } } }");
    }
    if has_projects {
        params.push("$projectIds: [ID!]");
        filters.push("{ project: { id: { in: $projectIds } } }");
    }
    format!(
        "query RecentIssues({}) {{
  issues(first: 20, orderBy: updatedAt, filter: {{ or: [{}] }}) {{
    nodes {{ {ISSUE_FIELDS} }}
  }}
}}",
        params.join(", "),
        filters.join(", ")
    )
}

pub async fn list_recent(
    client: &ProviderClient,
    token: &str,
    refs: &[DatasourceRef],
) -> FetchOutcome {
    let (teams, projects) = partition(refs);
    if teams.is_empty() && projects.is_empty() {
        return FetchOutcome::default();
    }

    let query = issues_query(!teams.is_empty(), !projects.is_empty());
    let mut variables = serde_json::Map::new();
    if !teams.is_empty() {
        variables.insert("teamIds".into(), json!(teams));
    }
    if !projects.is_empty() {
        variables.insert("projectIds".into(), json!(projects));
    }

    let result = graphql(client, token, &query, Value::Object(variables)).await;
    let mut outcome = FetchOutcome::default();
    if let Some(body) = outcome.take(Provider::Linear, "issues", refs[0].as_str(), result) {
        outcome.signals = normalize_issues(&body, refs);
    }
    outcome
}

/// Attribute each issue to a datasource: its team if selected, else its
/// project if selected, else the first ref of the group.
pub fn normalize_issues(body: &Value, refs: &[DatasourceRef]) -> Vec<Signal> {
    let fallback = refs.first().map(DatasourceRef::as_str);

    array_items(&body["data"]["issues"]["nodes"])
        .filter_map(|issue| {
            let id = id_at(issue, "/id")?;
            let datasource = str_at(issue, "/team/id")
                .and_then(|team| ref_for(refs, &DatasourceTarget::Team(team)))
                .or_else(|| {
                    str_at(issue, "/project/id")
                        .and_then(|project| ref_for(refs, &DatasourceTarget::Project(project)))
                })
                .or(fallback);

            Some(
                Signal::new(Provider::Linear, SignalKind::Ticket, format!("linear-{id}"))
                    .with_severity(Severity::from_priority(
                        issue.get("priority").and_then(Value::as_i64),
                    ))
                    .with_title(str_field(issue, "title"))
                    .with_body(str_field(issue, "description"), BODY_LIMIT)
                    .with_url(str_field(issue, "url"))
                    .with_datasource(datasource)
                    .with_source_ts(str_field(issue, "createdAt").and_then(|t| parse_timestamp(&t)))
                    .meta("assignee", json_at(issue, "/assignee/name"))
                    .meta("status", json_at(issue, "/state/name"))
                    .meta("labels", names_at(issue, "/labels/nodes", "name"))
                    .meta("team", json_at(issue, "/team/name"))
                    .meta("project", json_at(issue, "/project/name")),
            )
        })
        .collect()
}

fn ref_for<'r>(refs: &'r [DatasourceRef], target: &DatasourceTarget) -> Option<&'r str> {
    refs.iter()
        .find(|r| r.target() == target)
        .map(DatasourceRef::as_str)
}

/// Issue webhook: the issue lives under `data`, its URL at the top level.
pub fn normalize_webhook(payload: &Value) -> Result<Signal, MalformedPayload> {
    let data = payload
        .get("data")
        .ok_or_else(|| MalformedPayload("linear payload has no data".into()))?;
    let id = id_at(data, "/id")
        .ok_or_else(|| MalformedPayload("linear payload data has no id".into()))?;

    Ok(Signal::new(Provider::Linear, SignalKind::Ticket, format!("linear-{id}"))
        .with_severity(Severity::from_priority(
            data.get("priority").and_then(Value::as_i64),
        ))
        .with_title(str_field(data, "title"))
        .with_body(str_field(data, "description"), BODY_LIMIT)
        .with_url(str_field(payload, "url"))
        .with_source_ts(str_field(data, "createdAt").and_then(|t| parse_timestamp(&t)))
        .meta("assignee", json_at(data, "/assignee/name"))
        .meta("status", json_at(data, "/state/name"))
        .meta("labels", names_at(data, "/labels", "name")))
}

/// Create an issue. `linear_id` may be a team or a project; a project is
/// resolved to its first team, anything else is used as a team id.
pub async fn create_issue(
    client: &ProviderClient,
    token: &str,
    linear_id: &str,
    title: &str,
    description: &str,
    priority: Option<i64>,
) -> Result<Value, ProviderError> {
    let team_id = match graphql(
        client,
        token,
        "query ProjectTeam($id: String!) { project(id: $id) { id teams(first: 1) { nodes { id name } } } }",
        json!({ "id": linear_id }),
    )
    .await
    {
        Ok(body) => str_at(&body, "/data/project/teams/nodes/0/id"),
        Err(e) => {
            tracing::debug!(linear_id, error = %e, "Not a project id; using as team id");
            None
        }
    }
    .unwrap_or_else(|| linear_id.to_string());

    let body = graphql(
        client,
        token,
        "mutation CreateIssue($teamId: String!, $title: String!, $description: String, $priority: Int) {
  issueCreate(input: { teamId: $teamId, title: $title, description: $description, priority: $priority }) {
    success
    issue { id identifier title url state { name } priority }
  }
}",
        json!({
            "teamId": team_id,
            "title": title,
            "description": description,
            "priority": priority,
        }),
    )
    .await?;

    body.pointer("/data/issueCreate/issue")
        .filter(|issue| !issue.is_null())
        .cloned()
        .ok_or_else(|| ProviderError::Rejected {
            provider: Provider::Linear,
            message: "No issue returned".into(),
        })
}

pub async fn list_resources(
    client: &ProviderClient,
    token: &str,
) -> Result<Vec<Resource>, ProviderError> {
    let body = graphql(
        client,
        token,
        "query Resources { teams { nodes { id name } } projects { nodes { id name } } }",
        json!({}),
    )
    .await?;

    let mut resources = Vec::new();
    for (collection, kind) in [("teams", "team"), ("projects", "project")] {
        for node in array_items(&body["data"][collection]["nodes"]) {
            let Some(id) = str_field(node, "id") else {
                continue;
            };
            resources.push(Resource {
                id: format!("linear:{kind}:{id}"),
                provider: Provider::Linear,
                label: format!(
                    "{} ({kind})",
                    str_field(node, "name").unwrap_or_else(|| id.clone())
                ),
                kind: kind.into(),
            });
        }
    }
    Ok(resources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::{http_client, ProviderEndpoints};
    use httpmock::prelude::*;

    fn client(server: &MockServer) -> ProviderClient {
        ProviderClient::new(http_client().unwrap(), ProviderEndpoints::under(&server.base_url()))
    }

    fn refs(raw: &[&str]) -> Vec<DatasourceRef> {
        raw.iter().map(|r| DatasourceRef::parse(r).unwrap()).collect()
    }

    #[test]
    fn test_query_only_declares_used_variables() {
        let q = issues_query(true, false);
        assert!(q.contains("$teamIds: [ID!]"));
        assert!(!q.contains("$projectIds"));

        let q = issues_query(true, true);
        assert!(q.contains("{ project: { id: { in: $projectIds } } }"));
    }

    #[test]
    fn test_issue_attribution_and_severity() {
        let body = json!({"data": {"issues": {"nodes": [
            {"id": "i1", "title": "Crash", "priority": 1, "team": {"id": "T1", "name": "Core"}},
            {"id": "i2", "title": "Polish", "priority": 2, "team": {"id": "T9"}, "project": {"id": "P1"}},
            {"id": "i3", "title": "Someday", "team": {"id": "T9"}},
        ]}}});
        let refs = refs(&["linear:project:P1", "linear:team:T1"]);
        let signals = normalize_issues(&body, &refs);

        assert_eq!(signals[0].datasource_ref.as_deref(), Some("linear:team:T1"));
        assert_eq!(signals[0].severity, Some(Severity::High));
        assert_eq!(signals[1].datasource_ref.as_deref(), Some("linear:project:P1"));
        assert_eq!(signals[1].severity, Some(Severity::Medium));
        assert_eq!(signals[2].datasource_ref.as_deref(), Some("linear:project:P1"));
        assert_eq!(signals[2].severity, Some(Severity::Low));
        assert_eq!(signals[2].metadata["assignee"], Value::Null);
        assert_eq!(signals[0].external_id, "linear-i1");
    }

    #[test]
    fn test_webhook_shape() {
        let payload = json!({
            "url": "https://linear.app/acme/issue/ENG-1",
            "data": {"id": "i1", "title": "Crash", "priority": 0,
                     "labels": [{"name": "bug"}], "state": {"name": "Todo"}}
        });
        let signal = normalize_webhook(&payload).unwrap();
        assert_eq!(signal.external_id, "linear-i1");
        assert_eq!(signal.severity, Some(Severity::High));
        assert_eq!(signal.url.as_deref(), Some("https://linear.app/acme/issue/ENG-1"));
        assert_eq!(signal.metadata["labels"], json!(["bug"]));

        assert!(normalize_webhook(&json!({"data": {"title": "x"}})).is_err());
    }

    #[tokio::test]
    async fn test_list_recent_sends_raw_token_and_variables() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/linear/graphql")
                    .header("authorization", "lin_api_key")
                    .body_includes("\"teamIds\":[\"T1\"]");
                then.status(200).json_body(json!({"data": {"issues": {"nodes": [
                    {"id": "i1", "title": "Crash", "priority": 1, "team": {"id": "T1"}}
                ]}}}));
            })
            .await;

        let outcome =
            list_recent(&client(&server), "lin_api_key", &refs(&["linear:team:T1"])).await;
        mock.assert_async().await;
        assert_eq!(outcome.signals.len(), 1);
        assert!(outcome.failures.is_empty());
    }

    #[tokio::test]
    async fn test_create_issue_resolves_project_to_team() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/linear/graphql")
                    .body_includes("ProjectTeam");
                then.status(200).json_body(json!({"data": {"project": {
                    "id": "P1", "teams": {"nodes": [{"id": "T7", "name": "Core"}]}
                }}}));
            })
            .await;
        let create = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/linear/graphql")
                    .body_includes("issueCreate")
                    .body_includes("\"teamId\":\"T7\"");
                then.status(200).json_body(json!({"data": {"issueCreate": {
                    "success": true,
                    "issue": {"id": "i9", "identifier": "ENG-9", "title": "New"}
                }}}));
            })
            .await;

        let issue = create_issue(&client(&server), "tok", "P1", "New", "", Some(2))
            .await
            .unwrap();
        create.assert_async().await;
        assert_eq!(issue["identifier"], "ENG-9");
    }

    #[tokio::test]
    async fn test_create_issue_reports_graphql_errors() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/linear/graphql");
                then.status(200)
                    .json_body(json!({"errors": [{"message": "Team not found"}]}));
            })
            .await;

        let err = create_issue(&client(&server), "tok", "T404", "New", "", None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Linear error: Team not found");
    }
}
