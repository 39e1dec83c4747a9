//! GitHub adapter
//!
//! Per repository, five endpoints are fetched concurrently: issues, pulls,
//! commits, README and repository metadata. Each endpoint succeeds or fails
//! on its own. The issues endpoint also returns pull requests; those are
//! dropped there and picked up from the pulls endpoint instead.

use reqwest::RequestBuilder;
use serde_json::{json, Map, Value};

use super::{
    array_items, decode_base64_lossy, id_at, json_at, names_at, parse_timestamp, str_at,
    str_field, truncate_chars, FetchOutcome, MalformedPayload, Provider, ProviderClient,
    ProviderError, Resource, Signal, SignalKind,
};

const ACCEPT: &str = "application/vnd.github+json";
const BODY_LIMIT: usize = 2000;
const README_LIMIT: usize = 4000;
const COMMIT_TITLE_LIMIT: usize = 200;
const DECODED_CONTENT_LIMIT: usize = 8000;
const LIVE_ARRAY_LIMIT: usize = 30;
const TREE_LIMIT: usize = 100;

fn get(client: &ProviderClient, token: &str, url: String) -> RequestBuilder {
    client
        .http()
        .get(url)
        .bearer_auth(token)
        .header(reqwest::header::ACCEPT, ACCEPT)
}

fn repo_url(client: &ProviderClient, repo: &str) -> String {
    format!("{}/repos/{}", client.endpoints().github, repo)
}

pub async fn list_recent(
    client: &ProviderClient,
    token: &str,
    repo: &str,
    datasource: &str,
) -> FetchOutcome {
    let base = repo_url(client, repo);
    let listing = [
        ("state", "all"),
        ("sort", "updated"),
        ("per_page", "10"),
        ("direction", "desc"),
    ];

    let (issues, pulls, commits, readme, metadata) = tokio::join!(
        client.send_json(
            Provider::GitHub,
            get(client, token, format!("{base}/issues")).query(&listing)
        ),
        client.send_json(
            Provider::GitHub,
            get(client, token, format!("{base}/pulls")).query(&listing)
        ),
        client.send_json(
            Provider::GitHub,
            get(client, token, format!("{base}/commits")).query(&[("per_page", "30")])
        ),
        client.send_json(Provider::GitHub, get(client, token, format!("{base}/readme"))),
        client.send_json(Provider::GitHub, get(client, token, base.clone())),
    );

    let mut outcome = FetchOutcome::default();
    if let Some(issues) = outcome.take(Provider::GitHub, "issues", repo, issues) {
        outcome.signals.extend(normalize_issues(&issues, repo, datasource));
    }
    if let Some(pulls) = outcome.take(Provider::GitHub, "pulls", repo, pulls) {
        outcome.signals.extend(normalize_pulls(&pulls, repo, datasource));
    }
    if let Some(commits) = outcome.take(Provider::GitHub, "commits", repo, commits) {
        outcome.signals.extend(normalize_commits(&commits, repo, datasource));
    }
    if let Some(readme) = outcome.take(Provider::GitHub, "readme", repo, readme) {
        outcome.signals.push(normalize_readme(&readme, repo, datasource));
    }
    if let Some(metadata) = outcome.take(Provider::GitHub, "repo", repo, metadata) {
        outcome.signals.extend(normalize_repo(&metadata, datasource));
    }

    tracing::debug!(repo, count = outcome.signals.len(), "Fetched GitHub signals");
    outcome
}

pub fn normalize_issues(issues: &Value, repo: &str, datasource: &str) -> Vec<Signal> {
    array_items(issues)
        .filter(|issue| issue.get("pull_request").is_none())
        .filter_map(|issue| {
            let id = id_at(issue, "/id")?;
            Some(
                Signal::new(Provider::GitHub, SignalKind::Ticket, format!("github-issue-{id}"))
                    .with_title(str_field(issue, "title"))
                    .with_body(str_field(issue, "body"), BODY_LIMIT)
                    .with_url(str_field(issue, "html_url"))
                    .with_datasource(Some(datasource))
                    .with_source_ts(str_field(issue, "created_at").and_then(|t| parse_timestamp(&t)))
                    .meta("author", json_at(issue, "/user/login"))
                    .meta("repo", repo)
                    .meta("labels", names_at(issue, "/labels", "name")),
            )
        })
        .collect()
}

pub fn normalize_pulls(pulls: &Value, repo: &str, datasource: &str) -> Vec<Signal> {
    array_items(pulls)
        .filter_map(|pr| {
            let id = id_at(pr, "/id")?;
            Some(
                Signal::new(Provider::GitHub, SignalKind::Pr, format!("github-pr-{id}"))
                    .with_title(str_field(pr, "title"))
                    .with_body(str_field(pr, "body"), BODY_LIMIT)
                    .with_url(str_field(pr, "html_url"))
                    .with_datasource(Some(datasource))
                    .with_source_ts(str_field(pr, "created_at").and_then(|t| parse_timestamp(&t)))
                    .meta("author", json_at(pr, "/user/login"))
                    .meta("repo", repo)
                    .meta("state", json_at(pr, "/state"))
                    .meta("merged", json_at(pr, "/merged")),
            )
        })
        .collect()
}

pub fn normalize_commits(commits: &Value, repo: &str, datasource: &str) -> Vec<Signal> {
    array_items(commits)
        .filter_map(|commit| {
            let sha = str_field(commit, "sha")?;
            let message = str_at(commit, "/commit/message").unwrap_or_default();
            let title = truncate_chars(message.lines().next().unwrap_or_default(), COMMIT_TITLE_LIMIT);
            let author = str_at(commit, "/commit/author/name")
                .or_else(|| str_at(commit, "/author/login"));

            Some(
                Signal::new(Provider::GitHub, SignalKind::Commit, format!("github-commit-{sha}"))
                    .with_title(Some(title))
                    .with_body(Some(message), BODY_LIMIT)
                    .with_url(str_field(commit, "html_url"))
                    .with_datasource(Some(datasource))
                    .with_source_ts(
                        str_at(commit, "/commit/author/date").and_then(|t| parse_timestamp(&t)),
                    )
                    .meta("author", author)
                    .meta("sha", sha)
                    .meta("repo", repo),
            )
        })
        .collect()
}

pub fn normalize_readme(readme: &Value, repo: &str, datasource: &str) -> Signal {
    let content = str_field(readme, "content").and_then(|c| decode_base64_lossy(&c));

    Signal::new(
        Provider::GitHub,
        SignalKind::Doc,
        format!("github-readme-{}", repo.replacen('/', "-", 1)),
    )
    .with_title(Some(format!("README — {repo}")))
    .with_body(content, README_LIMIT)
    .with_url(str_field(readme, "html_url"))
    .with_datasource(Some(datasource))
    .meta("repo", repo)
    .meta("path", json_at(readme, "/path"))
}

pub fn normalize_repo(metadata: &Value, datasource: &str) -> Option<Signal> {
    let id = id_at(metadata, "/id")?;
    let mut meta = Map::new();
    for (key, pointer) in [
        ("language", "/language"),
        ("stars", "/stargazers_count"),
        ("forks", "/forks_count"),
        ("topics", "/topics"),
        ("default_branch", "/default_branch"),
        ("open_issues_count", "/open_issues_count"),
        ("created_at", "/created_at"),
        ("pushed_at", "/pushed_at"),
    ] {
        meta.insert(key.to_string(), json_at(metadata, pointer));
    }

    let mut signal = Signal::new(Provider::GitHub, SignalKind::Metadata, format!("github-repo-{id}"))
        .with_title(str_field(metadata, "full_name"))
        .with_body(str_field(metadata, "description"), BODY_LIMIT)
        .with_url(str_field(metadata, "html_url"))
        .with_datasource(Some(datasource))
        .with_source_ts(str_field(metadata, "pushed_at").and_then(|t| parse_timestamp(&t)));
    signal.metadata = meta;
    Some(signal)
}

/// Issue or pull request event from a repository webhook.
pub fn normalize_webhook(payload: &Value) -> Result<Signal, MalformedPayload> {
    let (item, kind, prefix) = match (payload.get("pull_request"), payload.get("issue")) {
        (Some(pr), _) => (pr, SignalKind::Pr, "github-pr"),
        (None, Some(issue)) => (issue, SignalKind::Ticket, "github-issue"),
        (None, None) => {
            return Err(MalformedPayload(
                "github payload has neither pull_request nor issue".into(),
            ))
        }
    };
    let id = id_at(item, "/id")
        .ok_or_else(|| MalformedPayload("github payload item has no id".into()))?;

    Ok(Signal::new(Provider::GitHub, kind, format!("{prefix}-{id}"))
        .with_title(str_field(item, "title"))
        .with_body(str_field(item, "body"), BODY_LIMIT)
        .with_url(str_field(item, "html_url"))
        .with_source_ts(str_field(item, "created_at").and_then(|t| parse_timestamp(&t)))
        .meta("author", json_at(payload, "/sender/login"))
        .meta("action", json_at(payload, "/action"))
        .meta("repo", json_at(payload, "/repository/full_name")))
}

/// Live read of one repository endpoint: `commits`, `pulls`, `issues`,
/// `readme`, `tree`, or a file path.
pub async fn query(
    client: &ProviderClient,
    token: &str,
    repo: &str,
    endpoint: &str,
) -> Result<Value, ProviderError> {
    let base = repo_url(client, repo);
    let endpoint = match endpoint.trim() {
        "" => "readme",
        other => other,
    };

    let request = match endpoint {
        "commits" => get(client, token, format!("{base}/commits")).query(&[("per_page", "20")]),
        "pulls" | "issues" => get(client, token, format!("{base}/{endpoint}")).query(&[
            ("state", "all"),
            ("sort", "updated"),
            ("per_page", "20"),
        ]),
        "readme" => get(client, token, format!("{base}/readme")),
        "tree" => {
            let metadata = client
                .send_json(Provider::GitHub, get(client, token, base.clone()))
                .await?;
            let branch = str_field(&metadata, "default_branch").unwrap_or_else(|| "main".into());
            get(client, token, format!("{base}/git/trees/{branch}"))
                .query(&[("recursive", "1")])
        }
        path if path.starts_with("contents/") => get(client, token, format!("{base}/{path}")),
        path => get(
            client,
            token,
            format!("{base}/contents/{}", path.trim_start_matches('/')),
        ),
    };

    let data = client.send_json(Provider::GitHub, request).await?;
    Ok(project_live_response(data))
}

/// Trim a live response to what an agent can usefully read.
fn project_live_response(mut data: Value) -> Value {
    if let Value::Array(items) = &data {
        return Value::Array(
            items
                .iter()
                .take(LIVE_ARRAY_LIMIT)
                .map(project_live_item)
                .collect(),
        );
    }

    if let Value::Object(ref mut object) = data {
        let is_base64 = object.get("encoding").and_then(Value::as_str) == Some("base64");
        if is_base64 {
            let decoded = object
                .get("content")
                .and_then(Value::as_str)
                .and_then(decode_base64_lossy);
            if let Some(decoded) = decoded {
                object.insert(
                    "decoded_content".into(),
                    Value::String(truncate_chars(&decoded, DECODED_CONTENT_LIMIT)),
                );
                object.remove("content");
            }
        }

        if let Some(Value::Array(tree)) = object.get("tree") {
            let truncated = tree.len() > TREE_LIMIT;
            let trimmed: Vec<Value> = tree
                .iter()
                .take(TREE_LIMIT)
                .map(|entry| {
                    json!({
                        "path": entry.get("path"),
                        "type": entry.get("type"),
                        "size": entry.get("size"),
                    })
                })
                .collect();
            object.insert("tree".into(), Value::Array(trimmed));
            object.insert("truncated_by_tool".into(), Value::Bool(truncated));
        }
    }

    data
}

fn project_live_item(item: &Value) -> Value {
    if item.get("commit").is_some() {
        json!({
            "sha": item.get("sha"),
            "message": json_at(item, "/commit/message"),
            "author": json_at(item, "/commit/author/name"),
            "date": json_at(item, "/commit/author/date"),
            "url": item.get("html_url"),
        })
    } else if item.get("title").is_some() {
        json!({
            "id": item.get("id"),
            "title": item.get("title"),
            "state": item.get("state"),
            "user": json_at(item, "/user/login"),
            "url": item.get("html_url"),
            "created_at": item.get("created_at"),
        })
    } else if item.get("path").is_some() {
        json!({
            "path": item.get("path"),
            "type": item.get("type"),
            "size": item.get("size"),
        })
    } else {
        item.clone()
    }
}

pub async fn create_issue(
    client: &ProviderClient,
    token: &str,
    repo: &str,
    title: &str,
    body: &str,
) -> Result<Value, ProviderError> {
    let request = client
        .http()
        .post(format!("{}/issues", repo_url(client, repo)))
        .bearer_auth(token)
        .header(reqwest::header::ACCEPT, ACCEPT)
        .json(&json!({ "title": title, "body": body }));

    let issue = client.send_json(Provider::GitHub, request).await?;
    Ok(json!({
        "id": issue.get("id"),
        "number": issue.get("number"),
        "title": issue.get("title"),
        "url": issue.get("html_url"),
        "state": issue.get("state"),
    }))
}

pub async fn list_resources(
    client: &ProviderClient,
    token: &str,
) -> Result<Vec<Resource>, ProviderError> {
    let request = get(client, token, format!("{}/user/repos", client.endpoints().github)).query(&[
        ("sort", "updated"),
        ("per_page", "30"),
        ("affiliation", "owner,collaborator,organization_member"),
    ]);
    let repos = client.send_json(Provider::GitHub, request).await?;

    Ok(array_items(&repos)
        .filter_map(|repo| str_field(repo, "full_name"))
        .map(|full_name| Resource {
            id: format!("github:{full_name}"),
            provider: Provider::GitHub,
            label: full_name,
            kind: "repo".into(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::{http_client, ProviderEndpoints};
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use httpmock::prelude::*;

    fn client(server: &MockServer) -> ProviderClient {
        ProviderClient::new(http_client().unwrap(), ProviderEndpoints::under(&server.base_url()))
    }

    #[test]
    fn test_issues_skip_pull_requests() {
        let issues = json!([
            {"id": 1, "title": "Bug", "body": "broken", "html_url": "https://gh/1",
             "user": {"login": "ana"}, "labels": [{"name": "bug"}], "created_at": "2024-01-01T00:00:00Z"},
            {"id": 2, "title": "PR disguised", "pull_request": {"url": "x"}}
        ]);
        let signals = normalize_issues(&issues, "acme/api", "github:acme/api");
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].external_id, "github-issue-1");
        assert_eq!(signals[0].metadata["labels"], json!(["bug"]));
        assert_eq!(signals[0].metadata["author"], "ana");
        assert!(signals[0].source_ts.is_some());
    }

    #[test]
    fn test_missing_optional_fields_become_null() {
        let issues = json!([{"id": 7, "title": "No frills"}]);
        let signals = normalize_issues(&issues, "acme/api", "github:acme/api");
        assert_eq!(signals[0].body, None);
        assert_eq!(signals[0].metadata["author"], Value::Null);
        assert_eq!(signals[0].metadata["labels"], Value::Null);
    }

    #[test]
    fn test_commit_title_is_first_line() {
        let commits = json!([{
            "sha": "abc123",
            "html_url": "https://gh/c/abc123",
            "commit": {"message": "Fix retry loop\n\nLonger explanation", "author": {"date": "2024-02-02T10:00:00Z"}},
            "author": {"login": "octocat"}
        }]);
        let signals = normalize_commits(&commits, "acme/api", "github:acme/api");
        assert_eq!(signals[0].title.as_deref(), Some("Fix retry loop"));
        assert_eq!(signals[0].external_id, "github-commit-abc123");
        assert_eq!(signals[0].metadata["author"], "octocat");
    }

    #[test]
    fn test_readme_external_id_and_decoding() {
        let readme = json!({
            "content": STANDARD.encode("# Acme API\nDocs"),
            "path": "README.md",
            "html_url": "https://gh/readme"
        });
        let signal = normalize_readme(&readme, "acme/api", "github:acme/api");
        assert_eq!(signal.external_id, "github-readme-acme-api");
        assert_eq!(signal.title.as_deref(), Some("README — acme/api"));
        assert_eq!(signal.body.as_deref(), Some("# Acme API\nDocs"));
    }

    #[test]
    fn test_webhook_prefers_pull_request() {
        let payload = json!({
            "action": "opened",
            "pull_request": {"id": 99, "title": "Add cache", "html_url": "https://gh/pr/99"},
            "sender": {"login": "ana"},
            "repository": {"full_name": "acme/api"}
        });
        let signal = normalize_webhook(&payload).unwrap();
        assert_eq!(signal.kind, SignalKind::Pr);
        assert_eq!(signal.external_id, "github-pr-99");
        assert_eq!(signal.metadata["action"], "opened");

        assert!(normalize_webhook(&json!({"action": "created"})).is_err());
        assert!(normalize_webhook(&json!({"issue": {"title": "no id"}})).is_err());
    }

    #[tokio::test]
    async fn test_failed_endpoint_does_not_block_siblings() {
        let server = MockServer::start_async().await;
        let issues = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/github/repos/acme/api/issues")
                    .query_param("per_page", "10")
                    .header("authorization", "Bearer gh-token");
                then.status(200).json_body(json!([
                    {"id": 1, "title": "Checkout bug", "created_at": "2024-01-01T00:00:00Z"}
                ]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/github/repos/acme/api/pulls");
                then.status(500).json_body(json!({"message": "boom"}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/github/repos/acme/api/commits");
                then.status(200).json_body(json!([]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/github/repos/acme/api");
                then.status(200)
                    .json_body(json!({"id": 42, "full_name": "acme/api", "stargazers_count": 3}));
            })
            .await;

        let outcome = list_recent(&client(&server), "gh-token", "acme/api", "github:acme/api").await;

        issues.assert_async().await;
        let signals = &outcome.signals;
        let ids: Vec<_> = signals.iter().map(|s| s.external_id.as_str()).collect();
        assert_eq!(ids, vec!["github-issue-1", "github-repo-42"]);
        assert_eq!(signals[1].metadata["stars"], 3);
        assert!(signals
            .iter()
            .all(|s| s.datasource_ref.as_deref() == Some("github:acme/api")));
        assert_eq!(
            outcome.failures,
            vec![
                "github fetch failed: GitHub API 500: boom",
                "github fetch failed: GitHub API 404: Not Found",
            ]
        );
    }

    #[tokio::test]
    async fn test_live_query_projects_commits() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/github/repos/acme/api/commits")
                    .query_param("per_page", "20");
                then.status(200).json_body(json!([{
                    "sha": "abc", "html_url": "https://gh/c/abc",
                    "commit": {"message": "init", "author": {"name": "Ana", "date": "2024-01-01T00:00:00Z"}},
                    "files": ["noise"]
                }]));
            })
            .await;

        let data = query(&client(&server), "tok", "acme/api", "commits").await.unwrap();
        assert_eq!(
            data,
            json!([{"sha": "abc", "message": "init", "author": "Ana",
                    "date": "2024-01-01T00:00:00Z", "url": "https://gh/c/abc"}])
        );
    }

    #[tokio::test]
    async fn test_live_query_decodes_file_contents() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/github/repos/acme/api/contents/src/lib.rs");
                then.status(200).json_body(json!({
                    "path": "src/lib.rs",
                    "encoding": "base64",
                    "content": STANDARD.encode("pub fn main() {}")
                }));
            })
            .await;

        let data = query(&client(&server), "tok", "acme/api", "src/lib.rs").await.unwrap();
        assert_eq!(data["decoded_content"], "pub fn main() {}");
        assert!(data.get("content").is_none());
    }

    #[tokio::test]
    async fn test_create_issue_surfaces_api_errors() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/github/repos/acme/api/issues");
                then.status(403).json_body(json!({"message": "Resource not accessible"}));
            })
            .await;

        let err = create_issue(&client(&server), "tok", "acme/api", "t", "")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "GitHub API 403: Resource not accessible");
    }
}
