//! Notion adapter
//!
//! Databases and pages take different fetch paths. Page bodies come from
//! the block children endpoint, flattened to text from a fixed set of
//! block types.

use serde_json::{json, Value};

use super::{
    array_items, json_at, parse_timestamp, str_at, str_field, truncate_chars, DatasourceRef,
    DatasourceTarget, FetchOutcome, MalformedPayload, Provider, ProviderClient, ProviderError,
    Resource, Signal, SignalKind,
};

const NOTION_VERSION: &str = "2022-06-28";
const DATABASE_PAGE_SIZE: u32 = 20;
/// Only the first few database rows get a body fetch, to stay under rate limits.
const BODY_FETCHES_PER_DATABASE: usize = 5;
const BODY_LIMIT: usize = 3000;
const LIVE_BODY_LIMIT: usize = 5000;
const UNTITLED: &str = "Untitled";

const TEXT_BLOCK_TYPES: &[&str] = &[
    "paragraph",
    "heading_1",
    "heading_2",
    "heading_3",
    "bulleted_list_item",
    "numbered_list_item",
    "to_do",
    "toggle",
    "callout",
    "quote",
];

fn request(
    client: &ProviderClient,
    method: reqwest::Method,
    token: &str,
    path: &str,
) -> reqwest::RequestBuilder {
    client
        .http()
        .request(method, format!("{}/{}", client.endpoints().notion, path))
        .bearer_auth(token)
        .header("Notion-Version", NOTION_VERSION)
}

pub async fn list_recent(
    client: &ProviderClient,
    token: &str,
    datasource: &DatasourceRef,
) -> FetchOutcome {
    let (endpoint, result) = match datasource.target() {
        DatasourceTarget::Database(id) => (
            "databases.query",
            database_signals(client, token, id, datasource.as_str()).await,
        ),
        DatasourceTarget::Page(id) => (
            "pages.retrieve",
            page_signal(client, token, id, datasource.as_str())
                .await
                .map(|s| vec![s]),
        ),
        _ => return FetchOutcome::default(),
    };

    let mut outcome = FetchOutcome::default();
    if let Some(signals) = outcome.take(Provider::Notion, endpoint, datasource.as_str(), result) {
        outcome.signals = signals;
    }
    outcome
}

async fn database_signals(
    client: &ProviderClient,
    token: &str,
    database_id: &str,
    datasource: &str,
) -> Result<Vec<Signal>, ProviderError> {
    let query = request(
        client,
        reqwest::Method::POST,
        token,
        &format!("databases/{database_id}/query"),
    )
    .json(&json!({
        "page_size": DATABASE_PAGE_SIZE,
        "sorts": [{ "timestamp": "last_edited_time", "direction": "descending" }],
    }));
    let data = client.send_json(Provider::Notion, query).await?;

    let mut signals = Vec::new();
    for (index, page) in array_items(&data["results"]).enumerate() {
        let Some(page_id) = str_field(page, "id") else {
            continue;
        };
        let body = if index < BODY_FETCHES_PER_DATABASE {
            page_body(client, token, &page_id).await
        } else {
            None
        };
        signals.push(
            normalize_page(page, body, Some(datasource)).meta("parent_db", database_id),
        );
    }
    Ok(signals)
}

async fn page_signal(
    client: &ProviderClient,
    token: &str,
    page_id: &str,
    datasource: &str,
) -> Result<Signal, ProviderError> {
    let page = client
        .send_json(
            Provider::Notion,
            request(client, reqwest::Method::GET, token, &format!("pages/{page_id}")),
        )
        .await?;
    let id = str_field(&page, "id").unwrap_or_else(|| page_id.to_string());
    let body = page_body(client, token, &id).await;
    Ok(normalize_page(&page, body, Some(datasource)))
}

/// Fetch and flatten a page body. Failure yields no body, not an error.
async fn page_body(client: &ProviderClient, token: &str, page_id: &str) -> Option<String> {
    fetch_blocks(client, token, page_id)
        .await
        .map_err(|e| tracing::debug!(page_id, error = %e, "Notion block fetch failed"))
        .ok()
        .and_then(|blocks| extract_block_text(&blocks, BODY_LIMIT))
}

async fn fetch_blocks(client: &ProviderClient, token: &str, page_id: &str) -> Result<Value, ProviderError> {
    let req = request(
        client,
        reqwest::Method::GET,
        token,
        &format!("blocks/{page_id}/children"),
    )
    .query(&[("page_size", "100")]);
    client.send_json(Provider::Notion, req).await
}

pub fn normalize_page(page: &Value, body: Option<String>, datasource: Option<&str>) -> Signal {
    let id = str_field(page, "id").unwrap_or_default();
    let mut signal = Signal::new(Provider::Notion, SignalKind::Doc, format!("notion-{id}"))
        .with_title(Some(extract_title(page)))
        .with_url(str_field(page, "url"))
        .with_datasource(datasource)
        .with_source_ts(str_field(page, "last_edited_time").and_then(|t| parse_timestamp(&t)))
        .meta("last_edited_by", json_at(page, "/last_edited_by/name"));
    signal.body = body;
    signal
}

/// Title from the property whose `type` is `title`, else "Untitled".
pub fn extract_title(page: &Value) -> String {
    page.get("properties")
        .and_then(Value::as_object)
        .into_iter()
        .flat_map(|props| props.values())
        .filter(|prop| prop.get("type").and_then(Value::as_str) == Some("title"))
        .find_map(|prop| str_at(prop, "/title/0/plain_text").filter(|t| !t.is_empty()))
        .unwrap_or_else(|| UNTITLED.to_string())
}

/// Concatenate rich text across supported blocks, one line per block, in
/// document order. Empty text yields `None`.
pub fn extract_block_text(blocks: &Value, max_chars: usize) -> Option<String> {
    let lines: Vec<String> = array_items(&blocks["results"])
        .filter_map(|block| {
            TEXT_BLOCK_TYPES
                .iter()
                .find_map(|kind| block.get(*kind).and_then(|b| b.get("rich_text")))
        })
        .map(|rich_text| {
            array_items(rich_text)
                .filter_map(|rt| rt.get("plain_text").and_then(Value::as_str))
                .collect::<String>()
        })
        .filter(|line| !line.is_empty())
        .collect();

    let text = truncate_chars(&lines.join("\n"), max_chars);
    (!text.is_empty()).then_some(text)
}

/// Page webhook. The page title arrives pre-flattened.
pub fn normalize_webhook(payload: &Value) -> Result<Signal, MalformedPayload> {
    let page = payload
        .get("page")
        .ok_or_else(|| MalformedPayload("notion payload has no page".into()))?;
    let id = str_field(page, "id")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| MalformedPayload("notion page has no id".into()))?;

    Ok(Signal::new(Provider::Notion, SignalKind::Doc, format!("notion-{id}"))
        .with_title(str_field(page, "title"))
        .with_url(str_field(page, "url"))
        .with_source_ts(str_field(page, "last_edited_time").and_then(|t| parse_timestamp(&t)))
        .meta("last_edited_by", json_at(page, "/last_edited_by/name"))
        .meta("parent_type", json_at(page, "/parent/type")))
}

/// Live read of a page: title, url, edit time and body text.
pub async fn query(client: &ProviderClient, token: &str, page_id: &str) -> Result<Value, ProviderError> {
    let page = client
        .send_json(
            Provider::Notion,
            request(client, reqwest::Method::GET, token, &format!("pages/{page_id}")),
        )
        .await?;
    let title = extract_title(&page);

    let body = match fetch_blocks(client, token, page_id).await {
        Ok(blocks) => Some(extract_block_text(&blocks, LIVE_BODY_LIMIT).unwrap_or_default()),
        Err(e) => {
            tracing::debug!(page_id, error = %e, "Notion block fetch failed");
            None
        }
    };

    Ok(json!({
        "title": title,
        "url": page.get("url"),
        "last_edited_time": page.get("last_edited_time"),
        "body": body,
    }))
}

/// Create a row in a database. The title property is `Name`; non-empty
/// content becomes a single paragraph.
pub async fn create_page(
    client: &ProviderClient,
    token: &str,
    database_id: &str,
    title: &str,
    content: &str,
) -> Result<Value, ProviderError> {
    let children: Vec<Value> = if content.is_empty() {
        Vec::new()
    } else {
        vec![json!({
            "object": "block",
            "type": "paragraph",
            "paragraph": { "rich_text": [{ "type": "text", "text": { "content": content } }] },
        })]
    };

    let req = request(client, reqwest::Method::POST, token, "pages").json(&json!({
        "parent": { "database_id": database_id },
        "properties": { "Name": { "title": [{ "text": { "content": title } }] } },
        "children": children,
    }));
    let page = client.send_json(Provider::Notion, req).await?;

    Ok(json!({ "id": page.get("id"), "url": page.get("url") }))
}

pub async fn list_resources(client: &ProviderClient, token: &str) -> Result<Vec<Resource>, ProviderError> {
    let search = |object: &'static str| {
        request(client, reqwest::Method::POST, token, "search").json(&json!({
            "filter": { "property": "object", "value": object },
            "page_size": 20,
        }))
    };

    let databases = client.send_json(Provider::Notion, search("database")).await?;
    let mut resources: Vec<Resource> = array_items(&databases["results"])
        .filter_map(|db| {
            let id = str_field(db, "id")?;
            Some(Resource {
                id: format!("notion:db:{id}"),
                provider: Provider::Notion,
                label: str_at(db, "/title/0/plain_text").unwrap_or_else(|| UNTITLED.into()),
                kind: "database".into(),
            })
        })
        .collect();

    match client.send_json(Provider::Notion, search("page")).await {
        Ok(pages) => resources.extend(array_items(&pages["results"]).filter_map(|page| {
            let id = str_field(page, "id")?;
            let label = str_at(page, "/properties/title/title/0/plain_text")
                .or_else(|| str_at(page, "/properties/Name/title/0/plain_text"))
                .unwrap_or_else(|| "Untitled page".into());
            Some(Resource {
                id: format!("notion:page:{id}"),
                provider: Provider::Notion,
                label,
                kind: "page".into(),
            })
        })),
        Err(e) => tracing::warn!(error = %e, "Notion page search failed"),
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

    fn blocks() -> Value {
        json!({"results": [
            {"type": "heading_1", "heading_1": {"rich_text": [{"plain_text": "Goals"}]}},
            {"type": "image", "image": {"caption": []}},
            {"type": "paragraph", "paragraph": {"rich_text": [
                {"plain_text": "Ship "}, {"plain_text": "v2"}
            ]}},
            {"type": "paragraph", "paragraph": {"rich_text": []}},
            {"type": "to_do", "to_do": {"rich_text": [{"plain_text": "write docs"}]}}
        ]})
    }

    #[test]
    fn test_title_scans_for_title_property() {
        let page = json!({"properties": {
            "Status": {"type": "select"},
            "Doc name": {"type": "title", "title": [{"plain_text": "Roadmap"}]}
        }});
        assert_eq!(extract_title(&page), "Roadmap");
        assert_eq!(extract_title(&json!({"properties": {}})), "Untitled");
        assert_eq!(
            extract_title(&json!({"properties": {"T": {"type": "title", "title": []}}})),
            "Untitled"
        );
    }

    #[test]
    fn test_block_text_in_document_order() {
        assert_eq!(
            extract_block_text(&blocks(), 3000).as_deref(),
            Some("Goals\nShip v2\nwrite docs")
        );
        assert_eq!(extract_block_text(&blocks(), 4).as_deref(), Some("Goal"));
        assert_eq!(extract_block_text(&json!({"results": []}), 3000), None);
    }

    #[test]
    fn test_webhook_requires_page_id() {
        let payload = json!({"page": {"id": "p1", "title": "Spec", "parent": {"type": "database_id"}}});
        let signal = normalize_webhook(&payload).unwrap();
        assert_eq!(signal.external_id, "notion-p1");
        assert_eq!(signal.metadata["parent_type"], "database_id");

        assert!(normalize_webhook(&json!({"page": {"title": "x"}})).is_err());
    }

    #[tokio::test]
    async fn test_database_rows_fetch_bodies_for_first_five_only() {
        let server = MockServer::start_async().await;
        let rows: Vec<Value> = (0..7)
            .map(|i| json!({"id": format!("p{i}"), "url": format!("https://notion.so/p{i}"),
                             "last_edited_time": "2024-01-01T00:00:00.000Z"}))
            .collect();
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/notion/databases/db1/query")
                    .header("notion-version", NOTION_VERSION);
                then.status(200).json_body(json!({"results": rows.clone()}));
            })
            .await;
        let block_fetches = server
            .mock_async(|when, then| {
                when.method(GET).path_includes("/children");
                then.status(200).json_body(blocks());
            })
            .await;

        let datasource = DatasourceRef::parse("notion:db:db1").unwrap();
        let signals = list_recent(&client(&server), "secret", &datasource).await.signals;

        assert_eq!(signals.len(), 7);
        block_fetches.assert_calls_async(5).await;
        assert!(signals[0].body.is_some());
        assert!(signals[6].body.is_none());
        assert_eq!(signals[0].metadata["parent_db"], "db1");
        assert_eq!(signals[0].title.as_deref(), Some("Untitled"));
    }

    #[tokio::test]
    async fn test_create_page_uses_name_property_and_paragraph() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/notion/pages")
                    .body_includes("\"Name\"")
                    .body_includes("\"paragraph\"");
                then.status(200)
                    .json_body(json!({"id": "new-page", "url": "https://notion.so/new-page"}));
            })
            .await;

        let page = create_page(&client(&server), "secret", "db1", "Retro", "Went well")
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(page["id"], "new-page");
    }
}
