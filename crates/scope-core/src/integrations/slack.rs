//! Slack adapter
//!
//! Slack reports application errors with HTTP 200 and `ok: false`; those
//! are treated as endpoint failures. Messages with a `subtype` (joins,
//! edits, bot housekeeping) are never signals.

use serde_json::{json, Value};

use super::signal::timestamp_from_epoch_secs;
use super::{
    array_items, json_at, str_at, str_field, truncate_chars, FetchOutcome, MalformedPayload,
    Provider, ProviderClient, ProviderError, Resource, Signal, SignalKind,
};

const HISTORY_LIMIT: &str = "20";
const LIVE_HISTORY_LIMIT: &str = "50";
const BODY_LIMIT: usize = 2000;
const LIVE_TEXT_LIMIT: usize = 500;
const LIVE_MESSAGE_LIMIT: usize = 30;

/// Call a Slack Web API method and unwrap the `ok` envelope.
async fn call(
    client: &ProviderClient,
    token: &str,
    request: reqwest::RequestBuilder,
) -> Result<Value, ProviderError> {
    let data = client
        .send_json(Provider::Slack, request.bearer_auth(token))
        .await?;
    if data.get("ok").and_then(Value::as_bool) != Some(true) {
        return Err(ProviderError::Rejected {
            provider: Provider::Slack,
            message: str_field(&data, "error").unwrap_or_else(|| "unknown_error".into()),
        });
    }
    Ok(data)
}

fn method_url(client: &ProviderClient, method: &str) -> String {
    format!("{}/{}", client.endpoints().slack, method)
}

async fn history(
    client: &ProviderClient,
    token: &str,
    channel: &str,
    limit: &str,
) -> Result<Value, ProviderError> {
    let request = client
        .http()
        .get(method_url(client, "conversations.history"))
        .query(&[("channel", channel), ("limit", limit)]);
    call(client, token, request).await
}

pub async fn list_recent(
    client: &ProviderClient,
    token: &str,
    channel: &str,
    datasource: &str,
) -> FetchOutcome {
    let result = history(client, token, channel, HISTORY_LIMIT).await;
    let mut outcome = FetchOutcome::default();
    if let Some(data) = outcome.take(Provider::Slack, "conversations.history", channel, result) {
        outcome.signals = normalize_history(&data, channel, datasource);
    }
    outcome
}

pub fn normalize_history(data: &Value, channel: &str, datasource: &str) -> Vec<Signal> {
    array_items(&data["messages"])
        .filter(|msg| msg.get("subtype").is_none())
        .filter_map(|msg| {
            let ts = str_field(msg, "ts")?;
            Some(
                Signal::new(Provider::Slack, SignalKind::Message, format!("slack-{channel}-{ts}"))
                    .with_body(str_field(msg, "text"), BODY_LIMIT)
                    .with_datasource(Some(datasource))
                    .with_source_ts(timestamp_from_epoch_secs(&ts))
                    .meta("channel", channel)
                    .meta("user", json_at(msg, "/user"))
                    .meta("thread_ts", json_at(msg, "/thread_ts")),
            )
        })
        .collect()
}

/// Whether an Events API callback carries a `subtype` (joins, edits).
pub fn is_housekeeping(payload: &Value) -> bool {
    payload
        .get("event")
        .is_some_and(|event| event.get("subtype").is_some())
}

/// Events API `message` callback.
pub fn normalize_webhook(payload: &Value) -> Result<Signal, MalformedPayload> {
    let event = payload
        .get("event")
        .ok_or_else(|| MalformedPayload("slack payload has no event".into()))?;
    if let Some(subtype) = event.get("subtype") {
        return Err(MalformedPayload(format!("slack event has subtype {subtype}")));
    }
    let ts = str_field(event, "ts")
        .ok_or_else(|| MalformedPayload("slack event has no ts".into()))?;
    let channel = str_field(event, "channel")
        .ok_or_else(|| MalformedPayload("slack event has no channel".into()))?;

    Ok(
        Signal::new(Provider::Slack, SignalKind::Message, format!("slack-{channel}-{ts}"))
            .with_body(str_field(event, "text"), BODY_LIMIT)
            .with_source_ts(timestamp_from_epoch_secs(&ts))
            .meta("channel", channel)
            .meta("user", json_at(event, "/user"))
            .meta("thread_ts", json_at(event, "/thread_ts")),
    )
}

/// Live channel read with an optional case-insensitive text filter.
pub async fn query(
    client: &ProviderClient,
    token: &str,
    channel: &str,
    text_filter: Option<&str>,
) -> Result<Value, ProviderError> {
    let data = history(client, token, channel, LIVE_HISTORY_LIMIT).await?;
    let needle = text_filter
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(str::to_lowercase);

    let messages: Vec<Value> = array_items(&data["messages"])
        .filter(|msg| msg.get("subtype").is_none())
        .map(|msg| {
            let reactions = msg.get("reactions").and_then(Value::as_array).map(|rs| {
                rs.iter()
                    .map(|r| {
                        format!(
                            "{}({})",
                            str_field(r, "name").unwrap_or_default(),
                            r.get("count").and_then(Value::as_i64).unwrap_or(0)
                        )
                    })
                    .collect::<Vec<_>>()
            });
            json!({
                "user": msg.get("user"),
                "text": str_field(msg, "text").map(|t| truncate_chars(&t, LIVE_TEXT_LIMIT)),
                "ts": msg.get("ts"),
                "thread_ts": msg.get("thread_ts"),
                "reactions": reactions,
            })
        })
        .filter(|msg| match &needle {
            Some(needle) => msg["text"]
                .as_str()
                .is_some_and(|t| t.to_lowercase().contains(needle)),
            None => true,
        })
        .collect();

    Ok(json!({
        "channel": channel,
        "message_count": messages.len(),
        "messages": messages.into_iter().take(LIVE_MESSAGE_LIMIT).collect::<Vec<_>>(),
    }))
}

pub async fn post_message(
    client: &ProviderClient,
    token: &str,
    channel: &str,
    text: &str,
) -> Result<Value, ProviderError> {
    let request = client
        .http()
        .post(method_url(client, "chat.postMessage"))
        .json(&json!({ "channel": channel, "text": text }));
    let data = call(client, token, request).await?;

    Ok(json!({
        "ok": true,
        "channel": data.get("channel"),
        "ts": data.get("ts"),
        "message": str_at(&data, "/message/text"),
    }))
}

pub async fn list_resources(
    client: &ProviderClient,
    token: &str,
) -> Result<Vec<Resource>, ProviderError> {
    let request = client
        .http()
        .get(method_url(client, "conversations.list"))
        .query(&[
            ("types", "public_channel,private_channel"),
            ("limit", "100"),
            ("exclude_archived", "true"),
        ]);
    let data = call(client, token, request).await?;

    Ok(array_items(&data["channels"])
        .filter(|ch| ch.get("is_archived").and_then(Value::as_bool) != Some(true))
        .filter_map(|ch| {
            let id = str_field(ch, "id")?;
            let private = ch.get("is_private").and_then(Value::as_bool) == Some(true);
            Some(Resource {
                id: format!("slack:{id}"),
                provider: Provider::Slack,
                label: format!("#{}", str_field(ch, "name").unwrap_or(id)),
                kind: if private { "private channel" } else { "channel" }.into(),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::{http_client, ProviderEndpoints};
    use httpmock::prelude::*;

    fn client(server: &MockServer) -> ProviderClient {
        ProviderClient::new(http_client().unwrap(), ProviderEndpoints::under(&server.base_url()))
    }

    #[test]
    fn test_subtype_messages_are_excluded() {
        let data = json!({"ok": true, "messages": [
            {"ts": "1700000000.000100", "text": "deploy failed", "user": "U1"},
            {"ts": "1700000001.000100", "subtype": "channel_join", "text": "joined"},
        ]});
        let signals = normalize_history(&data, "C1", "slack:C1");
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].external_id, "slack-C1-1700000000.000100");
        assert_eq!(signals[0].title, None);
        assert_eq!(
            signals[0].source_ts.map(|t| t.timestamp_millis()),
            Some(1_700_000_000_000)
        );
        assert_eq!(signals[0].metadata["thread_ts"], Value::Null);
    }

    #[test]
    fn test_webhook_uses_same_external_id_as_sync() {
        let payload = json!({"event": {"ts": "1700000000.000100", "channel": "C1", "text": "hi"}});
        let webhook = normalize_webhook(&payload).unwrap();
        let synced = normalize_history(
            &json!({"messages": [{"ts": "1700000000.000100", "text": "hi"}]}),
            "C1",
            "slack:C1",
        );
        assert_eq!(webhook.external_id, synced[0].external_id);

        assert!(normalize_webhook(&json!({"event": {"channel": "C1"}})).is_err());
    }

    #[tokio::test]
    async fn test_ok_false_is_an_endpoint_failure() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/slack/conversations.history")
                    .query_param("channel", "C1");
                then.status(200)
                    .json_body(json!({"ok": false, "error": "channel_not_found"}));
            })
            .await;

        let outcome = list_recent(&client(&server), "xoxb", "C1", "slack:C1").await;
        assert!(outcome.signals.is_empty());
        assert_eq!(
            outcome.failures,
            vec!["slack fetch failed: Slack error: channel_not_found"]
        );

        let err = query(&client(&server), "xoxb", "C1", None).await.unwrap_err();
        assert_eq!(err.to_string(), "Slack error: channel_not_found");
    }

    #[tokio::test]
    async fn test_live_query_filters_and_formats_reactions() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/slack/conversations.history")
                    .query_param("limit", "50")
                    .header("authorization", "Bearer xoxb");
                then.status(200).json_body(json!({"ok": true, "messages": [
                    {"ts": "1", "text": "Checkout is DOWN", "user": "U1",
                     "reactions": [{"name": "eyes", "count": 2}]},
                    {"ts": "2", "text": "lunch?", "user": "U2"},
                    {"ts": "3", "subtype": "bot_message", "text": "checkout bot"}
                ]}));
            })
            .await;

        let data = query(&client(&server), "xoxb", "C1", Some("checkout")).await.unwrap();
        assert_eq!(data["message_count"], 1);
        assert_eq!(data["messages"][0]["reactions"], json!(["eyes(2)"]));
    }

    #[tokio::test]
    async fn test_list_resources_labels_channels() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/slack/conversations.list");
                then.status(200).json_body(json!({"ok": true, "channels": [
                    {"id": "C1", "name": "eng", "is_private": false},
                    {"id": "C2", "name": "secret", "is_private": true},
                    {"id": "C3", "name": "old", "is_archived": true}
                ]}));
            })
            .await;

        let resources = list_resources(&client(&server), "xoxb").await.unwrap();
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].id, "slack:C1");
        assert_eq!(resources[0].label, "#eng");
        assert_eq!(resources[1].kind, "private channel");
    }
}
