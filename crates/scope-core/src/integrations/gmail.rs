//! Gmail adapter
//!
//! The list endpoint only returns message ids; each message needs a second
//! metadata fetch for its headers.

use futures::stream::{self, StreamExt};
use serde_json::Value;

use super::{
    array_items, json_at, parse_timestamp, str_field, FetchOutcome, MalformedPayload, Provider,
    ProviderClient, ProviderError, Resource, Signal, SignalKind,
};

const MAX_RESULTS: &str = "10";
const BODY_LIMIT: usize = 2000;
const METADATA_CONCURRENCY: usize = 4;

const VISIBLE_SYSTEM_LABELS: &[&str] = &["INBOX", "SENT", "STARRED", "IMPORTANT"];
const HIDDEN_LABELS: &[&str] = &[
    "SPAM",
    "TRASH",
    "DRAFT",
    "CHAT",
    "UNREAD",
    "CATEGORY_PERSONAL",
    "CATEGORY_SOCIAL",
    "CATEGORY_UPDATES",
    "CATEGORY_FORUMS",
    "CATEGORY_PROMOTIONS",
];

fn messages_url(client: &ProviderClient) -> String {
    format!("{}/users/me/messages", client.endpoints().gmail)
}

pub async fn list_recent(
    client: &ProviderClient,
    token: &str,
    label: &str,
    datasource: &str,
) -> FetchOutcome {
    let listing = client
        .send_json(
            Provider::Gmail,
            client
                .http()
                .get(messages_url(client))
                .bearer_auth(token)
                .query(&[("labelIds", label), ("maxResults", MAX_RESULTS)]),
        )
        .await;
    let mut outcome = FetchOutcome::default();
    let Some(listing) = outcome.take(Provider::Gmail, "messages.list", label, listing) else {
        return outcome;
    };

    let ids: Vec<String> = array_items(&listing["messages"])
        .filter_map(|m| str_field(m, "id"))
        .collect();

    let fetched: Vec<_> = stream::iter(ids)
        .map(|id| async move {
            let request = client
                .http()
                .get(format!("{}/{id}", messages_url(client)))
                .bearer_auth(token)
                .query(&[
                    ("format", "metadata"),
                    ("metadataHeaders", "Subject"),
                    ("metadataHeaders", "From"),
                    ("metadataHeaders", "Date"),
                ]);
            (id, client.send_json(Provider::Gmail, request).await)
        })
        .buffered(METADATA_CONCURRENCY)
        .collect()
        .await;

    for (id, result) in fetched {
        if let Some(message) = outcome.take(Provider::Gmail, "messages.get", &id, result) {
            outcome.signals.extend(normalize_message(&message, label, datasource));
        }
    }
    outcome
}

/// Header value by case-insensitive name.
pub fn header(message: &Value, name: &str) -> Option<String> {
    array_items(&message["payload"]["headers"])
        .find(|h| {
            h.get("name")
                .and_then(Value::as_str)
                .is_some_and(|n| n.eq_ignore_ascii_case(name))
        })
        .and_then(|h| str_field(h, "value"))
}

pub fn normalize_message(message: &Value, label: &str, datasource: &str) -> Option<Signal> {
    let id = str_field(message, "id")?;
    Some(
        Signal::new(Provider::Gmail, SignalKind::Email, format!("gmail-{id}"))
            .with_title(header(message, "Subject"))
            .with_body(str_field(message, "snippet"), BODY_LIMIT)
            .with_datasource(Some(datasource))
            .with_source_ts(header(message, "Date").and_then(|d| parse_timestamp(&d)))
            .meta("from", header(message, "From"))
            .meta("label", label)
            .meta("thread_id", json_at(message, "/threadId")),
    )
}

/// Push-relay payload with pre-extracted fields.
pub fn normalize_webhook(payload: &Value) -> Result<Signal, MalformedPayload> {
    let id = str_field(payload, "id")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| MalformedPayload("gmail payload has no id".into()))?;

    Ok(Signal::new(Provider::Gmail, SignalKind::Email, format!("gmail-{id}"))
        .with_title(str_field(payload, "subject"))
        .with_body(str_field(payload, "snippet"), BODY_LIMIT)
        .with_source_ts(str_field(payload, "date").and_then(|d| parse_timestamp(&d)))
        .meta("from", json_at(payload, "/from"))
        .meta("to", json_at(payload, "/to"))
        .meta("thread_id", json_at(payload, "/threadId")))
}

pub async fn list_resources(
    client: &ProviderClient,
    token: &str,
) -> Result<Vec<Resource>, ProviderError> {
    let data = client
        .send_json(
            Provider::Gmail,
            client
                .http()
                .get(format!("{}/users/me/labels", client.endpoints().gmail))
                .bearer_auth(token),
        )
        .await?;

    Ok(array_items(&data["labels"])
        .filter_map(|label| {
            let id = str_field(label, "id")?;
            let system = label.get("type").and_then(Value::as_str) == Some("system");
            if HIDDEN_LABELS.contains(&id.as_str())
                || (system && !VISIBLE_SYSTEM_LABELS.contains(&id.as_str()))
            {
                return None;
            }
            Some(Resource {
                label: str_field(label, "name").unwrap_or_else(|| id.clone()),
                id: format!("gmail:{id}"),
                provider: Provider::Gmail,
                kind: if system { "folder" } else { "label" }.into(),
            })
        })
        .collect())
}
