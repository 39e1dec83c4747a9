//! Provider integrations
//!
//! One module per external provider. Each module owns the provider's
//! endpoint selection, list limits, field extraction into [`Signal`],
//! webhook-shape normalization, live queries, and write calls.
//!
//! [`ProviderClient`] is the shared HTTP plumbing; its `list_recent` and
//! `list_resources` methods dispatch exhaustively over [`Provider`].
//! Bulk fetches return a [`FetchOutcome`] carrying endpoint failures
//! alongside whatever signals the other endpoints produced.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod github;
pub mod gmail;
pub mod linear;
pub mod notion;
mod signal;
pub mod slack;

pub use signal::{
    parse_timestamp, truncate_chars, MalformedPayload, Severity, Signal, SignalKind,
};

/// Per-request timeout for provider API calls.
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound on concurrent per-datasource fetches within one provider.
pub const MAX_CONCURRENT_FETCHES: usize = 3;

/// External provider a datasource or credential belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Linear,
    Slack,
    Notion,
    #[serde(rename = "github")]
    GitHub,
    Gmail,
}

impl Provider {
    pub fn all() -> &'static [Provider] {
        &[
            Provider::Linear,
            Provider::Slack,
            Provider::Notion,
            Provider::GitHub,
            Provider::Gmail,
        ]
    }

    /// Key used in datasource refs, credential rows and signal `source`.
    pub fn storage_key(&self) -> &'static str {
        match self {
            Provider::Linear => "linear",
            Provider::Slack => "slack",
            Provider::Notion => "notion",
            Provider::GitHub => "github",
            Provider::Gmail => "gmail",
        }
    }

    /// Human-facing name used in tool error messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::Linear => "Linear",
            Provider::Slack => "Slack",
            Provider::Notion => "Notion",
            Provider::GitHub => "GitHub",
            Provider::Gmail => "Gmail",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.storage_key())
    }
}

impl FromStr for Provider {
    type Err = DatasourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(Provider::Linear),
            "slack" => Ok(Provider::Slack),
            "notion" => Ok(Provider::Notion),
            "github" => Ok(Provider::GitHub),
            "gmail" => Ok(Provider::Gmail),
            other => Err(DatasourceError::UnknownProvider(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatasourceError {
    #[error("unknown provider \"{0}\"")]
    UnknownProvider(String),
    #[error("malformed datasource ref \"{0}\"")]
    Malformed(String),
}

/// What a datasource ref points at, per provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasourceTarget {
    /// `github:owner/repo`
    Repo(String),
    /// `slack:CHANNEL`
    Channel(String),
    /// `linear:team:ID`
    Team(String),
    /// `linear:project:ID`
    Project(String),
    /// `notion:db:ID`
    Database(String),
    /// `notion:page:ID`
    Page(String),
    /// `gmail:LABEL`
    Label(String),
}

/// Parsed form of an opaque `"<provider>:<rest>"` datasource key.
///
/// The raw string is kept verbatim: it is what gets stored on signals and
/// compared when a datasource is removed from a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasourceRef {
    raw: String,
    provider: Provider,
    target: DatasourceTarget,
}

impl DatasourceRef {
    pub fn parse(raw: &str) -> Result<Self, DatasourceError> {
        let malformed = || DatasourceError::Malformed(raw.to_string());
        let (provider, rest) = raw.split_once(':').ok_or_else(malformed)?;
        let provider: Provider = provider.parse()?;
        let rest = rest.trim();
        if rest.is_empty() {
            return Err(malformed());
        }

        let target = match provider {
            Provider::GitHub => {
                let (owner, name) = rest.split_once('/').ok_or_else(malformed)?;
                if owner.is_empty() || name.is_empty() {
                    return Err(malformed());
                }
                DatasourceTarget::Repo(rest.to_string())
            }
            Provider::Slack => DatasourceTarget::Channel(rest.to_string()),
            Provider::Gmail => DatasourceTarget::Label(rest.to_string()),
            Provider::Linear => match rest.split_once(':') {
                Some(("team", id)) if !id.is_empty() => DatasourceTarget::Team(id.to_string()),
                Some(("project", id)) if !id.is_empty() => {
                    DatasourceTarget::Project(id.to_string())
                }
                _ => return Err(malformed()),
            },
            Provider::Notion => match rest.split_once(':') {
                Some(("db", id)) if !id.is_empty() => DatasourceTarget::Database(id.to_string()),
                Some(("page", id)) if !id.is_empty() => DatasourceTarget::Page(id.to_string()),
                _ => return Err(malformed()),
            },
        };

        Ok(Self {
            raw: raw.to_string(),
            provider,
            target,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn target(&self) -> &DatasourceTarget {
        &self.target
    }

    /// Everything after `<provider>:`.
    pub fn resource(&self) -> &str {
        self.raw
            .split_once(':')
            .map(|(_, rest)| rest)
            .unwrap_or_default()
    }
}

impl fmt::Display for DatasourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A pickable datasource discovered on a connected account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Full datasource ref, e.g. `slack:C0123`.
    pub id: String,
    pub provider: Provider,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Base URLs for every provider API. Overridable so tests can point
/// adapters at a local mock server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoints {
    pub github: String,
    pub slack: String,
    /// Full GraphQL endpoint URL.
    pub linear: String,
    pub notion: String,
    pub gmail: String,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            github: "https://api.github.com".to_string(),
            slack: "https://slack.com/api".to_string(),
            linear: "https://api.linear.app/graphql".to_string(),
            notion: "https://api.notion.com/v1".to_string(),
            gmail: "https://gmail.googleapis.com/gmail/v1".to_string(),
        }
    }
}

impl ProviderEndpoints {
    /// Route every provider under one base URL (`/github`, `/slack`, ...).
    pub fn under(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            github: format!("{base}/github"),
            slack: format!("{base}/slack"),
            linear: format!("{base}/linear/graphql"),
            notion: format!("{base}/notion"),
            gmail: format!("{base}/gmail"),
        }
    }
}

/// Failure talking to a provider API. Never propagated past the adapter
/// boundary on the sync path; surfaced as a tool error on the agent path.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{} API {status}: {message}", .provider.display_name())]
    Api {
        provider: Provider,
        status: u16,
        message: String,
    },
    #[error("{} error: {message}", .provider.display_name())]
    Rejected { provider: Provider, message: String },
    #[error("{} request failed: {source}", .provider.display_name())]
    Transport {
        provider: Provider,
        #[source]
        source: reqwest::Error,
    },
    #[error("{} returned an unreadable response: {source}", .provider.display_name())]
    Decode {
        provider: Provider,
        #[source]
        source: reqwest::Error,
    },
}

/// Build the HTTP client shared by all adapters.
pub fn http_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("scope/", env!("CARGO_PKG_VERSION")))
        .timeout(PROVIDER_TIMEOUT)
        .build()
        .map_err(Into::into)
}

/// Shared HTTP plumbing for the provider adapters.
#[derive(Debug, Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    endpoints: ProviderEndpoints,
}

impl ProviderClient {
    pub fn new(http: reqwest::Client, endpoints: ProviderEndpoints) -> Self {
        Self { http, endpoints }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn endpoints(&self) -> &ProviderEndpoints {
        &self.endpoints
    }

    /// Send a request and decode a JSON body, mapping non-2xx to
    /// [`ProviderError::Api`].
    pub(crate) async fn send_json(
        &self,
        provider: Provider,
        request: RequestBuilder,
    ) -> Result<Value, ProviderError> {
        let response = request
            .send()
            .await
            .map_err(|source| ProviderError::Transport { provider, source })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| api_error_message(&v))
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
            return Err(ProviderError::Api {
                provider,
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|source| ProviderError::Decode { provider, source })
    }

    /// Fetch recent signals for every ref in one provider group.
    ///
    /// Never fails: each adapter records endpoint errors in the outcome
    /// and keeps going, so sibling endpoints and refs still contribute.
    pub async fn list_recent(
        &self,
        provider: Provider,
        token: &str,
        refs: &[DatasourceRef],
    ) -> FetchOutcome {
        match provider {
            Provider::Linear => linear::list_recent(self, token, refs).await,
            Provider::Slack => {
                self.per_ref(refs, move |r| async move {
                    match r.target() {
                        DatasourceTarget::Channel(channel) => {
                            slack::list_recent(self, token, channel, r.as_str()).await
                        }
                        _ => FetchOutcome::default(),
                    }
                })
                .await
            }
            Provider::Notion => {
                self.per_ref(refs, move |r| async move {
                    notion::list_recent(self, token, r).await
                })
                .await
            }
            Provider::GitHub => {
                self.per_ref(refs, move |r| async move {
                    match r.target() {
                        DatasourceTarget::Repo(repo) => {
                            github::list_recent(self, token, repo, r.as_str()).await
                        }
                        _ => FetchOutcome::default(),
                    }
                })
                .await
            }
            Provider::Gmail => {
                self.per_ref(refs, move |r| async move {
                    match r.target() {
                        DatasourceTarget::Label(label) => {
                            gmail::list_recent(self, token, label, r.as_str()).await
                        }
                        _ => FetchOutcome::default(),
                    }
                })
                .await
            }
        }
    }

    /// List pickable datasources on a connected account. Failures yield an
    /// empty list.
    pub async fn list_resources(&self, provider: Provider, token: &str) -> Vec<Resource> {
        let result = match provider {
            Provider::Linear => linear::list_resources(self, token).await,
            Provider::Slack => slack::list_resources(self, token).await,
            Provider::Notion => notion::list_resources(self, token).await,
            Provider::GitHub => github::list_resources(self, token).await,
            Provider::Gmail => gmail::list_resources(self, token).await,
        };

        result.unwrap_or_else(|e| {
            tracing::warn!(provider = %provider, error = %e, "Resource listing failed");
            Vec::new()
        })
    }

    /// Run a per-ref fetch with bounded concurrency, keeping ref order.
    async fn per_ref<'a, F, Fut>(&'a self, refs: &'a [DatasourceRef], fetch: F) -> FetchOutcome
    where
        F: Fn(&'a DatasourceRef) -> Fut,
        Fut: std::future::Future<Output = FetchOutcome> + 'a,
    {
        let fetches: Vec<Fut> = refs.iter().map(fetch).collect();
        stream::iter(fetches)
            .buffered(MAX_CONCURRENT_FETCHES)
            .fold(FetchOutcome::default(), |mut outcome, fetched| async move {
                outcome.absorb(fetched);
                outcome
            })
            .await
    }
}

/// Pull a human-readable message out of a provider error body.
fn api_error_message(body: &Value) -> Option<String> {
    body.get("message")
        .and_then(Value::as_str)
        .or_else(|| body.get("error_description").and_then(Value::as_str))
        .or_else(|| body.get("error").and_then(Value::as_str))
        .or_else(|| {
            body.get("errors")
                .and_then(|e| e.get(0))
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
        })
        .map(str::to_string)
}

/// Signals from one fetch plus the endpoint failures met along the way.
///
/// Failure messages are kept once each, in the order first seen.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub signals: Vec<Signal>,
    pub failures: Vec<String>,
}

impl FetchOutcome {
    /// An outcome with no signals and one failure.
    pub fn failed(message: impl Into<String>) -> Self {
        let mut outcome = Self::default();
        outcome.record_failure(message.into());
        outcome
    }

    /// Keep an endpoint's value, or log its error and record the failure.
    pub(crate) fn take<T>(
        &mut self,
        provider: Provider,
        endpoint: &str,
        resource: &str,
        result: Result<T, ProviderError>,
    ) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(
                    provider = %provider,
                    endpoint,
                    resource,
                    error = %e,
                    "Provider endpoint failed; skipping"
                );
                self.record_failure(format!("{provider} fetch failed: {e}"));
                None
            }
        }
    }

    fn record_failure(&mut self, message: String) {
        if !self.failures.contains(&message) {
            self.failures.push(message);
        }
    }

    pub fn absorb(&mut self, other: FetchOutcome) {
        self.signals.extend(other.signals);
        for message in other.failures {
            self.record_failure(message);
        }
    }
}

/// Value at a JSON pointer, or `null` when absent.
pub(crate) fn json_at(value: &Value, pointer: &str) -> Value {
    value.pointer(pointer).cloned().unwrap_or(Value::Null)
}

/// String at a JSON pointer, if present and a string.
pub(crate) fn str_at(value: &Value, pointer: &str) -> Option<String> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Identifier at a JSON pointer. Providers emit ids as numbers or strings.
pub(crate) fn id_at(value: &Value, pointer: &str) -> Option<String> {
    match value.pointer(pointer)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Collect `item[key]` strings from the array at `pointer`, or `null` when
/// there is no array.
pub(crate) fn names_at(value: &Value, pointer: &str, key: &str) -> Value {
    match value.pointer(pointer).and_then(Value::as_array) {
        Some(items) => Value::Array(
            items
                .iter()
                .filter_map(|item| item.get(key).cloned())
                .collect(),
        ),
        None => Value::Null,
    }
}

/// Iterate a JSON array, treating anything else as empty.
pub(crate) fn array_items(value: &Value) -> impl Iterator<Item = &Value> {
    value.as_array().into_iter().flatten()
}

/// `value[key]` as an owned string, if it is a non-null string.
pub(crate) fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Decode base64 the way GitHub and Gmail emit it (line-wrapped).
pub(crate) fn decode_base64_lossy(encoded: &str) -> Option<String> {
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact.as_bytes())
        .ok()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}
