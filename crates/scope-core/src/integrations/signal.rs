//! Normalized signal shape shared by every adapter and the webhook path

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Ticket,
    Pr,
    Commit,
    Doc,
    Message,
    Email,
    Metadata,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Ticket => "ticket",
            SignalKind::Pr => "pr",
            SignalKind::Commit => "commit",
            SignalKind::Doc => "doc",
            SignalKind::Message => "message",
            SignalKind::Email => "email",
            SignalKind::Metadata => "metadata",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "ticket" => SignalKind::Ticket,
            "pr" => SignalKind::Pr,
            "commit" => SignalKind::Commit,
            "doc" => SignalKind::Doc,
            "message" => SignalKind::Message,
            "email" => SignalKind::Email,
            "metadata" => SignalKind::Metadata,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Severity {
    /// Issue-tracker priority: 0 and 1 are high, 2 is medium, anything
    /// else (including absent) is low.
    pub fn from_priority(priority: Option<i64>) -> Self {
        match priority {
            Some(0) | Some(1) => Severity::High,
            Some(2) => Severity::Medium,
            _ => Severity::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "high" => Some(Severity::High),
            "medium" => Some(Severity::Medium),
            "low" => Some(Severity::Low),
            _ => None,
        }
    }
}

/// One external event, normalized. Not yet bound to a scope; the
/// orchestrator or ingest pipeline supplies the scope id at insert time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub source: Provider,
    pub kind: SignalKind,
    pub severity: Option<Severity>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub url: Option<String>,
    pub metadata: Map<String, Value>,
    /// Dedup key, unique across all scopes.
    pub external_id: String,
    pub datasource_ref: Option<String>,
    pub source_ts: Option<DateTime<Utc>>,
}

impl Signal {
    pub fn new(source: Provider, kind: SignalKind, external_id: impl Into<String>) -> Self {
        Self {
            source,
            kind,
            severity: None,
            title: None,
            body: None,
            url: None,
            metadata: Map::new(),
            external_id: external_id.into(),
            datasource_ref: None,
            source_ts: None,
        }
    }

    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.title = title;
        self
    }

    pub fn with_body(mut self, body: Option<String>, max_chars: usize) -> Self {
        self.body = body
            .filter(|b| !b.is_empty())
            .map(|b| truncate_chars(&b, max_chars));
        self
    }

    pub fn with_url(mut self, url: Option<String>) -> Self {
        self.url = url;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn with_datasource(mut self, datasource_ref: Option<&str>) -> Self {
        self.datasource_ref = datasource_ref.map(str::to_string);
        self
    }

    pub fn with_source_ts(mut self, ts: Option<DateTime<Utc>>) -> Self {
        self.source_ts = ts;
        self
    }

    /// Add a metadata entry. Absent values are stored as JSON null so the
    /// key set stays stable per provider.
    pub fn meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Text used for semantic embedding: title and body, trimmed.
    pub fn embedding_text(&self) -> Option<String> {
        let text = format!(
            "{} {}",
            self.title.as_deref().unwrap_or_default(),
            self.body.as_deref().unwrap_or_default()
        );
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

/// Webhook body is missing a field the normalizer needs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed payload: {0}")]
pub struct MalformedPayload(pub String);

/// Cap a string at `max` characters without splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Parse a provider timestamp: RFC 3339 first, then RFC 2822 (mail
/// headers).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_rfc2822(raw))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Slack-style `"1712345678.000200"` seconds to a UTC timestamp.
pub(crate) fn timestamp_from_epoch_secs(raw: &str) -> Option<DateTime<Utc>> {
    let secs: f64 = raw.parse().ok()?;
    let millis = (secs * 1000.0) as i64;
    Utc.timestamp_millis_opt(millis).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_to_severity() {
        assert_eq!(Severity::from_priority(Some(0)), Severity::High);
        assert_eq!(Severity::from_priority(Some(1)), Severity::High);
        assert_eq!(Severity::from_priority(Some(2)), Severity::Medium);
        assert_eq!(Severity::from_priority(Some(3)), Severity::Low);
        assert_eq!(Severity::from_priority(Some(4)), Severity::Low);
        assert_eq!(Severity::from_priority(None), Severity::Low);
    }

    #[test]
    fn test_truncate_is_char_based() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("🦀🦀🦀", 2), "🦀🦀");
        assert_eq!(truncate_chars("short", 100), "short");
        assert_eq!(truncate_chars("", 3), "");
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let rfc3339 = parse_timestamp("2024-03-01T12:00:00Z").unwrap();
        let rfc2822 = parse_timestamp("Fri, 01 Mar 2024 12:00:00 +0000").unwrap();
        assert_eq!(rfc3339, rfc2822);
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_epoch_seconds_scaled_to_millis() {
        let ts = timestamp_from_epoch_secs("1700000000.500").unwrap();
        assert_eq!(ts.timestamp_millis(), 1_700_000_000_500);
        assert!(timestamp_from_epoch_secs("nope").is_none());
    }

    #[test]
    fn test_embedding_text_skips_empty() {
        let empty = Signal::new(Provider::Slack, SignalKind::Message, "slack-C-1");
        assert_eq!(empty.embedding_text(), None);

        let titled = Signal::new(Provider::Linear, SignalKind::Ticket, "linear-1")
            .with_title(Some("Crash on save".into()));
        assert_eq!(titled.embedding_text().as_deref(), Some("Crash on save"));
    }

    #[test]
    fn test_body_is_capped_and_empty_dropped() {
        let s = Signal::new(Provider::GitHub, SignalKind::Ticket, "github-issue-1")
            .with_body(Some("x".repeat(50)), 10);
        assert_eq!(s.body.as_deref().map(str::len), Some(10));

        let s = Signal::new(Provider::GitHub, SignalKind::Ticket, "github-issue-2")
            .with_body(Some(String::new()), 10);
        assert_eq!(s.body, None);
    }
}
