//! Inbound webhook envelope handling
//!
//! Order matters: provider handshakes are answered before anything else,
//! then the scope id is required, then the payload is normalized. A
//! payload that fails any step produces no partial signal.

use serde_json::{json, Value};

use super::verify::{verify_github, verify_slack};
use super::IngestError;
use crate::config::WebhookSecrets;
use crate::integrations::{github, gmail, linear, notion, slack, Provider, Signal};

/// Result of reading one webhook delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    /// Provider verification request; respond with this body and stop.
    Challenge(Value),
    /// Housekeeping event that is acknowledged but never stored.
    Ignored,
    Accepted(IngestJob),
}

/// A normalized signal bound to its target scope, ready to embed and store.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestJob {
    pub scope_id: String,
    pub signal: Signal,
}

/// Provider handshake payloads, answered before any scope check.
pub fn handshake(provider: Provider, payload: &Value) -> Option<Value> {
    let is_verification = payload.get("type").and_then(Value::as_str) == Some("url_verification");
    match provider {
        Provider::Slack if is_verification => {
            Some(json!({ "challenge": payload.get("challenge") }))
        }
        Provider::Notion if is_verification || payload.get("verification_token").is_some() => {
            tracing::info!("Notion webhook verification request received");
            let challenge = payload
                .get("challenge")
                .or_else(|| payload.get("verification_token"));
            Some(json!({ "challenge": challenge }))
        }
        _ => None,
    }
}

/// Webhook-shape normalization, one function per provider.
pub fn normalize(provider: Provider, payload: &Value) -> Result<Signal, IngestError> {
    let signal = match provider {
        Provider::Linear => linear::normalize_webhook(payload),
        Provider::Slack => slack::normalize_webhook(payload),
        Provider::Notion => notion::normalize_webhook(payload),
        Provider::GitHub => github::normalize_webhook(payload),
        Provider::Gmail => gmail::normalize_webhook(payload),
    }?;
    Ok(signal)
}

/// Read a delivery: handshake, scope, then normalization.
pub fn prepare(provider: Provider, payload: &Value) -> Result<WebhookOutcome, IngestError> {
    if let Some(challenge) = handshake(provider, payload) {
        return Ok(WebhookOutcome::Challenge(challenge));
    }
    if provider == Provider::Slack && slack::is_housekeeping(payload) {
        tracing::debug!("Skipping Slack housekeeping event");
        return Ok(WebhookOutcome::Ignored);
    }

    let scope_id = ["scopeId", "scope_id"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
        .filter(|id| !id.is_empty())
        .ok_or(IngestError::MissingScope)?
        .to_string();
    let datasource = ["datasourceId", "datasource_id"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str));

    let signal = normalize(provider, payload)?.with_datasource(datasource);
    Ok(WebhookOutcome::Accepted(IngestJob { scope_id, signal }))
}

/// Check the provider's request signature when a secret is configured.
/// Providers without a configured secret are accepted unchecked.
pub fn check_signature<'h>(
    provider: Provider,
    secrets: &WebhookSecrets,
    header: impl Fn(&str) -> Option<&'h str>,
    body: &[u8],
) -> Result<(), IngestError> {
    let result = match provider {
        Provider::GitHub => match &secrets.github {
            Some(secret) => {
                let signature = header("x-hub-signature-256").unwrap_or_default();
                verify_github(body, signature, secret)
            }
            None => Ok(()),
        },
        Provider::Slack => match &secrets.slack {
            Some(secret) => {
                let timestamp = header("x-slack-request-timestamp").unwrap_or_default();
                let signature = header("x-slack-signature").unwrap_or_default();
                verify_slack(body, timestamp, signature, secret)
            }
            None => Ok(()),
        },
        Provider::Linear | Provider::Notion | Provider::Gmail => Ok(()),
    };

    result.map_err(|e| {
        tracing::warn!(provider = %provider, "Rejected webhook: {:#}", e);
        IngestError::BadSignature(format!("{e:#}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::verify::sign_hex;

    #[test]
    fn test_handshakes_short_circuit_before_scope_check() {
        let slack = json!({"type": "url_verification", "challenge": "abc"});
        assert_eq!(
            prepare(Provider::Slack, &slack).unwrap(),
            WebhookOutcome::Challenge(json!({"challenge": "abc"}))
        );

        let notion = json!({"verification_token": "tok-1"});
        assert_eq!(
            prepare(Provider::Notion, &notion).unwrap(),
            WebhookOutcome::Challenge(json!({"challenge": "tok-1"}))
        );

        // Only Slack and Notion have handshakes.
        assert!(handshake(Provider::GitHub, &slack).is_none());
    }

    #[test]
    fn test_slack_subtype_events_are_acknowledged_not_stored() {
        let edited = json!({
            "scopeId": "s1",
            "event": {"type": "message", "subtype": "message_changed", "ts": "1.0", "channel": "C1"}
        });
        assert_eq!(prepare(Provider::Slack, &edited).unwrap(), WebhookOutcome::Ignored);
        assert!(matches!(
            normalize(Provider::Slack, &edited),
            Err(IngestError::Malformed(_))
        ));
    }

    #[test]
    fn test_scope_is_required() {
        let payload = json!({"event": {"ts": "1.0", "channel": "C1"}});
        assert!(matches!(
            prepare(Provider::Slack, &payload),
            Err(IngestError::MissingScope)
        ));
    }

    #[test]
    fn test_accepts_both_scope_spellings_and_datasource() {
        let payload = json!({
            "scope_id": "s1",
            "datasourceId": "github:acme/api",
            "action": "opened",
            "issue": {"id": 9, "title": "Broken"}
        });
        let WebhookOutcome::Accepted(job) = prepare(Provider::GitHub, &payload).unwrap() else {
            panic!("expected accepted job");
        };
        assert_eq!(job.scope_id, "s1");
        assert_eq!(job.signal.external_id, "github-issue-9");
        assert_eq!(job.signal.datasource_ref.as_deref(), Some("github:acme/api"));
    }

    #[test]
    fn test_missing_id_is_malformed() {
        let payload = json!({"scopeId": "s1", "data": {"title": "no id"}});
        assert!(matches!(
            prepare(Provider::Linear, &payload),
            Err(IngestError::Malformed(_))
        ));
    }

    #[test]
    fn test_signature_only_checked_when_configured() {
        let body = br#"{"scopeId":"s1"}"#;
        let none = WebhookSecrets::default();
        assert!(check_signature(Provider::GitHub, &none, |_| None, body).is_ok());

        let secrets = WebhookSecrets {
            github: Some("gh".into()),
            slack: None,
        };
        let good = format!("sha256={}", sign_hex("gh", &[body]));
        let lookup = |name: &str| (name == "x-hub-signature-256").then_some(good.as_str());
        assert!(check_signature(Provider::GitHub, &secrets, lookup, body).is_ok());
        assert!(matches!(
            check_signature(Provider::GitHub, &secrets, |_| None, body),
            Err(IngestError::BadSignature(_))
        ));
    }
}
