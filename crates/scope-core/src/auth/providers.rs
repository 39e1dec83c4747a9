//! Per-provider OAuth application settings
//!
//! Authorization URLs, token endpoints, and the provider-specific shape of
//! each token response. Notion is the odd one out: it authenticates the
//! token request with HTTP Basic and a JSON body instead of form fields.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

use crate::config::OAuthClient;
use crate::integrations::Provider;
use crate::storage::Credential;

/// Assumed lifetime when a refresh response omits `expires_in`.
pub const DEFAULT_EXPIRES_IN: u64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthProviderConfig {
    pub provider: Provider,
    pub auth_url: String,
    pub token_url: String,
    pub client: OAuthClient,
    pub scopes: &'static [&'static str],
    pub scope_separator: &'static str,
    pub extra_auth_params: &'static [(&'static str, &'static str)],
    /// Send client credentials as HTTP Basic with a JSON body.
    pub basic_auth: bool,
}

impl OAuthProviderConfig {
    pub fn for_provider(provider: Provider, client: OAuthClient) -> Self {
        let (auth_url, token_url) = match provider {
            Provider::GitHub => (
                "https://github.com/login/oauth/authorize",
                "https://github.com/login/oauth/access_token",
            ),
            Provider::Linear => (
                "https://linear.app/oauth/authorize",
                "https://api.linear.app/oauth/token",
            ),
            Provider::Slack => (
                "https://slack.com/oauth/v2/authorize",
                "https://slack.com/api/oauth.v2.access",
            ),
            Provider::Notion => (
                "https://api.notion.com/v1/oauth/authorize",
                "https://api.notion.com/v1/oauth/token",
            ),
            Provider::Gmail => (
                "https://accounts.google.com/o/oauth2/v2/auth",
                "https://oauth2.googleapis.com/token",
            ),
        };

        let (scopes, scope_separator, extra_auth_params): (
            &'static [&'static str],
            &'static str,
            &'static [(&'static str, &'static str)],
        ) = match provider {
            Provider::GitHub => (&["repo", "read:org", "read:user"], " ", &[]),
            Provider::Linear => (
                &["read", "write"],
                ",",
                &[("response_type", "code"), ("prompt", "consent")],
            ),
            Provider::Slack => (
                &["channels:history", "channels:read", "chat:write", "users:read"],
                ",",
                &[],
            ),
            Provider::Notion => (&[], " ", &[("response_type", "code"), ("owner", "user")]),
            Provider::Gmail => (
                &[
                    "https://www.googleapis.com/auth/gmail.readonly",
                    "https://www.googleapis.com/auth/gmail.send",
                ],
                " ",
                &[("access_type", "offline"), ("prompt", "consent")],
            ),
        };

        Self {
            provider,
            auth_url: auth_url.to_string(),
            token_url: token_url.to_string(),
            client,
            scopes,
            scope_separator,
            extra_auth_params,
            basic_auth: provider == Provider::Notion,
        }
    }

    pub fn with_token_url(mut self, token_url: impl Into<String>) -> Self {
        self.token_url = token_url.into();
        self
    }

    /// Consent-screen URL carrying the encoded `{userId, provider}` state.
    pub fn authorize_url(&self, app_url: &str, user_id: &str) -> Result<Url> {
        let mut url = Url::parse(&self.auth_url).context("Failed to parse authorization URL")?;
        let state = encode_state(&OAuthState {
            user_id: user_id.to_string(),
            provider: self.provider,
        })?;

        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("client_id", &self.client.client_id)
                .append_pair("redirect_uri", &callback_url(app_url, self.provider))
                .append_pair("state", &state);
            if !self.scopes.is_empty() {
                pairs.append_pair("scope", &self.scopes.join(self.scope_separator));
            }
            for (key, value) in self.extra_auth_params {
                pairs.append_pair(key, value);
            }
            if !self.extra_auth_params.iter().any(|(k, _)| *k == "response_type") {
                pairs.append_pair("response_type", "code");
            }
        }

        Ok(url)
    }

    /// Exchange an authorization code for a token grant.
    pub async fn exchange_code(
        &self,
        http: &reqwest::Client,
        app_url: &str,
        code: &str,
    ) -> Result<TokenGrant> {
        let redirect_uri = callback_url(app_url, self.provider);
        let data = self
            .token_request(
                http,
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("redirect_uri", redirect_uri.as_str()),
                ],
            )
            .await
            .context("Token exchange failed")?;
        parse_grant(self.provider, &data)
    }

    /// Standard `refresh_token` grant.
    pub async fn refresh(&self, http: &reqwest::Client, refresh_token: &str) -> Result<TokenGrant> {
        let data = self
            .token_request(
                http,
                &[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                ],
            )
            .await
            .context("Token refresh failed")?;
        parse_grant(self.provider, &data)
    }

    async fn token_request(&self, http: &reqwest::Client, fields: &[(&str, &str)]) -> Result<Value> {
        let request = http
            .post(&self.token_url)
            .header(reqwest::header::ACCEPT, "application/json");

        let request = if self.basic_auth {
            let body: serde_json::Map<String, Value> = fields
                .iter()
                .map(|(k, v)| (k.to_string(), json!(v)))
                .collect();
            request
                .basic_auth(&self.client.client_id, Some(&self.client.client_secret))
                .json(&body)
        } else {
            let mut form: Vec<(&str, &str)> = fields.to_vec();
            form.push(("client_id", self.client.client_id.as_str()));
            form.push(("client_secret", self.client.client_secret.as_str()));
            request.form(&form)
        };

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to reach {} token endpoint", self.provider))?;
        let status = response.status();
        let data: Value = response.json().await.unwrap_or(Value::Null);

        if !status.is_success() || data.get("error").is_some_and(|e| !e.is_null()) {
            let message = data
                .get("error_description")
                .and_then(Value::as_str)
                .or_else(|| data.get("error").and_then(Value::as_str))
                .unwrap_or("Token exchange failed");
            anyhow::bail!("{} ({}): {}", self.provider, status, message);
        }
        Ok(data)
    }
}

/// Normalized token endpoint response.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
    pub scope: Option<String>,
    pub metadata: Value,
}

impl TokenGrant {
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expires_in
            .map(|secs| now + Duration::seconds(secs as i64))
    }

    pub fn into_credential(self, user_id: &str, provider: Provider) -> Credential {
        let expires_at = self.expires_at(Utc::now());
        Credential {
            user_id: user_id.to_string(),
            provider,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            scope: self.scope,
            metadata: self.metadata,
        }
    }
}

/// Pull the fields each provider actually returns.
fn parse_grant(provider: Provider, data: &Value) -> Result<TokenGrant> {
    let text = |pointer: &str| {
        data.pointer(pointer)
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let access_token = text("/access_token")
        .filter(|t| !t.is_empty())
        .context("No access token received")?;
    let expires_in = data.get("expires_in").and_then(Value::as_u64);

    let grant = match provider {
        Provider::GitHub => TokenGrant {
            access_token,
            refresh_token: None,
            expires_in: None,
            scope: text("/scope"),
            metadata: json!({ "token_type": data.get("token_type") }),
        },
        Provider::Linear => TokenGrant {
            access_token,
            refresh_token: None,
            expires_in,
            scope: text("/scope"),
            metadata: json!({}),
        },
        Provider::Slack => TokenGrant {
            access_token,
            refresh_token: None,
            expires_in: None,
            scope: text("/scope"),
            metadata: json!({
                "team_id": data.pointer("/team/id"),
                "team_name": data.pointer("/team/name"),
                "bot_user_id": data.get("bot_user_id"),
            }),
        },
        Provider::Notion => TokenGrant {
            access_token,
            refresh_token: None,
            expires_in: None,
            scope: None,
            metadata: json!({
                "workspace_name": data.get("workspace_name"),
                "workspace_icon": data.get("workspace_icon"),
                "workspace_id": data.get("workspace_id"),
                "bot_id": data.get("bot_id"),
            }),
        },
        Provider::Gmail => TokenGrant {
            access_token,
            refresh_token: text("/refresh_token"),
            expires_in,
            scope: text("/scope"),
            metadata: json!({}),
        },
    };
    Ok(grant)
}

/// OAuth `state` round-tripped through the consent screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthState {
    pub user_id: String,
    pub provider: Provider,
}

pub fn encode_state(state: &OAuthState) -> Result<String> {
    let json = serde_json::to_vec(state)?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

pub fn decode_state(raw: &str) -> Result<OAuthState> {
    let bytes = URL_SAFE_NO_PAD
        .decode(raw.trim_end_matches('='))
        .context("Invalid state parameter")?;
    serde_json::from_slice(&bytes).context("Invalid state parameter")
}

pub fn callback_url(app_url: &str, provider: Provider) -> String {
    format!(
        "{}/api/integrations/{}/callback",
        app_url.trim_end_matches('/'),
        provider.storage_key()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn client() -> OAuthClient {
        OAuthClient {
            client_id: "cid".into(),
            client_secret: "csecret".into(),
        }
    }

    #[test]
    fn test_authorize_url_params() {
        let config = OAuthProviderConfig::for_provider(Provider::Slack, client());
        let url = config.authorize_url("http://localhost:3000", "user-1").unwrap();
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(pairs["client_id"], "cid");
        assert_eq!(
            pairs["redirect_uri"],
            "http://localhost:3000/api/integrations/slack/callback"
        );
        assert_eq!(pairs["scope"], "channels:history,channels:read,chat:write,users:read");
        assert_eq!(pairs["response_type"], "code");

        let state = decode_state(&pairs["state"]).unwrap();
        assert_eq!(state.user_id, "user-1");
        assert_eq!(state.provider, Provider::Slack);
    }

    #[test]
    fn test_notion_has_no_scope_and_single_response_type() {
        let config = OAuthProviderConfig::for_provider(Provider::Notion, client());
        let url = config.authorize_url("http://localhost:3000", "u").unwrap();
        assert!(url.query_pairs().all(|(k, _)| k != "scope"));
        assert_eq!(url.query_pairs().filter(|(k, _)| k == "response_type").count(), 1);
        assert!(url.query_pairs().any(|(k, v)| k == "owner" && v == "user"));
    }

    #[test]
    fn test_state_rejects_garbage() {
        assert!(decode_state("not base64 at all!").is_err());
        assert!(decode_state(&URL_SAFE_NO_PAD.encode(b"{\"userId\":1}")).is_err());
    }

    #[test]
    fn test_provider_specific_grant_parsing() {
        let slack = parse_grant(
            Provider::Slack,
            &json!({"access_token": "xoxb", "scope": "chat:write",
                    "team": {"id": "T1", "name": "Acme"}, "bot_user_id": "B1"}),
        )
        .unwrap();
        assert_eq!(slack.metadata["team_name"], "Acme");
        assert_eq!(slack.refresh_token, None);

        let gmail = parse_grant(
            Provider::Gmail,
            &json!({"access_token": "ya29", "refresh_token": "1//r", "expires_in": 3599}),
        )
        .unwrap();
        assert_eq!(gmail.refresh_token.as_deref(), Some("1//r"));
        assert_eq!(gmail.expires_in, Some(3599));

        assert!(parse_grant(Provider::GitHub, &json!({"token_type": "bearer"})).is_err());
    }

    #[tokio::test]
    async fn test_notion_exchange_uses_basic_auth() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/token")
                    .header("authorization", "Basic Y2lkOmNzZWNyZXQ=")
                    .body_includes("\"grant_type\":\"authorization_code\"");
                then.status(200).json_body(json!({
                    "access_token": "secret_abc",
                    "workspace_name": "Acme HQ",
                    "bot_id": "bot-1"
                }));
            })
            .await;

        let config = OAuthProviderConfig::for_provider(Provider::Notion, client())
            .with_token_url(server.url("/token"));
        let grant = config
            .exchange_code(&reqwest::Client::new(), "http://localhost:3000", "code-1")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(grant.access_token, "secret_abc");
        assert_eq!(grant.metadata["workspace_name"], "Acme HQ");
    }

    #[tokio::test]
    async fn test_error_field_fails_exchange_even_on_200() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/token").body_includes("client_secret=csecret");
                then.status(200).json_body(json!({
                    "error": "bad_verification_code",
                    "error_description": "The code passed is incorrect or expired."
                }));
            })
            .await;

        let config = OAuthProviderConfig::for_provider(Provider::GitHub, client())
            .with_token_url(server.url("/token"));
        let err = config
            .exchange_code(&reqwest::Client::new(), "http://localhost:3000", "stale")
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("The code passed is incorrect or expired."));
    }
}
