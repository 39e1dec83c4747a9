//! Token lifecycle
//!
//! [`TokenManager`] is the only writer of credential rows after connect.
//! It hands adapters a usable access token, refreshing it first when it is
//! within five minutes of expiry. Concurrent callers may both refresh; the
//! provider's refresh grant is idempotent so that race is tolerated.

use std::collections::HashMap;

use chrono::{Duration, Utc};
use thiserror::Error;

use crate::config::ScopeConfig;
use crate::integrations::Provider;
use crate::storage::{ConnectionStore, Credential, SharedDatabase};

mod providers;

pub use providers::{
    callback_url, decode_state, encode_state, OAuthProviderConfig, OAuthState, TokenGrant,
    DEFAULT_EXPIRES_IN,
};

/// Refresh this long before the recorded expiry.
const REFRESH_MARGIN_MINUTES: i64 = 5;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("No {0} token found — connect {0} in Settings first")]
    NotConnected(Provider),
    #[error("{0} token expired and refresh failed")]
    RefreshFailed(Provider),
    #[error("credential storage error: {0}")]
    Storage(String),
}

impl From<anyhow::Error> for TokenError {
    fn from(err: anyhow::Error) -> Self {
        TokenError::Storage(format!("{err:#}"))
    }
}

/// Keyed credential store `(user, provider) -> Credential` with refresh.
#[derive(Clone)]
pub struct TokenManager {
    db: SharedDatabase,
    http: reqwest::Client,
    oauth: HashMap<Provider, OAuthProviderConfig>,
}

impl TokenManager {
    pub fn new(
        db: SharedDatabase,
        http: reqwest::Client,
        oauth: HashMap<Provider, OAuthProviderConfig>,
    ) -> Self {
        Self { db, http, oauth }
    }

    /// OAuth settings for every provider with a configured client.
    pub fn from_config(db: SharedDatabase, http: reqwest::Client, config: &ScopeConfig) -> Self {
        let oauth = config
            .oauth_clients
            .iter()
            .map(|(provider, client)| {
                (
                    *provider,
                    OAuthProviderConfig::for_provider(*provider, client.clone()),
                )
            })
            .collect();
        Self::new(db, http, oauth)
    }

    pub fn oauth(&self, provider: Provider) -> Option<&OAuthProviderConfig> {
        self.oauth.get(&provider)
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// A token that is valid now, refreshing first if it is about to
    /// expire. A failed refresh falls back to the stored token while it
    /// has not hard-expired.
    pub async fn get_valid_token(&self, user_id: &str, provider: Provider) -> Result<String, TokenError> {
        let credential = {
            let db = self.db.lock();
            ConnectionStore::new(&db).get(user_id, provider)?
        }
        .ok_or(TokenError::NotConnected(provider))?;

        let (Some(refresh_token), Some(expires_at)) =
            (credential.refresh_token.as_deref(), credential.expires_at)
        else {
            return Ok(credential.access_token);
        };

        let now = Utc::now();
        if now <= expires_at - Duration::minutes(REFRESH_MARGIN_MINUTES) {
            return Ok(credential.access_token);
        }

        match self.refresh(&credential, refresh_token).await {
            Ok(token) => Ok(token),
            Err(e) => {
                tracing::warn!(
                    provider = %provider,
                    user_id,
                    "Token refresh failed: {:#}",
                    e
                );
                if Utc::now() < expires_at {
                    Ok(credential.access_token)
                } else {
                    Err(TokenError::RefreshFailed(provider))
                }
            }
        }
    }

    async fn refresh(&self, credential: &Credential, refresh_token: &str) -> anyhow::Result<String> {
        let provider = credential.provider;
        let Some(config) = self.oauth.get(&provider) else {
            anyhow::bail!("No OAuth client configured for {}", provider);
        };

        let grant = config.refresh(&self.http, refresh_token).await?;
        let expires_at =
            Utc::now() + Duration::seconds(grant.expires_in.unwrap_or(DEFAULT_EXPIRES_IN) as i64);

        {
            let db = self.db.lock();
            ConnectionStore::new(&db).update_tokens(
                &credential.user_id,
                provider,
                &grant.access_token,
                grant.refresh_token.as_deref(),
                Some(expires_at),
            )?;
        }

        tracing::info!("Successfully refreshed OAuth token for {}", provider);
        Ok(grant.access_token)
    }

    /// Complete an OAuth callback: exchange the code and store the
    /// resulting credential.
    pub async fn complete_authorization(
        &self,
        user_id: &str,
        provider: Provider,
        app_url: &str,
        code: &str,
    ) -> anyhow::Result<Credential> {
        let Some(config) = self.oauth.get(&provider) else {
            anyhow::bail!(
                "{} OAuth is not configured. Set its client id and secret in env.",
                provider.display_name()
            );
        };
        let credential = config
            .exchange_code(&self.http, app_url, code)
            .await?
            .into_credential(user_id, provider);
        self.store(&credential)?;
        tracing::info!(provider = %provider, user_id, "Connected integration");
        Ok(credential)
    }

    pub fn store(&self, credential: &Credential) -> anyhow::Result<()> {
        let db = self.db.lock();
        ConnectionStore::new(&db).upsert(credential)
    }

    pub fn disconnect(&self, user_id: &str, provider: Provider) -> anyhow::Result<bool> {
        let db = self.db.lock();
        ConnectionStore::new(&db).delete(user_id, provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OAuthClient;
    use crate::storage::Database;
    use httpmock::prelude::*;
    use serde_json::json;

    fn manager(db: &SharedDatabase, token_url: Option<String>) -> TokenManager {
        let mut oauth = HashMap::new();
        if let Some(url) = token_url {
            let client = OAuthClient {
                client_id: "g-id".into(),
                client_secret: "g-secret".into(),
            };
            oauth.insert(
                Provider::Gmail,
                OAuthProviderConfig::for_provider(Provider::Gmail, client).with_token_url(url),
            );
        }
        TokenManager::new(db.clone(), reqwest::Client::new(), oauth)
    }

    fn store_gmail(db: &SharedDatabase, expires_in: Duration) -> Credential {
        let credential = Credential {
            user_id: "u1".into(),
            provider: Provider::Gmail,
            access_token: "old-token".into(),
            refresh_token: Some("refresh-1".into()),
            expires_at: Some(Utc::now() + expires_in),
            scope: None,
            metadata: json!({}),
        };
        ConnectionStore::new(&db.lock()).upsert(&credential).unwrap();
        credential
    }

    #[tokio::test]
    async fn test_missing_credential_is_not_connected() {
        let db = Database::in_memory().unwrap().shared();
        let err = manager(&db, None)
            .get_valid_token("u1", Provider::Slack)
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::NotConnected(Provider::Slack)));
        assert_eq!(
            err.to_string(),
            "No slack token found — connect slack in Settings first"
        );
    }

    #[tokio::test]
    async fn test_refresh_near_expiry_persists_later_expiry() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/token")
                    .body_includes("grant_type=refresh_token")
                    .body_includes("refresh_token=refresh-1");
                then.status(200)
                    .json_body(json!({"access_token": "new-token", "expires_in": 3600}));
            })
            .await;

        let db = Database::in_memory().unwrap().shared();
        let before = store_gmail(&db, Duration::minutes(1));

        let token = manager(&db, Some(server.url("/token")))
            .get_valid_token("u1", Provider::Gmail)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(token, "new-token");
        let after = ConnectionStore::new(&db.lock())
            .get("u1", Provider::Gmail)
            .unwrap()
            .unwrap();
        assert_eq!(after.access_token, "new-token");
        assert!(after.expires_at.unwrap() > before.expires_at.unwrap());
        assert_eq!(after.refresh_token.as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn test_fresh_token_skips_refresh() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(200).json_body(json!({"access_token": "unused"}));
            })
            .await;

        let db = Database::in_memory().unwrap().shared();
        store_gmail(&db, Duration::hours(1));
        let token = manager(&db, Some(server.url("/token")))
            .get_valid_token("u1", Provider::Gmail)
            .await
            .unwrap();

        assert_eq!(token, "old-token");
        mock.assert_calls_async(0).await;
    }

    #[tokio::test]
    async fn test_failed_refresh_falls_back_until_hard_expiry() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/token");
                then.status(400).json_body(json!({"error": "invalid_grant"}));
            })
            .await;

        let db = Database::in_memory().unwrap().shared();
        store_gmail(&db, Duration::minutes(2));
        let tokens = manager(&db, Some(server.url("/token")));
        assert_eq!(
            tokens.get_valid_token("u1", Provider::Gmail).await.unwrap(),
            "old-token"
        );

        store_gmail(&db, Duration::minutes(-1));
        let err = tokens.get_valid_token("u1", Provider::Gmail).await.unwrap_err();
        assert_eq!(err.to_string(), "gmail token expired and refresh failed");
    }
}
