//! Environment-driven configuration
//!
//! Every external dependency is optional. A missing value disables the
//! feature that needs it and logs a warning; nothing here panics.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::integrations::{Provider, ProviderEndpoints};
use crate::paths;

pub const DEFAULT_APP_URL: &str = "http://localhost:3000";
pub const DEFAULT_MODEL_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// OAuth application credentials for one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
}

/// OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

/// OpenAI-compatible embeddings endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

/// Shared secrets for verifying inbound webhook signatures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookSecrets {
    pub github: Option<String>,
    pub slack: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScopeConfig {
    pub data_dir: PathBuf,
    /// Public base URL, used to build OAuth callback URLs.
    pub app_url: String,
    pub endpoints: ProviderEndpoints,
    pub oauth_clients: HashMap<Provider, OAuthClient>,
    pub model: Option<ModelConfig>,
    pub embedding: Option<EmbeddingConfig>,
    pub webhook_secrets: WebhookSecrets,
}

impl ScopeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let data_dir = get("SCOPE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(paths::data_dir);

        let mut oauth_clients = HashMap::new();
        for provider in Provider::all() {
            let prefix = oauth_env_prefix(*provider);
            match (
                get(&format!("{prefix}_CLIENT_ID")),
                get(&format!("{prefix}_CLIENT_SECRET")),
            ) {
                (Some(client_id), Some(client_secret)) => {
                    oauth_clients.insert(
                        *provider,
                        OAuthClient {
                            client_id,
                            client_secret,
                        },
                    );
                }
                _ => tracing::debug!(provider = %provider, "No OAuth client configured"),
            }
        }

        let model = match get("SCOPE_MODEL_API_KEY") {
            Some(api_key) => Some(ModelConfig {
                base_url: get("SCOPE_MODEL_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_MODEL_BASE_URL.to_string()),
                api_key,
                model: get("SCOPE_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            }),
            None => {
                tracing::warn!("SCOPE_MODEL_API_KEY not set; chat is disabled");
                None
            }
        };

        let embedding = match get("SCOPE_EMBEDDING_API_KEY") {
            Some(api_key) => Some(EmbeddingConfig {
                base_url: get("SCOPE_EMBEDDING_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_MODEL_BASE_URL.to_string()),
                api_key,
                model: get("SCOPE_EMBEDDING_MODEL")
                    .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
            }),
            None => {
                tracing::warn!("SCOPE_EMBEDDING_API_KEY not set; signals are stored without embeddings");
                None
            }
        };

        Self {
            data_dir,
            app_url: get("SCOPE_APP_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_APP_URL.to_string()),
            endpoints: ProviderEndpoints::default(),
            oauth_clients,
            model,
            embedding,
            webhook_secrets: WebhookSecrets {
                github: get("GITHUB_WEBHOOK_SECRET"),
                slack: get("SLACK_SIGNING_SECRET"),
            },
        }
    }

    pub fn database_path(&self) -> PathBuf {
        paths::database_path_in(&self.data_dir)
    }
}

/// Environment prefix for a provider's OAuth app. Gmail uses Google's.
fn oauth_env_prefix(provider: Provider) -> &'static str {
    match provider {
        Provider::Linear => "LINEAR",
        Provider::Slack => "SLACK",
        Provider::Notion => "NOTION",
        Provider::GitHub => "GITHUB",
        Provider::Gmail => "GOOGLE",
    }
}
