//! Scope Server
//!
//! HTTP API over the scope core: scope and datasource management, sync
//! triggers, provider webhooks, integration connections and the streaming
//! chat endpoint. This is a library crate; the binary calls `start_server()`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{http::Method, middleware, routing::get, Json, Router};
use serde::Serialize;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use scope_core::agent::{AgentRuntime, ChatService};
use scope_core::ai::{ChatModel, OpenAiCompatClient};
use scope_core::auth::TokenManager;
use scope_core::ingest::{Embedder, IngestPipeline, OpenAiEmbedder};
use scope_core::integrations::{http_client, ProviderClient};
use scope_core::storage::{Database, SharedDatabase};
use scope_core::sync::SyncOrchestrator;
use scope_core::tools::ToolRegistry;
use scope_core::ScopeConfig;

pub mod auth;
pub mod error;
pub mod routes;
pub mod types;

/// Configuration for starting the server.
pub struct ServerConfig {
    /// Port to listen on (default: 3000).
    pub port: u16,
    /// Bearer token required on `/api` when set.
    pub api_token: Option<String>,
    pub core: ScopeConfig,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);
        let api_token = std::env::var("SCOPE_API_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty());
        if api_token.is_none() {
            tracing::warn!("SCOPE_API_TOKEN not set; /api accepts any caller with X-User-Id");
        }
        Self {
            port,
            api_token,
            core: ScopeConfig::from_env(),
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ScopeConfig>,
    pub db: SharedDatabase,
    pub tokens: TokenManager,
    pub client: ProviderClient,
    pub sync: SyncOrchestrator,
    pub ingest: IngestPipeline,
    /// None when no model is configured.
    pub chat: Option<ChatService>,
    pub api_token: Option<Arc<str>>,
}

impl AppState {
    /// Open the on-disk database and wire every service from config.
    pub fn from_config(config: ScopeConfig, api_token: Option<String>) -> anyhow::Result<Self> {
        let db = Database::new(&config.database_path())?.shared();
        Self::with_database(config, db, api_token)
    }

    pub fn with_database(
        config: ScopeConfig,
        db: SharedDatabase,
        api_token: Option<String>,
    ) -> anyhow::Result<Self> {
        let http = http_client()?;
        let tokens = TokenManager::from_config(db.clone(), http.clone(), &config);
        let client = ProviderClient::new(http.clone(), config.endpoints.clone());
        let sync = SyncOrchestrator::new(db.clone(), tokens.clone(), client.clone());

        let embedder = config.embedding.clone().map(|embedding| {
            Arc::new(OpenAiEmbedder::new(http.clone(), embedding)) as Arc<dyn Embedder>
        });
        let ingest = IngestPipeline::new(db.clone(), embedder);

        // Model streams outlive the provider request timeout.
        let chat = match config.model.clone() {
            Some(model_config) => {
                let model_http = reqwest::Client::builder()
                    .user_agent(concat!("scope/", env!("CARGO_PKG_VERSION")))
                    .build()?;
                let model: Arc<dyn ChatModel> =
                    Arc::new(OpenAiCompatClient::new(model_http, model_config));
                Some(ChatService::new(
                    db.clone(),
                    tokens.clone(),
                    client.clone(),
                    AgentRuntime::new(model, ToolRegistry::new()),
                ))
            }
            None => None,
        };

        Ok(Self {
            config: Arc::new(config),
            db,
            tokens,
            client,
            sync,
            ingest,
            chat,
            api_token: api_token.map(Arc::from),
        })
    }

    /// Swap the chat model, keeping the rest of the wiring.
    pub fn with_model(mut self, model: Arc<dyn ChatModel>) -> Self {
        self.chat = Some(ChatService::new(
            self.db.clone(),
            self.tokens.clone(),
            self.client.clone(),
            AgentRuntime::new(model, ToolRegistry::new()),
        ));
        self
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::PUT,
            Method::DELETE,
        ])
        .allow_headers(Any);

    // Provider callbacks and webhooks cannot carry our auth headers.
    let api = routes::api_router()
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ))
        .merge(routes::public_router());

    let features = HashMap::from([
        ("chat".to_string(), state.chat.is_some()),
        ("embeddings".to_string(), state.config.embedding.is_some()),
    ]);

    Router::new()
        .route("/health", get(move || health(features.clone())))
        .nest("/api", api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the server and block until shutdown.
pub async fn start_server(config: ServerConfig) -> anyhow::Result<()> {
    let state = AppState::from_config(config.core, config.api_token)?;
    tracing::info!(
        database = %state.config.database_path().display(),
        "Opened database"
    );
    let app = build_router(state);

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    tracing::info!("Starting scope-server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

async fn health(features: HashMap<String, bool>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        features,
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    features: HashMap<String, bool>,
}
