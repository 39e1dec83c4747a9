//! Request and response types for the API

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use scope_core::integrations::Resource;
use scope_core::storage::{Scope, StoredSignal};
use scope_core::sync::SyncReport;

// ============================================================================
// Scope Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateScopeRequest {
    pub name: String,
    #[serde(default)]
    pub datasources: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateDatasourcesRequest {
    pub datasources: Vec<String>,
}

/// A scope plus the sync run its change triggered.
#[derive(Debug, Serialize)]
pub struct ScopeResponse {
    pub scope: Scope,
    pub sync: SyncReport,
}

#[derive(Debug, Serialize)]
pub struct ScopeListResponse {
    pub scopes: Vec<Scope>,
}

// ============================================================================
// Signal Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SignalsQuery {
    #[serde(alias = "scopeId")]
    pub scope_id: Option<String>,
    pub source: Option<String>,
    pub kind: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SignalsResponse {
    pub signals: Vec<StoredSignal>,
}

// ============================================================================
// Integration Types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub metadata: Value,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct IntegrationStatusResponse {
    pub connected: BTreeMap<String, ConnectionStatus>,
}

/// Credential supplied directly, bypassing the OAuth redirect.
#[derive(Debug, Deserialize)]
pub struct StoreCredentialRequest {
    #[serde(alias = "accessToken")]
    pub access_token: String,
    #[serde(default, alias = "refreshToken")]
    pub refresh_token: Option<String>,
    /// Seconds from now.
    #[serde(default, alias = "expiresIn")]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct ResourcesResponse {
    pub resources: Vec<Resource>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConnectedResponse {
    pub ok: bool,
    pub provider: String,
    pub metadata: Value,
}

// ============================================================================
// Chat Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TitleRequest {
    #[serde(alias = "conversationId")]
    pub conversation_id: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct TitleResponse {
    pub title: String,
}
