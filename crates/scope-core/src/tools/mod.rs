//! Agent tools
//!
//! A static registry of read, render and write capabilities. Writes only
//! run when the [`WriteGuard`] in the tool context releases a confirmed
//! authorization.

mod live;
mod read;
pub mod registry;
mod render;
mod write;

pub use registry::{
    parse_params, Capability, DenyWrites, DispatchOutcome, ToolContext, ToolKind, ToolRegistry,
    ToolResult, UiDescriptor, WriteGuard, DEFAULT_TOOL_TIMEOUT,
};

pub(crate) use render::json_list;

/// Context over an in-memory store with every provider routed to `base_url`.
#[cfg(test)]
pub(crate) fn test_context(db: &crate::storage::SharedDatabase, base_url: &str) -> ToolContext {
    use crate::auth::TokenManager;
    use crate::integrations::{ProviderClient, ProviderEndpoints};

    let http = reqwest::Client::new();
    ToolContext::new(
        db.clone(),
        TokenManager::new(db.clone(), http.clone(), std::collections::HashMap::new()),
        ProviderClient::new(http, ProviderEndpoints::under(base_url)),
        "u1",
        "s1",
    )
}
