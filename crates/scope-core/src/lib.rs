//! Scope core library
//!
//! Integration sync pipeline and agent tool protocol:
//! - Credential lifecycle and OAuth plumbing (`auth`)
//! - Provider adapters and signal normalization (`integrations`)
//! - Bulk sync (`sync`) and single-event webhook ingest (`ingest`)
//! - Tool registry, confirmation gate, streaming protocol (`tools`, `agent`)
//! - SQLite persistence (`storage`)

pub mod agent;
pub mod ai;
pub mod auth;
pub mod config;
pub mod ingest;
pub mod integrations;
pub mod paths;
pub mod storage;
pub mod sync;
pub mod tools;

pub use config::ScopeConfig;
pub use integrations::{DatasourceRef, Provider, Signal};
