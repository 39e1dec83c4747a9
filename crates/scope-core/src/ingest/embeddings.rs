//! Semantic embeddings for ingested signals
//!
//! Any OpenAI-compatible `/embeddings` endpoint works. Vectors are stored
//! as little-endian f32 blobs next to the signal row.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::config::EmbeddingConfig;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

pub struct OpenAiEmbedder {
    http: reqwest::Client,
    config: EmbeddingConfig,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(http: reqwest::Client, config: EmbeddingConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.config.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(&json!({ "model": self.config.model, "input": text }))
            .send()
            .await
            .context("Failed to send embedding request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Embedding request failed ({}): {}", status, body);
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .context("Failed to parse embedding response")?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .context("No embedding returned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn test_embed_posts_model_and_input() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/embeddings")
                    .header("authorization", "Bearer sk-embed")
                    .json_body(json!({"model": "text-embedding-3-small", "input": "Crash on save"}));
                then.status(200)
                    .json_body(json!({"data": [{"embedding": [0.5, -0.25, 1.0]}]}));
            })
            .await;

        let embedder = OpenAiEmbedder::new(
            reqwest::Client::new(),
            EmbeddingConfig {
                base_url: server.url("/v1"),
                api_key: "sk-embed".into(),
                model: "text-embedding-3-small".into(),
            },
        );
        let vector = embedder.embed("Crash on save").await.unwrap();

        mock.assert_async().await;
        assert_eq!(vector, vec![0.5, -0.25, 1.0]);
    }

    #[tokio::test]
    async fn test_embed_surfaces_http_errors() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/embeddings");
                then.status(429).body("rate limited");
            })
            .await;

        let embedder = OpenAiEmbedder::new(
            reqwest::Client::new(),
            EmbeddingConfig {
                base_url: server.base_url(),
                api_key: "k".into(),
                model: "m".into(),
            },
        );
        let err = embedder.embed("x").await.unwrap_err();
        assert!(err.to_string().contains("429"));
    }
}
