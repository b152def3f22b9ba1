//! Cross-encoder re-ranking over an HTTP scoring service.
//!
//! The re-ranker is an optional second stage after vector search. It scores
//! each (query, document) pair jointly and is usually more precise than the
//! embedding distance alone. Failures here must never fail a query; the
//! engine logs and falls back to vector ordering.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::RerankerConfig;

/// Scores documents against a query. Implementations return exactly one
/// score per input document, in input order; higher means more relevant.
#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &str;

    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>>;
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

#[derive(Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f32,
}

/// Re-ranker backed by a Cohere/Jina-style HTTP endpoint:
/// POST `{model, query, documents}` returning
/// `{"results": [{"index": 0, "relevance_score": 0.97}, ...]}`.
pub struct HttpReranker {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpReranker {
    pub fn from_config(config: &RerankerConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow!("reranker.url is not configured"))?;
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| "rerank-v3.5".to_string());
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build reranker HTTP client")?;

        Ok(Self {
            client,
            url,
            model,
            api_key,
        })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    fn name(&self) -> &str {
        "http"
    }

    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let body = RerankRequest {
            model: &self.model,
            query,
            documents,
        };

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .context("Reranker request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Reranker returned {}: {}", status, text);
        }

        let text = response
            .text()
            .await
            .context("Failed to read reranker response")?;
        parse_rerank_response(&text, documents.len())
    }
}

/// Parse a rerank response into one score per input document. Results may
/// arrive in any order; `index` maps each score back to its document.
/// Documents the service omitted score 0.
pub fn parse_rerank_response(body: &str, n_documents: usize) -> Result<Vec<f32>> {
    let parsed: RerankResponse =
        serde_json::from_str(body).context("Failed to parse reranker response")?;

    let mut scores = vec![0.0f32; n_documents];
    for result in parsed.results {
        if result.index >= n_documents {
            anyhow::bail!(
                "Reranker returned index {} for {} documents",
                result.index,
                n_documents
            );
        }
        scores[result.index] = result.relevance_score;
    }
    Ok(scores)
}
