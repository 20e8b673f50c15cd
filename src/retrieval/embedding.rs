//! HTTP embedder for the Voyage embeddings API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{KlerError, KlerResult};

use super::semantic::Embedder;

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
    input_type: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

pub struct VoyageEmbedder {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    dimension: usize,
    timeout: Duration,
}

impl VoyageEmbedder {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: "https://api.voyageai.com/v1".into(),
            api_key: api_key.into(),
            model: "voyage-3-large".into(),
            dimension: 1024,
            timeout,
        }
    }

    /// Build from `VOYAGE_API_KEY`.
    pub fn from_env(timeout: Duration) -> KlerResult<Self> {
        let key = std::env::var("VOYAGE_API_KEY")
            .map_err(|_| KlerError::Auth("VOYAGE_API_KEY is not set".into()))?;
        Ok(Self::new(key, timeout))
    }

    pub fn with_model(mut self, model: impl Into<String>, dimension: usize) -> Self {
        self.model = model.into();
        self.dimension = dimension;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn embed(&self, input: &[String], input_type: &str) -> KlerResult<Vec<Vec<f32>>> {
        if input.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&EmbeddingRequest {
                input,
                model: &self.model,
                input_type,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    KlerError::UpstreamTimeout {
                        target: "embeddings".into(),
                        timeout_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    KlerError::Http(e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(KlerError::Retrieval(format!(
                "embedding request failed ({status}): {body}"
            )));
        }
        let body: EmbeddingResponse = response.json().await?;
        order_embeddings(body, input.len())
    }
}

/// Restore input order and check the count.
fn order_embeddings(mut body: EmbeddingResponse, expected: usize) -> KlerResult<Vec<Vec<f32>>> {
    if body.data.len() != expected {
        return Err(KlerError::Retrieval(format!(
            "expected {expected} embeddings, got {}",
            body.data.len()
        )));
    }
    body.data.sort_by_key(|item| item.index);
    Ok(body.data.into_iter().map(|item| item.embedding).collect())
}

#[async_trait]
impl Embedder for VoyageEmbedder {
    async fn embed_documents(&self, texts: &[String]) -> KlerResult<Vec<Vec<f32>>> {
        self.embed(texts, "document").await
    }

    async fn embed_query(&self, text: &str) -> KlerResult<Vec<f32>> {
        let mut out = self.embed(&[text.to_string()], "query").await?;
        out.pop()
            .ok_or_else(|| KlerError::Retrieval("empty embedding response".into()))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_index() {
        let body: EmbeddingResponse = serde_json::from_str(
            r#"{"data": [{"embedding": [2.0], "index": 1}, {"embedding": [1.0], "index": 0}]}"#,
        )
        .unwrap();
        let out = order_embeddings(body, 2).unwrap();
        assert_eq!(out, vec![vec![1.0], vec![2.0]]);
    }

    #[test]
    fn count_mismatch_is_error() {
        let body: EmbeddingResponse =
            serde_json::from_str(r#"{"data": [{"embedding": [1.0], "index": 0}]}"#).unwrap();
        assert!(order_embeddings(body, 2).is_err());
    }

    #[test]
    fn request_serializes() {
        let input = vec!["a".to_string()];
        let json = serde_json::to_value(EmbeddingRequest {
            input: &input,
            model: "voyage-3-large",
            input_type: "query",
        })
        .unwrap();
        assert_eq!(json["input_type"], "query");
        assert_eq!(json["input"][0], "a");
    }
}
