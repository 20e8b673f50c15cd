//! Document discovery: resolve a documentation name to a document id, then
//! fetch topic-focused text for it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{KlerError, KlerResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub id: String,
    #[serde(default)]
    pub title: String,
}

#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Best match for a documentation name, `None` when nothing matches.
    async fn find_document(&self, name: &str) -> KlerResult<Option<DocumentRef>>;

    /// Raw documentation text for `document_id`, focused on `topic`.
    async fn fetch(&self, document_id: &str, topic: &str) -> KlerResult<String>;
}

/// Client for a Context7-style documentation service.
pub struct Context7Client {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    tokens: usize,
    timeout: Duration,
}

impl Context7Client {
    pub fn new(timeout: Duration, tokens: usize) -> Self {
        Self {
            client: Client::new(),
            base_url: "https://context7.com/api/v1".into(),
            api_key: std::env::var("CONTEXT7_API_KEY").ok(),
            tokens,
            timeout,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let req = self.client.get(url).timeout(self.timeout);
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    fn map_send_error(&self, e: reqwest::Error) -> KlerError {
        if e.is_timeout() {
            KlerError::UpstreamTimeout {
                target: "documentation service".into(),
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            KlerError::Http(e)
        }
    }
}

/// Accepts `{"results": [...]}` or a bare array of hits.
fn first_hit(body: &serde_json::Value) -> Option<DocumentRef> {
    let hits = body
        .get("results")
        .and_then(|v| v.as_array())
        .or_else(|| body.as_array())?;
    hits.iter().find_map(|hit| {
        let id = hit.get("id").and_then(|v| v.as_str())?.trim();
        if id.is_empty() {
            return None;
        }
        let title = hit
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Some(DocumentRef {
            id: id.to_string(),
            title,
        })
    })
}

#[async_trait]
impl DocumentSource for Context7Client {
    async fn find_document(&self, name: &str) -> KlerResult<Option<DocumentRef>> {
        let url = format!("{}/search", self.base_url);
        let response = self
            .get(&url)
            .query(&[("query", name)])
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        if !response.status().is_success() {
            return Err(KlerError::Retrieval(format!(
                "documentation search failed with status {}",
                response.status()
            )));
        }
        let body: serde_json::Value = response.json().await.map_err(|e| self.map_send_error(e))?;
        let hit = first_hit(&body);
        tracing::debug!(name, found = hit.is_some(), "documentation search");
        Ok(hit)
    }

    async fn fetch(&self, document_id: &str, topic: &str) -> KlerResult<String> {
        let url = format!("{}/{}", self.base_url, document_id.trim_start_matches('/'));
        let tokens = self.tokens.to_string();
        let response = self
            .get(&url)
            .query(&[("type", "text"), ("topic", topic), ("tokens", tokens.as_str())])
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        if !response.status().is_success() {
            return Err(KlerError::Retrieval(format!(
                "documentation fetch for {document_id} failed with status {}",
                response.status()
            )));
        }
        let text = response.text().await.map_err(|e| self.map_send_error(e))?;
        tracing::debug!(document_id, topic, chars = text.len(), "documentation fetched");
        Ok(text)
    }
}
