//! Compression of answers and tool results for the summarized track.
//!
//! A summary is always produced: when the engine call fails or times out the
//! content is truncated instead and the result is marked low-fidelity.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::ModelConfig;
use crate::error::{KlerError, KlerResult};
use crate::provider::{ask_text, ReasoningEngine};

const SUMMARIZER_SYSTEM: &str =
    "You compress conversation content for a memory index. Reply with the summary only.";

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, content: &str, target_length_hint: &str) -> KlerResult<String>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub text: String,
    /// True when `text` is a truncation fallback.
    pub low_fidelity: bool,
}

/// Summarizer backed by the reasoning engine, bounded by a fixed timeout.
pub struct EngineSummarizer {
    engine: Arc<dyn ReasoningEngine>,
    model: ModelConfig,
    timeout: Duration,
}

impl EngineSummarizer {
    pub fn new(engine: Arc<dyn ReasoningEngine>, model: ModelConfig, timeout: Duration) -> Self {
        Self {
            engine,
            model,
            timeout,
        }
    }
}

#[async_trait]
impl Summarizer for EngineSummarizer {
    async fn summarize(&self, content: &str, target_length_hint: &str) -> KlerResult<String> {
        let prompt = format!(
            "Summarize the following in {target_length_hint}, preserving key facts, names and identifiers:\n\n{content}"
        );
        let call = ask_text(self.engine.as_ref(), &self.model, SUMMARIZER_SYSTEM, &prompt);
        let text = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| KlerError::UpstreamTimeout {
                target: "summarizer".into(),
                timeout_ms: self.timeout.as_millis() as u64,
            })??;
        if text.is_empty() {
            return Err(KlerError::Provider("summarizer returned no text".into()));
        }
        Ok(text)
    }
}

/// First `max_chars` characters followed by `...` when anything was cut.
pub fn truncate(content: &str, max_chars: usize) -> String {
    let mut chars = content.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// Summarize, or fall back to `fallback` marked low-fidelity.
pub async fn summarize_or_else(
    summarizer: &dyn Summarizer,
    content: &str,
    hint: &str,
    fallback: String,
) -> Summary {
    match summarizer.summarize(content, hint).await {
        Ok(text) => Summary {
            text,
            low_fidelity: false,
        },
        Err(e) => {
            tracing::warn!(error = %e, "summarization failed, truncating");
            Summary {
                text: fallback,
                low_fidelity: true,
            }
        }
    }
}

pub async fn summarize_or_truncate(
    summarizer: &dyn Summarizer,
    content: &str,
    hint: &str,
    truncate_chars: usize,
) -> Summary {
    summarize_or_else(summarizer, content, hint, truncate(content, truncate_chars)).await
}

/// Content handed to the summarizer for a tool result: the call plus a
/// bounded preview of its output.
pub fn tool_digest(tool: &str, input: &serde_json::Value, output: &str, preview_chars: usize) -> String {
    let preview: String = output.chars().take(preview_chars).collect();
    format!(
        "Tool: {tool}\nInput: {input}\nOutput preview: {preview}\n\nDescribe it as \"Called [tool] with [key params], returned [brief result]\"."
    )
}

/// Fallback summary of a tool result.
pub fn tool_fallback(tool: &str, input: &serde_json::Value, output: &str, truncate_chars: usize) -> String {
    let keys: Vec<&str> = input
        .as_object()
        .map(|o| o.keys().map(String::as_str).collect())
        .unwrap_or_default();
    format!(
        "Called {tool} with [{}], returned: {}",
        keys.join(", "),
        truncate(output, truncate_chars)
    )
}
