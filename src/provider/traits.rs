use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::ModelConfig;
use crate::error::KlerResult;
use crate::types::*;

/// Reasoning engine contract: one call takes the working messages and the
/// tool catalogue and returns an assistant message holding text and/or tool
/// calls.
#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Stream a completion, forwarding text deltas through the channel.
    async fn stream(
        &self,
        messages: &[Message],
        system: &str,
        tools: &[ToolDefinition],
        model: &ModelConfig,
        delta_tx: mpsc::UnboundedSender<StreamDelta>,
    ) -> KlerResult<Message>;

    /// Non-streaming completion (default impl collects the stream)
    async fn complete(
        &self,
        messages: &[Message],
        system: &str,
        tools: &[ToolDefinition],
        model: &ModelConfig,
    ) -> KlerResult<Message> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = self.stream(messages, system, tools, model, tx).await?;
        while rx.try_recv().is_ok() {}
        Ok(result)
    }
}

/// Single-prompt helper for the auxiliary calls (planning, reranking,
/// summarizing): no tools, plain text back.
pub async fn ask_text(
    engine: &dyn ReasoningEngine,
    model: &ModelConfig,
    system: &str,
    prompt: &str,
) -> KlerResult<String> {
    let reply = engine
        .complete(&[Message::user(prompt)], system, &[], model)
        .await?;
    Ok(reply.text_content().trim().to_string())
}

/// Pull the first JSON object out of a model reply, tolerating code fences
/// and surrounding prose.
pub fn parse_json_reply(text: &str) -> Option<serde_json::Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}
