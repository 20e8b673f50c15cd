use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::json;
use tokio::sync::mpsc;

use crate::config::ModelConfig;
use crate::error::{KlerError, KlerResult};
use crate::types::*;

use super::traits::ReasoningEngine;

const API_VERSION: &str = "2023-06-01";

/// Reasoning engine backed by the Anthropic Messages API over SSE.
pub struct AnthropicEngine {
    client: Client,
    base_url: String,
    api_key: String,
}

impl AnthropicEngine {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: "https://api.anthropic.com".into(),
            api_key: api_key.into(),
        }
    }

    /// Build from `ANTHROPIC_API_KEY`.
    pub fn from_env() -> KlerResult<Self> {
        let key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| KlerError::Auth("ANTHROPIC_API_KEY is not set".into()))?;
        Ok(Self::new(key))
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn build_messages_body(
        &self,
        messages: &[Message],
        system: &str,
        tools: &[ToolDefinition],
        model: &ModelConfig,
    ) -> serde_json::Value {
        let api_messages: Vec<serde_json::Value> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| self.message_to_api(m))
            .collect();

        let mut body = json!({
            "model": model.id,
            "max_tokens": model.max_output_tokens,
            "temperature": model.temperature,
            "messages": api_messages,
            "stream": true,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }

        if !tools.is_empty() {
            let api_tools: Vec<serde_json::Value> = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = json!(api_tools);
        }

        body
    }

    fn message_to_api(&self, msg: &Message) -> serde_json::Value {
        let role = match msg.role {
            Role::Assistant => "assistant",
            // tool results travel inside user messages
            Role::User | Role::Tool | Role::System => "user",
        };

        let content: Vec<serde_json::Value> = msg
            .content
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => json!({"type": "text", "text": text}),
                ContentBlock::ToolCall {
                    id,
                    name,
                    arguments,
                } => json!({
                    "type": "tool_use",
                    "id": id,
                    "name": name,
                    "input": arguments,
                }),
                ContentBlock::ToolResult {
                    tool_call_id,
                    content,
                    is_error,
                } => json!({
                    "type": "tool_result",
                    "tool_use_id": tool_call_id,
                    "content": content,
                    "is_error": is_error,
                }),
            })
            .collect();

        json!({
            "role": role,
            "content": content,
        })
    }

    fn parse_sse_event(&self, event_type: &str, data: &serde_json::Value) -> Option<StreamDelta> {
        match event_type {
            "content_block_delta" => {
                let delta = data.get("delta")?;
                match delta.get("type")?.as_str()? {
                    "text_delta" => {
                        let text = delta.get("text")?.as_str()?.to_string();
                        Some(StreamDelta::TextDelta { text })
                    }
                    "input_json_delta" => {
                        let index = data.get("index")?.as_u64()? as usize;
                        let partial = delta.get("partial_json")?.as_str()?.to_string();
                        Some(StreamDelta::ToolCallDelta {
                            id: format!("block_{index}"),
                            name: String::new(),
                            arguments_delta: partial,
                        })
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

/// Folds SSE `data:` lines into content blocks.
#[derive(Default)]
struct SseAccumulator {
    content_blocks: Vec<ContentBlock>,
    usage: TokenUsage,
    error: Option<String>,
}

impl SseAccumulator {
    fn feed_line(
        &mut self,
        engine: &AnthropicEngine,
        line: &str,
        delta_tx: &mpsc::UnboundedSender<StreamDelta>,
    ) {
        let Some(data_str) = line.strip_prefix("data: ") else {
            return;
        };
        let Ok(data) = serde_json::from_str::<serde_json::Value>(data_str) else {
            return;
        };
        let event_type = data.get("type").and_then(|v| v.as_str()).unwrap_or("");

        match event_type {
            "content_block_start" => {
                let block = data.get("content_block").cloned().unwrap_or(json!(null));
                match block.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "text" => self.content_blocks.push(ContentBlock::text("")),
                    "tool_use" => {
                        let id = block.get("id").and_then(|v| v.as_str()).unwrap_or("");
                        let name = block.get("name").and_then(|v| v.as_str()).unwrap_or("");
                        self.content_blocks
                            .push(ContentBlock::tool_call(id, name, json!({})));
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let Some(delta) = engine.parse_sse_event(event_type, &data) else {
                    return;
                };
                if matches!(delta, StreamDelta::TextDelta { .. }) {
                    let _ = delta_tx.send(delta.clone());
                }
                match (&delta, self.content_blocks.last_mut()) {
                    (StreamDelta::TextDelta { text }, Some(ContentBlock::Text { text: t })) => {
                        t.push_str(text);
                    }
                    (
                        StreamDelta::ToolCallDelta {
                            arguments_delta, ..
                        },
                        Some(ContentBlock::ToolCall { arguments, .. }),
                    ) => {
                        // JSON arrives in fragments, kept as a string until the end
                        let current = arguments.as_str().unwrap_or("").to_string();
                        *arguments = serde_json::Value::String(format!("{current}{arguments_delta}"));
                    }
                    _ => {}
                }
            }
            "message_start" => {
                if let Some(inp) = data
                    .pointer("/message/usage/input_tokens")
                    .and_then(|v| v.as_u64())
                {
                    self.usage.input_tokens = inp as usize;
                }
            }
            "message_delta" => {
                if let Some(out) = data.pointer("/usage/output_tokens").and_then(|v| v.as_u64()) {
                    self.usage.output_tokens = out as usize;
                }
            }
            "error" => {
                let message = data
                    .pointer("/error/message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown stream error");
                self.error = Some(message.to_string());
            }
            _ => {}
        }
    }

    fn finish(mut self, model: &ModelConfig) -> KlerResult<Message> {
        if let Some(err) = self.error {
            return Err(KlerError::Provider(format!("Anthropic stream error: {err}")));
        }
        for block in &mut self.content_blocks {
            if let ContentBlock::ToolCall { arguments, .. } = block {
                if let Some(s) = arguments.as_str() {
                    *arguments = if s.trim().is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(s).unwrap_or_else(|_| json!({}))
                    };
                }
            }
        }
        let mut msg = Message::new(Role::Assistant, self.content_blocks);
        msg.model = Some(model.id.clone());
        msg.usage = Some(self.usage);
        Ok(msg)
    }
}

#[async_trait]
impl ReasoningEngine for AnthropicEngine {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn stream(
        &self,
        messages: &[Message],
        system: &str,
        tools: &[ToolDefinition],
        model: &ModelConfig,
        delta_tx: mpsc::UnboundedSender<StreamDelta>,
    ) -> KlerResult<Message> {
        let body = self.build_messages_body(messages, system, tools, model);
        let url = format!("{}/v1/messages", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(5000);
            let body = response.text().await.unwrap_or_default();

            if status.as_u16() == 429 {
                return Err(KlerError::RateLimited {
                    provider: "anthropic".into(),
                    retry_after_ms,
                });
            }
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(KlerError::Auth(format!("Anthropic auth failed: {body}")));
            }
            return Err(KlerError::Provider(format!(
                "Anthropic API error {status}: {body}"
            )));
        }

        let mut acc = SseAccumulator::default();
        let mut buf: Vec<u8> = Vec::new();
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            buf.extend_from_slice(&chunk?);
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                acc.feed_line(self, line.trim_end(), &delta_tx);
            }
        }
        if !buf.is_empty() {
            let line = String::from_utf8_lossy(&buf).to_string();
            acc.feed_line(self, line.trim_end(), &delta_tx);
        }

        acc.finish(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(acc: &mut SseAccumulator, engine: &AnthropicEngine, lines: &[serde_json::Value]) -> Vec<StreamDelta> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for l in lines {
            acc.feed_line(engine, &format!("data: {l}"), &tx);
        }
        drop(tx);
        let mut out = Vec::new();
        while let Ok(d) = rx.try_recv() {
            out.push(d);
        }
        out
    }

    #[test]
    fn provider_kind_is_anthropic() {
        assert_eq!(AnthropicEngine::new("k").kind(), ProviderKind::Anthropic);
    }

    #[test]
    fn custom_base_url() {
        let engine = AnthropicEngine::new("k").with_base_url("http://localhost:8081");
        assert_eq!(engine.base_url, "http://localhost:8081");
    }

    #[test]
    fn message_to_api_tool_result() {
        let engine = AnthropicEngine::new("k");
        let msg = Message::tool_results(vec![ContentBlock::tool_result("tc1", "docs", false)]);
        let api = engine.message_to_api(&msg);
        assert_eq!(api["role"], "user");
        assert_eq!(api["content"][0]["type"], "tool_result");
        assert_eq!(api["content"][0]["tool_use_id"], "tc1");
    }

    #[test]
    fn message_to_api_assistant_with_tool_call() {
        let engine = AnthropicEngine::new("k");
        let msg = Message::new(
            Role::Assistant,
            vec![
                ContentBlock::text("Let me check"),
                ContentBlock::tool_call("tc1", "retrieve_documentation", json!({"query": "x"})),
            ],
        );
        let api = engine.message_to_api(&msg);
        assert_eq!(api["role"], "assistant");
        assert_eq!(api["content"][1]["type"], "tool_use");
        assert_eq!(api["content"][1]["input"]["query"], "x");
    }

    #[test]
    fn builds_body_with_and_without_tools() {
        let engine = AnthropicEngine::new("k");
        let model = ModelConfig::default();
        let tools = vec![ToolDefinition {
            name: "retrieve_full_context".into(),
            description: "Expand an id".into(),
            input_schema: json!({"type": "object"}),
        }];
        let body = engine.build_messages_body(&[Message::user("hi")], "sys", &tools, &model);
        assert_eq!(body["model"], model.id.as_str());
        assert_eq!(body["system"], "sys");
        assert_eq!(body["tools"][0]["name"], "retrieve_full_context");

        let body = engine.build_messages_body(&[Message::user("hi")], "", &[], &model);
        assert!(body.get("tools").is_none());
        assert!(body.get("system").is_none());
    }

    #[test]
    fn accumulates_text_and_tool_call() {
        let engine = AnthropicEngine::new("k");
        let mut acc = SseAccumulator::default();
        let deltas = feed(
            &mut acc,
            &engine,
            &[
                json!({"type": "message_start", "message": {"usage": {"input_tokens": 12}}}),
                json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text"}}),
                json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Look"}}),
                json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "ing"}}),
                json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "tu_1", "name": "retrieve_documentation"}}),
                json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"query\":"}}),
                json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": " \"oauth\"}"}}),
                json!({"type": "message_delta", "usage": {"output_tokens": 7}}),
            ],
        );
        assert_eq!(deltas.len(), 2);

        let msg = acc.finish(&ModelConfig::default()).unwrap();
        assert_eq!(msg.text_content(), "Looking");
        let calls = msg.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "tu_1");
        assert_eq!(calls[0].2["query"], "oauth");
        assert_eq!(msg.usage, Some(TokenUsage::new(12, 7)));
    }

    #[test]
    fn tool_call_without_input_gets_empty_object() {
        let engine = AnthropicEngine::new("k");
        let mut acc = SseAccumulator::default();
        feed(
            &mut acc,
            &engine,
            &[json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "t", "name": "n"}})],
        );
        let msg = acc.finish(&ModelConfig::default()).unwrap();
        assert_eq!(msg.tool_calls()[0].2, &json!({}));
    }

    #[test]
    fn stream_error_event_fails() {
        let engine = AnthropicEngine::new("k");
        let mut acc = SseAccumulator::default();
        feed(
            &mut acc,
            &engine,
            &[json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}})],
        );
        let err = acc.finish(&ModelConfig::default()).unwrap_err();
        assert!(matches!(err, KlerError::Provider(m) if m.contains("Overloaded")));
    }

    #[test]
    fn ignores_non_data_lines() {
        let engine = AnthropicEngine::new("k");
        let mut acc = SseAccumulator::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        acc.feed_line(&engine, "event: ping", &tx);
        acc.feed_line(&engine, "data: {broken", &tx);
        assert!(acc.content_blocks.is_empty());
    }
}
