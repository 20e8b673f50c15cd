//! Scripted engine for unit tests.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::ModelConfig;
use crate::error::{KlerError, KlerResult};
use crate::types::*;

use super::traits::ReasoningEngine;

pub enum Step {
    Reply(Message),
    Fail(String),
    Stall(Duration),
}

/// Plays back a fixed script, then repeats the fallback reply if one is set.
pub struct ScriptedEngine {
    script: Mutex<Vec<Step>>,
    fallback: Option<Message>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedEngine {
    pub fn new(steps: Vec<Step>) -> Self {
        let mut script = steps;
        script.reverse();
        Self {
            script: Mutex::new(script),
            fallback: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn replies(messages: Vec<Message>) -> Self {
        Self::new(messages.into_iter().map(Step::Reply).collect())
    }

    pub fn with_fallback(mut self, message: Message) -> Self {
        self.fallback = Some(message);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn seen(&self) -> Vec<Vec<Message>> {
        self.calls.lock().unwrap().clone()
    }
}

pub fn tool_call(name: &str, input: serde_json::Value) -> Message {
    Message::new(
        Role::Assistant,
        vec![ContentBlock::tool_call(
            format!("tu_{}", uuid::Uuid::new_v4().simple()),
            name,
            input,
        )],
    )
}

#[async_trait]
impl ReasoningEngine for ScriptedEngine {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn stream(
        &self,
        messages: &[Message],
        _system: &str,
        _tools: &[ToolDefinition],
        _model: &ModelConfig,
        delta_tx: mpsc::UnboundedSender<StreamDelta>,
    ) -> KlerResult<Message> {
        self.calls.lock().unwrap().push(messages.to_vec());
        let step = self.script.lock().unwrap().pop();
        match step {
            Some(Step::Reply(m)) => {
                let text = m.text_content();
                if !text.is_empty() {
                    let _ = delta_tx.send(StreamDelta::TextDelta { text });
                }
                Ok(m)
            }
            Some(Step::Fail(e)) => Err(KlerError::Provider(e)),
            Some(Step::Stall(d)) => {
                tokio::time::sleep(d).await;
                Ok(Message::assistant("too late"))
            }
            None => self
                .fallback
                .clone()
                .ok_or_else(|| KlerError::Provider("script exhausted".into())),
        }
    }
}
