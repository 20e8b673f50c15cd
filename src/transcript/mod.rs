//! Transcript persistence used for one-shot session rehydration.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KlerError, KlerResult};
use crate::types::Role;

/// One stored conversation message, as an external store keeps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub role: Role,
    pub content: String,
    /// Stored compression of an assistant answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl TranscriptMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            summary: None,
            created_at: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>, summary: Option<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            summary,
            created_at: Utc::now(),
        }
    }
}

/// Read side of an external transcript store.
#[async_trait]
pub trait TranscriptSource: Send + Sync {
    async fn load(&self, conversation_id: &str) -> KlerResult<Vec<TranscriptMessage>>;
}

/// JSONL-based transcript persistence, one file per conversation.
pub struct JsonlTranscriptStore {
    base_dir: PathBuf,
}

impl JsonlTranscriptStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn transcript_path(&self, conversation_id: &str) -> KlerResult<PathBuf> {
        if conversation_id.is_empty()
            || conversation_id.contains('/')
            || conversation_id.contains('\\')
            || conversation_id.starts_with('.')
        {
            return Err(KlerError::InvalidInput(format!(
                "invalid conversation id: {conversation_id:?}"
            )));
        }
        Ok(self.base_dir.join(format!("{conversation_id}.jsonl")))
    }

    /// Append a message to the conversation transcript
    pub async fn append(&self, conversation_id: &str, message: &TranscriptMessage) -> KlerResult<()> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let path = self.transcript_path(conversation_id)?;
        let line = serde_json::to_string(message)? + "\n";

        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    pub async fn delete(&self, conversation_id: &str) -> KlerResult<()> {
        let path = self.transcript_path(conversation_id)?;
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    /// Conversation ids with a transcript on disk, sorted.
    pub async fn list(&self) -> KlerResult<Vec<String>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

#[async_trait]
impl TranscriptSource for JsonlTranscriptStore {
    async fn load(&self, conversation_id: &str) -> KlerResult<Vec<TranscriptMessage>> {
        let path = self.transcript_path(conversation_id)?;
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = tokio::fs::read_to_string(&path).await?;
        let mut messages = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(m) => messages.push(m),
                Err(e) => tracing::warn!(
                    conversation = conversation_id,
                    line = line_no + 1,
                    error = %e,
                    "skipping unreadable transcript line"
                ),
            }
        }
        Ok(messages)
    }
}
