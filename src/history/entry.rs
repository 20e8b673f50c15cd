use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Role;

/// What a history entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Query,
    Response,
    ToolResult,
}

impl EntryKind {
    pub fn role(&self) -> Role {
        match self {
            EntryKind::Query => Role::User,
            EntryKind::Response => Role::Assistant,
            EntryKind::ToolResult => Role::Tool,
        }
    }
}

/// Tool name and input that produced a tool-result entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolTrace {
    pub name: String,
    pub input: serde_json::Value,
}

/// One record on either memory track.
///
/// Full entries have `ref_id == None`. Summary entries carry the id of the
/// full entry they compress and an id ending in `-sum`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    /// Session-wide append stamp, strictly increasing on the full track.
    pub seq: u64,
    pub kind: EntryKind,
    pub role: Role,
    pub content: String,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub ref_id: Option<String>,
    /// Set when the summary is a truncation rather than a real compression.
    #[serde(default)]
    pub low_fidelity: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolTrace>,
    pub created_at: DateTime<Utc>,
}

impl Entry {
    pub fn is_summary(&self) -> bool {
        self.ref_id.is_some()
    }

    /// The `[ID:x, ref:y] ` prefix shown to the reasoning engine.
    pub fn label(&self) -> String {
        match &self.ref_id {
            Some(r) => format!("[ID:{}, ref:{}] ", self.id, r),
            None => format!("[ID:{}] ", self.id),
        }
    }
}

/// Content to append to the full track; the id is minted by the session.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryDraft {
    pub kind: EntryKind,
    pub content: String,
    pub tool: Option<ToolTrace>,
}

impl EntryDraft {
    pub fn query(content: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::Query,
            content: content.into(),
            tool: None,
        }
    }

    pub fn response(content: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::Response,
            content: content.into(),
            tool: None,
        }
    }

    pub fn tool_result(
        name: impl Into<String>,
        input: serde_json::Value,
        content: impl Into<String>,
    ) -> Self {
        Self {
            kind: EntryKind::ToolResult,
            content: content.into(),
            tool: Some(ToolTrace {
                name: name.into(),
                input,
            }),
        }
    }
}

/// Id of the summary entry compressing `ref_id`.
pub fn summary_id(ref_id: &str) -> String {
    format!("{ref_id}-sum")
}
