use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::error::{KlerError, KlerResult};
use crate::types::{Message, Role};

use super::entry::{summary_id, Entry, EntryDraft, EntryKind};

/// Dual-track memory for one conversation.
///
/// The full track keeps every query, tool result and answer verbatim. The
/// summarized track is what the reasoning engine sees; each of its entries
/// references the full entry it compresses.
#[derive(Debug, Clone)]
pub struct Session {
    key: String,
    full: Vec<Entry>,
    summarized: Vec<Entry>,
    full_index: HashMap<String, usize>,
    summary_ids: HashSet<String>,
    query_counter: u64,
    tool_counter: u64,
    seq: u64,
    created_at: DateTime<Utc>,
    last_active: DateTime<Utc>,
}

impl Session {
    pub fn new(key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            full: Vec::new(),
            summarized: Vec::new(),
            full_index: HashMap::new(),
            summary_ids: HashSet::new(),
            query_counter: 0,
            tool_counter: 0,
            seq: 0,
            created_at: now,
            last_active: now,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn full_track(&self) -> &[Entry] {
        &self.full
    }

    /// The summarized track, in append order.
    pub fn working_context(&self) -> &[Entry] {
        &self.summarized
    }

    pub fn query_counter(&self) -> u64 {
        self.query_counter
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        self.last_active
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }

    /// Id of the most recent query, if any.
    pub fn current_query_id(&self) -> Option<String> {
        (self.query_counter > 0).then(|| format!("q{}", self.query_counter))
    }

    /// Append to the full track, minting the entry id from the draft kind:
    /// `q<N>` for a new query, `q<N>-r` for its answer and `q<N>-t<M>` for
    /// tool results recorded while answering it.
    pub fn append_full(&mut self, draft: EntryDraft) -> KlerResult<String> {
        let id = match draft.kind {
            EntryKind::Query => {
                self.query_counter += 1;
                self.tool_counter = 0;
                format!("q{}", self.query_counter)
            }
            EntryKind::Response => format!("{}-r", self.require_query()?),
            EntryKind::ToolResult => {
                let query = self.require_query()?;
                self.tool_counter += 1;
                format!("{query}-t{}", self.tool_counter)
            }
        };
        if self.full_index.contains_key(&id) {
            return Err(KlerError::DuplicateEntry { id });
        }

        self.seq += 1;
        let entry = Entry {
            id: id.clone(),
            seq: self.seq,
            kind: draft.kind,
            role: draft.kind.role(),
            content: draft.content,
            ref_id: None,
            low_fidelity: false,
            tool: draft.tool,
            created_at: Utc::now(),
        };
        self.full_index.insert(id.clone(), self.full.len());
        self.full.push(entry);
        self.touch();
        Ok(id)
    }

    pub fn append_summary(&mut self, ref_id: &str, content: impl Into<String>) -> KlerResult<String> {
        self.push_summary(ref_id, content.into(), false)
    }

    /// Record a truncation fallback; the entry is flagged low-fidelity.
    pub fn append_degraded_summary(
        &mut self,
        ref_id: &str,
        content: impl Into<String>,
    ) -> KlerResult<String> {
        self.push_summary(ref_id, content.into(), true)
    }

    fn push_summary(&mut self, ref_id: &str, content: String, low_fidelity: bool) -> KlerResult<String> {
        let target = self
            .entry(ref_id)
            .ok_or_else(|| KlerError::DanglingReference {
                id: ref_id.to_string(),
            })?;
        let kind = target.kind;
        let tool = target.tool.clone();

        let id = summary_id(ref_id);
        if !self.summary_ids.insert(id.clone()) {
            return Err(KlerError::DuplicateEntry { id });
        }
        self.summarized.push(Entry {
            id: id.clone(),
            seq: self.seq,
            kind,
            role: kind.role(),
            content,
            ref_id: Some(ref_id.to_string()),
            low_fidelity,
            tool,
            created_at: Utc::now(),
        });
        self.touch();
        Ok(id)
    }

    pub fn entry(&self, id: &str) -> Option<&Entry> {
        self.full_index.get(id).map(|&i| &self.full[i])
    }

    /// Verbatim content of a full-track entry.
    pub fn resolve_full(&self, id: &str) -> KlerResult<&str> {
        self.entry(id)
            .map(|e| e.content.as_str())
            .ok_or_else(|| KlerError::NotFound { id: id.to_string() })
    }

    /// Render the summarized track as engine messages. Tool summaries are
    /// shown on the user side; consecutive same-role entries are merged.
    pub fn working_messages(&self) -> Vec<Message> {
        let mut out: Vec<(Role, String)> = Vec::new();
        for entry in &self.summarized {
            let role = match entry.kind {
                EntryKind::Response => Role::Assistant,
                EntryKind::Query | EntryKind::ToolResult => Role::User,
            };
            let text = format!("{}{}", entry.label(), entry.content);
            match out.last_mut() {
                Some((last_role, last_text)) if *last_role == role => {
                    last_text.push_str("\n\n");
                    last_text.push_str(&text);
                }
                _ => out.push((role, text)),
            }
        }
        out.into_iter()
            .map(|(role, text)| match role {
                Role::Assistant => Message::assistant(text),
                _ => Message::user(text),
            })
            .collect()
    }

    fn require_query(&self) -> KlerResult<String> {
        self.current_query_id().ok_or_else(|| {
            KlerError::InvalidInput("no query has been recorded in this session".into())
        })
    }
}
