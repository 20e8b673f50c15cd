use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{KlerError, KlerResult};
use crate::transcript::{TranscriptMessage, TranscriptSource};
use crate::types::Role;

use super::entry::EntryDraft;
use super::session::Session;

pub type SessionHandle = Arc<Mutex<Session>>;

/// Keyed store of live sessions.
///
/// Each session sits behind its own async mutex. An exchange takes the lock
/// with [`HistoryStore::try_acquire`], so a session has at most one writer and
/// a second concurrent exchange is refused instead of queued.
#[derive(Default)]
pub struct HistoryStore {
    sessions: DashMap<String, SessionHandle>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session for `key`, creating an empty one on first use.
    /// Never replaces an existing session.
    pub fn create_or_get(&self, key: &str) -> SessionHandle {
        self.sessions
            .entry(key.to_string())
            .or_insert_with(|| {
                tracing::debug!(session = key, "creating session");
                Arc::new(Mutex::new(Session::new(key)))
            })
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<SessionHandle> {
        self.sessions.get(key).map(|h| h.clone())
    }

    /// Take exclusive ownership of a session for one exchange.
    pub fn try_acquire(&self, key: &str) -> KlerResult<OwnedMutexGuard<Session>> {
        self.create_or_get(key)
            .try_lock_owned()
            .map_err(|_| KlerError::SessionBusy {
                key: key.to_string(),
            })
    }

    /// True when `key` has no live history yet and no exchange holds it.
    pub fn needs_rehydration(&self, key: &str) -> bool {
        match self.sessions.get(key) {
            None => true,
            Some(handle) => handle
                .try_lock()
                .map(|s| s.full_track().is_empty())
                .unwrap_or(false),
        }
    }

    /// Replay already-loaded transcript messages into an empty session.
    /// Returns the number of messages replayed, 0 when the session already
    /// has history.
    pub fn restore(&self, key: &str, messages: &[TranscriptMessage]) -> KlerResult<usize> {
        let mut session = self.try_acquire(key)?;
        if !session.full_track().is_empty() {
            return Ok(0);
        }
        let replayed = replay(&mut session, messages)?;
        tracing::info!(session = key, replayed, "session rehydrated");
        Ok(replayed)
    }

    /// Load `conversation_id` from `source` and restore it into `key`. The
    /// transcript is only read when the session is still empty.
    pub async fn rehydrate(
        &self,
        key: String,
        source: Arc<dyn TranscriptSource>,
        conversation_id: String,
    ) -> KlerResult<usize> {
        if !self.needs_rehydration(&key) {
            return Ok(0);
        }
        let messages = source.load(&conversation_id).await?;
        self.restore(&key, &messages)
    }

    /// Drop a session unless an exchange currently holds it.
    pub fn evict(&self, key: &str) -> bool {
        self.sessions
            .remove_if(key, |_, handle| handle.try_lock().is_ok())
            .is_some()
    }

    /// Evict every idle session whose last activity is older than `max_idle`.
    pub fn evict_idle(&self, max_idle: Duration) -> Vec<String> {
        let cutoff = Utc::now() - max_idle;
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|item| {
                item.value()
                    .try_lock()
                    .map(|s| s.last_active() < cutoff)
                    .unwrap_or(false)
            })
            .map(|item| item.key().clone())
            .collect();

        let evicted: Vec<String> = stale.into_iter().filter(|k| self.evict(k)).collect();
        if !evicted.is_empty() {
            tracing::info!(count = evicted.len(), "evicted idle sessions");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Replay stored messages onto both tracks. User messages are mirrored
/// verbatim; answers are summarized by their stored summary, or by their full
/// content when none was kept.
fn replay(session: &mut Session, messages: &[TranscriptMessage]) -> KlerResult<usize> {
    let mut replayed = 0;
    for message in messages {
        match message.role {
            Role::User => {
                let id = session.append_full(EntryDraft::query(message.content.clone()))?;
                session.append_summary(&id, message.content.clone())?;
            }
            Role::Assistant => {
                let id = match session.append_full(EntryDraft::response(message.content.clone())) {
                    Ok(id) => id,
                    Err(e @ (KlerError::InvalidInput(_) | KlerError::DuplicateEntry { .. })) => {
                        tracing::warn!(session = session.key(), error = %e, "skipping transcript answer");
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                let summary = message
                    .summary
                    .clone()
                    .unwrap_or_else(|| message.content.clone());
                session.append_summary(&id, summary)?;
            }
            Role::System | Role::Tool => continue,
        }
        replayed += 1;
    }
    Ok(replayed)
}
