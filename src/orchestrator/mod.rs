//! Turn orchestration for one exchange.
//!
//! ```text
//! Init ─► AwaitingModel ─► (no tool calls) ─► Finalizing ─► Done
//!              ▲    │
//!              │    └─► (tool calls) ─► ExecutingTools ─┐
//!              └────────────────────────────────────────┘
//! ```
//!
//! The loop ends in `Aborted` when the turn budget runs out or the event
//! consumer disconnects. Either way the partial answer is recorded and billed.
//! An upstream failure records the partial answer, emits an error event and
//! returns the typed error without billing.

pub mod events;

pub use events::EventSink;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::cost::{CreditLedger, DebitOutcome, TurnRecord};
use crate::dispatcher::{ToolDispatcher, ToolInvocation};
use crate::error::{KlerError, KlerResult};
use crate::history::{EntryDraft, HistoryStore, Session};
use crate::provider::ReasoningEngine;
use crate::summarizer::{summarize_or_truncate, truncate, Summarizer};
use crate::transcript::{JsonlTranscriptStore, TranscriptMessage, TranscriptSource};
use crate::types::{EngineEvent, Message, SourceSummary, StreamDelta, ToolDefinition};

const TURN_LIMIT_NOTICE: &str = "I reached the maximum number of reasoning steps before finishing an answer.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    TurnBudgetExceeded,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ExchangeState {
    Init,
    AwaitingModel,
    ExecutingTools,
    Finalizing,
    Done,
    Aborted(AbortReason),
}

impl ExchangeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExchangeState::Done | ExchangeState::Aborted(_))
    }
}

/// One user message to process.
#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    pub session_key: String,
    /// Billing principal; the session key when unset.
    pub owner: Option<String>,
    pub text: String,
}

impl ExchangeRequest {
    pub fn new(session_key: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            owner: None,
            text: text.into(),
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    fn owner(&self) -> &str {
        self.owner.as_deref().unwrap_or(&self.session_key)
    }
}

#[derive(Debug, Clone)]
pub struct ExchangeOutcome {
    pub answer: String,
    pub summary: String,
    /// Full-track id of the answer.
    pub answer_id: String,
    pub state: ExchangeState,
    pub turn_limited: bool,
    /// Engine calls made.
    pub turns: usize,
    pub invocations: Vec<ToolInvocation>,
    pub sources: Vec<SourceSummary>,
    pub cost: i64,
    pub debit: DebitOutcome,
}

/// Drives exchanges against the engine, tools, history and ledger.
pub struct Orchestrator {
    engine: Arc<dyn ReasoningEngine>,
    dispatcher: ToolDispatcher,
    summarizer: Arc<dyn Summarizer>,
    history: Arc<HistoryStore>,
    ledger: CreditLedger,
    transcripts: Option<Arc<JsonlTranscriptStore>>,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(
        engine: Arc<dyn ReasoningEngine>,
        dispatcher: ToolDispatcher,
        summarizer: Arc<dyn Summarizer>,
        config: EngineConfig,
    ) -> Self {
        Self {
            engine,
            dispatcher,
            summarizer,
            history: Arc::new(HistoryStore::new()),
            ledger: CreditLedger::from_config(&config.allowance),
            transcripts: None,
            config,
        }
    }

    pub fn with_history(mut self, history: Arc<HistoryStore>) -> Self {
        self.history = history;
        self
    }

    pub fn with_ledger(mut self, ledger: CreditLedger) -> Self {
        self.ledger = ledger;
        self
    }

    /// Persist exchanges to `store` and rehydrate empty sessions from it.
    /// The session key is used as the conversation id.
    pub fn with_transcripts(mut self, store: Arc<JsonlTranscriptStore>) -> Self {
        self.transcripts = Some(store);
        self
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    /// Run `request` on a spawned task, returning the handle and the event
    /// stream. The stream closes when the exchange ends.
    pub fn spawn_exchange(
        self: &Arc<Self>,
        request: ExchangeRequest,
    ) -> (JoinHandle<KlerResult<ExchangeOutcome>>, mpsc::Receiver<EngineEvent>) {
        let (sink, rx) = EventSink::channel(self.config.orchestrator.event_buffer);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.process_message(request, sink).await });
        (handle, rx)
    }

    pub async fn process_message(&self, request: ExchangeRequest, events: EventSink) -> KlerResult<ExchangeOutcome> {
        let text = request.text.trim().to_string();
        if text.is_empty() {
            return Err(KlerError::InvalidInput("message text is empty".into()));
        }
        let owner = request.owner().to_string();
        let key = request.session_key.clone();

        self.ledger.preflight(&owner, self.config.pricing.base).await?;
        if let Some(store) = &self.transcripts {
            if self.history.needs_rehydration(&key) {
                let stored = store.load(&key).await?;
                self.history.restore(&key, &stored)?;
            }
        }
        let mut session = self.history.try_acquire(&key)?;

        let query_id = session.append_full(EntryDraft::query(text.clone()))?;
        session.append_summary(&query_id, text.clone())?;
        tracing::info!(session = %key, query = %query_id, "exchange started");

        let mut messages = session.working_messages();
        let tools = self.dispatcher.catalogue();
        let max_turns = self.config.orchestrator.max_turns;

        let mut state = ExchangeState::Init;
        let mut record = TurnRecord::default();
        let mut invocations = Vec::new();
        let mut sources = Vec::new();
        let mut accumulated = String::new();
        let mut final_text = String::new();
        let mut turns = 0;

        for turn in 1..=max_turns {
            transition(&mut state, ExchangeState::AwaitingModel, &key);
            turns = turn;
            events.emit(EngineEvent::TurnStart { turn, max_turns }).await;

            let reply = match self.call_engine(&messages, &tools, &events).await {
                Ok(reply) => reply,
                Err(e) => return Err(self.record_failure(&mut session, &accumulated, e, &events).await),
            };

            let reply_text = reply.text_content();
            if !reply_text.is_empty() {
                if !accumulated.is_empty() {
                    accumulated.push_str("\n\n");
                }
                accumulated.push_str(&reply_text);
            }

            let calls: Vec<ToolInvocation> = reply
                .tool_calls()
                .into_iter()
                .map(|(id, name, input)| ToolInvocation::new(id, name, input.clone()))
                .collect();

            if calls.is_empty() {
                final_text = reply_text;
                events
                    .emit(EngineEvent::TurnComplete {
                        turn,
                        completed: true,
                        tools_used: 0,
                    })
                    .await;
                transition(&mut state, ExchangeState::Finalizing, &key);
                break;
            }

            if events.is_closed() {
                tracing::warn!(session = %key, turn, "event consumer gone, skipping tool batch");
                transition(&mut state, ExchangeState::Aborted(AbortReason::Disconnected), &key);
                break;
            }

            transition(&mut state, ExchangeState::ExecutingTools, &key);
            messages.push(reply);
            let batch = self.dispatcher.execute_all(&mut session, calls, &events).await?;
            let tools_used = batch.invocations.len();
            record.merge(&batch.record);
            sources.extend(batch.sources);
            invocations.extend(batch.invocations);
            messages.push(batch.message);

            events
                .emit(EngineEvent::TurnComplete {
                    turn,
                    completed: false,
                    tools_used,
                })
                .await;

            if events.is_closed() {
                tracing::warn!(session = %key, turn, "event consumer gone, stopping exchange");
                transition(&mut state, ExchangeState::Aborted(AbortReason::Disconnected), &key);
                break;
            }
        }

        if state == ExchangeState::ExecutingTools {
            tracing::warn!(session = %key, max_turns, "turn budget exhausted");
            transition(&mut state, ExchangeState::Aborted(AbortReason::TurnBudgetExceeded), &key);
        }
        let turn_limited = state == ExchangeState::Aborted(AbortReason::TurnBudgetExceeded);

        let mut answer = if final_text.trim().is_empty() { accumulated } else { final_text };
        if answer.trim().is_empty() && turn_limited {
            answer = TURN_LIMIT_NOTICE.to_string();
        }

        let (answer_id, summary) = self.record_answer(&mut session, &answer).await?;
        if state == ExchangeState::Finalizing {
            transition(&mut state, ExchangeState::Done, &key);
        }
        self.persist_transcript(&key, &text, &answer, &summary).await;

        // debit while the session is still held
        let cost = self.config.pricing.price(&record);
        let debit = self.ledger.debit(&owner, cost, &format!("{key}/{answer_id}")).await;
        drop(session);
        tracing::info!(session = %key, answer = %answer_id, turns, cost, state = ?state, "exchange finished");

        events
            .emit(EngineEvent::Done {
                answer_id: answer_id.clone(),
                summary: summary.clone(),
                answer: answer.clone(),
                turn_limited,
                sources: sources.clone(),
            })
            .await;

        Ok(ExchangeOutcome {
            answer,
            summary,
            answer_id,
            state,
            turn_limited,
            turns,
            invocations,
            sources,
            cost,
            debit,
        })
    }

    async fn call_engine(&self, messages: &[Message], tools: &[ToolDefinition], events: &EventSink) -> KlerResult<Message> {
        let (delta_tx, mut delta_rx) = mpsc::unbounded_channel();
        let sink = events.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(delta) = delta_rx.recv().await {
                if let StreamDelta::TextDelta { text } = delta {
                    sink.emit(EngineEvent::TextDelta { text }).await;
                }
            }
        });

        let timeout = Duration::from_millis(self.config.timeouts.engine_ms);
        let call = self.engine.stream(
            messages,
            &self.config.orchestrator.system_prompt,
            tools,
            &self.config.model,
            delta_tx,
        );
        let result = tokio::time::timeout(timeout, call).await;
        forwarder.await.ok();

        result.map_err(|_| KlerError::UpstreamTimeout {
            target: "reasoning engine".into(),
            timeout_ms: timeout.as_millis() as u64,
        })?
    }

    /// Append the answer and its summary; returns `(answer_id, summary)`.
    async fn record_answer(&self, session: &mut Session, answer: &str) -> KlerResult<(String, String)> {
        let answer_id = session.append_full(EntryDraft::response(answer))?;
        let summary = summarize_or_truncate(
            self.summarizer.as_ref(),
            answer,
            &self.config.summary.answer_hint,
            self.config.summary.truncate_chars,
        )
        .await;
        if summary.low_fidelity {
            session.append_degraded_summary(&answer_id, summary.text.clone())?;
        } else {
            session.append_summary(&answer_id, summary.text.clone())?;
        }
        Ok((answer_id, summary.text))
    }

    async fn record_failure(
        &self,
        session: &mut OwnedMutexGuard<Session>,
        partial: &str,
        error: KlerError,
        events: &EventSink,
    ) -> KlerError {
        match session.append_full(EntryDraft::response(partial)) {
            Ok(id) => {
                let fallback = truncate(partial, self.config.summary.truncate_chars);
                if let Err(e) = session.append_degraded_summary(&id, fallback) {
                    tracing::warn!(session = session.key(), error = %e, "could not record partial summary");
                }
            }
            Err(e) => tracing::warn!(session = session.key(), error = %e, "could not record partial answer"),
        }
        tracing::error!(session = session.key(), error = %error, "exchange failed");
        events
            .emit(EngineEvent::Error {
                message: error.to_string(),
            })
            .await;
        error
    }

    async fn persist_transcript(&self, key: &str, question: &str, answer: &str, summary: &str) {
        let Some(store) = &self.transcripts else {
            return;
        };
        let messages = [
            TranscriptMessage::user(question),
            TranscriptMessage::assistant(answer, Some(summary.to_string())),
        ];
        for message in &messages {
            if let Err(e) = store.append(key, message).await {
                tracing::warn!(session = key, error = %e, "failed to persist transcript");
                return;
            }
        }
    }
}

fn transition(state: &mut ExchangeState, next: ExchangeState, session: &str) {
    tracing::debug!(session, from = ?*state, to = ?next, "exchange state");
    *state = next;
}
