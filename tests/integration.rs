use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use kler_core::config::{EngineConfig, ModelConfig};
use kler_core::cost::CreditLedger;
use kler_core::dispatcher::{ToolDispatcher, RETRIEVE_DOCUMENTATION, RETRIEVE_FULL_CONTEXT};
use kler_core::error::{KlerError, KlerResult};
use kler_core::history::EntryKind;
use kler_core::orchestrator::{AbortReason, EventSink, ExchangeRequest, ExchangeState, Orchestrator};
use kler_core::provider::ReasoningEngine;
use kler_core::retrieval::{
    reciprocal_rank_fusion, DocumentRef, DocumentSource, RetrievalPipeline, SECTION_DELIMITER,
};
use kler_core::search::SearchAdapter;
use kler_core::summarizer::Summarizer;
use kler_core::types::*;

// ─── Mock Engine ────────────────────────────────────────────────────────────

struct QueueEngine {
    replies: Mutex<Vec<Message>>,
    fallback: Option<Message>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl QueueEngine {
    fn new(replies: Vec<Message>) -> Self {
        Self {
            replies: Mutex::new(replies),
            fallback: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn looping(message: Message) -> Self {
        Self {
            replies: Mutex::new(Vec::new()),
            fallback: Some(message),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn last_call(&self) -> Vec<Message> {
        self.calls.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ReasoningEngine for QueueEngine {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Custom("mock".into())
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
        let next = {
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                None
            } else {
                Some(replies.remove(0))
            }
        };
        let msg = next
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| KlerError::Provider("No more responses".into()))?;
        for block in &msg.content {
            if let ContentBlock::Text { text } = block {
                let _ = delta_tx.send(StreamDelta::TextDelta { text: text.clone() });
            }
        }
        Ok(msg)
    }
}

fn calls(blocks: Vec<(&str, &str, Value)>) -> Message {
    Message::new(
        Role::Assistant,
        blocks
            .into_iter()
            .map(|(id, name, input)| ContentBlock::tool_call(id, name, input))
            .collect(),
    )
}

// ─── Mock Collaborators ─────────────────────────────────────────────────────

struct PrefixSummarizer;

#[async_trait]
impl Summarizer for PrefixSummarizer {
    async fn summarize(&self, content: &str, _hint: &str) -> KlerResult<String> {
        Ok(format!("summary: {}", content.chars().take(40).collect::<String>()))
    }
}

struct TokioDocs;

#[async_trait]
impl DocumentSource for TokioDocs {
    async fn find_document(&self, name: &str) -> KlerResult<Option<DocumentRef>> {
        if name.to_lowercase().contains("tokio") {
            Ok(Some(DocumentRef {
                id: "/tokio-rs/tokio".into(),
                title: "Tokio".into(),
            }))
        } else {
            Ok(None)
        }
    }

    async fn fetch(&self, _document_id: &str, _topic: &str) -> KlerResult<String> {
        Ok([
            "TITLE: Spawning tasks\ntokio::spawn runs a future on the runtime and returns a JoinHandle.",
            "TITLE: Channels\nmpsc channels send values between tasks.",
            "TITLE: Timers\ntokio::time::sleep waits without blocking a thread.",
        ]
        .join(SECTION_DELIMITER))
    }
}

struct CodeSearch;

#[async_trait]
impl SearchAdapter for CodeSearch {
    async fn call(&self, operation: &str, params: Value) -> KlerResult<String> {
        Ok(format!("{operation} results for {params}"))
    }

    fn catalogue(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition {
            name: "search_code".into(),
            description: "Search code".into(),
            input_schema: json!({"type": "object"}),
        }]
    }
}

fn build(engine: Arc<QueueEngine>) -> Orchestrator {
    let config = EngineConfig::default();
    let summarizer: Arc<dyn Summarizer> = Arc::new(PrefixSummarizer);
    let pipeline = RetrievalPipeline::new(Arc::new(TokioDocs), config.retrieval.clone());
    let dispatcher = ToolDispatcher::new(summarizer.clone(), &config)
        .unwrap()
        .with_retrieval(Arc::new(pipeline))
        .with_search(Arc::new(CodeSearch));
    Orchestrator::new(engine, dispatcher, summarizer, config)
}

async fn collect(mut rx: mpsc::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

// ─── Exchanges ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn documentation_question_fills_both_tracks() {
    let engine = Arc::new(QueueEngine::new(vec![
        calls(vec![("tu_1", RETRIEVE_DOCUMENTATION, json!({"query": "tokio spawn"}))]),
        Message::assistant("Use tokio::spawn and await the JoinHandle."),
    ]));
    let orch = Arc::new(build(engine.clone()));

    let (handle, rx) = orch.spawn_exchange(ExchangeRequest::new("s1", "How do I spawn a task?"));
    let events = collect(rx).await;
    let outcome = handle.await.unwrap().unwrap();

    assert_eq!(outcome.state, ExchangeState::Done);
    assert_eq!(outcome.cost, 10);
    assert!(!outcome.sources.is_empty());
    assert!(events.iter().any(|e| matches!(e, EngineEvent::RetrievalComplete { .. })));
    assert!(matches!(events.last(), Some(EngineEvent::Done { .. })));

    let session = orch.history().try_acquire("s1").unwrap();
    let full: Vec<&str> = session.full_track().iter().map(|e| e.id.as_str()).collect();
    assert_eq!(full, vec!["q1", "q1-t1", "q1-r"]);
    assert_eq!(session.full_track()[1].kind, EntryKind::ToolResult);
    assert!(session.full_track()[1].content.contains("tokio::spawn"));

    let summaries = session.working_context();
    assert_eq!(summaries.len(), 3);
    for (summary, full) in summaries.iter().zip(session.full_track()) {
        assert_eq!(summary.ref_id.as_deref(), Some(full.id.as_str()));
        assert_eq!(summary.id, format!("{}-sum", full.id));
    }
    // the query is mirrored verbatim, everything else is compressed
    assert_eq!(summaries[0].content, "How do I spawn a task?");
    assert!(summaries[2].content.starts_with("summary: "));
}

#[tokio::test]
async fn tool_exchange_streams_events_in_order() {
    let engine = Arc::new(QueueEngine::new(vec![
        calls(vec![
            ("tu_1", "search_code", json!({"q": "spawn"})),
            ("tu_2", "search_code", json!({"q": "select!"})),
        ]),
        Message::assistant("done text"),
    ]));
    let orch = Arc::new(build(engine));

    let (handle, rx) = orch.spawn_exchange(ExchangeRequest::new("s1", "find spawn and select"));
    let events = collect(rx).await;
    let outcome = handle.await.unwrap().unwrap();

    let names: Vec<&str> = events.iter().map(EngineEvent::name).collect();
    assert_eq!(
        names,
        vec![
            "turn_start",
            "tool_start",
            "tool_start",
            "tool_complete",
            "tool_complete",
            "turn_complete",
            "turn_start",
            "text_delta",
            "turn_complete",
            "done",
        ]
    );

    let completed: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::ToolComplete { invocation_id, .. } => Some(invocation_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(completed, vec!["tu_1", "tu_2"]);
    assert!(matches!(
        events[5],
        EngineEvent::TurnComplete { turn: 1, completed: false, tools_used: 2 }
    ));
    match events.last() {
        Some(EngineEvent::Done { answer, answer_id, .. }) => {
            assert_eq!(answer, "done text");
            assert_eq!(answer_id, "q1-r");
        }
        other => panic!("expected done, got {other:?}"),
    }
    assert_eq!(outcome.state, ExchangeState::Done);
}

#[tokio::test]
async fn full_context_is_returned_byte_for_byte() {
    let answer = "```rust\nlet h = tokio::spawn(async { 42 });\n```\n\tnaïve “quoted” ✓  \n";
    let engine = Arc::new(QueueEngine::new(vec![
        Message::assistant(answer),
        calls(vec![("tu_1", RETRIEVE_FULL_CONTEXT, json!({"id": "q1-r"}))]),
        Message::assistant("That was the snippet."),
    ]));
    let orch = build(engine.clone());

    orch.process_message(ExchangeRequest::new("s1", "show code"), EventSink::detached())
        .await
        .unwrap();
    let second = orch
        .process_message(ExchangeRequest::new("s1", "repeat it exactly"), EventSink::detached())
        .await
        .unwrap();

    assert_eq!(second.invocations[0].result.as_deref(), Some(answer));
    let sent = engine.last_call();
    let tool_message = sent.last().unwrap();
    assert_eq!(
        tool_message.content[0],
        ContentBlock::tool_result("tu_1", answer, false)
    );
    // a lookup reads history and writes nothing
    let session = orch.history().try_acquire("s1").unwrap();
    let ids: Vec<&str> = session.full_track().iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["q1", "q1-r", "q2", "q2-r"]);
}

#[tokio::test]
async fn missing_reference_is_reported_to_engine() {
    let engine = Arc::new(QueueEngine::new(vec![
        calls(vec![("tu_1", RETRIEVE_FULL_CONTEXT, json!({"id": "q9-r"}))]),
        Message::assistant("I could not find that."),
    ]));
    let orch = build(engine.clone());
    let outcome = orch
        .process_message(ExchangeRequest::new("s1", "expand q9"), EventSink::detached())
        .await
        .unwrap();

    assert!(outcome.invocations[0].is_failed());
    assert_eq!(outcome.invocations[0].result.as_deref(), Some("Error: ID 'q9-r' not found"));
    assert_eq!(outcome.state, ExchangeState::Done);
    assert_eq!(outcome.cost, 5);
}

#[tokio::test]
async fn disallowed_operation_fails_without_charge() {
    let engine = Arc::new(QueueEngine::new(vec![
        calls(vec![("tu_1", "delete_repository", json!({"repo": "x"}))]),
        Message::assistant("I can only read."),
    ]));
    let orch = build(engine);
    let outcome = orch
        .process_message(ExchangeRequest::new("s1", "delete it"), EventSink::detached())
        .await
        .unwrap();
    let failed = &outcome.invocations[0];
    assert!(failed.is_failed());
    assert!(failed.result.as_deref().unwrap().starts_with("Error: "));
    assert_eq!(outcome.cost, 5);
}

#[tokio::test]
async fn stops_after_fifteen_turns() {
    let engine = Arc::new(QueueEngine::looping(calls(vec![(
        "tu_loop",
        RETRIEVE_FULL_CONTEXT,
        json!({"id": "q1"}),
    )])));
    let orch = build(engine.clone());
    let (sink, rx) = EventSink::channel(1024);

    let outcome = orch
        .process_message(ExchangeRequest::new("s1", "never finish"), sink)
        .await
        .unwrap();
    let events = collect(rx).await;

    assert_eq!(engine.call_count(), 15);
    assert_eq!(outcome.turns, 15);
    assert_eq!(outcome.state, ExchangeState::Aborted(AbortReason::TurnBudgetExceeded));
    assert!(outcome.turn_limited);
    assert!(!outcome.answer.is_empty());
    let turn_starts = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::TurnStart { .. }))
        .count();
    assert_eq!(turn_starts, 15);
    assert!(matches!(
        events.last(),
        Some(EngineEvent::Done { turn_limited: true, .. })
    ));
    // the partial answer is still recorded and billed; history lookups are free
    assert!(orch.history().try_acquire("s1").unwrap().entry("q1-r").is_some());
    assert_eq!(outcome.cost, 5);
    assert_eq!(orch.ledger().balance("s1").await, 45);
}

#[tokio::test]
async fn retrieval_plus_two_searches_costs_sixteen() {
    let engine = Arc::new(QueueEngine::new(vec![
        calls(vec![
            ("tu_1", RETRIEVE_DOCUMENTATION, json!({"query": "tokio channels"})),
            ("tu_2", "search_code", json!({"q": "mpsc::channel"})),
            ("tu_3", "search_code", json!({"q": "JoinHandle"})),
        ]),
        Message::assistant("Here is how channels are used."),
    ]));
    let orch = build(engine).with_ledger(CreditLedger::new(100));
    let outcome = orch
        .process_message(ExchangeRequest::new("s1", "channels?").with_owner("alice"), EventSink::detached())
        .await
        .unwrap();

    assert_eq!(outcome.cost, 16);
    assert_eq!(orch.ledger().balance("alice").await, 84);
    let ids: Vec<Option<&str>> = outcome.invocations.iter().map(|i| i.entry_id.as_deref()).collect();
    assert_eq!(ids, vec![Some("q1-t1"), Some("q1-t2"), Some("q1-t3")]);
}

#[tokio::test]
async fn preflight_refuses_before_engine_call() {
    let engine = Arc::new(QueueEngine::new(vec![Message::assistant("unused")]));
    let orch = build(engine.clone()).with_ledger(CreditLedger::new(0));
    let err = orch
        .process_message(ExchangeRequest::new("s1", "hi"), EventSink::detached())
        .await
        .unwrap_err();
    assert!(matches!(err, KlerError::InsufficientBalance { needed: 5, balance: 0 }));
    assert_eq!(engine.call_count(), 0);
}

#[tokio::test]
async fn ids_are_monotonic_across_exchanges() {
    let engine = Arc::new(QueueEngine::new(vec![
        Message::assistant("one"),
        calls(vec![("tu_1", "search_code", json!({"q": "x"}))]),
        Message::assistant("two"),
        Message::assistant("three"),
    ]));
    let orch = build(engine);
    let mut answer_ids = Vec::new();
    for text in ["first", "second", "third"] {
        let outcome = orch
            .process_message(ExchangeRequest::new("s1", text), EventSink::detached())
            .await
            .unwrap();
        answer_ids.push(outcome.answer_id);
    }
    assert_eq!(answer_ids, vec!["q1-r", "q2-r", "q3-r"]);

    let session = orch.history().try_acquire("s1").unwrap();
    let seqs: Vec<u64> = session.full_track().iter().map(|e| e.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    assert!(session.entry("q2-t1").is_some());
}

// ─── Fusion ─────────────────────────────────────────────────────────────────

#[test]
fn fusion_is_deterministic() {
    let lists = vec![
        vec!["b", "a", "c"],
        vec!["a", "c", "b"],
        vec!["c", "d"],
    ];
    let first = reciprocal_rank_fusion(&lists, 60.0);
    for _ in 0..10 {
        assert_eq!(reciprocal_rank_fusion(&lists, 60.0), first);
    }
    let order: Vec<&str> = first.iter().map(|(k, _)| *k).collect();
    assert_eq!(order.len(), 4);
    assert_eq!(*order.last().unwrap(), "d");
}
