//! # kler-core
//!
//! Conversational agent orchestration: a bounded multi-turn loop that lets a
//! reasoning engine call tools, remembers every exchange on two tracks, and
//! bills each exchange in integer credits.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use kler_core::config::EngineConfig;
//! use kler_core::dispatcher::ToolDispatcher;
//! use kler_core::orchestrator::{EventSink, ExchangeRequest, Orchestrator};
//! use kler_core::provider::AnthropicEngine;
//! use kler_core::summarizer::{EngineSummarizer, Summarizer};
//!
//! # async fn run() -> kler_core::KlerResult<()> {
//! let config = EngineConfig::load(std::path::Path::new("kler.toml"))?;
//! let engine = Arc::new(AnthropicEngine::from_env()?);
//! let summarizer: Arc<dyn Summarizer> = Arc::new(EngineSummarizer::new(
//!     engine.clone(),
//!     config.model.clone(),
//!     Duration::from_millis(config.timeouts.summarizer_ms),
//! ));
//! let dispatcher = ToolDispatcher::new(summarizer.clone(), &config)?;
//! let orchestrator = Orchestrator::new(engine, dispatcher, summarizer, config);
//!
//! let outcome = orchestrator
//!     .process_message(ExchangeRequest::new("session-1", "How do I spawn a task in tokio?"), EventSink::detached())
//!     .await?;
//! println!("{} ({} credits)", outcome.answer, outcome.cost);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`types`] | Core types: `Message`, `Role`, `ContentBlock`, `ToolDefinition`, `EngineEvent` |
//! | [`config`] | TOML configuration with environment overrides and validation |
//! | [`error`] | Error types with thiserror: InsufficientBalance, SessionBusy, UpstreamTimeout, etc. |
//! | [`provider`] | Reasoning-engine abstraction with an Anthropic SSE backend |
//! | [`history`] | Dual-track session memory: verbatim full track plus summarized working track |
//! | [`transcript`] | JSONL transcript persistence used to rehydrate sessions |
//! | [`summarizer`] | Engine-backed summaries with truncation fallback |
//! | [`retrieval`] | Documentation retrieval: chunking, BM25, vectors, RRF fusion, rerank |
//! | [`search`] | Read-only external code search over MCP JSON-RPC |
//! | [`dispatcher`] | Concurrent tool batches with ordered history writes |
//! | [`orchestrator`] | The turn loop, its state machine and progress events |
//! | [`cost`] | Pricing, credit ledger and daily allowance |
//!
//! ## Dual-Track Memory
//!
//! - Each query gets an id `qN`; its tool results are `qN-t1`, `qN-t2`, ... and
//!   its answer is `qN-r`
//! - Every full entry has exactly one summary `<id>-sum` that points back to it
//! - The engine only sees summaries, labelled `[ID:q1-r-sum, ref:q1-r]`, and
//!   calls `retrieve_full_context` to read any entry verbatim

pub mod config;
pub mod cost;
pub mod dispatcher;
pub mod error;
pub mod history;
pub mod orchestrator;
pub mod provider;
pub mod retrieval;
pub mod search;
pub mod summarizer;
pub mod transcript;
pub mod types;

pub use error::{KlerError, KlerResult};
pub use types::*;
