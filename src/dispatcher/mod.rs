//! Tool execution for one engine turn.
//!
//! Every call in a batch runs concurrently against a read-only view of the
//! session. Once the whole batch has joined, results are written to history
//! in the order the engine requested them, so tool ids are deterministic.
//! A failing tool becomes an error result for the engine, never an error
//! for the exchange.

pub mod request;

pub use request::{
    documentation_definition, full_context_definition, ToolInvocation, ToolRequest, RETRIEVE_DOCUMENTATION,
    RETRIEVE_FULL_CONTEXT,
};

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};

use crate::config::{EngineConfig, SummaryConfig};
use crate::cost::{ToolClass, TurnRecord};
use crate::error::{KlerError, KlerResult};
use crate::history::{EntryDraft, Session};
use crate::orchestrator::EventSink;
use crate::retrieval::{RetrievalPipeline, RetrievalReport};
use crate::search::{ReadOnlyAllowList, SearchAdapter};
use crate::summarizer::{summarize_or_else, tool_digest, tool_fallback, Summarizer, Summary};
use crate::types::{ContentBlock, EngineEvent, Message, SourceSummary, ToolDefinition, ToolStatus};

/// Outcome of a joined batch.
#[derive(Debug, Clone)]
pub struct DispatchBatch {
    pub invocations: Vec<ToolInvocation>,
    /// Tool-role message carrying one result block per invocation.
    pub message: Message,
    /// Successful calls by billing class.
    pub record: TurnRecord,
    pub sources: Vec<SourceSummary>,
}

struct ToolOutput {
    content: String,
    report: Option<RetrievalReport>,
}

struct Settled {
    block: ContentBlock,
    /// Billing class of a successful call.
    billed: Option<ToolClass>,
    report: Option<RetrievalReport>,
}

struct Executed {
    request: Option<ToolRequest>,
    outcome: KlerResult<ToolOutput>,
    summary: Option<Summary>,
}

pub struct ToolDispatcher {
    retrieval: Option<Arc<RetrievalPipeline>>,
    search: Option<Arc<dyn SearchAdapter>>,
    allow_list: ReadOnlyAllowList,
    summarizer: Arc<dyn Summarizer>,
    summary: SummaryConfig,
    adapter_timeout: Duration,
    max_parallel: usize,
}

impl ToolDispatcher {
    pub fn new(summarizer: Arc<dyn Summarizer>, config: &EngineConfig) -> KlerResult<Self> {
        Ok(Self {
            retrieval: None,
            search: None,
            allow_list: ReadOnlyAllowList::new(config.search.allow_list.iter().cloned())?,
            summarizer,
            summary: config.summary.clone(),
            adapter_timeout: Duration::from_millis(config.timeouts.adapter_ms),
            max_parallel: config.orchestrator.max_parallel_tools.max(1),
        })
    }

    pub fn with_retrieval(mut self, pipeline: Arc<RetrievalPipeline>) -> Self {
        self.retrieval = Some(pipeline);
        self
    }

    pub fn with_search(mut self, adapter: Arc<dyn SearchAdapter>) -> Self {
        self.search = Some(adapter);
        self
    }

    pub fn allow_list(&self) -> &ReadOnlyAllowList {
        &self.allow_list
    }

    /// Tools offered to the engine.
    pub fn catalogue(&self) -> Vec<ToolDefinition> {
        let mut defs = vec![full_context_definition()];
        if self.retrieval.is_some() {
            defs.push(documentation_definition());
        }
        if let Some(search) = &self.search {
            defs.extend(
                search
                    .catalogue()
                    .into_iter()
                    .filter(|d| self.allow_list.contains(&d.name)),
            );
        }
        defs
    }

    /// Run one invocation and record it the way a batch of one would be.
    /// Tool failures settle the invocation as failed; only history errors
    /// are returned.
    pub async fn execute(&self, session: &mut Session, mut invocation: ToolInvocation) -> KlerResult<ToolInvocation> {
        let executed = self.run_one(session, &invocation).await;
        self.settle(session, &mut invocation, executed)?;
        Ok(invocation)
    }

    async fn run_request(&self, session: &Session, request: &ToolRequest) -> KlerResult<ToolOutput> {
        match request {
            ToolRequest::RetrieveFullContext { entry_id } => Ok(ToolOutput {
                content: session.resolve_full(entry_id)?.to_string(),
                report: None,
            }),
            ToolRequest::RetrieveDocumentation { query } => {
                let pipeline = self.retrieval.as_ref().ok_or_else(|| KlerError::ToolFailure {
                    tool_name: RETRIEVE_DOCUMENTATION.into(),
                    message: "documentation retrieval is not configured".into(),
                })?;
                let report = pipeline.retrieve(query).await?;
                Ok(ToolOutput {
                    content: report.context.clone(),
                    report: Some(report),
                })
            }
            ToolRequest::ExternalSearch { operation, params } => {
                let adapter = self.search.as_ref().ok_or_else(|| KlerError::ToolFailure {
                    tool_name: operation.clone(),
                    message: "search service is not configured".into(),
                })?;
                let content = tokio::time::timeout(self.adapter_timeout, adapter.call(operation, params.clone()))
                    .await
                    .map_err(|_| KlerError::UpstreamTimeout {
                        target: operation.clone(),
                        timeout_ms: self.adapter_timeout.as_millis() as u64,
                    })??;
                Ok(ToolOutput { content, report: None })
            }
        }
    }

    async fn run_one(&self, session: &Session, invocation: &ToolInvocation) -> Executed {
        let request = match ToolRequest::parse(&invocation.name, &invocation.input, &self.allow_list) {
            Ok(r) => r,
            Err(e) => {
                return Executed {
                    request: None,
                    outcome: Err(e),
                    summary: None,
                }
            }
        };
        let outcome = self.run_request(session, &request).await;

        let summary = match &outcome {
            Ok(out) if request.records_history() => Some(
                summarize_or_else(
                    self.summarizer.as_ref(),
                    &tool_digest(&invocation.name, &invocation.input, &out.content, self.summary.tool_preview_chars),
                    &self.summary.tool_hint,
                    tool_fallback(&invocation.name, &invocation.input, &out.content, self.summary.truncate_chars),
                )
                .await,
            ),
            _ => None,
        };

        Executed {
            request: Some(request),
            outcome,
            summary,
        }
    }

    /// Run a batch concurrently, then record results and emit completion
    /// events in invocation order.
    pub async fn execute_all(
        &self,
        session: &mut Session,
        mut invocations: Vec<ToolInvocation>,
        events: &EventSink,
    ) -> KlerResult<DispatchBatch> {
        for inv in &invocations {
            tracing::debug!(session = session.key(), tool = %inv.name, "tool start");
            events
                .emit(EngineEvent::ToolStart {
                    invocation_id: inv.id.clone(),
                    tool_name: inv.name.clone(),
                    input: inv.input.clone(),
                })
                .await;
        }

        let executed: Vec<Executed> = {
            let view: &Session = session;
            let pending: Vec<_> = invocations.iter().map(|inv| self.run_one(view, inv)).collect();
            stream::iter(pending)
                .buffered(self.max_parallel)
                .collect()
                .await
        };

        let mut record = TurnRecord::default();
        let mut blocks = Vec::with_capacity(invocations.len());
        let mut sources = Vec::new();

        for (inv, exec) in invocations.iter_mut().zip(executed) {
            let settled = self.settle(session, inv, exec)?;
            if let Some(class) = settled.billed {
                record.record(class);
            }
            blocks.push(settled.block);

            events
                .emit(EngineEvent::ToolComplete {
                    invocation_id: inv.id.clone(),
                    tool_name: inv.name.clone(),
                    status: inv.status,
                    entry_id: inv.entry_id.clone(),
                })
                .await;
            if let Some(report) = settled.report {
                let found = report.sources();
                events
                    .emit(EngineEvent::RetrievalComplete {
                        query: report.query.clone(),
                        sources: found.clone(),
                        num_chunks: report.num_chunks(),
                    })
                    .await;
                sources.extend(found);
            }
        }

        Ok(DispatchBatch {
            invocations,
            message: Message::tool_results(blocks),
            record,
            sources,
        })
    }

    /// Write a finished invocation to history and settle it. Successful
    /// retrieval and search results get a full entry and its summary.
    fn settle(&self, session: &mut Session, inv: &mut ToolInvocation, exec: Executed) -> KlerResult<Settled> {
        let output = match exec.outcome {
            Ok(output) => output,
            Err(e) => {
                let message = failure_text(&e);
                tracing::warn!(session = session.key(), tool = %inv.name, error = %e, "tool failed");
                inv.settle(ToolStatus::Failed, message.clone());
                return Ok(Settled {
                    block: ContentBlock::tool_result(inv.id.clone(), message, true),
                    billed: None,
                    report: None,
                });
            }
        };

        let billed = exec.request.as_ref().map(ToolRequest::class);
        if exec.request.as_ref().is_some_and(ToolRequest::records_history) {
            let entry_id = session.append_full(EntryDraft::tool_result(
                inv.name.clone(),
                inv.input.clone(),
                output.content.clone(),
            ))?;
            match exec.summary {
                Some(Summary {
                    text,
                    low_fidelity: false,
                }) => session.append_summary(&entry_id, text)?,
                Some(Summary { text, .. }) => session.append_degraded_summary(&entry_id, text)?,
                None => session.append_degraded_summary(
                    &entry_id,
                    tool_fallback(&inv.name, &inv.input, &output.content, self.summary.truncate_chars),
                )?,
            };
            inv.entry_id = Some(entry_id);
        }

        let block = ContentBlock::tool_result(inv.id.clone(), output.content.clone(), false);
        inv.settle(ToolStatus::Complete, output.content);
        tracing::info!(session = session.key(), tool = %inv.name, entry = ?inv.entry_id, "tool complete");
        Ok(Settled {
            block,
            billed,
            report: output.report,
        })
    }
}

fn failure_text(error: &KlerError) -> String {
    match error {
        KlerError::NotFound { .. } => error.to_string(),
        other => format!("Error: {other}"),
    }
}
