use std::sync::Arc;

use futures::future::join_all;

use crate::config::RetrievalConfig;
use crate::error::{KlerError, KlerResult};
use crate::types::SourceSummary;

use super::chunker::{chunk_by_section, Chunk};
use super::discovery::{DocumentRef, DocumentSource};
use super::fusion::{deduplicate_chunks, reciprocal_rank_fusion, ScoredChunk};
use super::lexical::{Bm25Params, LexicalIndex};
use super::planner::{plan_or_passthrough, PassthroughPlanner, QueryPlan, QueryPlanner};
use super::rerank::Reranker;
use super::semantic::{Embedder, HashingEmbedder, VectorIndex};

const TITLE_CHARS: usize = 100;
const SNIPPET_CHARS: usize = 200;

/// Marker returned in place of a context block when discovery finds nothing.
pub fn not_found_marker(name: &str) -> String {
    format!("No documentation found for '{name}'")
}

/// Outcome of one retrieval call.
#[derive(Debug, Clone)]
pub struct RetrievalReport {
    pub query: String,
    pub plan: QueryPlan,
    pub document: Option<DocumentRef>,
    /// Selected chunks, best first.
    pub chunks: Vec<ScoredChunk>,
    /// Formatted block handed to the reasoning engine.
    pub context: String,
}

impl RetrievalReport {
    pub fn found(&self) -> bool {
        !self.chunks.is_empty()
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn sources(&self) -> Vec<SourceSummary> {
        self.chunks
            .iter()
            .map(|c| SourceSummary {
                title: c.chunk.title(TITLE_CHARS),
                snippet: c.chunk.snippet(SNIPPET_CHARS),
                score: c.score,
            })
            .collect()
    }
}

/// Hybrid documentation retrieval. Chunks and indexes live only for the
/// duration of one [`RetrievalPipeline::retrieve`] call.
pub struct RetrievalPipeline {
    source: Arc<dyn DocumentSource>,
    embedder: Arc<dyn Embedder>,
    planner: Arc<dyn QueryPlanner>,
    reranker: Option<Arc<dyn Reranker>>,
    config: RetrievalConfig,
}

impl RetrievalPipeline {
    pub fn new(source: Arc<dyn DocumentSource>, config: RetrievalConfig) -> Self {
        Self {
            source,
            embedder: Arc::new(HashingEmbedder::default()),
            planner: Arc::new(PassthroughPlanner),
            reranker: None,
            config,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn with_planner(mut self, planner: Arc<dyn QueryPlanner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub async fn retrieve(&self, query: &str) -> KlerResult<RetrievalReport> {
        let query = query.trim();
        if query.is_empty() {
            return Err(KlerError::InvalidInput("retrieval query is empty".into()));
        }

        let plan = if self.config.decompose {
            plan_or_passthrough(self.planner.as_ref(), query, self.config.max_sub_queries).await
        } else {
            QueryPlan::passthrough(query)
        };
        tracing::info!(query, doc_name = %plan.doc_name, sub_queries = plan.sub_queries.len(), "retrieval planned");

        let Some(document) = self.source.find_document(&plan.doc_name).await? else {
            return Ok(RetrievalReport {
                query: query.to_string(),
                context: not_found_marker(&plan.doc_name),
                plan,
                document: None,
                chunks: Vec::new(),
            });
        };

        let per_sub_query = join_all(
            plan.sub_queries
                .iter()
                .map(|sq| self.search_sub_query(&document, sq)),
        )
        .await;

        let mut collected = Vec::new();
        let mut failures = 0;
        let mut last_err = None;
        for (sub_query, result) in plan.sub_queries.iter().zip(per_sub_query) {
            match result {
                Ok(chunks) => collected.extend(chunks),
                Err(e) => {
                    tracing::warn!(sub_query = %sub_query, error = %e, "sub-query retrieval failed");
                    failures += 1;
                    last_err = Some(e);
                }
            }
        }
        if let Some(e) = last_err {
            if failures == plan.sub_queries.len() {
                return Err(e);
            }
        }

        collected.sort_by(|a, b| b.score.total_cmp(&a.score));
        let candidates = deduplicate_chunks(collected);
        let chunks = self.select(query, candidates).await;

        let context = if chunks.is_empty() {
            not_found_marker(query)
        } else {
            format_context(query, &plan, &document, &chunks)
        };
        tracing::info!(query, document = %document.id, chunks = chunks.len(), "retrieval complete");

        Ok(RetrievalReport {
            query: query.to_string(),
            plan,
            document: Some(document),
            chunks,
            context,
        })
    }

    async fn search_sub_query(&self, document: &DocumentRef, sub_query: &str) -> KlerResult<Vec<ScoredChunk>> {
        let text = self.source.fetch(&document.id, sub_query).await?;
        let chunks = chunk_by_section(&document.id, &text);
        self.hybrid_search(sub_query, chunks).await
    }

    /// Keyword + semantic search over `chunks`, fused with RRF, keeping the
    /// configured number of results.
    pub async fn hybrid_search(&self, query: &str, chunks: Vec<Chunk>) -> KlerResult<Vec<ScoredChunk>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let k = self.config.candidates_per_index;

        let lexical = LexicalIndex::build(
            &texts,
            Bm25Params {
                k1: self.config.bm25_k1,
                b: self.config.bm25_b,
            },
        );
        let mut ranked_lists = vec![lexical.search(query, k).into_iter().map(|(i, _)| i).collect::<Vec<_>>()];

        match self.semantic_ranking(query, &texts, k).await {
            Ok(list) => ranked_lists.push(list),
            Err(e) => tracing::warn!(error = %e, "semantic search unavailable, using keyword ranking only"),
        }

        let fused = reciprocal_rank_fusion(&ranked_lists, self.config.rrf_k);
        let mut slots: Vec<Option<Chunk>> = chunks.into_iter().map(Some).collect();
        Ok(fused
            .into_iter()
            .take(self.config.per_subquery_top)
            .filter_map(|(i, score)| slots[i].take().map(|chunk| ScoredChunk { chunk, score }))
            .collect())
    }

    async fn semantic_ranking(&self, query: &str, texts: &[String], k: usize) -> KlerResult<Vec<usize>> {
        let vectors = self.embedder.embed_documents(texts).await?;
        let query_vector = self.embedder.embed_query(query).await?;
        let index = VectorIndex::new(self.config.distance, vectors);
        Ok(index.search(&query_vector, k).into_iter().map(|(i, _)| i).collect())
    }

    /// Rerank against the original query when enabled, else keep fused order.
    async fn select(&self, query: &str, candidates: Vec<ScoredChunk>) -> Vec<ScoredChunk> {
        let top = self.config.final_top;
        let reranker = match (&self.reranker, self.config.rerank) {
            (Some(r), true) if candidates.len() > 1 => r,
            _ => return candidates.into_iter().take(top).collect(),
        };

        match reranker.rerank(query, &candidates, top).await {
            Ok(order) => {
                let mut slots: Vec<Option<ScoredChunk>> = candidates.into_iter().map(Some).collect();
                let mut picked: Vec<ScoredChunk> =
                    order.into_iter().filter_map(|i| slots.get_mut(i).and_then(Option::take)).collect();
                // top up from fused order if the reranker returned fewer
                picked.extend(slots.into_iter().flatten());
                picked.truncate(top);
                picked
            }
            Err(e) => {
                tracing::warn!(error = %e, "rerank failed, keeping fused order");
                candidates.into_iter().take(top).collect()
            }
        }
    }
}

fn format_context(query: &str, plan: &QueryPlan, document: &DocumentRef, chunks: &[ScoredChunk]) -> String {
    let source = if document.title.is_empty() {
        document.id.clone()
    } else {
        format!("{} ({})", document.title, document.id)
    };
    let mut out = format!(
        "Documentation for '{query}'\nSource: {source}\nSub-queries: {}\n",
        plan.sub_queries.join("; ")
    );
    for (i, c) in chunks.iter().enumerate() {
        out.push_str(&format!("\n[Doc {}]\n{}\n", i + 1, c.chunk.text));
    }
    out
}
