//! Relevance rerank of fused chunks against the original query.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::ModelConfig;
use crate::error::{KlerError, KlerResult};
use crate::provider::{ask_text, parse_json_reply, ReasoningEngine};

use super::fusion::ScoredChunk;
use super::tokenizer::tokenize;

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Positions into `candidates`, most relevant first, at most `top_k`.
    async fn rerank(&self, query: &str, candidates: &[ScoredChunk], top_k: usize) -> KlerResult<Vec<usize>>;
}

/// Asks the reasoning engine to pick and order document ids.
pub struct EngineReranker {
    engine: Arc<dyn ReasoningEngine>,
    model: ModelConfig,
    timeout: Duration,
}

impl EngineReranker {
    pub fn new(engine: Arc<dyn ReasoningEngine>, model: ModelConfig, timeout: Duration) -> Self {
        Self {
            engine,
            model,
            timeout,
        }
    }

    fn prompt(query: &str, candidates: &[ScoredChunk], top_k: usize) -> String {
        let docs: Vec<String> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| {
                format!(
                    "<document>\n<document_id>{i}</document_id>\n<document_content>{}</document_content>\n</document>",
                    c.chunk.text
                )
            })
            .collect();
        format!(
            "You are about to be given a set of documents, along with an id of each.\n\
             Your task is to select the {top_k} most relevant documents to answer the user's question.\n\n\
             Here is the user's question:\n<question>\n{query}\n</question>\n\n\
             Here are the documents to select from:\n<documents>\n{}\n</documents>\n\n\
             Respond with JSON only: {{\"document_ids\": [...]}} listing {top_k} document ids, \
             sorted in order of decreasing relevance to the user's question.",
            docs.join("\n")
        )
    }
}

/// Map the engine's id list onto candidate positions, dropping unknown and
/// repeated ids.
fn parse_ranking(reply: &str, len: usize, top_k: usize) -> KlerResult<Vec<usize>> {
    let json = parse_json_reply(reply)
        .ok_or_else(|| KlerError::Retrieval("rerank reply is not JSON".into()))?;
    let ids = json
        .get("document_ids")
        .and_then(|v| v.as_array())
        .ok_or_else(|| KlerError::Retrieval("rerank reply has no document_ids".into()))?;

    let mut seen = HashSet::new();
    let order: Vec<usize> = ids
        .iter()
        .filter_map(|v| match v {
            serde_json::Value::String(s) => s.trim().parse::<usize>().ok(),
            serde_json::Value::Number(n) => n.as_u64().map(|n| n as usize),
            _ => None,
        })
        .filter(|i| *i < len && seen.insert(*i))
        .take(top_k)
        .collect();
    if order.is_empty() {
        return Err(KlerError::Retrieval("rerank reply named no known documents".into()));
    }
    Ok(order)
}

#[async_trait]
impl Reranker for EngineReranker {
    async fn rerank(&self, query: &str, candidates: &[ScoredChunk], top_k: usize) -> KlerResult<Vec<usize>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let prompt = Self::prompt(query, candidates, top_k);
        let call = ask_text(
            self.engine.as_ref(),
            &self.model,
            "You rank documentation excerpts by relevance. Always respond with valid JSON only.",
            &prompt,
        );
        let reply = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| KlerError::UpstreamTimeout {
                target: "reranker".into(),
                timeout_ms: self.timeout.as_millis() as u64,
            })??;
        parse_ranking(&reply, candidates.len(), top_k)
    }
}

/// Offline reranker: fraction of distinct query terms present in each chunk.
/// Ties keep the incoming order.
pub struct OverlapReranker;

#[async_trait]
impl Reranker for OverlapReranker {
    async fn rerank(&self, query: &str, candidates: &[ScoredChunk], top_k: usize) -> KlerResult<Vec<usize>> {
        let terms: HashSet<String> = tokenize(query).into_iter().collect();
        if terms.is_empty() {
            return Ok((0..candidates.len().min(top_k)).collect());
        }
        let mut scored: Vec<(usize, f64)> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let words: HashSet<String> = tokenize(&c.chunk.text).into_iter().collect();
                let hits = terms.iter().filter(|t| words.contains(*t)).count();
                (i, hits as f64 / terms.len() as f64)
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(scored.into_iter().take(top_k).map(|(i, _)| i).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::ScriptedEngine;
    use crate::retrieval::chunker::Chunk;
    use crate::types::Message;

    fn candidates(texts: &[&str]) -> Vec<ScoredChunk> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| ScoredChunk {
                chunk: Chunk {
                    doc_id: "d".into(),
                    section_index: i,
                    text: t.to_string(),
                },
                score: 0.0,
            })
            .collect()
    }

    #[test]
    fn parse_ranking_filters_unknown_and_repeats() {
        let order = parse_ranking(r#"{"document_ids": ["2", "9", "2", 0, "x"]}"#, 3, 6).unwrap();
        assert_eq!(order, vec![2, 0]);
    }

    #[test]
    fn parse_ranking_caps_at_top_k() {
        let order = parse_ranking(r#"{"document_ids": ["0","1","2"]}"#, 3, 2).unwrap();
        assert_eq!(order, vec![0, 1]);
    }

    #[test]
    fn parse_ranking_rejects_garbage() {
        assert!(parse_ranking("no idea", 3, 2).is_err());
        assert!(parse_ranking(r#"{"document_ids": ["7"]}"#, 3, 2).is_err());
    }

    #[tokio::test]
    async fn engine_reranker_uses_reply_order() {
        let engine = Arc::new(ScriptedEngine::replies(vec![Message::assistant(
            "```json\n{\"document_ids\": [\"1\", \"0\"]}\n```",
        )]));
        let r = EngineReranker::new(engine, ModelConfig::default(), Duration::from_secs(5));
        let order = r
            .rerank("oauth", &candidates(&["pagination", "oauth flow"]), 2)
            .await
            .unwrap();
        assert_eq!(order, vec![1, 0]);
    }

    #[tokio::test]
    async fn overlap_reranker_prefers_coverage() {
        let c = candidates(&["cursor pagination", "refresh the oauth token", "oauth scopes"]);
        let order = OverlapReranker.rerank("oauth token refresh", &c, 2).await.unwrap();
        assert_eq!(order, vec![1, 2]);
    }
}
