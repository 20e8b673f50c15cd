//! Query decomposition: which documentation to fetch and which focused
//! sub-queries to run against it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::error::{KlerError, KlerResult};
use crate::provider::{ask_text, parse_json_reply, ReasoningEngine};

const PLANNER_SYSTEM: &str = "You are an expert at reading developer questions and naming the API documentation to search, plus the focused topics to look up in it. Always respond with valid JSON only.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub doc_name: String,
    pub sub_queries: Vec<String>,
}

impl QueryPlan {
    /// The query used as-is: both document name and sole sub-query.
    pub fn passthrough(query: &str) -> Self {
        Self {
            doc_name: query.to_string(),
            sub_queries: vec![query.to_string()],
        }
    }
}

#[async_trait]
pub trait QueryPlanner: Send + Sync {
    async fn plan(&self, query: &str, max_sub_queries: usize) -> KlerResult<QueryPlan>;
}

/// No decomposition.
pub struct PassthroughPlanner;

#[async_trait]
impl QueryPlanner for PassthroughPlanner {
    async fn plan(&self, query: &str, _max_sub_queries: usize) -> KlerResult<QueryPlan> {
        Ok(QueryPlan::passthrough(query))
    }
}

pub struct EnginePlanner {
    engine: Arc<dyn ReasoningEngine>,
    model: ModelConfig,
    timeout: Duration,
}

impl EnginePlanner {
    pub fn new(engine: Arc<dyn ReasoningEngine>, model: ModelConfig, timeout: Duration) -> Self {
        Self {
            engine,
            model,
            timeout,
        }
    }

    fn prompt(query: &str, max_sub_queries: usize) -> String {
        format!(
            r#"Give me the API documentation name to search for, and up to {max_sub_queries} focused sub-queries covering what the question needs: {query}

GUIDELINES:
- Use the official API name as doc_name (e.g. "Stripe API", "Telegram Bot API", "X API" for Twitter/X).
- Prefer official APIs over third-party SDKs.
- For authentication questions, mention OAuth or authentication in a sub-query.
- Simple questions need only one sub-query.

Example:
<prompt>Can you provide the OAuth setup for the X ads API and how to post a tweet?</prompt>
<answer>{{"doc_name": "X API", "sub_queries": ["OAuth setup", "post tweet v2"]}}</answer>

Reply with the JSON object only."#
        )
    }
}

/// Validate a decoded plan: trimmed, non-empty, unique sub-queries, capped.
fn normalize_plan(query: &str, raw: &serde_json::Value, max_sub_queries: usize) -> KlerResult<QueryPlan> {
    let doc_name = raw
        .get("doc_name")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| KlerError::Retrieval("plan has no doc_name".into()))?
        .to_string();

    let mut seen = HashSet::new();
    let mut sub_queries: Vec<String> = raw
        .get("sub_queries")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty() && seen.insert(s.to_lowercase()))
                .take(max_sub_queries.max(1))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    if sub_queries.is_empty() {
        sub_queries.push(query.to_string());
    }
    Ok(QueryPlan {
        doc_name,
        sub_queries,
    })
}

#[async_trait]
impl QueryPlanner for EnginePlanner {
    async fn plan(&self, query: &str, max_sub_queries: usize) -> KlerResult<QueryPlan> {
        let prompt = Self::prompt(query, max_sub_queries);
        let call = ask_text(self.engine.as_ref(), &self.model, PLANNER_SYSTEM, &prompt);
        let reply = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| KlerError::UpstreamTimeout {
                target: "planner".into(),
                timeout_ms: self.timeout.as_millis() as u64,
            })??;
        let raw = parse_json_reply(&reply)
            .ok_or_else(|| KlerError::Retrieval("plan reply is not JSON".into()))?;
        normalize_plan(query, &raw, max_sub_queries)
    }
}

/// Plan, degrading to the passthrough plan on any failure.
pub async fn plan_or_passthrough(planner: &dyn QueryPlanner, query: &str, max_sub_queries: usize) -> QueryPlan {
    match planner.plan(query, max_sub_queries).await {
        Ok(plan) => plan,
        Err(e) => {
            tracing::warn!(query, error = %e, "query planning failed, using query as-is");
            QueryPlan::passthrough(query)
        }
    }
}
