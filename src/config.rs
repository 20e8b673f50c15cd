//! Engine configuration.
//!
//! Every section has serde defaults, so an empty TOML document yields a
//! working configuration. Environment variables of the form
//! `KLER_SECTION__KEY=value` override file values after parsing.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cost::pricing::PricingTable;
use crate::error::{KlerError, KlerResult};
use crate::retrieval::semantic::DistanceMetric;

const ENV_PREFIX: &str = "KLER_";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant that answers questions about APIs, SDKs, and technical documentation.

TOOL USAGE GUIDELINES:
1. retrieve_documentation: use this tool for questions about API authentication, endpoints, parameters, SDK setup or code examples. Prefer it over general knowledge for any API/SDK question.
2. Code search tools (search_code, search_repositories, get_file_contents, ...): use when explicitly asked about repositories or code.
3. retrieve_full_context: earlier messages are shown as summaries prefixed with [ID:...]. Call this tool with an ID when you need the full original content.

Do not use tools for greetings, general knowledge questions unrelated to a specific API, or simple conversation.";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub summary: SummaryConfig,
    #[serde(default)]
    pub pricing: PricingTable,
    #[serde(default)]
    pub allowance: AllowanceConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

// ─── Sections ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Capacity of the per-exchange event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default = "default_max_parallel_tools")]
    pub max_parallel_tools: usize,
}

fn default_max_turns() -> usize {
    15
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_event_buffer() -> usize {
    64
}

fn default_max_parallel_tools() -> usize {
    8
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            system_prompt: default_system_prompt(),
            event_buffer: default_event_buffer(),
            max_parallel_tools: default_max_parallel_tools(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_id")]
    pub id: String,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_model_id() -> String {
    "claude-haiku-4-5-20251001".to_string()
}

fn default_max_output_tokens() -> usize {
    3000
}

fn default_temperature() -> f64 {
    0.2
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            id: default_model_id(),
            max_output_tokens: default_max_output_tokens(),
            temperature: default_temperature(),
        }
    }
}

/// Fixed per-call timeouts. No call is retried automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_engine_ms")]
    pub engine_ms: u64,
    #[serde(default = "default_adapter_ms")]
    pub adapter_ms: u64,
    #[serde(default = "default_summarizer_ms")]
    pub summarizer_ms: u64,
}

fn default_engine_ms() -> u64 {
    120_000
}

fn default_adapter_ms() -> u64 {
    30_000
}

fn default_summarizer_ms() -> u64 {
    20_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            engine_ms: default_engine_ms(),
            adapter_ms: default_adapter_ms(),
            summarizer_ms: default_summarizer_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default = "default_per_subquery_top")]
    pub per_subquery_top: usize,
    #[serde(default = "default_final_top")]
    pub final_top: usize,
    #[serde(default = "default_max_sub_queries")]
    pub max_sub_queries: usize,
    /// Results requested from each index before fusion.
    #[serde(default = "default_candidates_per_index")]
    pub candidates_per_index: usize,
    #[serde(default = "default_bm25_k1")]
    pub bm25_k1: f64,
    #[serde(default = "default_bm25_b")]
    pub bm25_b: f64,
    #[serde(default)]
    pub distance: DistanceMetric,
    #[serde(default = "default_true")]
    pub decompose: bool,
    #[serde(default = "default_true")]
    pub rerank: bool,
    /// Token budget passed to the discovery adapter when fetching.
    #[serde(default = "default_fetch_tokens")]
    pub fetch_tokens: usize,
}

fn default_rrf_k() -> f64 {
    60.0
}

fn default_per_subquery_top() -> usize {
    3
}

fn default_final_top() -> usize {
    6
}

fn default_max_sub_queries() -> usize {
    5
}

fn default_candidates_per_index() -> usize {
    15
}

fn default_bm25_k1() -> f64 {
    1.5
}

fn default_bm25_b() -> f64 {
    0.75
}

fn default_true() -> bool {
    true
}

fn default_fetch_tokens() -> usize {
    50_000
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            per_subquery_top: default_per_subquery_top(),
            final_top: default_final_top(),
            max_sub_queries: default_max_sub_queries(),
            candidates_per_index: default_candidates_per_index(),
            bm25_k1: default_bm25_k1(),
            bm25_b: default_bm25_b(),
            distance: DistanceMetric::default(),
            decompose: true,
            rerank: true,
            fetch_tokens: default_fetch_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryConfig {
    #[serde(default = "default_answer_hint")]
    pub answer_hint: String,
    #[serde(default = "default_tool_hint")]
    pub tool_hint: String,
    /// Characters kept by the truncation fallback.
    #[serde(default = "default_truncate_chars")]
    pub truncate_chars: usize,
    /// Characters of tool output shown to the summarizer.
    #[serde(default = "default_tool_preview_chars")]
    pub tool_preview_chars: usize,
}

fn default_answer_hint() -> String {
    "2-3 sentences".to_string()
}

fn default_tool_hint() -> String {
    "1-2 sentences".to_string()
}

fn default_truncate_chars() -> usize {
    200
}

fn default_tool_preview_chars() -> usize {
    1000
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            answer_hint: default_answer_hint(),
            tool_hint: default_tool_hint(),
            truncate_chars: default_truncate_chars(),
            tool_preview_chars: default_tool_preview_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowanceConfig {
    /// Balance a brand-new owner starts with.
    #[serde(default = "default_initial_balance")]
    pub initial_balance: i64,
    /// Balance the daily top-up restores, 0 disables it.
    #[serde(default = "default_daily_allowance")]
    pub daily_allowance: i64,
    /// Upper bound on credits granted by top-ups per calendar month.
    #[serde(default)]
    pub monthly_cap: Option<i64>,
}

fn default_initial_balance() -> i64 {
    50
}

fn default_daily_allowance() -> i64 {
    50
}

impl Default for AllowanceConfig {
    fn default() -> Self {
        Self {
            initial_balance: default_initial_balance(),
            daily_allowance: default_daily_allowance(),
            monthly_cap: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// External search operations offered to the engine.
    #[serde(default = "default_allow_list")]
    pub allow_list: Vec<String>,
    /// Command line of the stdio search server, empty when disabled.
    #[serde(default)]
    pub server_command: Vec<String>,
}

fn default_allow_list() -> Vec<String> {
    vec![
        "search_repositories".to_string(),
        "search_code".to_string(),
        "get_file_contents".to_string(),
        "list_commits".to_string(),
    ]
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            allow_list: default_allow_list(),
            server_command: Vec::new(),
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

impl EngineConfig {
    /// Parse a TOML document, without environment overrides.
    pub fn from_toml_str(content: &str) -> KlerResult<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, then apply `KLER_*` environment overrides.
    pub fn load(path: &Path) -> KlerResult<Self> {
        if !path.exists() {
            return Err(KlerError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path)?;
        let mut config: EngineConfig = toml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    /// Environment variables in format: KLER_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(std::env::vars());
    }

    pub fn apply_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if let Some(config_key) = key.strip_prefix(ENV_PREFIX) {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> KlerResult<()> {
        match path {
            "ORCHESTRATOR__MAX_TURNS" => self.orchestrator.max_turns = parse(path, value)?,
            "ORCHESTRATOR__MAX_PARALLEL_TOOLS" => {
                self.orchestrator.max_parallel_tools = parse(path, value)?
            }
            "MODEL__ID" => self.model.id = value.to_string(),
            "MODEL__MAX_OUTPUT_TOKENS" => self.model.max_output_tokens = parse(path, value)?,
            "TIMEOUTS__ENGINE_MS" => self.timeouts.engine_ms = parse(path, value)?,
            "TIMEOUTS__ADAPTER_MS" => self.timeouts.adapter_ms = parse(path, value)?,
            "TIMEOUTS__SUMMARIZER_MS" => self.timeouts.summarizer_ms = parse(path, value)?,
            "RETRIEVAL__RRF_K" => self.retrieval.rrf_k = parse(path, value)?,
            "RETRIEVAL__RERANK" => self.retrieval.rerank = parse(path, value)?,
            "RETRIEVAL__DECOMPOSE" => self.retrieval.decompose = parse(path, value)?,
            "RETRIEVAL__DISTANCE" => {
                self.retrieval.distance = match value.to_ascii_lowercase().as_str() {
                    "cosine" => DistanceMetric::Cosine,
                    "euclidean" => DistanceMetric::Euclidean,
                    other => {
                        return Err(KlerError::Config(format!(
                            "{path}: unknown distance metric '{other}'"
                        )))
                    }
                }
            }
            "PRICING__BASE" => self.pricing.base = parse(path, value)?,
            "PRICING__RETRIEVAL" => self.pricing.retrieval = parse(path, value)?,
            "PRICING__EXTERNAL_PER_CALL" => self.pricing.external_per_call = parse(path, value)?,
            "ALLOWANCE__DAILY_ALLOWANCE" => self.allowance.daily_allowance = parse(path, value)?,
            "ALLOWANCE__MONTHLY_CAP" => self.allowance.monthly_cap = Some(parse(path, value)?),
            "SEARCH__ALLOW_LIST" => {
                self.search.allow_list = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            }
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> KlerResult<()> {
        if self.orchestrator.max_turns == 0 {
            return Err(KlerError::Config("orchestrator.max_turns must be >= 1".into()));
        }
        if self.orchestrator.event_buffer == 0 {
            return Err(KlerError::Config("orchestrator.event_buffer must be >= 1".into()));
        }
        if self.orchestrator.max_parallel_tools == 0 {
            return Err(KlerError::Config(
                "orchestrator.max_parallel_tools must be >= 1".into(),
            ));
        }
        let r = &self.retrieval;
        if r.rrf_k <= 0.0 {
            return Err(KlerError::Config("retrieval.rrf_k must be positive".into()));
        }
        if r.per_subquery_top == 0 || r.final_top == 0 || r.max_sub_queries == 0 {
            return Err(KlerError::Config(
                "retrieval top-k and sub-query limits must be >= 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&r.bm25_b) || r.bm25_k1 < 0.0 {
            return Err(KlerError::Config("retrieval.bm25 parameters out of range".into()));
        }
        if self.pricing.base < 0
            || self.pricing.retrieval < 0
            || self.pricing.external_per_call < 0
            || self.pricing.extra_tool < 0
        {
            return Err(KlerError::Config("pricing entries must be non-negative".into()));
        }
        crate::search::ReadOnlyAllowList::new(self.search.allow_list.iter().cloned())?;
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(path: &str, value: &str) -> KlerResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| KlerError::Config(format!("{path}: cannot parse '{value}'")))
}
