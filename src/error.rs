use thiserror::Error;

#[derive(Error, Debug)]
pub enum KlerError {
    #[error("Insufficient balance: need {needed} credits, have {balance}")]
    InsufficientBalance { needed: i64, balance: i64 },

    #[error("Tool failure: tool={tool_name}, {message}")]
    ToolFailure { tool_name: String, message: String },

    #[error("Dangling reference: no full entry with id '{id}'")]
    DanglingReference { id: String },

    #[error("Error: ID '{id}' not found")]
    NotFound { id: String },

    #[error("Duplicate entry id: {id}")]
    DuplicateEntry { id: String },

    #[error("Turn budget exceeded after {turns} turns")]
    TurnBudgetExceeded { turns: usize },

    #[error("Upstream timeout: {target} did not answer within {timeout_ms}ms")]
    UpstreamTimeout { target: String, timeout_ms: u64 },

    #[error("Session busy: an exchange is already in flight for '{key}'")]
    SessionBusy { key: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Tool not allowed: {name}")]
    ToolNotAllowed { name: String },

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Auth error: {0}")]
    Auth(String),

    #[error("Provider rate limited: {provider}, retry after {retry_after_ms}ms")]
    RateLimited {
        provider: String,
        retry_after_ms: u64,
    },

    #[error("Retrieval error: {0}")]
    Retrieval(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("MCP error: server={server}, {message}")]
    Mcp { server: String, message: String },

    #[error("JSON-RPC error: code={code}, {message}")]
    JsonRpc { code: i32, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Config parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl KlerError {
    /// Errors that terminate an exchange as opposed to being folded back
    /// into the turn loop as a failed tool result.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            KlerError::ToolFailure { .. }
                | KlerError::NotFound { .. }
                | KlerError::ToolNotAllowed { .. }
                | KlerError::Retrieval(_)
                | KlerError::Mcp { .. }
                | KlerError::JsonRpc { .. }
        )
    }
}

pub type KlerResult<T> = Result<T, KlerError>;
