use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::cost::ToolClass;
use crate::error::{KlerError, KlerResult};
use crate::search::ReadOnlyAllowList;
use crate::types::{ToolDefinition, ToolStatus};

pub const RETRIEVE_FULL_CONTEXT: &str = "retrieve_full_context";
pub const RETRIEVE_DOCUMENTATION: &str = "retrieve_documentation";

/// A tool call the engine asked for, resolved to what it will do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolRequest {
    /// Expand a summarized entry back to its verbatim content.
    RetrieveFullContext { entry_id: String },
    RetrieveDocumentation { query: String },
    /// Read-only operation on the external search service.
    ExternalSearch { operation: String, params: Value },
}

impl ToolRequest {
    pub fn parse(name: &str, input: &Value, allow_list: &ReadOnlyAllowList) -> KlerResult<Self> {
        match name {
            RETRIEVE_FULL_CONTEXT => Ok(ToolRequest::RetrieveFullContext {
                entry_id: required_str(name, input, "id")?,
            }),
            RETRIEVE_DOCUMENTATION => Ok(ToolRequest::RetrieveDocumentation {
                query: required_str(name, input, "query")?,
            }),
            other => {
                allow_list.check(other)?;
                Ok(ToolRequest::ExternalSearch {
                    operation: other.to_string(),
                    params: input.clone(),
                })
            }
        }
    }

    pub fn class(&self) -> ToolClass {
        match self {
            ToolRequest::RetrieveFullContext { .. } => ToolClass::Internal,
            ToolRequest::RetrieveDocumentation { .. } => ToolClass::Retrieval,
            ToolRequest::ExternalSearch { .. } => ToolClass::External,
        }
    }

    /// Internal lookups read history and never write to it.
    pub fn records_history(&self) -> bool {
        !matches!(self, ToolRequest::RetrieveFullContext { .. })
    }
}

fn required_str(tool: &str, input: &Value, key: &str) -> KlerResult<String> {
    input
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| KlerError::InvalidInput(format!("{tool}: missing string field '{key}'")))
}

/// One engine-requested tool call and, once finished, its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub input: Value,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Full-track id of the recorded result, if one was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
}

impl ToolInvocation {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
            status: ToolStatus::Running,
            result: None,
            entry_id: None,
        }
    }

    /// Settle a running invocation. Later calls are ignored.
    pub fn settle(&mut self, status: ToolStatus, result: String) {
        if self.status != ToolStatus::Running {
            return;
        }
        self.status = status;
        self.result = Some(result);
    }

    pub fn is_failed(&self) -> bool {
        self.status == ToolStatus::Failed
    }
}

pub fn full_context_definition() -> ToolDefinition {
    ToolDefinition {
        name: RETRIEVE_FULL_CONTEXT.into(),
        description: "Retrieve the full, verbatim content of a summarized conversation item by its ID. \
            Use when a summary lacks detail you need, e.g. the exact code or numbers from an earlier answer."
            .into(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "id": {"type": "string", "description": "The ref ID of the item to expand, e.g. 'q1-r' or 'q2-t1'"}
            },
            "required": ["id"]
        }),
    }
}

pub fn documentation_definition() -> ToolDefinition {
    ToolDefinition {
        name: RETRIEVE_DOCUMENTATION.into(),
        description: "Search up-to-date documentation for APIs, SDKs and libraries. \
            Use for questions about how to use a library, API endpoints, parameters or configuration."
            .into(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "What to look up, including the library or API name"}
            },
            "required": ["query"]
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow() -> ReadOnlyAllowList {
        ReadOnlyAllowList::new(["search_code"]).unwrap()
    }

    #[test]
    fn parses_internal_tools() {
        let req = ToolRequest::parse(RETRIEVE_FULL_CONTEXT, &json!({"id": "q1-r"}), &allow()).unwrap();
        assert_eq!(req, ToolRequest::RetrieveFullContext { entry_id: "q1-r".into() });
        assert_eq!(req.class(), ToolClass::Internal);
        assert!(!req.records_history());

        let req = ToolRequest::parse(RETRIEVE_DOCUMENTATION, &json!({"query": "axum routing"}), &allow()).unwrap();
        assert_eq!(req.class(), ToolClass::Retrieval);
        assert!(req.records_history());
    }

    #[test]
    fn external_requires_allow_list() {
        let req = ToolRequest::parse("search_code", &json!({"q": "x"}), &allow()).unwrap();
        assert_eq!(req.class(), ToolClass::External);
        let err = ToolRequest::parse("create_issue", &json!({}), &allow()).unwrap_err();
        assert!(matches!(err, KlerError::ToolNotAllowed { .. }));
    }

    #[test]
    fn missing_argument_is_invalid() {
        let err = ToolRequest::parse(RETRIEVE_DOCUMENTATION, &json!({"query": "  "}), &allow()).unwrap_err();
        assert!(matches!(err, KlerError::InvalidInput(_)));
    }

    #[test]
    fn invocation_settles_once() {
        let mut inv = ToolInvocation::new("tu_1", "search_code", json!({}));
        inv.settle(ToolStatus::Failed, "boom".into());
        inv.settle(ToolStatus::Complete, "ok".into());
        assert!(inv.is_failed());
        assert_eq!(inv.result.as_deref(), Some("boom"));
    }
}
