//! JSON-RPC 2.0 framing for the search server.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcId {
    Number(i64),
    String(String),
}

impl From<i64> for JsonRpcId {
    fn from(n: i64) -> Self {
        JsonRpcId::Number(n)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: JsonRpcId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<JsonRpcId>, method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: id.into(),
            method: method.into(),
            params: None,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = Some(params);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: JsonRpcId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: JsonRpcId, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: JsonRpcId, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Result payload, or the server's error as `KlerError::JsonRpc`.
    pub fn into_result(self) -> crate::error::KlerResult<serde_json::Value> {
        match self.error {
            Some(err) => Err(crate::error::KlerError::JsonRpc {
                code: err.code,
                message: err.message,
            }),
            None => Ok(self.result.unwrap_or_default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Fire-and-forget message; carries no id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params: None,
        }
    }
}

/// Tool advertised by the search server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RemoteContent {
    Text { text: String },
    Image { data: String, #[serde(rename = "mimeType")] mime_type: String },
    Resource { resource: serde_json::Value },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteToolResult {
    #[serde(default)]
    pub content: Vec<RemoteContent>,
    #[serde(default)]
    pub is_error: bool,
}

impl RemoteToolResult {
    /// Text blocks joined by newlines; non-text blocks are noted by kind.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(|c| match c {
                RemoteContent::Text { text } => text.clone(),
                RemoteContent::Image { mime_type, .. } => format!("[image: {mime_type}]"),
                RemoteContent::Resource { resource } => resource
                    .get("text")
                    .and_then(|t| t.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| "[resource]".into()),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_request_wire_shape() {
        let req = JsonRpcRequest::new(7, "tools/call")
            .with_params(json!({"name": "search_code", "arguments": {"q": "tokio"}}));
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 7);
        assert_eq!(value["params"]["name"], "search_code");
    }

    #[test]
    fn error_response_becomes_json_rpc_error() {
        let resp = JsonRpcResponse::failure(JsonRpcId::Number(1), -32601, "Method not found");
        let err = resp.into_result().unwrap_err();
        assert!(matches!(err, crate::error::KlerError::JsonRpc { code: -32601, .. }));
    }

    #[test]
    fn notification_has_no_id() {
        let json = serde_json::to_string(&JsonRpcNotification::new("notifications/initialized")).unwrap();
        assert!(!json.contains("\"id\""));
    }

    #[test]
    fn tool_result_text_joins_blocks() {
        let result: RemoteToolResult = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "3 repositories"},
                {"type": "resource", "resource": {"uri": "repo://a", "text": "tokio-rs/tokio"}}
            ],
            "isError": false
        }))
        .unwrap();
        assert_eq!(result.text(), "3 repositories\ntokio-rs/tokio");
    }
}
