//! External code/repository search.
//!
//! The search service is an MCP server reached over JSON-RPC. Only
//! operations on a read-only allow-list are ever advertised to the engine or
//! forwarded to the server.

pub mod allow_list;
pub mod protocol;
pub mod transport;

pub use allow_list::ReadOnlyAllowList;
pub use transport::SearchTransport;
#[cfg(feature = "native")]
pub use transport::StdioTransport;

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{KlerError, KlerResult};
use crate::types::ToolDefinition;

use protocol::{JsonRpcId, JsonRpcNotification, JsonRpcRequest, RemoteTool, RemoteToolResult};

const PROTOCOL_VERSION: &str = "2024-11-05";

/// Read-only search operations exposed to the dispatcher.
#[async_trait]
pub trait SearchAdapter: Send + Sync {
    /// Run `operation` with `params` and return its text output.
    async fn call(&self, operation: &str, params: Value) -> KlerResult<String>;

    /// Tool definitions for every operation this adapter will accept.
    fn catalogue(&self) -> Vec<ToolDefinition>;
}

// ─── Client ──────────────────────────────────────────────────────────────────

/// JSON-RPC client speaking the MCP handshake and tool calls.
pub struct McpClient {
    transport: Box<dyn SearchTransport>,
    next_id: AtomicI64,
    server_name: String,
}

impl McpClient {
    pub fn new(transport: Box<dyn SearchTransport>) -> Self {
        Self {
            transport,
            next_id: AtomicI64::new(1),
            server_name: "unknown".into(),
        }
    }

    fn next_id(&self) -> JsonRpcId {
        JsonRpcId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Handshake; records the server name and sends `notifications/initialized`.
    pub async fn initialize(&mut self) -> KlerResult<()> {
        let req = JsonRpcRequest::new(self.next_id(), "initialize").with_params(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {"name": "kler-core", "version": env!("CARGO_PKG_VERSION")},
            "capabilities": {}
        }));
        let result = self
            .transport
            .send(req)
            .await?
            .into_result()
            .map_err(|e| KlerError::Mcp {
                server: self.server_name.clone(),
                message: e.to_string(),
            })?;

        if let Some(name) = result.pointer("/serverInfo/name").and_then(Value::as_str) {
            self.server_name = name.to_string();
        }
        self.transport
            .notify(JsonRpcNotification::new("notifications/initialized"))
            .await?;
        tracing::info!(server = %self.server_name, "search server initialized");
        Ok(())
    }

    pub async fn list_tools(&self) -> KlerResult<Vec<RemoteTool>> {
        let req = JsonRpcRequest::new(self.next_id(), "tools/list");
        let result = self.transport.send(req).await?.into_result()?;
        Ok(serde_json::from_value(result.get("tools").cloned().unwrap_or_default()).unwrap_or_default())
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> KlerResult<RemoteToolResult> {
        let req = JsonRpcRequest::new(self.next_id(), "tools/call")
            .with_params(json!({"name": name, "arguments": arguments}));
        let result = self.transport.send(req).await?.into_result()?;
        serde_json::from_value(result).map_err(|e| KlerError::Mcp {
            server: self.server_name.clone(),
            message: format!("failed to parse tool result: {e}"),
        })
    }

    pub async fn close(&self) -> KlerResult<()> {
        self.transport.close().await
    }
}

// ─── Adapter ─────────────────────────────────────────────────────────────────

/// [`SearchAdapter`] over an MCP server, restricted to an allow-list.
pub struct McpSearchAdapter {
    client: McpClient,
    allow_list: ReadOnlyAllowList,
    catalogue: Vec<ToolDefinition>,
}

impl McpSearchAdapter {
    /// Initialize the server and build the catalogue from the tools it
    /// advertises that are also on the allow-list.
    pub async fn connect(transport: Box<dyn SearchTransport>, allow_list: ReadOnlyAllowList) -> KlerResult<Self> {
        let mut client = McpClient::new(transport);
        client.initialize().await?;
        let remote = client.list_tools().await?;

        let catalogue: Vec<ToolDefinition> = remote
            .into_iter()
            .filter(|t| allow_list.contains(&t.name))
            .map(|t| ToolDefinition {
                description: t
                    .description
                    .unwrap_or_else(|| format!("Read-only search operation {}", t.name)),
                input_schema: if t.input_schema.is_null() {
                    json!({"type": "object"})
                } else {
                    t.input_schema
                },
                name: t.name,
            })
            .collect();

        for name in allow_list.iter() {
            if !catalogue.iter().any(|d| d.name == name) {
                tracing::warn!(server = %client.server_name(), operation = name, "allowed operation not offered by server");
            }
        }

        Ok(Self {
            client,
            allow_list,
            catalogue,
        })
    }

    /// Spawn the configured stdio server and connect to it.
    #[cfg(feature = "native")]
    pub async fn spawn(command: &[String], allow_list: ReadOnlyAllowList) -> KlerResult<Self> {
        let transport = StdioTransport::spawn(command)?;
        Self::connect(Box::new(transport), allow_list).await
    }

    pub fn allow_list(&self) -> &ReadOnlyAllowList {
        &self.allow_list
    }

    pub async fn close(&self) -> KlerResult<()> {
        self.client.close().await
    }
}

#[async_trait]
impl SearchAdapter for McpSearchAdapter {
    async fn call(&self, operation: &str, params: Value) -> KlerResult<String> {
        self.allow_list.check(operation)?;
        tracing::debug!(operation, "external search call");
        let result = self.client.call_tool(operation, params).await?;
        let text = result.text();
        if result.is_error {
            return Err(KlerError::ToolFailure {
                tool_name: operation.to_string(),
                message: text,
            });
        }
        Ok(text)
    }

    fn catalogue(&self) -> Vec<ToolDefinition> {
        self.catalogue.clone()
    }
}
