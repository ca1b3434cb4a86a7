//! The per-turn MCP toolset: fresh connections to every active server,
//! discovered tools filtered to the caller's permitted set, and dispatch
//! with per-server timeouts.
//!
//! Per-server failure degrades gracefully (the server is skipped with a
//! warning); total construction failure degrades the turn to built-in
//! tools only — the caller decides, this type just returns what connected.

use serde_json::Value;
use std::collections::HashSet;

use dg_domain::config::{McpServerConfig, McpTransportKind};
use dg_domain::tool::ToolDefinition;

use crate::protocol::{self, McpToolDef, ToolsListResult};
use crate::registry::ConfigSnapshot;
use crate::transport::{HttpTransport, McpTransport, StdioTransport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("MCP transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("MCP tool not found: {0}")]
    ToolNotFound(String),
}

struct ConnectedServer {
    name: String,
    transport: Box<dyn McpTransport>,
    tools: Vec<McpToolDef>,
}

impl ConnectedServer {
    /// Connect, handshake, and discover tools for one server.
    async fn connect(config: &McpServerConfig) -> Result<Self, McpError> {
        let transport: Box<dyn McpTransport> = match config.transport {
            McpTransportKind::Stdio => Box::new(StdioTransport::spawn(config)?),
            // The sse flavour is served by the HTTP transport, which also
            // understands event-stream response bodies.
            McpTransportKind::Http | McpTransportKind::Sse => {
                Box::new(HttpTransport::connect(config)?)
            }
        };

        let params = serde_json::to_value(protocol::initialize_params())
            .map_err(|e| McpError::Protocol(format!("serialize initialize params: {e}")))?;
        transport
            .send_request("initialize", Some(params))
            .await?
            .into_result()
            .map_err(|e| McpError::Protocol(format!("initialize failed: {e}")))?;
        transport.send_notification("notifications/initialized").await?;

        let tools = match transport.send_request("tools/list", None).await?.into_result() {
            Ok(value) => serde_json::from_value::<ToolsListResult>(value)
                .map(|r| r.tools)
                .unwrap_or_else(|e| {
                    tracing::warn!(server = %config.name, error = %e, "unparseable tools/list result");
                    Vec::new()
                }),
            Err(e) => {
                tracing::warn!(server = %config.name, error = %e, "tools/list failed");
                Vec::new()
            }
        };

        tracing::info!(server = %config.name, tool_count = tools.len(), "MCP server connected");
        Ok(Self {
            name: config.name.clone(),
            transport,
            tools,
        })
    }
}

/// A turn-scoped set of MCP tools. Call [`McpToolset::shutdown`] when the
/// turn finishes.
pub struct McpToolset {
    servers: Vec<ConnectedServer>,
}

impl McpToolset {
    /// Connect every server in the snapshot and keep the tools whose names
    /// are in `allowed`. Returns `None` when the snapshot has no servers.
    pub async fn connect(
        snapshot: &ConfigSnapshot,
        allowed: &HashSet<String>,
    ) -> Option<Self> {
        if snapshot.is_empty() {
            return None;
        }

        let mut servers = Vec::new();
        for config in &snapshot.servers {
            match ConnectedServer::connect(config).await {
                Ok(mut server) => {
                    server.tools.retain(|t| allowed.contains(&t.name));
                    servers.push(server);
                }
                Err(e) => {
                    tracing::warn!(server = %config.name, error = %e, "skipping MCP server");
                }
            }
        }

        Some(Self { servers })
    }

    /// Definitions of every permitted tool across connected servers.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.servers
            .iter()
            .flat_map(|server| {
                server.tools.iter().map(|tool| ToolDefinition {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.input_schema.clone(),
                })
            })
            .collect()
    }

    pub fn contains(&self, tool_name: &str) -> bool {
        self.servers
            .iter()
            .any(|s| s.tools.iter().any(|t| t.name == tool_name))
    }

    pub fn tool_count(&self) -> usize {
        self.servers.iter().map(|s| s.tools.len()).sum()
    }

    /// Invoke a tool on whichever server advertises it. Returns the
    /// extracted text content and whether the server flagged an error.
    pub async fn call(&self, tool_name: &str, arguments: Value) -> Result<(String, bool), McpError> {
        let server = self
            .servers
            .iter()
            .find(|s| s.transport.is_alive() && s.tools.iter().any(|t| t.name == tool_name))
            .ok_or_else(|| McpError::ToolNotFound(tool_name.to_string()))?;

        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });
        let raw = server
            .transport
            .send_request("tools/call", Some(params))
            .await?
            .into_result()
            .map_err(|e| McpError::Protocol(format!("tools/call failed: {e}")))?;

        let is_error = raw
            .get("isError")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let text = protocol::extract_result_text(&raw);
        tracing::debug!(server = %server.name, tool = tool_name, is_error, "MCP tool call finished");
        Ok((text, is_error))
    }

    /// Shut every connection down. Turn-scoped by design: connections are
    /// never reused across turns.
    pub async fn shutdown(&self) {
        for server in &self.servers {
            server.transport.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::McpRegistry;
    use std::collections::HashMap;

    fn allowed(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn empty_snapshot_yields_no_toolset() {
        let registry = McpRegistry::new();
        let snapshot = registry.install(vec![]);
        assert!(McpToolset::connect(&snapshot, &allowed(&["x"])).await.is_none());
    }

    #[tokio::test]
    async fn unreachable_server_is_skipped() {
        let registry = McpRegistry::new();
        let snapshot = registry.install(vec![McpServerConfig {
            name: "broken".into(),
            transport: McpTransportKind::Stdio,
            command: Some("/nonexistent/deepgate-mcp-binary".into()),
            args: vec![],
            env: HashMap::new(),
            url: None,
            timeout_secs: 2,
        }]);

        let toolset = McpToolset::connect(&snapshot, &allowed(&["x"])).await.unwrap();
        assert_eq!(toolset.tool_count(), 0);
        assert!(!toolset.contains("x"));
    }

    #[tokio::test]
    async fn call_unknown_tool_errors() {
        let toolset = McpToolset { servers: vec![] };
        let err = toolset.call("ghost", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::ToolNotFound(_)));
    }
}
