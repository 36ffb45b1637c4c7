use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::future::join_all;
use rmcp::{
    model::{CallToolRequestParam, Tool},
    service::{Peer, RoleClient, ServiceExt},
    transport::{
        StreamableHttpClientTransport, TokioChildProcess,
        streamable_http_client::StreamableHttpClientTransportConfig,
    },
};
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;

use crate::llm::ToolSpec;
use crate::mcp::config::{McpConfig, McpTransport};

/// A tool implemented inside the agent process.
#[async_trait]
pub trait NativeTool: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn schema(&self) -> Value;
    async fn call(&self, args: Value) -> anyhow::Result<Value>;
}

type DynClientService = rmcp::service::RunningService<
    RoleClient,
    Box<dyn rmcp::service::DynService<RoleClient>>,
>;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    Unknown(String),

    #[error("tool '{tool}' timed out after {seconds:.0}s")]
    Timeout { tool: String, seconds: f64 },

    #[error("tool '{tool}' failed: {message}")]
    Failed { tool: String, message: String },

    #[error("transport error calling '{tool}': {message}")]
    Transport { tool: String, message: String },
}

/// Flattened tool result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub text: String,
    /// The server reported the call as failed (`isError`).
    pub is_error: bool,
}

impl ToolOutput {
    /// Flatten an MCP `CallToolResult` (as JSON) or a native tool value.
    ///
    /// Text blocks are joined with newlines; other content blocks are kept as
    /// compact JSON.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        let is_error = value
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let text = match &value {
            Value::String(s) => s.clone(),
            Value::Object(obj) => match obj.get("content").and_then(Value::as_array) {
                Some(blocks) => blocks
                    .iter()
                    .map(|block| match block.get("text").and_then(Value::as_str) {
                        Some(text) if block.get("type").and_then(Value::as_str) == Some("text") => {
                            text.to_string()
                        }
                        _ => block.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
                None => value.to_string(),
            },
            other => other.to_string(),
        };

        Self { text, is_error }
    }
}

/// Tool visible to the model.
#[derive(Debug, Clone)]
pub struct RegisteredTool {
    /// Name the model calls (`server__tool`, or the bare name for local tools).
    pub name: String,
    /// Owning server; `None` for local tools.
    pub server: Option<String>,
    /// Name as published by the server.
    pub raw_name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    /// Bound on connecting to one server and listing its tools.
    pub connect_timeout: Duration,
}

#[derive(Clone)]
pub struct McpRegistry {
    peers: Arc<HashMap<String, Peer<RoleClient>>>,
    // namespaced_tool_name -> (server_name, tool_name)
    tool_index: Arc<HashMap<String, (String, String)>>,
    tools: Arc<Vec<RegisteredTool>>,
    native_tools: Arc<HashMap<String, Arc<dyn NativeTool>>>,
    services: Arc<tokio::sync::Mutex<Vec<(String, DynClientService)>>>,
}

impl std::fmt::Debug for McpRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpRegistry")
            .field("tool_count", &self.tools.len())
            .field("server_count", &self.peers.len())
            .field("native_tool_count", &self.native_tools.len())
            .finish()
    }
}

impl McpRegistry {
    /// Connect every enabled server concurrently and index their tools.
    ///
    /// Servers that fail or time out are skipped. Fails only when no server
    /// contributed any tool.
    pub async fn connect(cfg: &McpConfig, opts: ConnectOptions) -> anyhow::Result<Self> {
        let attempts = cfg.enabled().map(|(name, entry)| async move {
            let res = tokio::time::timeout(
                opts.connect_timeout,
                connect_server(name, &entry.transport, opts.connect_timeout),
            )
            .await;
            (name.clone(), entry.transport.kind(), res)
        });

        let mut peers = HashMap::new();
        let mut services = Vec::new();
        let mut tools = Vec::new();
        let mut tool_index = HashMap::new();

        for (server, kind, res) in join_all(attempts).await {
            let (service, listed) = match res {
                Ok(Ok(ok)) => ok,
                Ok(Err(e)) => {
                    tracing::error!(
                        name: "mcp.server.failed",
                        server = %server,
                        transport = kind,
                        error = %format!("{e:#}"),
                        "Failed to connect MCP server, skipping"
                    );
                    continue;
                }
                Err(_) => {
                    tracing::error!(
                        name: "mcp.server.timeout",
                        server = %server,
                        transport = kind,
                        timeout_secs = opts.connect_timeout.as_secs_f64(),
                        "Timed out connecting MCP server, skipping"
                    );
                    continue;
                }
            };

            tracing::info!(
                name: "mcp.server.connected",
                server = %server,
                transport = kind,
                tools = listed.len(),
                "MCP server connected"
            );

            for t in listed {
                let registered = Self::register_server_tool(&server, t);
                tracing::debug!(
                    name: "mcp.tool.discovered",
                    tool = %registered.name,
                    "Discovered tool"
                );
                tool_index.insert(
                    registered.name.clone(),
                    (server.clone(), registered.raw_name.clone()),
                );
                tools.push(registered);
            }

            peers.insert(server.clone(), service.peer().clone());
            services.push((server, service));
        }

        if tools.is_empty() {
            for (server, service) in services {
                if let Err(e) = service.cancel().await {
                    tracing::warn!(server = %server, error = %e, "MCP service did not close cleanly");
                }
            }
            anyhow::bail!("no MCP tools available");
        }

        Ok(Self {
            peers: Arc::new(peers),
            tool_index: Arc::new(tool_index),
            tools: Arc::new(tools),
            native_tools: Arc::new(HashMap::new()),
            services: Arc::new(tokio::sync::Mutex::new(services)),
        })
    }

    /// Creates an empty registry (local tools only).
    pub fn new_empty() -> Self {
        Self {
            peers: Arc::new(HashMap::new()),
            tool_index: Arc::new(HashMap::new()),
            tools: Arc::new(Vec::new()),
            native_tools: Arc::new(HashMap::new()),
            services: Arc::new(tokio::sync::Mutex::new(Vec::new())),
        }
    }

    fn register_server_tool(server: &str, t: Tool) -> RegisteredTool {
        let raw_name = t.name.to_string();
        let schema = serde_json::to_value(&*t.input_schema)
            .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}));
        RegisteredTool {
            name: sanitize_tool_name(&format!("{server}__{raw_name}")),
            server: Some(server.to_string()),
            raw_name,
            description: t.description.as_deref().unwrap_or_default().to_string(),
            input_schema: schema,
        }
    }

    /// Register a local tool under its bare name.
    #[must_use]
    pub fn with_native_tool(self, tool: Arc<dyn NativeTool>) -> Self {
        let name = sanitize_tool_name(tool.name());

        let mut tools = (*self.tools).clone();
        tools.retain(|t| t.name != name);
        tools.push(RegisteredTool {
            name: name.clone(),
            server: None,
            raw_name: tool.name().to_string(),
            description: tool.description().to_string(),
            input_schema: tool.schema(),
        });

        let mut native_tools = (*self.native_tools).clone();
        native_tools.insert(name, tool);

        Self {
            peers: self.peers,
            tool_index: self.tool_index,
            tools: Arc::new(tools),
            native_tools: Arc::new(native_tools),
            services: self.services,
        }
    }

    pub fn tools(&self) -> &[RegisteredTool] {
        &self.tools
    }

    /// Connected server names, sorted.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Provider-neutral tool descriptors for the model drivers.
    pub fn function_declarations(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|t| ToolSpec {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.input_schema.clone(),
            })
            .collect()
    }

    /// Execute a tool by the name the model used, bounded by `timeout`.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<ToolOutput, ToolError> {
        let timed_out = || ToolError::Timeout {
            tool: name.to_string(),
            seconds: timeout.as_secs_f64(),
        };

        if let Some(tool) = self.native_tools.get(name) {
            return match tokio::time::timeout(timeout, tool.call(arguments)).await {
                Err(_) => Err(timed_out()),
                Ok(Ok(v)) => Ok(ToolOutput::from_value(v)),
                Ok(Err(e)) => Err(ToolError::Failed {
                    tool: name.to_string(),
                    message: format!("{e:#}"),
                }),
            };
        }

        let (server, raw_tool) = self
            .tool_index
            .get(name)
            .ok_or_else(|| ToolError::Unknown(name.to_string()))?;

        let peer = self
            .peers
            .get(server)
            .ok_or_else(|| ToolError::Unknown(name.to_string()))?;

        let request = CallToolRequestParam {
            name: raw_tool.clone().into(),
            arguments: arguments.as_object().cloned(),
        };

        let res = tokio::time::timeout(timeout, peer.call_tool(request))
            .await
            .map_err(|_| timed_out())?
            .with_context(|| format!("tools/call failed for {server}::{raw_tool}"))
            .map_err(|e| ToolError::Transport {
                tool: name.to_string(),
                message: format!("{e:#}"),
            })?;

        let value = serde_json::to_value(res).map_err(|e| ToolError::Failed {
            tool: name.to_string(),
            message: e.to_string(),
        })?;
        Ok(ToolOutput::from_value(value))
    }

    /// Cancel every running MCP service. Safe to call more than once.
    pub async fn shutdown(&self) {
        let services = std::mem::take(&mut *self.services.lock().await);
        for (server, service) in services {
            match service.cancel().await {
                Ok(reason) => tracing::debug!(server = %server, reason = ?reason, "MCP service closed"),
                Err(e) => tracing::warn!(server = %server, error = %e, "MCP service did not close cleanly"),
            }
        }
    }
}

async fn connect_server(
    server: &str,
    transport: &McpTransport,
    connect_timeout: Duration,
) -> anyhow::Result<(DynClientService, Vec<Tool>)> {
    let service = match transport {
        McpTransport::Stdio { command, args, env } => {
            let mut cmd = Command::new(command);
            cmd.args(args);
            for (k, v) in env {
                cmd.env(k, v);
            }
            let transport = TokioChildProcess::new(cmd)
                .with_context(|| format!("failed to spawn '{command}'"))?;
            ().into_dyn()
                .serve(transport)
                .await
                .with_context(|| format!("failed to connect stdio MCP server '{server}'"))?
        }
        McpTransport::StreamableHttp { url, headers } => {
            let client = reqwest::Client::builder()
                .default_headers(super::header_map(headers)?)
                .build()
                .context("failed to build HTTP client")?;
            let transport = StreamableHttpClientTransport::with_client(
                client,
                StreamableHttpClientTransportConfig::with_uri(url.to_string()),
            );
            ().into_dyn()
                .serve(transport)
                .await
                .with_context(|| format!("failed to connect remote MCP server '{server}'"))?
        }
        McpTransport::Sse { url, headers } => {
            let transport = super::sse::connect(server, url, headers, connect_timeout).await?;
            ().into_dyn()
                .serve(transport)
                .await
                .with_context(|| format!("failed to connect SSE MCP server '{server}'"))?
        }
    };

    let tools = service
        .list_all_tools()
        .await
        .with_context(|| format!("tools/list failed for MCP server '{server}'"))?;

    Ok((service, tools))
}

/// Restrict tool names to `[A-Za-z0-9_-]`, which every provider accepts.
pub fn sanitize_tool_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
