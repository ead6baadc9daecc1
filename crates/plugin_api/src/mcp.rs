//! Worker-side MCP surface: plugins register local tool servers (in-process
//! objects) or external ones (reachable over HTTP), and the runtime serves
//! the aggregate through `/mcp/list-tools` and `/mcp/call-tool`.
//!
//! Dispatch queries servers live in registration order; nothing about a
//! server's tool set is cached, so a server may change its tools between
//! calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::definition::HookError;
use crate::metadata::{McpMetadata, McpServerInfo, McpServerStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub input_schema: Option<Value>,
}

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("no tool named `{0}` is registered")]
    UnknownTool(String),
    #[error("tool call failed: {0}")]
    Failed(String),
    #[error("tool server unreachable: {0}")]
    Unreachable(String),
}

/// A local MCP tool server. Implemented by plugin code; owned by the
/// registrar once started.
#[async_trait]
pub trait McpServer: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError>;
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ToolError>;
    /// Release whatever the server holds. Called at most once.
    async fn stop(&self);
}

#[derive(Debug, Clone)]
pub struct ExternalMcpOptions {
    pub server_id: String,
    pub url: String,
    pub headers: HashMap<String, String>,
}

struct LocalEntry {
    server_id: String,
    server: Box<dyn McpServer>,
}

struct ExternalEntry {
    options: ExternalMcpOptions,
}

#[derive(Serialize, Deserialize)]
struct ToolList {
    tools: Vec<ToolDescriptor>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExternalCall<'a> {
    tool_name: &'a str,
    arguments: Value,
}

/// Holds every MCP server a worker has registered. One per worker process.
pub struct McpRegistrar {
    local: RwLock<Vec<LocalEntry>>,
    external: RwLock<Vec<ExternalEntry>>,
    http: reqwest::Client,
    stopped: AtomicBool,
}

impl Default for McpRegistrar {
    fn default() -> Self {
        McpRegistrar {
            local: RwLock::new(Vec::new()),
            external: RwLock::new(Vec::new()),
            http: reqwest::Client::new(),
            stopped: AtomicBool::new(false),
        }
    }
}

impl McpRegistrar {
    pub async fn start_local(
        &self,
        server_id: impl Into<String>,
        server: Box<dyn McpServer>,
    ) -> Result<(), HookError> {
        let server_id = server_id.into();
        if self.stopped.load(Ordering::SeqCst) {
            return Err(HookError::Failed("mcp registrar is shut down".to_string()));
        }
        let mut local = self.local.write().await;
        if local.iter().any(|e| e.server_id == server_id) {
            return Err(HookError::Failed(format!(
                "mcp server `{server_id}` already registered"
            )));
        }
        info!(server_id = %server_id, "local mcp server registered");
        local.push(LocalEntry { server_id, server });
        Ok(())
    }

    pub async fn start_external(&self, options: ExternalMcpOptions) -> Result<(), HookError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(HookError::Failed("mcp registrar is shut down".to_string()));
        }
        let mut external = self.external.write().await;
        if external.iter().any(|e| e.options.server_id == options.server_id) {
            return Err(HookError::Failed(format!(
                "mcp server `{}` already registered",
                options.server_id
            )));
        }
        info!(server_id = %options.server_id, url = %options.url, "external mcp server registered");
        external.push(ExternalEntry { options });
        Ok(())
    }

    pub async fn has_servers(&self) -> bool {
        !self.local.read().await.is_empty() || !self.external.read().await.is_empty()
    }

    /// Aggregate tool list across every server, registration order. A
    /// server that fails to answer contributes nothing rather than failing
    /// the whole listing.
    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        let mut tools = Vec::new();
        for entry in self.local.read().await.iter() {
            match entry.server.list_tools().await {
                Ok(list) => tools.extend(list),
                Err(e) => {
                    warn!(server_id = %entry.server_id, error = %e, "local mcp server failed to list tools");
                }
            }
        }
        for entry in self.external.read().await.iter() {
            match self.external_list(&entry.options).await {
                Ok(list) => tools.extend(list),
                Err(e) => {
                    warn!(server_id = %entry.options.server_id, error = %e, "external mcp server failed to list tools");
                }
            }
        }
        tools
    }

    /// Dispatch to the first server (registration order) that currently
    /// advertises the tool.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        for entry in self.local.read().await.iter() {
            let tools = entry.server.list_tools().await.unwrap_or_default();
            if tools.iter().any(|t| t.name == name) {
                return entry.server.call_tool(name, arguments).await;
            }
        }
        for entry in self.external.read().await.iter() {
            let tools = self.external_list(&entry.options).await.unwrap_or_default();
            if tools.iter().any(|t| t.name == name) {
                return self.external_call(&entry.options, name, arguments).await;
            }
        }
        Err(ToolError::UnknownTool(name.to_string()))
    }

    /// Snapshot for the `/metadata` manifest. External servers are probed
    /// so the status reflects reachability at report time.
    pub async fn server_info(&self) -> McpMetadata {
        let mut info = McpMetadata::default();
        let stopped = self.stopped.load(Ordering::SeqCst);
        for entry in self.local.read().await.iter() {
            info.local.push(McpServerInfo {
                server_id: entry.server_id.clone(),
                status: if stopped {
                    McpServerStatus::Unavailable
                } else {
                    McpServerStatus::Available
                },
            });
        }
        for entry in self.external.read().await.iter() {
            let status = if stopped || self.external_list(&entry.options).await.is_err() {
                McpServerStatus::Unavailable
            } else {
                McpServerStatus::Available
            };
            info.external
                .push(McpServerInfo { server_id: entry.options.server_id.clone(), status });
        }
        info
    }

    /// Stop every local server. Subsequent calls are no-ops; each server's
    /// `stop` runs at most once.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for entry in self.local.read().await.iter() {
            info!(server_id = %entry.server_id, "stopping local mcp server");
            entry.server.stop().await;
        }
    }

    async fn external_list(
        &self,
        options: &ExternalMcpOptions,
    ) -> Result<Vec<ToolDescriptor>, ToolError> {
        let base = options.url.trim_end_matches('/');
        let mut req = self.http.get(format!("{base}/list-tools"));
        for (k, v) in &options.headers {
            req = req.header(k, v);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ToolError::Unreachable(format!("{}: {e}", options.server_id)))?;
        if !resp.status().is_success() {
            return Err(ToolError::Unreachable(format!(
                "{}: status {}",
                options.server_id,
                resp.status()
            )));
        }
        let list: ToolList = resp
            .json()
            .await
            .map_err(|e| ToolError::Failed(format!("{}: {e}", options.server_id)))?;
        Ok(list.tools)
    }

    async fn external_call(
        &self,
        options: &ExternalMcpOptions,
        name: &str,
        arguments: Value,
    ) -> Result<Value, ToolError> {
        let base = options.url.trim_end_matches('/');
        let mut req = self
            .http
            .post(format!("{base}/call-tool"))
            .json(&ExternalCall { tool_name: name, arguments });
        for (k, v) in &options.headers {
            req = req.header(k, v);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ToolError::Unreachable(format!("{}: {e}", options.server_id)))?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(ToolError::Failed(format!("status {status}: {detail}")));
        }
        resp.json()
            .await
            .map_err(|e| ToolError::Failed(format!("{}: {e}", options.server_id)))
    }
}

/// Handle given to `onStart` through `StartContext::mcp`.
#[derive(Clone, Default)]
pub struct McpAccessor {
    registrar: Arc<McpRegistrar>,
}

impl McpAccessor {
    pub fn new(registrar: Arc<McpRegistrar>) -> Self {
        McpAccessor { registrar }
    }

    pub async fn start_local(
        &self,
        server_id: impl Into<String>,
        server: Box<dyn McpServer>,
    ) -> Result<(), HookError> {
        self.registrar.start_local(server_id, server).await
    }

    pub async fn start_external(&self, options: ExternalMcpOptions) -> Result<(), HookError> {
        self.registrar.start_external(options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct CountingServer {
        tools: Vec<&'static str>,
        stops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl McpServer for CountingServer {
        async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
            Ok(self
                .tools
                .iter()
                .map(|n| ToolDescriptor {
                    name: n.to_string(),
                    description: None,
                    input_schema: None,
                })
                .collect())
        }

        async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
            Ok(json!({"tool": name, "echo": arguments}))
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn server(tools: Vec<&'static str>, stops: &Arc<AtomicUsize>) -> Box<dyn McpServer> {
        Box::new(CountingServer { tools, stops: Arc::clone(stops) })
    }

    #[tokio::test]
    async fn tools_aggregate_in_registration_order() {
        let stops = Arc::new(AtomicUsize::new(0));
        let reg = McpRegistrar::default();
        reg.start_local("billing", server(vec!["charge", "refund"], &stops)).await.unwrap();
        reg.start_local("crm", server(vec!["lookup"], &stops)).await.unwrap();

        let names: Vec<String> = reg.list_tools().await.into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["charge", "refund", "lookup"]);
    }

    #[tokio::test]
    async fn first_server_owning_a_tool_wins() {
        let stops = Arc::new(AtomicUsize::new(0));
        let reg = McpRegistrar::default();
        reg.start_local("a", server(vec!["shared"], &stops)).await.unwrap();
        reg.start_local("b", server(vec!["shared"], &stops)).await.unwrap();

        let result = reg.call_tool("shared", json!({"x": 1})).await.unwrap();
        assert_eq!(result["echo"], json!({"x": 1}));
    }

    #[tokio::test]
    async fn unknown_tool_is_a_typed_error() {
        let reg = McpRegistrar::default();
        match reg.call_tool("nope", json!({})).await {
            Err(ToolError::UnknownTool(name)) => assert_eq!(name, "nope"),
            other => panic!("expected UnknownTool, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn duplicate_server_id_is_rejected() {
        let stops = Arc::new(AtomicUsize::new(0));
        let reg = McpRegistrar::default();
        reg.start_local("dup", server(vec![], &stops)).await.unwrap();
        assert!(reg.start_local("dup", server(vec![], &stops)).await.is_err());
    }

    #[tokio::test]
    async fn shutdown_stops_each_server_exactly_once() {
        let stops = Arc::new(AtomicUsize::new(0));
        let reg = McpRegistrar::default();
        reg.start_local("one", server(vec![], &stops)).await.unwrap();
        reg.start_local("two", server(vec![], &stops)).await.unwrap();

        reg.shutdown().await;
        reg.shutdown().await;
        assert_eq!(stops.load(Ordering::SeqCst), 2);
        assert!(reg.start_local("late", server(vec![], &stops)).await.is_err());
    }
}
