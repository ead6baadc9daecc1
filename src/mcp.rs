//! Host-side MCP bridge: typed client for a worker's `/mcp/*` endpoints.
//! Tool calls are never retried here; a tool's effects are not assumed
//! idempotent, so the caller owns any retry decision.

use std::time::Duration;

use plugin_api::mcp::ToolDescriptor;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum McpBridgeError {
    /// The worker is unreachable or has no MCP server registered.
    #[error("mcp unavailable: {0}")]
    Unavailable(String),
    #[error("tool call failed with status {status}: {detail}")]
    ToolCall { status: u16, detail: String },
    #[error("malformed mcp response: {0}")]
    Malformed(String),
}

#[derive(Deserialize)]
struct ToolListBody {
    tools: Vec<ToolDescriptor>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CallToolBody<'a> {
    tool_name: &'a str,
    arguments: Value,
}

#[derive(Clone)]
pub struct McpBridge {
    client: reqwest::Client,
    call_timeout: Duration,
}

impl McpBridge {
    pub fn new(client: reqwest::Client, call_timeout: Duration) -> Self {
        McpBridge { client, call_timeout }
    }

    pub async fn list_tools(
        &self,
        worker_address: &str,
    ) -> Result<Vec<ToolDescriptor>, McpBridgeError> {
        let url = format!("{}/mcp/list-tools", worker_address.trim_end_matches('/'));
        let response = self
            .client
            .get(url)
            .timeout(self.call_timeout)
            .send()
            .await
            .map_err(|e| McpBridgeError::Unavailable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(McpBridgeError::Unavailable(format!("status {status}: {detail}")));
        }
        let body: ToolListBody =
            response.json().await.map_err(|e| McpBridgeError::Malformed(e.to_string()))?;
        Ok(body.tools)
    }

    pub async fn call_tool(
        &self,
        worker_address: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<Value, McpBridgeError> {
        let url = format!("{}/mcp/call-tool", worker_address.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .timeout(self.call_timeout)
            .json(&CallToolBody { tool_name, arguments })
            .send()
            .await
            .map_err(|e| McpBridgeError::Unavailable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(McpBridgeError::ToolCall { status: status.as_u16(), detail });
        }
        response.json().await.map_err(|e| McpBridgeError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn bridge() -> McpBridge {
        McpBridge::new(reqwest::Client::new(), Duration::from_secs(2))
    }

    async fn serve(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn list_tools_parses_the_tool_list() {
        let addr = serve(axum::Router::new().route(
            "/mcp/list-tools",
            get(|| async { Json(json!({"tools": [{"name": "charge"}, {"name": "refund"}]})) }),
        ))
        .await;

        let tools = bridge().list_tools(&addr).await.unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["charge", "refund"]);
    }

    #[tokio::test]
    async fn no_server_registered_maps_to_unavailable() {
        let addr = serve(axum::Router::new().route(
            "/mcp/list-tools",
            get(|| async {
                (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "no mcp server registered"})))
            }),
        ))
        .await;

        match bridge().list_tools(&addr).await {
            Err(McpBridgeError::Unavailable(detail)) => assert!(detail.contains("503")),
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn connection_refused_maps_to_unavailable() {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        assert!(matches!(
            bridge().list_tools(&addr).await,
            Err(McpBridgeError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn failed_tool_call_surfaces_body_text_and_is_not_retried() {
        let hits = Arc::new(AtomicU32::new(0));
        let hits_in_route = Arc::clone(&hits);
        let addr = serve(axum::Router::new().route(
            "/mcp/call-tool",
            post(move || {
                hits_in_route.fetch_add(1, Ordering::SeqCst);
                async { (StatusCode::INTERNAL_SERVER_ERROR, "charge declined".to_string()) }
            }),
        ))
        .await;

        match bridge().call_tool(&addr, "charge", json!({"amount": 100})).await {
            Err(McpBridgeError::ToolCall { status, detail }) => {
                assert_eq!(status, 500);
                assert_eq!(detail, "charge declined");
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1, "tool calls must not be retried");
    }

    #[tokio::test]
    async fn successful_tool_call_returns_the_result_json() {
        let addr = serve(axum::Router::new().route(
            "/mcp/call-tool",
            post(|Json(body): Json<Value>| async move {
                Json(json!({"echo": body["arguments"], "tool": body["toolName"]}))
            }),
        ))
        .await;

        let result = bridge().call_tool(&addr, "charge", json!({"amount": 100})).await.unwrap();
        assert_eq!(result["tool"], "charge");
        assert_eq!(result["echo"]["amount"], 100);
    }
}
