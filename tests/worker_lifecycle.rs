//! Exercises the worker control surface end to end, in-process: a plugin
//! definition is built through the SDK and served on an ephemeral port,
//! then driven over HTTP the way the supervisor drives a real worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use plugin_api::context::RouteResponse;
use plugin_api::definition::{PluginDefinition, PluginFactory};
use plugin_api::mcp::{McpServer, ToolDescriptor, ToolError};
use plugin_api::metadata::{ConfigFieldSpec, FieldType, HttpMethod};
use plugin_api::runtime::{WorkerEnv, build_worker, serve};
use serde_json::{Value, json};

struct OneToolServer {
    stops: Arc<AtomicUsize>,
}

#[async_trait]
impl McpServer for OneToolServer {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
        Ok(vec![ToolDescriptor {
            name: "echo".to_string(),
            description: None,
            input_schema: None,
        }])
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        match name {
            "echo" => Ok(json!({"echo": arguments})),
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

fn greeting_field(default: &str) -> ConfigFieldSpec {
    ConfigFieldSpec {
        field_type: FieldType::String,
        label: "Greeting".to_string(),
        required: None,
        sensitive: None,
        env: None,
        default: Some(json!(default)),
    }
}

fn test_factory(with_mcp: bool, stops: Arc<AtomicUsize>) -> PluginFactory {
    PluginFactory::new(move |ctx| {
        ctx.register.config_field("greeting", greeting_field("hello"));
        ctx.register.api_key_auth("key", "API key");
        ctx.register.route(HttpMethod::POST, "/echo", |req| async move {
            RouteResponse::ok(json!({"body": req.body, "query": req.query}))
        });

        let stops = Arc::clone(&stops);
        PluginDefinition::builder("mock")
            .on_start(move |ctx| {
                let stops = Arc::clone(&stops);
                async move {
                    if with_mcp {
                        ctx.mcp.start_local("tools", Box::new(OneToolServer { stops })).await?;
                    }
                    Ok(())
                }
            })
            // Replies with whatever the current greeting config value is,
            // so config updates are observable from the outside.
            .on_validate_auth(|ctx| async move {
                let greeting =
                    ctx.config.get_optional("greeting").and_then(|v| v.as_str().map(String::from));
                if ctx.candidate.credential("secret") == Some("letmein") {
                    Ok(plugin_api::AuthCheck {
                        valid: true,
                        message: greeting,
                    })
                } else {
                    Ok(plugin_api::AuthCheck::rejected("wrong secret"))
                }
            })
            .build()
    })
}

fn worker_env() -> WorkerEnv {
    WorkerEnv::from_map(&HashMap::from([
        ("PLUGIN_ID".to_string(), "mock".to_string()),
        ("ORGANIZATION_ID".to_string(), "org-1".to_string()),
        // Unused: the test binds its own ephemeral listener.
        ("WORKER_PORT".to_string(), "1".to_string()),
    ]))
    .expect("worker env")
}

async fn start_worker(
    with_mcp: bool,
) -> (String, Arc<AtomicUsize>, tokio::task::JoinHandle<anyhow::Result<()>>) {
    let stops = Arc::new(AtomicUsize::new(0));
    let factory = test_factory(with_mcp, Arc::clone(&stops));
    let state = Arc::new(build_worker(&factory, &worker_env()).await.expect("build worker"));
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let address = format!("http://{}", listener.local_addr().unwrap());
    let server = tokio::spawn(serve(state, listener));
    (address, stops, server)
}

#[tokio::test]
async fn health_and_metadata_are_served() {
    let (address, _stops, _server) = start_worker(false).await;
    let client = reqwest::Client::new();

    let health: Value =
        client.get(format!("{address}/health")).send().await.unwrap().json().await.unwrap();
    assert_eq!(health["healthy"], true);

    let metadata: Value =
        client.get(format!("{address}/metadata")).send().await.unwrap().json().await.unwrap();
    assert_eq!(metadata["name"], "mock");
    assert_eq!(metadata["configSchema"]["greeting"]["type"], "string");
    assert_eq!(metadata["authMethods"][0]["id"], "key");
    assert_eq!(metadata["routes"][0]["path"], "/echo");
    assert!(metadata.get("mcp").is_none(), "no mcp section without servers");
}

#[tokio::test]
async fn list_tools_is_503_without_servers_and_200_with() {
    let client = reqwest::Client::new();

    let (address, _stops, _server) = start_worker(false).await;
    let response = client.get(format!("{address}/mcp/list-tools")).send().await.unwrap();
    assert_eq!(response.status(), 503);

    let (address, _stops, _server) = start_worker(true).await;
    let body: Value =
        client.get(format!("{address}/mcp/list-tools")).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["tools"][0]["name"], "echo");

    let metadata: Value =
        client.get(format!("{address}/metadata")).send().await.unwrap().json().await.unwrap();
    assert_eq!(metadata["mcp"]["local"][0]["serverId"], "tools");
    assert_eq!(metadata["mcp"]["local"][0]["status"], "available");
}

#[tokio::test]
async fn tool_calls_dispatch_by_name() {
    let (address, _stops, _server) = start_worker(true).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{address}/mcp/call-tool"))
        .json(&json!({"toolName": "echo", "arguments": {"n": 1}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["echo"]["n"], 1);

    let response = client
        .post(format!("{address}/mcp/call-tool"))
        .json(&json!({"toolName": "missing", "arguments": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn plugin_routes_receive_body_and_query() {
    let (address, _stops, _server) = start_worker(false).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(format!("{address}/echo?mode=fast%20lane"))
        .json(&json!({"k": "v"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["body"]["k"], "v");
    assert_eq!(body["query"]["mode"], "fast lane");
}

#[tokio::test]
async fn validate_auth_checks_the_candidate() {
    let (address, _stops, _server) = start_worker(false).await;
    let client = reqwest::Client::new();

    let good: Value = client
        .post(format!("{address}/hooks/validate-auth"))
        .json(&json!({"methodId": "key", "credentials": {"secret": "letmein"}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(good["valid"], true);

    let bad: Value = client
        .post(format!("{address}/hooks/validate-auth"))
        .json(&json!({"methodId": "key", "credentials": {"secret": "nope"}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(bad["valid"], false);
    assert_eq!(bad["message"], "wrong secret");
}

#[tokio::test]
async fn config_update_is_visible_to_later_hooks() {
    let (address, _stops, _server) = start_worker(false).await;
    let client = reqwest::Client::new();

    let before: Value = client
        .post(format!("{address}/hooks/validate-auth"))
        .json(&json!({"methodId": "key", "credentials": {"secret": "letmein"}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(before["message"], "hello", "default applies before any update");

    let response = client
        .post(format!("{address}/hooks/config-update"))
        .json(&json!({"config": {"greeting": "bonjour"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let after: Value = client
        .post(format!("{address}/hooks/validate-auth"))
        .json(&json!({"methodId": "key", "credentials": {"secret": "letmein"}}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(after["message"], "bonjour");
}

#[tokio::test]
async fn shutdown_stops_the_server_and_mcp_exactly_once() {
    let (address, stops, server) = start_worker(true).await;
    let client = reqwest::Client::new();

    let response = client.post(format!("{address}/shutdown")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    let result = tokio::time::timeout(std::time::Duration::from_secs(5), server)
        .await
        .expect("server task did not stop")
        .unwrap();
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(stops.load(Ordering::SeqCst), 1);
}
