//! A small integration worker used by the supervisor test suite. Declares
//! one of everything: config field, auth method, UI slot, an echo route,
//! and (when the `mcp` capability is granted) a local tool server.

use async_trait::async_trait;
use plugin_api::context::RouteResponse;
use plugin_api::definition::{PluginDefinition, PluginFactory};
use plugin_api::mcp::{McpServer, ToolDescriptor, ToolError};
use plugin_api::metadata::{ConfigFieldSpec, FieldType, HttpMethod};
use serde_json::{Value, json};

struct EchoToolServer;

#[async_trait]
impl McpServer for EchoToolServer {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ToolError> {
        Ok(vec![
            ToolDescriptor {
                name: "echo".to_string(),
                description: Some("returns its arguments".to_string()),
                input_schema: None,
            },
            ToolDescriptor {
                name: "always_fails".to_string(),
                description: None,
                input_schema: None,
            },
        ])
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        match name {
            "echo" => Ok(json!({"echo": arguments})),
            "always_fails" => Err(ToolError::Failed("this tool always fails".to_string())),
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    async fn stop(&self) {}
}

fn factory() -> PluginFactory {
    PluginFactory::new(|ctx| {
        ctx.register.config_field(
            "greeting",
            ConfigFieldSpec {
                field_type: FieldType::String,
                label: "Greeting".to_string(),
                required: None,
                sensitive: None,
                env: None,
                default: Some(json!("hello")),
            },
        );
        ctx.register.config_field(
            "exitAfterMs",
            ConfigFieldSpec {
                field_type: FieldType::Number,
                label: "Exit after (ms)".to_string(),
                required: None,
                sensitive: None,
                env: None,
                default: None,
            },
        );
        ctx.register.api_key_auth("key", "API key");
        ctx.register.ui_extension("dashboard.sidebar", "MockPanel");
        ctx.register.route(HttpMethod::POST, "/echo", |req| async move {
            RouteResponse::ok(json!({"body": req.body, "query": req.query}))
        });

        let with_mcp = std::env::var("PLUGIN_CAPABILITIES")
            .map(|caps| caps.split(',').any(|c| c.trim() == "mcp"))
            .unwrap_or(false);

        PluginDefinition::builder("mock")
            .on_start(move |ctx| async move {
                if with_mcp {
                    ctx.mcp.start_local("mock-tools", Box::new(EchoToolServer)).await?;
                }
                // Lets the suite simulate a worker that dies mid-flight.
                if let Some(ms) = ctx.config.get_optional("exitAfterMs").and_then(|v| v.as_u64())
                {
                    tokio::spawn(async move {
                        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                        std::process::exit(7);
                    });
                }
                ctx.logger.info("mock worker started");
                Ok(())
            })
            .on_validate_auth(|ctx| async move {
                if ctx.candidate.credential("secret") == Some("letmein") {
                    Ok(plugin_api::AuthCheck::ok())
                } else {
                    Ok(plugin_api::AuthCheck::rejected("wrong secret"))
                }
            })
            .on_disable(|ctx| async move {
                ctx.logger.info("mock worker disabling");
                Ok(())
            })
            .build()
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    plugin_api::run(factory()).await
}
