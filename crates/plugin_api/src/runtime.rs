//! Worker-process runtime: reads the environment contract the supervisor
//! populates, invokes the plugin factory, runs the startup hooks, and
//! serves the HTTP control surface until told to shut down.
//!
//! A worker binary is just `runtime::run(factory)` behind `#[tokio::main]`.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::{Arc, Once};

use anyhow::{Context, anyhow};
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{MethodFilter, get, on, post};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strum_macros::{Display, EnumString};
use tokio::net::TcpListener;
use tokio::sync::{RwLock, watch};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::context::{
    AuthAccessor, AuthState, AuthValidationContext, ConfigAccessor, ConfigUpdateContext,
    DisableContext, EnableContext, GlobalContext, InitializeContext, PluginLogger, RouteHandler,
    RouteRequest, StartContext,
};
use crate::definition::PluginFactory;
use crate::mcp::{McpAccessor, McpRegistrar, ToolError};
use crate::metadata::{
    ConfigFieldSpec, FieldType, HttpMethod, PluginMetadata, RouteSpec, validate_metadata,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum RunMode {
    #[default]
    Production,
    Test,
}

/// The environment contract between supervisor and worker. The supervisor
/// builds a cleared environment containing exactly these variables; the
/// worker reads nothing else.
#[derive(Debug, Clone)]
pub struct WorkerEnv {
    pub plugin_id: String,
    pub organization_id: String,
    pub port: u16,
    pub run_mode: RunMode,
    pub capabilities: Vec<String>,
    /// Raw `PLUGIN_CONFIG_<SUFFIX>` values keyed by suffix.
    pub config_raw: HashMap<String, String>,
    pub auth: Option<AuthState>,
    pub platform_api_url: Option<String>,
    pub platform_api_token: Option<String>,
    pub log_dir: Option<String>,
    pub log_level: Option<String>,
    pub version: Option<String>,
}

const CONFIG_PREFIX: &str = "PLUGIN_CONFIG_";
const CREDENTIAL_PREFIX: &str = "AUTH_CREDENTIAL_";

impl WorkerEnv {
    pub fn from_env() -> anyhow::Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_map(&vars)
    }

    pub fn from_map(vars: &HashMap<String, String>) -> anyhow::Result<Self> {
        let required = |key: &str| -> anyhow::Result<String> {
            vars.get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .with_context(|| format!("{key} is not set"))
        };

        let port: u16 = required("WORKER_PORT")?
            .parse()
            .context("WORKER_PORT is not a valid port number")?;
        let run_mode = match vars.get("RUN_MODE") {
            Some(raw) => RunMode::from_str(raw)
                .map_err(|_| anyhow!("RUN_MODE must be `production` or `test`, got `{raw}`"))?,
            None => RunMode::default(),
        };

        let mut config_raw = HashMap::new();
        let mut credentials = HashMap::new();
        for (key, value) in vars {
            if let Some(suffix) = key.strip_prefix(CONFIG_PREFIX) {
                config_raw.insert(suffix.to_string(), value.clone());
            } else if let Some(suffix) = key.strip_prefix(CREDENTIAL_PREFIX) {
                credentials.insert(suffix.to_lowercase(), value.clone());
            }
        }

        let auth = vars.get("AUTH_METHOD_ID").map(|method_id| AuthState {
            method_id: method_id.clone(),
            credentials,
        });

        Ok(WorkerEnv {
            plugin_id: required("PLUGIN_ID")?,
            organization_id: required("ORGANIZATION_ID")?,
            port,
            run_mode,
            capabilities: vars
                .get("PLUGIN_CAPABILITIES")
                .map(|raw| raw.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
            config_raw,
            auth,
            platform_api_url: vars.get("PLATFORM_API_URL").cloned(),
            platform_api_token: vars.get("PLATFORM_API_TOKEN").cloned(),
            log_dir: vars.get("LOG_DIR").cloned(),
            log_level: vars.get("LOG_LEVEL").cloned(),
            version: vars.get("PLUGIN_VERSION").cloned(),
        })
    }
}

static TRACING_INIT: Once = Once::new();

/// Install the worker's tracing subscriber: stderr always, plus a daily
/// rolling file when `LOG_DIR` is set. Safe to call more than once.
pub fn init_tracing(env: &WorkerEnv) {
    TRACING_INIT.call_once(|| {
        let filter = EnvFilter::try_new(env.log_level.as_deref().unwrap_or("info"))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed();
        let file_layer = env.log_dir.as_deref().map(|dir| {
            let file_name = format!("{}-{}.log", env.plugin_id, env.organization_id);
            let appender = tracing_appender::rolling::daily(dir, file_name);
            tracing_subscriber::fmt::layer().with_writer(appender).with_ansi(false).boxed()
        });
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    });
}

/// Everything the HTTP surface needs, built once at startup.
pub struct WorkerState {
    pub plugin_id: String,
    pub organization_id: String,
    definition: Arc<crate::definition::PluginDefinition>,
    manifest: PluginMetadata,
    routes: Vec<(RouteSpec, RouteHandler)>,
    config: RwLock<ConfigAccessor>,
    config_schema: BTreeMap<String, ConfigFieldSpec>,
    auth: AuthAccessor,
    mcp: Arc<McpRegistrar>,
    logger: PluginLogger,
    shutdown: watch::Sender<bool>,
}

impl WorkerState {
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown.clone()
    }

    async fn current_metadata(&self) -> PluginMetadata {
        let mut manifest = self.manifest.clone();
        if self.mcp.has_servers().await {
            manifest.mcp = Some(self.mcp.server_info().await);
        }
        manifest
    }
}

fn coerce_value(field: &ConfigFieldSpec, raw: &str) -> anyhow::Result<Value> {
    let value = match field.field_type {
        FieldType::String => Value::String(raw.to_string()),
        FieldType::Number => serde_json::from_str::<serde_json::Number>(raw)
            .map(Value::Number)
            .with_context(|| format!("`{raw}` is not a number"))?,
        FieldType::Boolean => {
            Value::Bool(raw.parse().with_context(|| format!("`{raw}` is not a boolean"))?)
        }
        FieldType::Json => {
            serde_json::from_str(raw).with_context(|| format!("`{raw}` is not valid JSON"))?
        }
    };
    Ok(value)
}

/// Overlay environment-provided values on declared defaults, coerced to the
/// declared field types.
fn merge_config(
    schema: &BTreeMap<String, ConfigFieldSpec>,
    raw: &HashMap<String, String>,
) -> anyhow::Result<HashMap<String, Value>> {
    let mut merged = HashMap::new();
    for (name, field) in schema {
        let suffix =
            field.env.clone().unwrap_or_else(|| name.to_uppercase());
        if let Some(value) = raw.get(&suffix) {
            let value = coerce_value(field, value)
                .with_context(|| format!("config field `{name}`"))?;
            merged.insert(name.clone(), value);
        } else if let Some(default) = &field.default {
            merged.insert(name.clone(), default.clone());
        } else if field.required.unwrap_or(false) {
            warn!(field = %name, "required config field has no value");
        }
    }
    Ok(merged)
}

/// Invoke the factory, validate the definition, run the startup hooks and
/// assemble the worker state. Any error here aborts the worker before it
/// binds its port.
pub async fn build_worker(factory: &PluginFactory, env: &WorkerEnv) -> anyhow::Result<WorkerState> {
    let mut ctx = GlobalContext::new(&env.plugin_id, &env.organization_id);
    let definition = factory.build(&mut ctx)?;

    let config_schema: BTreeMap<String, ConfigFieldSpec> =
        ctx.register.config_fields().iter().cloned().collect();
    let merged = merge_config(&config_schema, &env.config_raw)?;
    let config = ConfigAccessor::new(merged);
    let auth = AuthAccessor::new(env.auth.clone());
    let logger = ctx.logger.clone();
    let mcp = Arc::new(McpRegistrar::default());

    let mut manifest = PluginMetadata::new(definition.name());
    manifest.version = env.version.clone();
    if !config_schema.is_empty() {
        manifest.config_schema = Some(config_schema.clone());
    }
    if !ctx.register.auth_methods().is_empty() {
        manifest.auth_methods = Some(ctx.register.auth_methods().to_vec());
    }
    if !ctx.register.ui_extensions().is_empty() {
        manifest.ui_extensions = Some(ctx.register.ui_extensions().to_vec());
    }
    let routes: Vec<(RouteSpec, RouteHandler)> = ctx
        .register
        .routes()
        .iter()
        .map(|(spec, handler)| (spec.clone(), Arc::clone(handler)))
        .collect();
    if !routes.is_empty() {
        manifest.routes = Some(routes.iter().map(|(spec, _)| spec.clone()).collect());
    }

    let definition = Arc::new(definition);
    definition
        .run_initialize(InitializeContext {
            organization_id: env.organization_id.clone(),
            config: config.clone(),
            logger: logger.clone(),
        })
        .await
        .map_err(|e| anyhow!("onInitialize failed: {e}"))?;
    definition
        .run_start(StartContext {
            organization_id: env.organization_id.clone(),
            config: config.clone(),
            auth: auth.clone(),
            mcp: McpAccessor::new(Arc::clone(&mcp)),
            logger: logger.clone(),
        })
        .await
        .map_err(|e| anyhow!("onStart failed: {e}"))?;

    // The manifest we are about to serve must pass the same structural
    // rules the supervisor applies.
    let mut reported = manifest.clone();
    if mcp.has_servers().await {
        reported.mcp = Some(mcp.server_info().await);
    }
    validate_metadata(&serde_json::to_value(&reported)?)?;

    let (shutdown, _) = watch::channel(false);
    Ok(WorkerState {
        plugin_id: env.plugin_id.clone(),
        organization_id: env.organization_id.clone(),
        definition,
        manifest,
        routes,
        config: RwLock::new(config),
        config_schema,
        auth,
        mcp,
        logger,
        shutdown,
    })
}

#[derive(Serialize, Deserialize, JsonSchema)]
pub struct HealthResult {
    pub healthy: bool,
}

#[derive(Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HookResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl HookResult {
    fn from_outcome(outcome: Result<(), crate::definition::HookError>) -> (StatusCode, Json<Self>) {
        match outcome {
            Ok(()) => (StatusCode::OK, Json(HookResult { success: true, error: None })),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(HookResult { success: false, error: Some(e.to_string()) }),
            ),
        }
    }
}

#[derive(Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CallToolParams {
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Deserialize)]
struct ConfigUpdateBody {
    config: HashMap<String, Value>,
}

async fn health() -> Json<HealthResult> {
    Json(HealthResult { healthy: true })
}

async fn metadata(State(state): State<Arc<WorkerState>>) -> Json<PluginMetadata> {
    Json(state.current_metadata().await)
}

async fn list_tools(State(state): State<Arc<WorkerState>>) -> (StatusCode, Json<Value>) {
    if !state.mcp.has_servers().await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "no mcp server registered"})),
        );
    }
    let tools = state.mcp.list_tools().await;
    (StatusCode::OK, Json(json!({"tools": tools})))
}

async fn call_tool(
    State(state): State<Arc<WorkerState>>,
    Json(params): Json<CallToolParams>,
) -> (StatusCode, Json<Value>) {
    if !state.mcp.has_servers().await {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "no mcp server registered"})),
        );
    }
    match state.mcp.call_tool(&params.tool_name, params.arguments).await {
        Ok(result) => (StatusCode::OK, Json(result)),
        Err(ToolError::UnknownTool(name)) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("no tool named `{name}` is registered")})),
        ),
        Err(ToolError::Unreachable(detail)) => {
            (StatusCode::BAD_GATEWAY, Json(json!({"error": detail})))
        }
        Err(ToolError::Failed(detail)) => {
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": detail})))
        }
    }
}

async fn enable_hook(State(state): State<Arc<WorkerState>>) -> (StatusCode, Json<HookResult>) {
    let config = state.config.read().await.clone();
    let outcome = state
        .definition
        .run_enable(EnableContext {
            organization_id: state.organization_id.clone(),
            config,
            auth: state.auth.clone(),
            logger: state.logger.clone(),
        })
        .await;
    HookResult::from_outcome(outcome)
}

async fn disable_hook(State(state): State<Arc<WorkerState>>) -> (StatusCode, Json<HookResult>) {
    let outcome = state
        .definition
        .run_disable(DisableContext {
            organization_id: state.organization_id.clone(),
            logger: state.logger.clone(),
        })
        .await;
    HookResult::from_outcome(outcome)
}

async fn config_update_hook(
    State(state): State<Arc<WorkerState>>,
    Json(body): Json<ConfigUpdateBody>,
) -> (StatusCode, Json<HookResult>) {
    // Defaults still apply underneath the updated values.
    let mut merged: HashMap<String, Value> = state
        .config_schema
        .iter()
        .filter_map(|(name, field)| {
            field.default.clone().map(|default| (name.clone(), default))
        })
        .collect();
    merged.extend(body.config);
    let accessor = ConfigAccessor::new(merged);
    *state.config.write().await = accessor.clone();

    let outcome = state
        .definition
        .run_config_update(ConfigUpdateContext {
            organization_id: state.organization_id.clone(),
            config: accessor,
            logger: state.logger.clone(),
        })
        .await;
    HookResult::from_outcome(outcome)
}

async fn validate_auth_hook(
    State(state): State<Arc<WorkerState>>,
    Json(candidate): Json<AuthState>,
) -> (StatusCode, Json<Value>) {
    let config = state.config.read().await.clone();
    let outcome = state
        .definition
        .run_validate_auth(AuthValidationContext {
            organization_id: state.organization_id.clone(),
            candidate,
            config,
            logger: state.logger.clone(),
        })
        .await;
    match outcome {
        Ok(check) => (StatusCode::OK, Json(json!(check))),
        Err(e) => {
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()})))
        }
    }
}

async fn shutdown_endpoint(State(state): State<Arc<WorkerState>>) -> Json<Value> {
    info!(plugin = %state.plugin_id, "shutdown requested");
    let _ = state.shutdown.send(true);
    Json(json!({"success": true}))
}

fn method_filter(method: HttpMethod) -> MethodFilter {
    match method {
        HttpMethod::GET => MethodFilter::GET,
        HttpMethod::POST => MethodFilter::POST,
        HttpMethod::PUT => MethodFilter::PUT,
        HttpMethod::DELETE => MethodFilter::DELETE,
        HttpMethod::PATCH => MethodFilter::PATCH,
    }
}

fn parse_query(raw: Option<&str>) -> HashMap<String, String> {
    form_urlencoded::parse(raw.unwrap_or_default().as_bytes()).into_owned().collect()
}

pub fn build_router(state: Arc<WorkerState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/metadata", get(metadata))
        .route("/mcp/list-tools", get(list_tools))
        .route("/mcp/call-tool", post(call_tool))
        .route("/hooks/enable", post(enable_hook))
        .route("/hooks/disable", post(disable_hook))
        .route("/hooks/config-update", post(config_update_hook))
        .route("/hooks/validate-auth", post(validate_auth_hook))
        .route("/shutdown", post(shutdown_endpoint));

    for (spec, handler) in &state.routes {
        let handler = Arc::clone(handler);
        let method = spec.method;
        let path = spec.path.clone();
        router = router.route(
            &spec.path,
            on(method_filter(method), move |req: axum::extract::Request| {
                let handler = Arc::clone(&handler);
                let path = path.clone();
                async move {
                    let query = parse_query(req.uri().query());
                    let body = match axum::body::to_bytes(req.into_body(), 1024 * 1024).await {
                        Ok(bytes) if !bytes.is_empty() => {
                            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
                        }
                        _ => Value::Null,
                    };
                    let response = handler(RouteRequest { method, path, query, body }).await;
                    let status = StatusCode::from_u16(response.status)
                        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                    (status, Json(response.body))
                }
            }),
        );
    }

    router
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn shutdown_signal(mut rx: watch::Receiver<bool>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = rx.changed() => {}
    }
}

/// Serve the control surface on an already-bound listener until a shutdown
/// signal arrives, then stop local MCP servers.
pub async fn serve(state: Arc<WorkerState>, listener: TcpListener) -> anyhow::Result<()> {
    let rx = state.shutdown.subscribe();
    let mcp = Arc::clone(&state.mcp);
    let router = build_router(state);
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(rx))
        .await;
    // Local servers stop whether the surface exited cleanly or not.
    mcp.shutdown().await;
    served.context("control surface server failed")
}

/// Full worker entry point: environment, logging, factory, control surface.
pub async fn run(factory: PluginFactory) -> anyhow::Result<()> {
    let env = WorkerEnv::from_env()?;
    init_tracing(&env);
    info!(
        plugin = %env.plugin_id,
        organization = %env.organization_id,
        port = env.port,
        mode = %env.run_mode,
        "worker starting"
    );

    let state = match build_worker(&factory, &env).await {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!(plugin = %env.plugin_id, error = %format!("{e:#}"), "worker failed to load");
            return Err(e);
        }
    };

    let listener = TcpListener::bind(("127.0.0.1", env.port))
        .await
        .with_context(|| format!("could not bind 127.0.0.1:{}", env.port))?;
    serve(state, listener).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::PluginDefinition;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([
            ("PLUGIN_ID".to_string(), "stripe".to_string()),
            ("ORGANIZATION_ID".to_string(), "org-1".to_string()),
            ("WORKER_PORT".to_string(), "4455".to_string()),
        ])
    }

    #[test]
    fn env_contract_parses_config_and_credentials() {
        let mut vars = base_vars();
        vars.insert("RUN_MODE".to_string(), "test".to_string());
        vars.insert("PLUGIN_CONFIG_APIREGION".to_string(), "eu".to_string());
        vars.insert("AUTH_METHOD_ID".to_string(), "key".to_string());
        vars.insert("AUTH_CREDENTIAL_SECRET".to_string(), "sk_123".to_string());

        let env = WorkerEnv::from_map(&vars).unwrap();
        assert_eq!(env.port, 4455);
        assert_eq!(env.run_mode, RunMode::Test);
        assert_eq!(env.config_raw["APIREGION"], "eu");
        let auth = env.auth.unwrap();
        assert_eq!(auth.method_id, "key");
        assert_eq!(auth.credential("secret"), Some("sk_123"));
    }

    #[test]
    fn missing_required_env_names_the_variable() {
        let mut vars = base_vars();
        vars.remove("ORGANIZATION_ID");
        let err = WorkerEnv::from_map(&vars).unwrap_err();
        assert!(format!("{err:#}").contains("ORGANIZATION_ID"));
    }

    #[test]
    fn merge_config_coerces_and_defaults() {
        let schema = BTreeMap::from([
            (
                "retryLimit".to_string(),
                ConfigFieldSpec {
                    field_type: FieldType::Number,
                    label: "Retry limit".to_string(),
                    required: None,
                    sensitive: None,
                    env: None,
                    default: Some(json!(3)),
                },
            ),
            (
                "region".to_string(),
                ConfigFieldSpec {
                    field_type: FieldType::String,
                    label: "Region".to_string(),
                    required: None,
                    sensitive: None,
                    env: None,
                    default: None,
                },
            ),
        ]);
        let raw = HashMap::from([("REGION".to_string(), "eu".to_string())]);
        let merged = merge_config(&schema, &raw).unwrap();
        assert_eq!(merged["retryLimit"], json!(3));
        assert_eq!(merged["region"], json!("eu"));
    }

    #[test]
    fn merge_config_rejects_uncoercible_values() {
        let schema = BTreeMap::from([(
            "retryLimit".to_string(),
            ConfigFieldSpec {
                field_type: FieldType::Number,
                label: "Retry limit".to_string(),
                required: None,
                sensitive: None,
                env: None,
                default: None,
            },
        )]);
        let raw = HashMap::from([("RETRYLIMIT".to_string(), "lots".to_string())]);
        let err = merge_config(&schema, &raw).unwrap_err();
        assert!(format!("{err:#}").contains("retryLimit"));
    }

    #[tokio::test]
    async fn build_worker_runs_startup_hooks_and_reports_manifest() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let starts = Arc::new(AtomicUsize::new(0));
        let starts_in_factory = Arc::clone(&starts);
        let factory = PluginFactory::new(move |ctx| {
            ctx.register.api_key_auth("key", "Secret key");
            ctx.register.ui_extension("billing.sidebar", "Panel");
            let starts = Arc::clone(&starts_in_factory);
            PluginDefinition::builder("stripe")
                .on_start(move |_ctx| {
                    let starts = Arc::clone(&starts);
                    async move {
                        starts.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .build()
        });

        let env = WorkerEnv::from_map(&base_vars()).unwrap();
        let state = build_worker(&factory, &env).await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        let manifest = state.current_metadata().await;
        assert_eq!(manifest.name, "stripe");
        assert_eq!(manifest.auth_methods.unwrap()[0].id, "key");
        assert!(manifest.mcp.is_none());
    }

    #[tokio::test]
    async fn failing_start_hook_aborts_the_worker() {
        let factory = PluginFactory::new(|_ctx| {
            PluginDefinition::builder("broken")
                .on_start(|_ctx| async {
                    Err(crate::definition::HookError::Failed("no database".to_string()))
                })
                .build()
        });
        let env = WorkerEnv::from_map(&base_vars()).unwrap();
        let err = build_worker(&factory, &env).await.err().expect("startup must fail");
        assert!(format!("{err:#}").contains("onStart"));
    }

    #[test]
    fn query_strings_are_percent_decoded() {
        let query = parse_query(Some("mode=fast%20lane&flag"));
        assert_eq!(query["mode"], "fast lane");
        assert_eq!(query["flag"], "");
        assert!(parse_query(None).is_empty());
    }
}
