//! Contexts handed to plugin code: the global registration context the
//! factory receives, and the per-invocation contexts each lifecycle hook
//! receives. Everything here is cheap to clone; shared parts sit behind
//! `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::definition::HookError;
use crate::mcp::McpAccessor;
use crate::metadata::{
    AuthKind, AuthMethodSpec, ConfigFieldSpec, HttpMethod, RouteSpec, UiExtension,
};

/// Resolved credentials for one (plugin, organization) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthState {
    pub method_id: String,
    pub credentials: HashMap<String, String>,
}

impl AuthState {
    pub fn credential(&self, key: &str) -> Option<&str> {
        self.credentials.get(key).map(String::as_str)
    }
}

/// Read access to the merged plugin configuration (declared defaults
/// overlaid with the organization's values).
#[derive(Debug, Clone, Default)]
pub struct ConfigAccessor {
    values: Arc<HashMap<String, Value>>,
}

impl ConfigAccessor {
    pub fn new(values: HashMap<String, Value>) -> Self {
        ConfigAccessor { values: Arc::new(values) }
    }

    pub fn get(&self, key: &str) -> Result<Value, HookError> {
        self.values
            .get(key)
            .cloned()
            .ok_or_else(|| HookError::Failed(format!("config key `{key}` is not set")))
    }

    pub fn get_optional(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuthAccessor {
    state: Arc<Option<AuthState>>,
}

impl AuthAccessor {
    pub fn new(state: Option<AuthState>) -> Self {
        AuthAccessor { state: Arc::new(state) }
    }

    /// `None` when the organization has not connected this plugin yet.
    pub fn get(&self) -> Option<&AuthState> {
        self.state.as_ref().as_ref()
    }
}

/// Logger handed to plugin code; forwards into the worker's tracing
/// subscriber with the plugin and organization attached to every event.
#[derive(Debug, Clone)]
pub struct PluginLogger {
    plugin: Arc<str>,
    organization: Arc<str>,
}

impl PluginLogger {
    pub fn new(plugin: &str, organization: &str) -> Self {
        PluginLogger { plugin: Arc::from(plugin), organization: Arc::from(organization) }
    }

    pub fn debug(&self, msg: &str) {
        tracing::debug!(plugin = %self.plugin, organization = %self.organization, "{msg}");
    }

    pub fn info(&self, msg: &str) {
        tracing::info!(plugin = %self.plugin, organization = %self.organization, "{msg}");
    }

    pub fn warn(&self, msg: &str) {
        tracing::warn!(plugin = %self.plugin, organization = %self.organization, "{msg}");
    }

    pub fn error(&self, msg: &str) {
        tracing::error!(plugin = %self.plugin, organization = %self.organization, "{msg}");
    }
}

#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: HashMap<String, String>,
    pub body: Value,
}

#[derive(Debug, Clone)]
pub struct RouteResponse {
    pub status: u16,
    pub body: Value,
}

impl RouteResponse {
    pub fn ok(body: Value) -> Self {
        RouteResponse { status: 200, body }
    }
}

pub type RouteHandler = Arc<dyn Fn(RouteRequest) -> BoxFuture<'static, RouteResponse> + Send + Sync>;

/// Paths the worker runtime serves itself. A plugin route on any of these
/// would collide with the control surface when the router is assembled.
const RESERVED_PATHS: &[&str] = &["/health", "/metadata", "/shutdown"];
const RESERVED_PREFIXES: &[&str] = &["/mcp/", "/hooks/"];

fn path_is_reserved(path: &str) -> bool {
    RESERVED_PATHS.contains(&path)
        || RESERVED_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}

/// Capability registration surface the factory writes into. Misuse is
/// recorded, not panicked on; the factory wrapper turns the first recorded
/// problem into a definition error.
#[derive(Default)]
pub struct Registrar {
    config_fields: Vec<(String, ConfigFieldSpec)>,
    auth_methods: Vec<AuthMethodSpec>,
    ui_extensions: Vec<UiExtension>,
    routes: Vec<(RouteSpec, RouteHandler)>,
    violations: Vec<String>,
}

impl Registrar {
    pub fn config_field(&mut self, name: impl Into<String>, spec: ConfigFieldSpec) {
        let name = name.into();
        if name.trim().is_empty() {
            self.violations.push("config field registered with an empty name".to_string());
            return;
        }
        if self.config_fields.iter().any(|(n, _)| n == &name) {
            self.violations.push(format!("config field `{name}` registered more than once"));
            return;
        }
        self.config_fields.push((name, spec));
    }

    pub fn api_key_auth(&mut self, id: impl Into<String>, label: impl Into<String>) {
        self.push_auth(AuthMethodSpec {
            id: id.into(),
            kind: AuthKind::ApiKey,
            label: label.into(),
            authorization_url: None,
            scopes: None,
        });
    }

    pub fn oauth2_auth(
        &mut self,
        id: impl Into<String>,
        label: impl Into<String>,
        authorization_url: impl Into<String>,
        scopes: Vec<String>,
    ) {
        self.push_auth(AuthMethodSpec {
            id: id.into(),
            kind: AuthKind::Oauth2,
            label: label.into(),
            authorization_url: Some(authorization_url.into()),
            scopes: Some(scopes),
        });
    }

    fn push_auth(&mut self, spec: AuthMethodSpec) {
        if spec.id.trim().is_empty() {
            self.violations.push("auth method registered with an empty id".to_string());
            return;
        }
        if self.auth_methods.iter().any(|m| m.id == spec.id) {
            self.violations
                .push(format!("auth method `{}` registered more than once", spec.id));
            return;
        }
        self.auth_methods.push(spec);
    }

    pub fn ui_extension(&mut self, slot: impl Into<String>, component: impl Into<String>) {
        let slot = slot.into();
        let component = component.into();
        if slot.trim().is_empty() || component.trim().is_empty() {
            self.violations
                .push("ui extension registered with an empty slot or component".to_string());
            return;
        }
        self.ui_extensions.push(UiExtension { slot, component });
    }

    pub fn route<F, Fut>(&mut self, method: HttpMethod, path: impl Into<String>, handler: F)
    where
        F: Fn(RouteRequest) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = RouteResponse> + Send + 'static,
    {
        let path = path.into();
        if !path.starts_with('/') {
            self.violations
                .push(format!("route path `{path}` must start with `/` and be non-empty"));
            return;
        }
        if path_is_reserved(&path) {
            self.violations
                .push(format!("route path `{path}` is reserved by the worker control surface"));
            return;
        }
        if self.routes.iter().any(|(r, _)| r.path == path && r.method == method) {
            self.violations.push(format!("route {method} {path} registered more than once"));
            return;
        }
        self.routes.push((
            RouteSpec { path, method },
            Arc::new(move |req| Box::pin(handler(req))),
        ));
    }

    pub(crate) fn first_violation(&self) -> Option<String> {
        self.violations.first().cloned()
    }

    pub fn config_fields(&self) -> &[(String, ConfigFieldSpec)] {
        &self.config_fields
    }

    pub fn auth_methods(&self) -> &[AuthMethodSpec] {
        &self.auth_methods
    }

    pub fn ui_extensions(&self) -> &[UiExtension] {
        &self.ui_extensions
    }

    pub fn routes(&self) -> &[(RouteSpec, RouteHandler)] {
        &self.routes
    }
}

/// The context the factory itself runs against: registration surface plus
/// a logger scoped to the (plugin, organization) pair.
pub struct GlobalContext {
    pub plugin_id: String,
    pub organization_id: String,
    pub register: Registrar,
    pub logger: PluginLogger,
}

impl GlobalContext {
    pub fn new(plugin_id: impl Into<String>, organization_id: impl Into<String>) -> Self {
        let plugin_id = plugin_id.into();
        let organization_id = organization_id.into();
        let logger = PluginLogger::new(&plugin_id, &organization_id);
        GlobalContext { plugin_id, organization_id, register: Registrar::default(), logger }
    }
}

#[derive(Clone)]
pub struct InitializeContext {
    pub organization_id: String,
    pub config: ConfigAccessor,
    pub logger: PluginLogger,
}

#[derive(Clone)]
pub struct StartContext {
    pub organization_id: String,
    pub config: ConfigAccessor,
    pub auth: AuthAccessor,
    pub mcp: McpAccessor,
    pub logger: PluginLogger,
}

/// Carries the candidate credentials being checked, which may differ from
/// whatever is currently stored.
#[derive(Clone)]
pub struct AuthValidationContext {
    pub organization_id: String,
    pub candidate: AuthState,
    pub config: ConfigAccessor,
    pub logger: PluginLogger,
}

impl AuthValidationContext {
    #[cfg(test)]
    pub(crate) fn for_tests(organization_id: &str) -> Self {
        AuthValidationContext {
            organization_id: organization_id.to_string(),
            candidate: AuthState { method_id: "test".to_string(), credentials: HashMap::new() },
            config: ConfigAccessor::default(),
            logger: PluginLogger::new("test", organization_id),
        }
    }
}

#[derive(Clone)]
pub struct ConfigUpdateContext {
    pub organization_id: String,
    /// The configuration after the update was applied.
    pub config: ConfigAccessor,
    pub logger: PluginLogger,
}

#[derive(Clone)]
pub struct DisableContext {
    pub organization_id: String,
    pub logger: PluginLogger,
}

#[derive(Clone)]
pub struct EnableContext {
    pub organization_id: String,
    pub config: ConfigAccessor,
    pub auth: AuthAccessor,
    pub logger: PluginLogger,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::FieldType;
    use serde_json::json;

    fn string_field(label: &str) -> ConfigFieldSpec {
        ConfigFieldSpec {
            field_type: FieldType::String,
            label: label.to_string(),
            required: None,
            sensitive: None,
            env: None,
            default: None,
        }
    }

    #[test]
    fn config_accessor_distinguishes_missing_from_present() {
        let cfg = ConfigAccessor::new(HashMap::from([
            ("region".to_string(), json!("eu")),
            ("limit".to_string(), json!(5)),
        ]));
        assert_eq!(cfg.get("region").unwrap(), json!("eu"));
        assert!(cfg.get("missing").is_err());
        assert_eq!(cfg.get_optional("missing"), None);
        assert_eq!(cfg.keys(), vec!["limit".to_string(), "region".to_string()]);
    }

    #[test]
    fn duplicate_config_field_is_a_violation() {
        let mut reg = Registrar::default();
        reg.config_field("apiKey", string_field("API key"));
        reg.config_field("apiKey", string_field("API key"));
        assert!(reg.first_violation().unwrap().contains("apiKey"));
        assert_eq!(reg.config_fields().len(), 1);
    }

    #[test]
    fn duplicate_auth_id_is_a_violation() {
        let mut reg = Registrar::default();
        reg.api_key_auth("key", "Secret key");
        reg.oauth2_auth("key", "OAuth", "https://example.test/authorize", vec![]);
        assert!(reg.first_violation().unwrap().contains("`key`"));
    }

    #[test]
    fn route_path_must_be_absolute() {
        let mut reg = Registrar::default();
        reg.route(HttpMethod::GET, "webhooks", |_req| async {
            RouteResponse::ok(json!({}))
        });
        assert!(reg.first_violation().unwrap().contains("webhooks"));
        assert!(reg.routes().is_empty());
    }

    #[test]
    fn control_surface_paths_are_reserved() {
        for path in ["/health", "/metadata", "/shutdown", "/mcp/call-tool", "/hooks/enable"] {
            let mut reg = Registrar::default();
            reg.route(HttpMethod::GET, path, |_req| async { RouteResponse::ok(json!({})) });
            let violation = reg.first_violation().unwrap();
            assert!(violation.contains("reserved"), "{violation}");
            assert!(reg.routes().is_empty());
        }
        // A path that merely shares a prefix without the slash is fine.
        let mut reg = Registrar::default();
        reg.route(HttpMethod::GET, "/healthz", |_req| async { RouteResponse::ok(json!({})) });
        assert!(reg.first_violation().is_none());
    }

    #[test]
    fn same_path_different_method_is_allowed() {
        let mut reg = Registrar::default();
        reg.route(HttpMethod::GET, "/sync", |_req| async { RouteResponse::ok(json!({})) });
        reg.route(HttpMethod::POST, "/sync", |_req| async { RouteResponse::ok(json!({})) });
        assert!(reg.first_violation().is_none());
        assert_eq!(reg.routes().len(), 2);
    }
}
