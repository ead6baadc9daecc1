//! Wire types for the capability manifest a worker reports on `/metadata`,
//! plus the structural validator the supervisor runs before accepting one.
//!
//! Validation is deliberately manual rather than schema-driven so every
//! failure names the offending field; a manifest that fails validation is
//! never cached or surfaced.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

/// Config field value types a plugin may declare.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Json,
}

/// One entry in `configSchema`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFieldSpec {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub required: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sensitive: Option<bool>,
    /// Environment variable suffix the worker runtime reads the value from.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub default: Option<Value>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum AuthKind {
    ApiKey,
    Oauth2,
}

/// One entry in `authMethods`. Order matters: the first method is the
/// default offered to organizations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthMethodSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: AuthKind,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub authorization_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub scopes: Option<Vec<String>>,
}

/// A dashboard mount point: the plugin's `component` renders in `slot`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UiExtension {
    pub slot: String,
    pub component: String,
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, EnumString,
    AsRefStr, Display,
)]
pub enum HttpMethod {
    GET,
    POST,
    PUT,
    DELETE,
    PATCH,
}

/// A worker-served HTTP route the platform proxies to by path and method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    pub path: String,
    pub method: HttpMethod,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum McpServerStatus {
    Available,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct McpServerInfo {
    pub server_id: String,
    pub status: McpServerStatus,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct McpMetadata {
    #[serde(default)]
    pub local: Vec<McpServerInfo>,
    #[serde(default)]
    pub external: Vec<McpServerInfo>,
}

/// The full manifest. Every section is optional; a plugin with no
/// capabilities reports `{"name": ...}` and nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PluginMetadata {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub config_schema: Option<BTreeMap<String, ConfigFieldSpec>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub auth_methods: Option<Vec<AuthMethodSpec>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ui_extensions: Option<Vec<UiExtension>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub routes: Option<Vec<RouteSpec>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mcp: Option<McpMetadata>,
}

impl PluginMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        PluginMetadata {
            name: name.into(),
            version: None,
            config_schema: None,
            auth_methods: None,
            ui_extensions: None,
            routes: None,
            mcp: None,
        }
    }
}

/// A manifest failed the structural rules. The message names the path of
/// the offending field so plugin authors can find it.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid plugin metadata: {0}")]
pub struct MetadataViolation(pub String);

fn non_empty_str<'a>(value: &'a Value, path: &str) -> Result<&'a str, MetadataViolation> {
    match value.as_str() {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(MetadataViolation(format!("{path} must be a non-empty string"))),
    }
}

fn field(obj: &serde_json::Map<String, Value>, key: &str, path: &str) -> Result<Value, MetadataViolation> {
    obj.get(key)
        .cloned()
        .ok_or_else(|| MetadataViolation(format!("{path}.{key} is required")))
}

fn as_object<'a>(
    value: &'a Value,
    path: &str,
) -> Result<&'a serde_json::Map<String, Value>, MetadataViolation> {
    value
        .as_object()
        .ok_or_else(|| MetadataViolation(format!("{path} must be an object")))
}

fn as_array<'a>(value: &'a Value, path: &str) -> Result<&'a Vec<Value>, MetadataViolation> {
    value
        .as_array()
        .ok_or_else(|| MetadataViolation(format!("{path} must be an array")))
}

fn check_config_schema(value: &Value) -> Result<(), MetadataViolation> {
    if value.is_array() {
        return Err(MetadataViolation("configSchema must be an object".to_string()));
    }
    let schema = as_object(value, "configSchema")?;
    for (name, spec) in schema {
        let path = format!("configSchema.{name}");
        let spec = as_object(spec, &path)?;
        let ty = field(spec, "type", &path)?;
        match ty.as_str() {
            Some("string" | "number" | "boolean" | "json") => {}
            _ => {
                return Err(MetadataViolation(format!(
                    "{path}.type must be one of string|number|boolean|json"
                )));
            }
        }
        non_empty_str(&field(spec, "label", &path)?, &format!("{path}.label"))?;
    }
    Ok(())
}

fn check_auth_methods(value: &Value) -> Result<(), MetadataViolation> {
    for (i, entry) in as_array(value, "authMethods")?.iter().enumerate() {
        let path = format!("authMethods[{i}]");
        let entry = as_object(entry, &path)?;
        non_empty_str(&field(entry, "id", &path)?, &format!("{path}.id"))?;
        let ty = field(entry, "type", &path)?;
        match ty.as_str() {
            Some("apiKey" | "oauth2") => {}
            _ => {
                return Err(MetadataViolation(format!(
                    "{path}.type must be one of apiKey|oauth2"
                )));
            }
        }
        non_empty_str(&field(entry, "label", &path)?, &format!("{path}.label"))?;
    }
    Ok(())
}

fn check_ui_extensions(value: &Value) -> Result<(), MetadataViolation> {
    for (i, entry) in as_array(value, "uiExtensions")?.iter().enumerate() {
        let path = format!("uiExtensions[{i}]");
        let entry = as_object(entry, &path)?;
        non_empty_str(&field(entry, "slot", &path)?, &format!("{path}.slot"))?;
        non_empty_str(&field(entry, "component", &path)?, &format!("{path}.component"))?;
    }
    Ok(())
}

fn check_routes(value: &Value) -> Result<(), MetadataViolation> {
    for (i, entry) in as_array(value, "routes")?.iter().enumerate() {
        let path = format!("routes[{i}]");
        let entry = as_object(entry, &path)?;
        non_empty_str(&field(entry, "path", &path)?, &format!("{path}.path"))?;
        let method = field(entry, "method", &path)?;
        match method.as_str() {
            Some("GET" | "POST" | "PUT" | "DELETE" | "PATCH") => {}
            _ => {
                return Err(MetadataViolation(format!(
                    "{path}.method must be one of GET|POST|PUT|DELETE|PATCH"
                )));
            }
        }
    }
    Ok(())
}

fn check_mcp(value: &Value) -> Result<(), MetadataViolation> {
    let mcp = as_object(value, "mcp")?;
    for key in ["local", "external"] {
        let Some(list) = mcp.get(key) else { continue };
        for (i, entry) in as_array(list, &format!("mcp.{key}"))?.iter().enumerate() {
            let path = format!("mcp.{key}[{i}]");
            let entry = as_object(entry, &path)?;
            non_empty_str(&field(entry, "serverId", &path)?, &format!("{path}.serverId"))?;
            let status = field(entry, "status", &path)?;
            match status.as_str() {
                Some("available" | "unavailable") => {}
                _ => {
                    return Err(MetadataViolation(format!(
                        "{path}.status must be one of available|unavailable"
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Check the raw `/metadata` body against the structural rules, then
/// deserialize it. Errors name the first offending field.
pub fn validate_metadata(raw: &Value) -> Result<PluginMetadata, MetadataViolation> {
    let root = as_object(raw, "metadata")?;
    non_empty_str(&field(root, "name", "metadata")?, "name")?;
    if let Some(v) = root.get("configSchema") {
        check_config_schema(v)?;
    }
    if let Some(v) = root.get("authMethods") {
        check_auth_methods(v)?;
    }
    if let Some(v) = root.get("uiExtensions") {
        check_ui_extensions(v)?;
    }
    if let Some(v) = root.get("routes") {
        check_routes(v)?;
    }
    if let Some(v) = root.get("mcp") {
        check_mcp(v)?;
    }
    serde_json::from_value(raw.clone())
        .map_err(|e| MetadataViolation(format!("metadata did not deserialize: {e}")))
}
