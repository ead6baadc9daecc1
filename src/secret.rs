//! Credential storage for (plugin, organization) pairs. Credentials are
//! revealed exactly once per spawn, when the registry builds a worker's
//! environment; nothing else reads them and `Debug` output redacts them.

use async_trait::async_trait;
use dashmap::DashMap;
use plugin_api::context::AuthState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;

fn scope(plugin_id: &str, organization_id: &str) -> String {
    format!("{plugin_id}/{organization_id}")
}

#[async_trait]
#[typetag::serde]
pub trait CredentialsManagerType: Send + Sync {
    /// `None` when the organization has not connected the plugin.
    async fn reveal(&self, plugin_id: &str, organization_id: &str) -> Option<AuthState>;
    async fn store(
        &self,
        plugin_id: &str,
        organization_id: &str,
        state: AuthState,
    ) -> Result<(), String>;
    async fn revoke(&self, plugin_id: &str, organization_id: &str);
    fn clone_box(&self) -> Box<dyn CredentialsManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct CredentialsManager(pub Box<dyn CredentialsManagerType>);

impl Clone for CredentialsManager {
    fn clone(&self) -> Self {
        CredentialsManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for CredentialsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Reads credentials the deployment injects through the supervisor's own
/// environment: `OPSDECK_AUTH_<PLUGIN>_<ORG>` holds the method id and
/// `OPSDECK_CRED_<PLUGIN>_<ORG>_<KEY>` each credential. Read-only.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EnvCredentialsManager;

impl EnvCredentialsManager {
    pub fn new() -> Box<Self> {
        Box::new(Self)
    }

    fn sanitize(s: &str) -> String {
        s.replace(['-', '.'], "_").to_uppercase()
    }
}

#[typetag::serde]
#[async_trait]
impl CredentialsManagerType for EnvCredentialsManager {
    async fn reveal(&self, plugin_id: &str, organization_id: &str) -> Option<AuthState> {
        let suffix = format!("{}_{}", Self::sanitize(plugin_id), Self::sanitize(organization_id));
        let method_id = env::var(format!("OPSDECK_AUTH_{suffix}")).ok()?;
        let prefix = format!("OPSDECK_CRED_{suffix}_");
        let credentials: HashMap<String, String> = env::vars()
            .filter_map(|(k, v)| {
                k.strip_prefix(&prefix).map(|key| (key.to_lowercase(), v))
            })
            .collect();
        Some(AuthState { method_id, credentials })
    }

    async fn store(
        &self,
        _plugin_id: &str,
        _organization_id: &str,
        _state: AuthState,
    ) -> Result<(), String> {
        Err("environment-backed credentials are read-only".to_string())
    }

    async fn revoke(&self, _plugin_id: &str, _organization_id: &str) {}

    fn clone_box(&self) -> Box<dyn CredentialsManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        "EnvCredentialsManager".to_string()
    }
}

/// In-memory store for tests and single-node deployments. Clones share
/// the same underlying map.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MapCredentialsManager {
    #[serde(skip)]
    states: std::sync::Arc<DashMap<String, AuthState>>,
}

impl MapCredentialsManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }
}

#[typetag::serde]
#[async_trait]
impl CredentialsManagerType for MapCredentialsManager {
    async fn reveal(&self, plugin_id: &str, organization_id: &str) -> Option<AuthState> {
        self.states.get(&scope(plugin_id, organization_id)).map(|s| s.clone())
    }

    async fn store(
        &self,
        plugin_id: &str,
        organization_id: &str,
        state: AuthState,
    ) -> Result<(), String> {
        self.states.insert(scope(plugin_id, organization_id), state);
        Ok(())
    }

    async fn revoke(&self, plugin_id: &str, organization_id: &str) {
        self.states.remove(&scope(plugin_id, organization_id));
    }

    fn clone_box(&self) -> Box<dyn CredentialsManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapCredentialsManager({} entries)", self.states.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(method: &str, key: &str, value: &str) -> AuthState {
        AuthState {
            method_id: method.to_string(),
            credentials: HashMap::from([(key.to_string(), value.to_string())]),
        }
    }

    #[tokio::test]
    async fn stored_credentials_come_back_per_scope() {
        let mgr = MapCredentialsManager::new();
        mgr.store("stripe", "org-1", state("key", "secret", "sk_1")).await.unwrap();
        mgr.store("stripe", "org-2", state("oauth", "token", "tok_2")).await.unwrap();

        let one = mgr.reveal("stripe", "org-1").await.unwrap();
        assert_eq!(one.method_id, "key");
        assert_eq!(one.credential("secret"), Some("sk_1"));
        assert!(mgr.reveal("hubspot", "org-1").await.is_none());

        mgr.revoke("stripe", "org-1").await;
        assert!(mgr.reveal("stripe", "org-1").await.is_none());
    }

    #[tokio::test]
    async fn debug_output_never_contains_credentials() {
        let mgr = MapCredentialsManager::new();
        mgr.store("stripe", "org-1", state("key", "secret", "sk_super_secret")).await.unwrap();
        let wrapper = CredentialsManager(mgr.clone_box());
        assert!(!format!("{wrapper:?}").contains("sk_super_secret"));
    }
}
