//! Organization-scoped plugin configuration. The registry reads values
//! from here when it builds a worker's environment; it never hands the
//! manager itself to plugin code.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::PathBuf};
use tracing::{info, warn};

/// `stripe`/`org-1`/`apiRegion` -> `STRIPE_ORG_1_APIREGION`
fn scoped_key(plugin_id: &str, organization_id: &str, key: &str) -> String {
    let sanitize = |s: &str| s.replace(['-', '.'], "_").to_uppercase();
    format!("{}_{}_{}", sanitize(plugin_id), sanitize(organization_id), sanitize(key))
}

#[async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn keys(&self, plugin_id: &str, organization_id: &str) -> Vec<String>;
    async fn get(&self, plugin_id: &str, organization_id: &str, key: &str) -> Option<String>;
    async fn set(
        &self,
        plugin_id: &str,
        organization_id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), String>;
    async fn del(&self, plugin_id: &str, organization_id: &str, key: &str);
    async fn all(&self, plugin_id: &str, organization_id: &str) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys(plugin_id, organization_id).await {
            if let Some(value) = self.get(plugin_id, organization_id, &key).await {
                config.push((key, value));
            }
        }
        config
    }
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn into_inner(self) -> Box<dyn ConfigManagerType> {
        self.0
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Backed by process environment plus an `.env` file for persistence.
/// Config keys are tracked in a sidecar index variable per scope so
/// `keys()` does not have to guess which env vars belong to a plugin.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            dotenvy::from_path(env_file.clone()).ok();
            info!("Loaded .env from {}", env_file.display());
        } else {
            warn!("could not load .env from {}", env_file.display())
        }
        Box::new(Self { env_file })
    }

    fn index_key(plugin_id: &str, organization_id: &str) -> String {
        format!("{}__KEYS", scoped_key(plugin_id, organization_id, "CONFIG"))
    }

    fn write_env_line(&self, key: &str, value: Option<&str>) {
        let content = fs::read_to_string(&self.env_file).unwrap_or_default();
        let mut lines: Vec<String> = Vec::new();
        let mut found = false;
        for line in content.lines() {
            match line.split_once('=') {
                Some((k, _)) if k.trim() == key => {
                    if let Some(value) = value {
                        lines.push(format!("{key}={value}"));
                    }
                    found = true;
                }
                _ => lines.push(line.to_string()),
            }
        }
        if !found && let Some(value) = value {
            lines.push(format!("{key}={value}"));
        }
        if let Err(e) = fs::write(&self.env_file, lines.join("\n")) {
            warn!(file = %self.env_file.display(), error = %e, "could not persist env file");
        }
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self, plugin_id: &str, organization_id: &str) -> Vec<String> {
        env::var(Self::index_key(plugin_id, organization_id))
            .map(|raw| raw.split(',').filter(|k| !k.is_empty()).map(String::from).collect())
            .unwrap_or_default()
    }

    async fn get(&self, plugin_id: &str, organization_id: &str, key: &str) -> Option<String> {
        env::var(scoped_key(plugin_id, organization_id, key)).ok()
    }

    async fn set(
        &self,
        plugin_id: &str,
        organization_id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), String> {
        let scoped = scoped_key(plugin_id, organization_id, key);
        unsafe {
            env::set_var(&scoped, value);
        }
        self.write_env_line(&scoped, Some(value));

        let mut keys = self.keys(plugin_id, organization_id).await;
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
            let index = Self::index_key(plugin_id, organization_id);
            let joined = keys.join(",");
            unsafe {
                env::set_var(&index, &joined);
            }
            self.write_env_line(&index, Some(&joined));
        }
        Ok(())
    }

    async fn del(&self, plugin_id: &str, organization_id: &str, key: &str) {
        let scoped = scoped_key(plugin_id, organization_id, key);
        unsafe {
            env::remove_var(&scoped);
        }
        self.write_env_line(&scoped, None);

        let keys: Vec<String> = self
            .keys(plugin_id, organization_id)
            .await
            .into_iter()
            .filter(|k| k != key)
            .collect();
        let index = Self::index_key(plugin_id, organization_id);
        let joined = keys.join(",");
        unsafe {
            env::set_var(&index, &joined);
        }
        self.write_env_line(&index, Some(&joined));
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

/// In-memory manager for tests and ephemeral deployments. Clones share
/// the same underlying map; the contents are not persisted.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MapConfigManager {
    #[serde(skip)]
    values: std::sync::Arc<DashMap<String, String>>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self, plugin_id: &str, organization_id: &str) -> Vec<String> {
        let prefix = scoped_key(plugin_id, organization_id, "");
        self.values
            .iter()
            .filter_map(|entry| entry.key().strip_prefix(&prefix).map(String::from))
            .collect()
    }

    async fn get(&self, plugin_id: &str, organization_id: &str, key: &str) -> Option<String> {
        self.values.get(&scoped_key(plugin_id, organization_id, key)).map(|v| v.clone())
    }

    async fn set(
        &self,
        plugin_id: &str,
        organization_id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), String> {
        self.values.insert(scoped_key(plugin_id, organization_id, key), value.to_string());
        Ok(())
    }

    async fn del(&self, plugin_id: &str, organization_id: &str, key: &str) {
        self.values.remove(&scoped_key(plugin_id, organization_id, key));
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.values.len())
    }
}
