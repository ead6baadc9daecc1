//! The supervising registry: one worker process per enabled
//! (plugin, organization) pair. Tracks enablement, readiness, health and
//! restart counts; every worker-facing call is wrapped so one misbehaving
//! worker only ever affects its own instance.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use plugin_api::context::AuthState;
use plugin_api::definition::AuthCheck;
use plugin_api::mcp::ToolDescriptor;
use plugin_api::metadata::PluginMetadata;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strum_macros::Display;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ConfigManager;
use crate::fetch::{FetchError, RetryPolicy, probe};
use crate::mcp::{McpBridge, McpBridgeError};
use crate::metadata::{METADATA_POLICY, MetadataFetchError, fetch_metadata};
use crate::process::{PortAllocator, PortError, kill_gracefully};
use crate::secret::CredentialsManager;

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InstanceState {
    Stopped,
    Starting,
    Running,
    Unhealthy,
    Crashed,
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("no executable registered for plugin `{0}`")]
    UnknownPlugin(String),
    #[error("plugin `{plugin_id}` is already running for organization `{organization_id}`")]
    AlreadyRunning { plugin_id: String, organization_id: String },
    #[error("plugin `{plugin_id}` is not running for organization `{organization_id}`")]
    NotRunning { plugin_id: String, organization_id: String },
    #[error("could not spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error(transparent)]
    Ports(#[from] PortError),
    #[error("worker never became ready: {0}")]
    Readiness(FetchError),
    #[error(transparent)]
    Discovery(#[from] MetadataFetchError),
    #[error(transparent)]
    Bridge(#[from] McpBridgeError),
    #[error("worker hook call failed: {0}")]
    Hook(String),
}

/// Tunables for spawning and supervising workers. Defaults match
/// production; tests shrink the timings.
#[derive(Clone, Debug)]
pub struct SupervisorSettings {
    pub port_range: RangeInclusive<u16>,
    /// How long a child gets between SIGTERM and SIGKILL.
    pub grace: Duration,
    /// Polling schedule for a freshly spawned worker's `/health`.
    pub readiness: RetryPolicy,
    /// Schedule for the `/metadata` discovery fetch.
    pub metadata: RetryPolicy,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    pub hook_timeout: Duration,
    pub max_restarts: u32,
    pub run_mode: String,
    pub log_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    /// Base URL workers with an mcp/route capability call back into. Each
    /// spawn gets a freshly minted scoped token alongside it.
    pub platform_api_url: Option<String>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        SupervisorSettings {
            port_range: 42000..=42999,
            grace: Duration::from_secs(5),
            readiness: RetryPolicy {
                attempts: 10,
                attempt_timeout: Duration::from_secs(1),
                backoff_base: Duration::from_millis(100),
            },
            metadata: METADATA_POLICY,
            health_interval: Duration::from_secs(10),
            health_timeout: Duration::from_secs(2),
            hook_timeout: Duration::from_secs(10),
            max_restarts: 3,
            run_mode: "production".to_string(),
            log_dir: None,
            log_level: None,
            platform_api_url: None,
        }
    }
}

struct Instance {
    plugin_id: String,
    organization_id: String,
    capabilities: Vec<String>,
    state: RwLock<InstanceState>,
    port: RwLock<Option<u16>>,
    pid: RwLock<Option<u32>>,
    /// Fresh per spawn; correlates a worker's log lines across restarts.
    spawn_id: RwLock<Option<Uuid>>,
    /// Why the instance last failed. Survives the transition to `crashed`
    /// so the dashboard can show it; cleared on the next successful start.
    last_error: RwLock<Option<String>>,
    metadata: RwLock<Option<PluginMetadata>>,
    child: Mutex<Option<Child>>,
    /// Serializes health probes for this instance; probes across
    /// instances are independent.
    probe_lock: Mutex<()>,
    restarts: AtomicU32,
    started_at: RwLock<Option<DateTime<Utc>>>,
    last_probe: RwLock<Option<DateTime<Utc>>>,
    /// Bumped on every spawn so a superseded monitor task notices and
    /// exits instead of probing a worker it no longer owns.
    monitor_gen: AtomicU32,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Instance {
    fn new(plugin_id: &str, organization_id: &str, capabilities: Vec<String>) -> Arc<Self> {
        Arc::new(Instance {
            plugin_id: plugin_id.to_string(),
            organization_id: organization_id.to_string(),
            capabilities,
            state: RwLock::new(InstanceState::Stopped),
            port: RwLock::new(None),
            pid: RwLock::new(None),
            spawn_id: RwLock::new(None),
            last_error: RwLock::new(None),
            metadata: RwLock::new(None),
            child: Mutex::new(None),
            probe_lock: Mutex::new(()),
            restarts: AtomicU32::new(0),
            started_at: RwLock::new(None),
            last_probe: RwLock::new(None),
            monitor_gen: AtomicU32::new(0),
            monitor: Mutex::new(None),
        })
    }

    async fn set_state(&self, next: InstanceState) {
        let mut state = self.state.write().await;
        if *state != next {
            info!(
                target: "event",
                plugin = %self.plugin_id,
                organization = %self.organization_id,
                from = %*state,
                to = %next,
                "worker state transition"
            );
            *state = next;
        }
    }

    /// Atomically move a settled instance into `starting`. The check and
    /// the transition happen under one write lock, so of two racing
    /// enables exactly one claims the spawn.
    async fn try_claim_start(&self) -> bool {
        let mut state = self.state.write().await;
        if matches!(
            *state,
            InstanceState::Starting | InstanceState::Running | InstanceState::Unhealthy
        ) {
            return false;
        }
        info!(
            target: "event",
            plugin = %self.plugin_id,
            organization = %self.organization_id,
            from = %*state,
            to = %InstanceState::Starting,
            "worker state transition"
        );
        *state = InstanceState::Starting;
        true
    }

    async fn address(&self) -> Option<String> {
        (*self.port.read().await).map(|port| format!("http://127.0.0.1:{port}"))
    }

    async fn record_error(&self, error: String) {
        *self.last_error.write().await = Some(error);
    }
}

/// One line of `diagnostics()` output.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDiagnostics {
    pub plugin_id: String,
    pub organization_id: String,
    pub state: InstanceState,
    pub port: Option<u16>,
    pub process_id: Option<u32>,
    pub spawn_id: Option<String>,
    pub restarts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub struct PluginRegistry {
    executables: DashMap<String, PathBuf>,
    instances: DashMap<(String, String), Arc<Instance>>,
    ports: PortAllocator,
    client: reqwest::Client,
    bridge: McpBridge,
    config: ConfigManager,
    credentials: CredentialsManager,
    settings: SupervisorSettings,
}

impl PluginRegistry {
    pub fn new(
        settings: SupervisorSettings,
        config: ConfigManager,
        credentials: CredentialsManager,
    ) -> Arc<Self> {
        let client = reqwest::Client::new();
        Arc::new(PluginRegistry {
            executables: DashMap::new(),
            instances: DashMap::new(),
            ports: PortAllocator::new(settings.port_range.clone()),
            bridge: McpBridge::new(client.clone(), settings.hook_timeout),
            client,
            config,
            credentials,
            settings,
        })
    }

    pub fn register_executable(&self, plugin_id: &str, path: PathBuf) {
        info!(plugin = %plugin_id, path = %path.display(), "plugin executable registered");
        self.executables.insert(plugin_id.to_string(), path);
    }

    /// Forget an executable. Instances already running keep their process;
    /// they just cannot be restarted until the executable reappears.
    pub fn unregister_executable(&self, plugin_id: &str) {
        if self.executables.remove(plugin_id).is_some() {
            info!(plugin = %plugin_id, "plugin executable unregistered");
        }
    }

    pub fn known_plugins(&self) -> Vec<String> {
        self.executables.iter().map(|e| e.key().clone()).collect()
    }

    pub async fn state(&self, plugin_id: &str, organization_id: &str) -> Option<InstanceState> {
        let instance = self.instance(plugin_id, organization_id)?;
        Some(*instance.state.read().await)
    }

    /// A worker's manifest, only once the worker has actually reached
    /// `running`.
    pub async fn metadata(
        &self,
        plugin_id: &str,
        organization_id: &str,
    ) -> Option<PluginMetadata> {
        let instance = self.instance(plugin_id, organization_id)?;
        let state = *instance.state.read().await;
        if !matches!(state, InstanceState::Running | InstanceState::Unhealthy) {
            return None;
        }
        instance.metadata.read().await.clone()
    }

    fn instance(&self, plugin_id: &str, organization_id: &str) -> Option<Arc<Instance>> {
        self.instances
            .get(&(plugin_id.to_string(), organization_id.to_string()))
            .map(|e| Arc::clone(e.value()))
    }

    /// Enable a plugin for an organization: spawn its worker, wait for it
    /// to become ready, validate its manifest, start supervision.
    pub async fn enable(
        self: &Arc<Self>,
        plugin_id: &str,
        organization_id: &str,
        capabilities: &[String],
    ) -> Result<(), RegistryError> {
        if !self.executables.contains_key(plugin_id) {
            return Err(RegistryError::UnknownPlugin(plugin_id.to_string()));
        }

        let key = (plugin_id.to_string(), organization_id.to_string());
        let instance = Arc::clone(
            self.instances
                .entry(key)
                .or_insert_with(|| Instance::new(plugin_id, organization_id, capabilities.to_vec()))
                .value(),
        );
        if !instance.try_claim_start().await {
            return Err(RegistryError::AlreadyRunning {
                plugin_id: plugin_id.to_string(),
                organization_id: organization_id.to_string(),
            });
        }
        instance.restarts.store(0, Ordering::SeqCst);
        self.spawn_instance(&instance).await?;

        // The enable hook runs once per enablement, not on restarts.
        if let Some(address) = instance.address().await {
            let result = self
                .client
                .post(format!("{address}/hooks/enable"))
                .timeout(self.settings.hook_timeout)
                .json(&json!({}))
                .send()
                .await;
            match result {
                Ok(response) if !response.status().is_success() => {
                    let detail = response.text().await.unwrap_or_default();
                    return Err(RegistryError::Hook(detail));
                }
                Err(e) => return Err(RegistryError::Hook(e.to_string())),
                Ok(_) => {}
            }
        }
        Ok(())
    }

    async fn spawn_instance(self: &Arc<Self>, instance: &Arc<Instance>) -> Result<(), RegistryError> {
        instance.set_state(InstanceState::Starting).await;

        let path = self
            .executables
            .get(&instance.plugin_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| RegistryError::UnknownPlugin(instance.plugin_id.clone()))?;

        let reservation = self.ports.reserve().await?;
        let port = reservation.port();
        let mut command = self.worker_command(instance, &path, port).await;
        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                instance.record_error(format!("could not spawn worker: {e}")).await;
                instance.set_state(InstanceState::Crashed).await;
                return Err(e.into());
            }
        };
        let spawn_id = Uuid::new_v4();
        *instance.pid.write().await = child.id();
        *instance.child.lock().await = Some(child);
        *instance.port.write().await = Some(port);
        *instance.spawn_id.write().await = Some(spawn_id);
        *instance.started_at.write().await = Some(Utc::now());
        info!(
            target: "event",
            plugin = %instance.plugin_id,
            organization = %instance.organization_id,
            spawn_id = %spawn_id,
            port,
            "worker spawned"
        );

        let address = format!("http://127.0.0.1:{port}");

        // The reservation stays held until the child has bound the port,
        // which the first successful probe proves.
        let ready = probe_until_ready(&self.client, &address, self.settings.readiness).await;
        drop(reservation);
        if let Err(e) = ready {
            warn!(
                plugin = %instance.plugin_id,
                organization = %instance.organization_id,
                error = %e,
                "worker never answered its health endpoint"
            );
            instance.record_error(format!("worker never became ready: {e}")).await;
            self.stop_child(instance).await;
            instance.set_state(InstanceState::Crashed).await;
            return Err(RegistryError::Readiness(e));
        }

        match fetch_metadata(&self.client, &address, self.settings.metadata).await {
            Ok(metadata) => {
                *instance.metadata.write().await = Some(metadata);
            }
            Err(e) => {
                instance.record_error(e.to_string()).await;
                self.stop_child(instance).await;
                instance.set_state(InstanceState::Crashed).await;
                return Err(e.into());
            }
        }

        *instance.last_error.write().await = None;
        instance.set_state(InstanceState::Running).await;
        self.start_monitor(instance).await;
        Ok(())
    }

    /// Build the worker command with a cleared environment: exactly the
    /// contract variables, never the supervisor's own secrets.
    async fn worker_command(&self, instance: &Instance, path: &PathBuf, port: u16) -> Command {
        let mut command = Command::new(path);
        command
            .env_clear()
            .env("PLUGIN_ID", &instance.plugin_id)
            .env("ORGANIZATION_ID", &instance.organization_id)
            .env("WORKER_PORT", port.to_string())
            .env("RUN_MODE", &self.settings.run_mode)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        if !instance.capabilities.is_empty() {
            command.env("PLUGIN_CAPABILITIES", instance.capabilities.join(","));
        }
        for (key, value) in
            self.config.0.all(&instance.plugin_id, &instance.organization_id).await
        {
            command.env(format!("PLUGIN_CONFIG_{}", key.to_uppercase()), value);
        }
        if let Some(auth) =
            self.credentials.0.reveal(&instance.plugin_id, &instance.organization_id).await
        {
            command.env("AUTH_METHOD_ID", &auth.method_id);
            for (key, value) in &auth.credentials {
                command.env(format!("AUTH_CREDENTIAL_{}", key.to_uppercase()), value);
            }
        }
        // Workers that bridge back into the platform get the base URL and a
        // token minted for this spawn only; a restarted worker gets a new one.
        let bridging = instance.capabilities.iter().any(|c| c == "mcp" || c == "route");
        if bridging && let Some(url) = &self.settings.platform_api_url {
            command.env("PLATFORM_API_URL", url);
            command.env("PLATFORM_API_TOKEN", Uuid::new_v4().to_string());
        }
        if let Some(dir) = &self.settings.log_dir {
            command.env("LOG_DIR", dir);
        }
        if let Some(level) = &self.settings.log_level {
            command.env("LOG_LEVEL", level);
        }
        command
    }

    async fn start_monitor(self: &Arc<Self>, instance: &Arc<Instance>) {
        let generation = instance.monitor_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let registry = Arc::clone(self);
        let instance_for_task = Arc::clone(instance);
        let handle = tokio::spawn(registry.monitor_loop(instance_for_task, generation));
        *instance.monitor.lock().await = Some(handle);
    }

    /// Boxed: the loop recurses through `try_restart` → `spawn_instance` →
    /// `start_monitor`, which an unboxed async fn cannot express.
    fn monitor_loop(
        self: Arc<Self>,
        instance: Arc<Instance>,
        generation: u32,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            loop {
                tokio::time::sleep(self.settings.health_interval).await;
                if instance.monitor_gen.load(Ordering::SeqCst) != generation {
                    return;
                }
                let state = *instance.state.read().await;
                if matches!(state, InstanceState::Stopped | InstanceState::Crashed) {
                    return;
                }

                // Exit before health: a dead child's port may already be reused.
                let exited = {
                    let mut child = instance.child.lock().await;
                    match child.as_mut().map(|c| c.try_wait()) {
                        Some(Ok(Some(status))) => {
                            *child = None;
                            Some(status)
                        }
                        _ => None,
                    }
                };
                if let Some(status) = exited {
                    warn!(
                        plugin = %instance.plugin_id,
                        organization = %instance.organization_id,
                        code = status.code(),
                        "worker exited unexpectedly"
                    );
                    instance
                        .record_error(format!("worker exited unexpectedly: {status}"))
                        .await;
                    instance.set_state(InstanceState::Crashed).await;
                    self.try_restart(&instance).await;
                    return;
                }

                self.probe_instance(&instance).await;
            }
        })
    }

    /// One serialized health probe. Failure marks the instance unhealthy
    /// but never kills it; recovery flips it back to running.
    async fn probe_instance(&self, instance: &Arc<Instance>) {
        let _serialized = instance.probe_lock.lock().await;
        let Some(address) = instance.address().await else { return };
        let healthy = probe(
            &self.client,
            &format!("{address}/health"),
            self.settings.health_timeout,
        )
        .await
        .is_ok();
        *instance.last_probe.write().await = Some(Utc::now());

        let state = *instance.state.read().await;
        match (state, healthy) {
            (InstanceState::Running, false) => instance.set_state(InstanceState::Unhealthy).await,
            (InstanceState::Unhealthy, true) => instance.set_state(InstanceState::Running).await,
            _ => {}
        }
    }

    async fn try_restart(self: &Arc<Self>, instance: &Arc<Instance>) {
        let restarts = instance.restarts.fetch_add(1, Ordering::SeqCst) + 1;
        if restarts > self.settings.max_restarts {
            warn!(
                plugin = %instance.plugin_id,
                organization = %instance.organization_id,
                restarts,
                "restart budget exhausted, leaving worker crashed"
            );
            return;
        }
        info!(
            plugin = %instance.plugin_id,
            organization = %instance.organization_id,
            attempt = restarts,
            "restarting crashed worker"
        );
        if let Err(e) = self.spawn_instance(instance).await {
            warn!(
                plugin = %instance.plugin_id,
                organization = %instance.organization_id,
                error = %e,
                "restart failed"
            );
        }
    }

    async fn stop_child(&self, instance: &Instance) {
        let mut child_slot = instance.child.lock().await;
        if let Some(mut child) = child_slot.take()
            && let Err(e) = kill_gracefully(&mut child, self.settings.grace).await
        {
            warn!(
                plugin = %instance.plugin_id,
                organization = %instance.organization_id,
                error = %e,
                "could not reap worker child"
            );
        }
    }

    /// Disable a plugin for an organization: run its disable hook, ask the
    /// worker to shut down, then terminate the process. Disabling an
    /// instance that is not running is a no-op.
    pub async fn disable(&self, plugin_id: &str, organization_id: &str) -> Result<(), RegistryError> {
        let Some(instance) = self.instance(plugin_id, organization_id) else {
            return Ok(());
        };
        {
            let state = *instance.state.read().await;
            if matches!(state, InstanceState::Stopped) {
                return Ok(());
            }
        }
        instance.set_state(InstanceState::Stopped).await;
        if let Some(monitor) = instance.monitor.lock().await.take() {
            monitor.abort();
        }

        if let Some(address) = instance.address().await {
            // Best effort: a hung worker must not block its own teardown.
            for endpoint in ["/hooks/disable", "/shutdown"] {
                let result = self
                    .client
                    .post(format!("{address}{endpoint}"))
                    .timeout(self.settings.hook_timeout)
                    .json(&json!({}))
                    .send()
                    .await;
                if let Err(e) = result {
                    warn!(
                        plugin = %plugin_id,
                        organization = %organization_id,
                        endpoint,
                        error = %e,
                        "worker did not answer during teardown"
                    );
                }
            }
        }

        self.stop_child(&instance).await;
        *instance.port.write().await = None;
        *instance.pid.write().await = None;
        *instance.metadata.write().await = None;
        Ok(())
    }

    fn require_instance(
        &self,
        plugin_id: &str,
        organization_id: &str,
    ) -> Result<Arc<Instance>, RegistryError> {
        self.instance(plugin_id, organization_id).ok_or_else(|| RegistryError::NotRunning {
            plugin_id: plugin_id.to_string(),
            organization_id: organization_id.to_string(),
        })
    }

    async fn running_address(
        &self,
        plugin_id: &str,
        organization_id: &str,
    ) -> Result<String, McpBridgeError> {
        let Some(instance) = self.instance(plugin_id, organization_id) else {
            return Err(McpBridgeError::Unavailable(format!(
                "plugin `{plugin_id}` is not enabled for organization `{organization_id}`"
            )));
        };
        let state = *instance.state.read().await;
        if state != InstanceState::Running {
            return Err(McpBridgeError::Unavailable(format!(
                "worker is {state}, not running"
            )));
        }
        instance.address().await.ok_or_else(|| {
            McpBridgeError::Unavailable("worker has no bound port".to_string())
        })
    }

    /// Tool calls only go to workers in `running`; anything else is
    /// reported as unavailable rather than queued.
    pub async fn call_tool(
        &self,
        plugin_id: &str,
        organization_id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<Value, McpBridgeError> {
        let address = self.running_address(plugin_id, organization_id).await?;
        self.bridge.call_tool(&address, tool_name, arguments).await
    }

    pub async fn list_tools(
        &self,
        plugin_id: &str,
        organization_id: &str,
    ) -> Result<Vec<ToolDescriptor>, McpBridgeError> {
        let address = self.running_address(plugin_id, organization_id).await?;
        self.bridge.list_tools(&address).await
    }

    /// Check candidate credentials against the worker's validation hook.
    pub async fn validate_auth(
        &self,
        plugin_id: &str,
        organization_id: &str,
        candidate: &AuthState,
    ) -> Result<AuthCheck, RegistryError> {
        let instance = self.require_instance(plugin_id, organization_id)?;
        let address = instance.address().await.ok_or_else(|| RegistryError::NotRunning {
            plugin_id: plugin_id.to_string(),
            organization_id: organization_id.to_string(),
        })?;
        let response = self
            .client
            .post(format!("{address}/hooks/validate-auth"))
            .timeout(self.settings.hook_timeout)
            .json(candidate)
            .send()
            .await
            .map_err(|e| RegistryError::Hook(e.to_string()))?;
        if !response.status().is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(RegistryError::Hook(detail));
        }
        response.json().await.map_err(|e| RegistryError::Hook(e.to_string()))
    }

    /// Persist new config values and tell the worker to pick them up.
    pub async fn update_config(
        &self,
        plugin_id: &str,
        organization_id: &str,
        values: &HashMap<String, Value>,
    ) -> Result<(), RegistryError> {
        for (key, value) in values {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            self.config
                .0
                .set(plugin_id, organization_id, key, &text)
                .await
                .map_err(RegistryError::Hook)?;
        }

        let instance = self.require_instance(plugin_id, organization_id)?;
        let Some(address) = instance.address().await else {
            // Not running; the new values apply on next spawn.
            return Ok(());
        };
        let response = self
            .client
            .post(format!("{address}/hooks/config-update"))
            .timeout(self.settings.hook_timeout)
            .json(&json!({"config": values}))
            .send()
            .await
            .map_err(|e| RegistryError::Hook(e.to_string()))?;
        if !response.status().is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(RegistryError::Hook(detail));
        }
        Ok(())
    }

    pub async fn diagnostics(&self) -> Vec<InstanceDiagnostics> {
        let mut report = Vec::new();
        for entry in self.instances.iter() {
            let instance = entry.value();
            report.push(InstanceDiagnostics {
                plugin_id: instance.plugin_id.clone(),
                organization_id: instance.organization_id.clone(),
                state: *instance.state.read().await,
                port: *instance.port.read().await,
                process_id: *instance.pid.read().await,
                spawn_id: (*instance.spawn_id.read().await).map(|id| id.to_string()),
                restarts: instance.restarts.load(Ordering::SeqCst),
                started_at: *instance.started_at.read().await,
                last_health_check: *instance.last_probe.read().await,
                last_error: instance.last_error.read().await.clone(),
            });
        }
        report.sort_by(|a, b| {
            (a.plugin_id.as_str(), a.organization_id.as_str())
                .cmp(&(b.plugin_id.as_str(), b.organization_id.as_str()))
        });
        report
    }

    /// Stop every instance. Used on supervisor shutdown.
    pub async fn shutdown_all(&self) {
        let keys: Vec<(String, String)> =
            self.instances.iter().map(|e| e.key().clone()).collect();
        for (plugin_id, organization_id) in keys {
            if let Err(e) = self.disable(&plugin_id, &organization_id).await {
                warn!(
                    plugin = %plugin_id,
                    organization = %organization_id,
                    error = %e,
                    "shutdown of worker failed"
                );
            }
        }
    }
}

/// Poll `/health` until the worker answers with a 2xx once.
async fn probe_until_ready(
    client: &reqwest::Client,
    address: &str,
    policy: RetryPolicy,
) -> Result<(), FetchError> {
    crate::fetch::get_json_with_retry(client, &format!("{address}/health"), policy, |_| Ok(()))
        .await
}
