//! The plugin contract: a factory produces a [`PluginDefinition`] and the
//! platform-facing [`PluginFactory`] wrapper validates the result before a
//! worker is allowed to use it.
//!
//! A definition is a closed record: a required `name` plus one optional async
//! hook per lifecycle event. The factory is invoked once per organization, so
//! validation runs on every invocation rather than once at registration.

use std::panic::{AssertUnwindSafe, catch_unwind};

use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::future::Future;
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

use crate::context::{
    AuthValidationContext, ConfigUpdateContext, DisableContext, EnableContext, GlobalContext,
    InitializeContext, StartContext,
};

/// Error raised by a hook body. Plugins convert their own failures into this.
#[derive(Error, Debug)]
pub enum HookError {
    #[error("{0}")]
    Failed(String),
}

impl From<anyhow::Error> for HookError {
    fn from(err: anyhow::Error) -> HookError {
        HookError::Failed(format!("{err:#}"))
    }
}

pub type HookOutcome = Result<(), HookError>;

/// Result of `onValidateAuth`: whether the candidate credentials worked.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct AuthCheck {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
}

impl AuthCheck {
    pub fn ok() -> Self {
        AuthCheck { valid: true, message: None }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        AuthCheck { valid: false, message: Some(message.into()) }
    }
}

/// The fixed set of lifecycle hooks a definition may carry.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, EnumString, AsRefStr, Display, Serialize, Deserialize,
)]
#[strum(serialize_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub enum HookKind {
    OnInitialize,
    OnStart,
    OnValidateAuth,
    OnConfigUpdate,
    OnDisable,
    OnEnable,
}

pub type InitializeHook =
    Box<dyn Fn(InitializeContext) -> BoxFuture<'static, HookOutcome> + Send + Sync>;
pub type StartHook = Box<dyn Fn(StartContext) -> BoxFuture<'static, HookOutcome> + Send + Sync>;
pub type ValidateAuthHook = Box<
    dyn Fn(AuthValidationContext) -> BoxFuture<'static, Result<AuthCheck, HookError>>
        + Send
        + Sync,
>;
pub type ConfigUpdateHook =
    Box<dyn Fn(ConfigUpdateContext) -> BoxFuture<'static, HookOutcome> + Send + Sync>;
pub type DisableHook = Box<dyn Fn(DisableContext) -> BoxFuture<'static, HookOutcome> + Send + Sync>;
pub type EnableHook = Box<dyn Fn(EnableContext) -> BoxFuture<'static, HookOutcome> + Send + Sync>;

/// Errors raised while validating a factory's output. Factory-time errors are
/// fatal: the plugin never starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DefinitionError {
    /// The factory panicked or misused the registration surface.
    #[error("plugin factory did not produce a usable definition: {0}")]
    InvalidDefinition(String),

    /// `name` is absent or trims to empty.
    #[error("plugin definition is missing a non-empty name")]
    MissingName,

    /// A hook slot was filled in a way the contract forbids.
    #[error("hook `{0}` is invalid: {1}")]
    InvalidHook(HookKind, String),
}

#[derive(Default)]
pub(crate) struct HookSet {
    pub(crate) on_initialize: Option<InitializeHook>,
    pub(crate) on_start: Option<StartHook>,
    pub(crate) on_validate_auth: Option<ValidateAuthHook>,
    pub(crate) on_config_update: Option<ConfigUpdateHook>,
    pub(crate) on_disable: Option<DisableHook>,
    pub(crate) on_enable: Option<EnableHook>,
}

/// What a plugin factory returns. Built through [`PluginDefinition::builder`];
/// the builder records contract violations (duplicate hooks, …) which
/// [`PluginFactory::build`] surfaces as typed errors.
pub struct PluginDefinition {
    name: String,
    pub(crate) hooks: HookSet,
    violations: Vec<DefinitionError>,
}

impl PluginDefinition {
    pub fn builder(name: impl Into<String>) -> PluginDefinitionBuilder {
        PluginDefinitionBuilder {
            definition: PluginDefinition {
                name: name.into(),
                hooks: HookSet::default(),
                violations: Vec::new(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// All checks run in contract order; the first failure wins.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.name.trim().is_empty() {
            return Err(DefinitionError::MissingName);
        }
        if let Some(v) = self.violations.first() {
            return Err(v.clone());
        }
        Ok(())
    }

    pub fn declared_hooks(&self) -> Vec<HookKind> {
        let mut kinds = Vec::new();
        if self.hooks.on_initialize.is_some() {
            kinds.push(HookKind::OnInitialize);
        }
        if self.hooks.on_start.is_some() {
            kinds.push(HookKind::OnStart);
        }
        if self.hooks.on_validate_auth.is_some() {
            kinds.push(HookKind::OnValidateAuth);
        }
        if self.hooks.on_config_update.is_some() {
            kinds.push(HookKind::OnConfigUpdate);
        }
        if self.hooks.on_disable.is_some() {
            kinds.push(HookKind::OnDisable);
        }
        if self.hooks.on_enable.is_some() {
            kinds.push(HookKind::OnEnable);
        }
        kinds
    }

    /// Hooks are optional; an absent hook is a successful no-op.
    pub async fn run_initialize(&self, ctx: InitializeContext) -> HookOutcome {
        match &self.hooks.on_initialize {
            Some(hook) => hook(ctx).await,
            None => Ok(()),
        }
    }

    pub async fn run_start(&self, ctx: StartContext) -> HookOutcome {
        match &self.hooks.on_start {
            Some(hook) => hook(ctx).await,
            None => Ok(()),
        }
    }

    /// A plugin without a validation hook accepts any candidate; the platform
    /// then only learns about bad credentials when a call fails.
    pub async fn run_validate_auth(
        &self,
        ctx: AuthValidationContext,
    ) -> Result<AuthCheck, HookError> {
        match &self.hooks.on_validate_auth {
            Some(hook) => hook(ctx).await,
            None => Ok(AuthCheck::ok()),
        }
    }

    pub async fn run_config_update(&self, ctx: ConfigUpdateContext) -> HookOutcome {
        match &self.hooks.on_config_update {
            Some(hook) => hook(ctx).await,
            None => Ok(()),
        }
    }

    pub async fn run_disable(&self, ctx: DisableContext) -> HookOutcome {
        match &self.hooks.on_disable {
            Some(hook) => hook(ctx).await,
            None => Ok(()),
        }
    }

    pub async fn run_enable(&self, ctx: EnableContext) -> HookOutcome {
        match &self.hooks.on_enable {
            Some(hook) => hook(ctx).await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for PluginDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDefinition")
            .field("name", &self.name)
            .field("hooks", &self.declared_hooks())
            .finish()
    }
}

pub struct PluginDefinitionBuilder {
    definition: PluginDefinition,
}

macro_rules! hook_setter {
    ($fn_name:ident, $slot:ident, $kind:expr, $ctx:ty, $ret:ty) => {
        pub fn $fn_name<F, Fut>(mut self, hook: F) -> Self
        where
            F: Fn($ctx) -> Fut + Send + Sync + 'static,
            Fut: Future<Output = $ret> + Send + 'static,
        {
            if self.definition.hooks.$slot.is_some() {
                self.definition.violations.push(DefinitionError::InvalidHook(
                    $kind,
                    "registered more than once".to_string(),
                ));
            }
            self.definition.hooks.$slot = Some(Box::new(move |ctx| Box::pin(hook(ctx))));
            self
        }
    };
}

impl PluginDefinitionBuilder {
    hook_setter!(on_initialize, on_initialize, HookKind::OnInitialize, InitializeContext, HookOutcome);
    hook_setter!(on_start, on_start, HookKind::OnStart, StartContext, HookOutcome);
    hook_setter!(on_validate_auth, on_validate_auth, HookKind::OnValidateAuth, AuthValidationContext, Result<AuthCheck, HookError>);
    hook_setter!(on_config_update, on_config_update, HookKind::OnConfigUpdate, ConfigUpdateContext, HookOutcome);
    hook_setter!(on_disable, on_disable, HookKind::OnDisable, DisableContext, HookOutcome);
    hook_setter!(on_enable, on_enable, HookKind::OnEnable, EnableContext, HookOutcome);

    pub fn build(self) -> PluginDefinition {
        self.definition
    }
}

/// Wraps a user-supplied factory and validates its output on every call.
///
/// A single factory is invoked once per organization and hook objects may be
/// recreated each time, so the contract check cannot be cached.
pub struct PluginFactory {
    inner: Box<dyn Fn(&mut GlobalContext) -> PluginDefinition + Send + Sync>,
}

impl PluginFactory {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&mut GlobalContext) -> PluginDefinition + Send + Sync + 'static,
    {
        PluginFactory { inner: Box::new(factory) }
    }

    /// Invoke the wrapped factory and validate the definition it returned.
    ///
    /// Validation is pure: the only effect of a failure is the typed error.
    pub fn build(&self, ctx: &mut GlobalContext) -> Result<PluginDefinition, DefinitionError> {
        let definition = catch_unwind(AssertUnwindSafe(|| (self.inner)(ctx)))
            .map_err(|payload| DefinitionError::InvalidDefinition(panic_text(payload)))?;
        definition.validate()?;
        if let Some(problem) = ctx.register.first_violation() {
            return Err(DefinitionError::InvalidDefinition(problem));
        }
        Ok(definition)
    }
}

fn panic_text(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("factory panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("factory panicked: {s}")
    } else {
        "factory panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::GlobalContext;

    fn global_ctx() -> GlobalContext {
        GlobalContext::new("mock", "org-1")
    }

    #[tokio::test]
    async fn valid_definition_is_accepted_unchanged() {
        let factory = PluginFactory::new(|_ctx| {
            PluginDefinition::builder("stripe")
                .on_start(|_ctx| async { Ok(()) })
                .on_disable(|_ctx| async { Ok(()) })
                .build()
        });

        let def = factory.build(&mut global_ctx()).unwrap();
        assert_eq!(def.name(), "stripe");
        assert_eq!(def.declared_hooks(), vec![HookKind::OnStart, HookKind::OnDisable]);
    }

    #[tokio::test]
    async fn blank_name_is_rejected() {
        for name in ["", "   ", "\t\n"] {
            let factory = PluginFactory::new(move |_ctx| PluginDefinition::builder(name).build());
            let err = factory.build(&mut global_ctx()).unwrap_err();
            assert_eq!(err, DefinitionError::MissingName);
        }
    }

    #[tokio::test]
    async fn duplicate_hook_is_rejected_and_named() {
        let factory = PluginFactory::new(|_ctx| {
            PluginDefinition::builder("hubspot")
                .on_enable(|_ctx| async { Ok(()) })
                .on_enable(|_ctx| async { Ok(()) })
                .build()
        });

        match factory.build(&mut global_ctx()) {
            Err(DefinitionError::InvalidHook(kind, _)) => assert_eq!(kind, HookKind::OnEnable),
            other => panic!("expected InvalidHook, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn panicking_factory_is_an_invalid_definition() {
        let factory: PluginFactory = PluginFactory::new(|_ctx| panic!("boom"));
        match factory.build(&mut global_ctx()) {
            Err(DefinitionError::InvalidDefinition(msg)) => assert!(msg.contains("boom")),
            other => panic!("expected InvalidDefinition, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn validation_runs_per_invocation() {
        // The factory alternates between a valid and an invalid definition;
        // each call must be judged on its own output.
        use std::sync::atomic::{AtomicBool, Ordering};
        let flip = AtomicBool::new(false);
        let factory = PluginFactory::new(move |_ctx| {
            let bad = flip.fetch_xor(true, Ordering::SeqCst);
            let name = if bad { "" } else { "zendesk" };
            PluginDefinition::builder(name).build()
        });

        assert!(factory.build(&mut global_ctx()).is_ok());
        assert_eq!(factory.build(&mut global_ctx()).unwrap_err(), DefinitionError::MissingName);
        assert!(factory.build(&mut global_ctx()).is_ok());
    }

    #[tokio::test]
    async fn absent_hooks_are_successful_noops() {
        let def = PluginDefinition::builder("intercom").build();
        def.validate().unwrap();
        let check = def
            .run_validate_auth(crate::context::AuthValidationContext::for_tests("org-1"))
            .await
            .unwrap();
        assert!(check.valid);
    }

    #[test]
    fn hook_kind_wire_names_are_camel_case() {
        assert_eq!(HookKind::OnValidateAuth.to_string(), "onValidateAuth");
        assert_eq!("onConfigUpdate".parse::<HookKind>().unwrap(), HookKind::OnConfigUpdate);
    }
}
