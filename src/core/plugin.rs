//! Plugin system

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

use crate::core::context::Context;
use crate::error::{CoreError, Result};

/// Lifecycle state of a registered plugin.
///
/// ```text
/// Registered ─setup─► Initialized ─enable─► Enabled ⇄ Disabled
///                          │                   │         │
///                          └──────teardown─────┴─────────┴──► TornDown
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginState {
    Registered,
    Initialized,
    Enabled,
    Disabled,
    TornDown,
}

impl PluginState {
    pub fn can_transition_to(self, next: PluginState) -> bool {
        use PluginState::*;
        matches!(
            (self, next),
            (Registered, Initialized)
                | (Initialized, Enabled)
                | (Enabled, Disabled)
                | (Disabled, Enabled)
                | (Initialized | Enabled | Disabled, TornDown)
        )
    }

    /// Set up and not yet torn down.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            PluginState::Initialized | PluginState::Enabled | PluginState::Disabled
        )
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PluginState::Registered => "REGISTERED",
            PluginState::Initialized => "INITIALIZED",
            PluginState::Enabled => "ENABLED",
            PluginState::Disabled => "DISABLED",
            PluginState::TornDown => "TORN_DOWN",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub dependencies: Vec<String>,
}

impl PluginMetadata {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            author: String::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// Declares a required plugin. Repeated names are kept once.
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        let dep = dep.into();
        if !self.dependencies.contains(&dep) {
            self.dependencies.push(dep);
        }
        self
    }

    pub fn with_dependencies<I, S>(self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        deps.into_iter().fold(self, |meta, dep| meta.with_dependency(dep))
    }
}

/// Plugin trait
///
/// Lifecycle methods are driven by the
/// [`PluginManager`](crate::runtime::PluginManager); plugins register their
/// event handlers in `setup` through [`Context::engine`].
///
/// Hooks are named extension points. A plugin advertises the hooks it
/// implements with `implements_hook` and answers them in `call_hook`.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    fn metadata(&self) -> PluginMetadata;

    async fn setup(&mut self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    async fn teardown(&mut self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    async fn enable(&mut self) -> Result<()> {
        Ok(())
    }

    async fn disable(&mut self) -> Result<()> {
        Ok(())
    }

    fn implements_hook(&self, _hook: &str) -> bool {
        false
    }

    async fn call_hook(&mut self, hook: &str, _args: &Value, _ctx: &Context) -> Result<Value> {
        Err(CoreError::HookNotImplemented {
            plugin: self.name(),
            hook: hook.to_string(),
        })
    }

    fn name(&self) -> String {
        self.metadata().name
    }
}

#[async_trait]
impl Plugin for Box<dyn Plugin> {
    fn metadata(&self) -> PluginMetadata {
        (**self).metadata()
    }

    async fn setup(&mut self, ctx: &Context) -> Result<()> {
        (**self).setup(ctx).await
    }

    async fn teardown(&mut self, ctx: &Context) -> Result<()> {
        (**self).teardown(ctx).await
    }

    async fn enable(&mut self) -> Result<()> {
        (**self).enable().await
    }

    async fn disable(&mut self) -> Result<()> {
        (**self).disable().await
    }

    fn implements_hook(&self, hook: &str) -> bool {
        (**self).implements_hook(hook)
    }

    async fn call_hook(&mut self, hook: &str, args: &Value, ctx: &Context) -> Result<Value> {
        (**self).call_hook(hook, args, ctx).await
    }

    fn name(&self) -> String {
        (**self).name()
    }
}

/// Plugin whose only behavior is a setup closure.
pub struct FunctionPlugin<F> {
    metadata: PluginMetadata,
    func: F,
}

impl<F> FunctionPlugin<F> {
    pub fn new(metadata: PluginMetadata, func: F) -> Self {
        Self { metadata, func }
    }
}

#[async_trait]
impl<F> Plugin for FunctionPlugin<F>
where
    F: Fn(&Context) -> Result<()> + Send + Sync + 'static,
{
    fn metadata(&self) -> PluginMetadata {
        self.metadata.clone()
    }

    async fn setup(&mut self, ctx: &Context) -> Result<()> {
        (self.func)(ctx)
    }
}

#[macro_export]
macro_rules! plugin_fn {
    ($name:expr, $version:expr, $func:expr) => {{
        use $crate::core::plugin::{FunctionPlugin, PluginMetadata};
        let metadata = PluginMetadata::new($name, $version);
        FunctionPlugin::new(metadata, $func)
    }};
    ($metadata:expr, $func:expr) => {{
        use $crate::core::plugin::FunctionPlugin;
        FunctionPlugin::new($metadata, $func)
    }};
}

/// A registered plugin together with its lifecycle state.
///
/// The plugin object sits behind an async mutex so lifecycle and hook calls
/// can be awaited without holding the registry lock.
pub struct PluginInstance {
    pub metadata: PluginMetadata,
    state: parking_lot::Mutex<PluginState>,
    plugin: tokio::sync::Mutex<Box<dyn Plugin>>,
}

impl PluginInstance {
    pub fn new(plugin: Box<dyn Plugin>) -> Self {
        let metadata = Plugin::metadata(&plugin);
        Self {
            metadata,
            state: parking_lot::Mutex::new(PluginState::Registered),
            plugin: tokio::sync::Mutex::new(plugin),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn dependencies(&self) -> &[String] {
        &self.metadata.dependencies
    }

    pub fn state(&self) -> PluginState {
        *self.state.lock()
    }

    pub fn is_enabled(&self) -> bool {
        self.state() == PluginState::Enabled
    }

    /// Checks that moving to `to` is legal without changing anything.
    pub fn check_transition(&self, to: PluginState) -> Result<()> {
        let from = self.state();
        if from.can_transition_to(to) {
            Ok(())
        } else {
            Err(CoreError::InvalidStateTransition {
                plugin: self.metadata.name.clone(),
                from,
                to,
            })
        }
    }

    pub fn transition(&self, to: PluginState) -> Result<()> {
        let mut state = self.state.lock();
        if !state.can_transition_to(to) {
            return Err(CoreError::InvalidStateTransition {
                plugin: self.metadata.name.clone(),
                from: *state,
                to,
            });
        }
        *state = to;
        Ok(())
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, Box<dyn Plugin>> {
        self.plugin.lock().await
    }

    pub fn to_meta(&self) -> (String, PluginState) {
        (self.metadata.name.clone(), self.state())
    }
}
