//! Plugin manager

use futures::future::Future;
use futures::FutureExt;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::core::engine::panic_message;
use crate::core::{Context, Plugin, PluginInstance, PluginMetadata, PluginState};
use crate::error::{CoreError, PluginFault, Result};
use crate::runtime::hooks::HookSpec;
use crate::runtime::resolver;

#[derive(Debug, Clone)]
pub struct PluginManagerConfig {
    /// Upper bound for every single lifecycle or hook call.
    pub timeout: Duration,
    /// Keep initializing independent plugins after one fails. Dependents of
    /// a failed plugin are skipped.
    pub continue_on_failure: bool,
}

impl Default for PluginManagerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            continue_on_failure: false,
        }
    }
}

impl PluginManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn continue_on_failure(mut self, continue_on_failure: bool) -> Self {
        self.continue_on_failure = continue_on_failure;
        self
    }
}

/// Registry and lifecycle controller for plugins.
///
/// Plugins are kept in registration order. [`PluginManager::initialize`]
/// brings them up in dependency order and records that order;
/// [`PluginManager::shutdown`] walks it backwards.
pub struct PluginManager {
    plugins: RwLock<Vec<Arc<PluginInstance>>>,
    init_order: RwLock<Vec<String>>,
    pub(crate) hook_specs: RwLock<HashMap<String, HookSpec>>,
    config: PluginManagerConfig,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::with_config(PluginManagerConfig::default())
    }

    pub fn with_config(config: PluginManagerConfig) -> Self {
        Self {
            plugins: RwLock::new(Vec::new()),
            init_order: RwLock::new(Vec::new()),
            hook_specs: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &PluginManagerConfig {
        &self.config
    }

    pub fn register<P: Plugin>(&self, plugin: P) -> Result<()> {
        self.register_boxed(Box::new(plugin))
    }

    pub fn register_boxed(&self, plugin: Box<dyn Plugin>) -> Result<()> {
        let instance = PluginInstance::new(plugin);
        let mut plugins = self.plugins.write();

        if plugins.iter().any(|p| p.name() == instance.name()) {
            return Err(CoreError::DuplicateName(instance.name().to_string()));
        }

        debug!(
            plugin = instance.name(),
            dependencies = ?instance.dependencies(),
            "registered plugin"
        );
        plugins.push(Arc::new(instance));
        Ok(())
    }

    /// Removes a plugin that no other registered plugin depends on. Live
    /// plugins have to be shut down first.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut plugins = self.plugins.write();
        let position = plugins
            .iter()
            .position(|p| p.name() == name)
            .ok_or_else(|| CoreError::PluginNotFound(name.to_string()))?;

        let dependents: Vec<String> = plugins
            .iter()
            .filter(|p| p.name() != name && p.dependencies().iter().any(|d| d == name))
            .map(|p| p.name().to_string())
            .collect();
        if !dependents.is_empty() {
            return Err(CoreError::DependencyInUse {
                name: name.to_string(),
                dependents,
            });
        }

        let state = plugins[position].state();
        if state.is_live() {
            return Err(CoreError::InvalidStateTransition {
                plugin: name.to_string(),
                from: state,
                to: PluginState::Registered,
            });
        }

        plugins.remove(position);
        self.init_order.write().retain(|n| n != name);
        debug!(plugin = name, "unregistered plugin");
        Ok(())
    }

    /// Validates the dependency graph and returns the initialization order.
    pub fn resolve_order(&self) -> Result<Vec<String>> {
        let plugins = self.plugins.read();
        resolver::resolve_order(plugins.iter().map(|p| (p.name(), p.dependencies())))
    }

    /// Sets up and enables every registered plugin in dependency order.
    ///
    /// Nothing runs unless the whole graph resolves. Plugins that are
    /// already live are left alone. Without `continue_on_failure` the first
    /// failure stops initialization; plugins brought up before it stay up.
    pub async fn initialize(&self, ctx: &Context) -> Result<()> {
        let order = self.resolve_order()?;
        let slots = self.slots_in(&order);

        if let Some(stale) = slots.iter().find(|s| s.state() == PluginState::TornDown) {
            return Err(CoreError::InvalidStateTransition {
                plugin: stale.name().to_string(),
                from: PluginState::TornDown,
                to: PluginState::Initialized,
            });
        }

        info!(order = ?order, "initializing plugins");
        let mut failures = Vec::new();
        let mut failed: HashSet<String> = HashSet::new();

        for slot in slots {
            if slot.state() != PluginState::Registered {
                continue;
            }

            if let Some(dep) = slot.dependencies().iter().find(|d| failed.contains(*d)) {
                warn!(plugin = slot.name(), dependency = %dep, "skipping plugin with failed dependency");
                let error = CoreError::RuntimeError(format!("dependency '{}' failed", dep));
                failures.push(fault(&slot, "setup", error));
                failed.insert(slot.name().to_string());
                continue;
            }

            if let Err((phase, error)) = self.bring_up(&slot, ctx).await {
                warn!(plugin = slot.name(), phase, "plugin failed: {}", error);
                if !self.config.continue_on_failure {
                    return Err(setup_error(slot.name(), phase, error));
                }
                failures.push(fault(&slot, phase, error));
                failed.insert(slot.name().to_string());
            }
        }

        if failures.is_empty() {
            info!(count = self.init_order.read().len(), "plugins initialized");
            Ok(())
        } else {
            Err(CoreError::InitializationFailed(failures))
        }
    }

    async fn bring_up(
        &self,
        slot: &PluginInstance,
        ctx: &Context,
    ) -> std::result::Result<(), (&'static str, CoreError)> {
        let scoped = ctx.with_plugin(slot.metadata.clone());
        let mut plugin = slot.lock().await;

        self.guarded(slot.name(), "setup", plugin.setup(&scoped))
            .await
            .map_err(|e| ("setup", e))?;
        slot.transition(PluginState::Initialized)
            .map_err(|e| ("setup", e))?;
        self.init_order.write().push(slot.name().to_string());

        self.guarded(slot.name(), "enable", plugin.enable())
            .await
            .map_err(|e| ("enable", e))?;
        slot.transition(PluginState::Enabled)
            .map_err(|e| ("enable", e))?;

        debug!(plugin = slot.name(), "plugin enabled");
        Ok(())
    }

    /// Disables and tears down every initialized plugin in reverse
    /// initialization order. Faults are collected and reported once all
    /// plugins were visited.
    pub async fn shutdown(&self, ctx: &Context) -> Result<()> {
        let order = std::mem::take(&mut *self.init_order.write());
        info!(count = order.len(), "shutting down plugins");
        let mut faults = Vec::new();

        for slot in self.slots_in(&order).into_iter().rev() {
            let scoped = ctx.with_plugin(slot.metadata.clone());
            let mut plugin = slot.lock().await;

            if slot.state() == PluginState::Enabled {
                if let Err(error) = self.guarded(slot.name(), "disable", plugin.disable()).await {
                    faults.push(fault(&slot, "disable", error));
                }
                if let Err(error) = slot.transition(PluginState::Disabled) {
                    faults.push(fault(&slot, "disable", error));
                }
            }

            if slot.state().is_live() {
                if let Err(error) = self.guarded(slot.name(), "teardown", plugin.teardown(&scoped)).await {
                    faults.push(fault(&slot, "teardown", error));
                }
                if let Err(error) = slot.transition(PluginState::TornDown) {
                    faults.push(fault(&slot, "teardown", error));
                }
            }
        }

        if faults.is_empty() {
            Ok(())
        } else {
            for f in &faults {
                warn!(plugin = %f.plugin, phase = f.phase, "shutdown fault: {}", f.error);
            }
            Err(CoreError::ShutdownFailed(faults))
        }
    }

    /// Enables a disabled plugin. The state is checked under the plugin lock,
    /// so concurrent toggles of the same plugin run one at a time.
    pub async fn enable(&self, name: &str) -> Result<()> {
        self.toggle(name, PluginState::Enabled).await
    }

    pub async fn disable(&self, name: &str) -> Result<()> {
        self.toggle(name, PluginState::Disabled).await
    }

    async fn toggle(&self, name: &str, to: PluginState) -> Result<()> {
        let slot = self.find(name)?;
        let mut plugin = slot.lock().await;
        slot.check_transition(to)?;

        if to == PluginState::Enabled {
            self.guarded(name, "enable", plugin.enable()).await?;
        } else {
            self.guarded(name, "disable", plugin.disable()).await?;
        }
        slot.transition(to)?;
        debug!(plugin = name, state = %to, "plugin toggled");
        Ok(())
    }

    /// Runs one plugin call with the configured timeout, turning panics into
    /// [`CoreError::Panic`].
    pub(crate) async fn guarded<T, F>(&self, plugin: &str, phase: &'static str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match timeout(self.config.timeout, AssertUnwindSafe(call).catch_unwind()).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(CoreError::Panic(panic_message(panic.as_ref()))),
            Err(_) => Err(CoreError::Timeout {
                plugin: plugin.to_string(),
                phase,
                timeout: self.config.timeout,
            }),
        }
    }

    fn find(&self, name: &str) -> Result<Arc<PluginInstance>> {
        self.plugins
            .read()
            .iter()
            .find(|p| p.name() == name)
            .cloned()
            .ok_or_else(|| CoreError::PluginNotFound(name.to_string()))
    }

    fn slots_in(&self, order: &[String]) -> Vec<Arc<PluginInstance>> {
        let plugins = self.plugins.read();
        order
            .iter()
            .filter_map(|name| plugins.iter().find(|p| p.name() == name).cloned())
            .collect()
    }

    /// Plugins in broadcast order: initialization order first, then any
    /// other registered plugin in registration order.
    pub(crate) fn broadcast_order(&self) -> Vec<Arc<PluginInstance>> {
        let order = self.init_order.read().clone();
        let mut slots = self.slots_in(&order);
        let plugins = self.plugins.read();
        slots.extend(
            plugins
                .iter()
                .filter(|p| !order.iter().any(|n| n == p.name()))
                .cloned(),
        );
        slots
    }

    pub fn get_state(&self, name: &str) -> Option<PluginState> {
        self.find(name).ok().map(|p| p.state())
    }

    pub fn list_plugins(&self) -> Vec<(String, PluginState)> {
        self.plugins.read().iter().map(|p| p.to_meta()).collect()
    }

    pub fn get_plugin_metadata(&self, name: &str) -> Option<PluginMetadata> {
        self.find(name).ok().map(|p| p.metadata.clone())
    }

    /// Order used by the last initialization, which shutdown reverses.
    pub fn init_order(&self) -> Vec<String> {
        self.init_order.read().clone()
    }

    pub fn has_plugin(&self, name: &str) -> bool {
        self.plugins.read().iter().any(|p| p.name() == name)
    }

    pub fn plugin_count(&self) -> usize {
        self.plugins.read().len()
    }
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}

fn setup_error(plugin: &str, phase: &'static str, error: CoreError) -> CoreError {
    match error {
        timeout @ CoreError::Timeout { .. } => timeout,
        transition @ CoreError::InvalidStateTransition { .. } => transition,
        other => CoreError::PluginSetup {
            plugin: plugin.to_string(),
            phase,
            source: Box::new(other),
        },
    }
}

fn fault(slot: &PluginInstance, phase: &'static str, error: CoreError) -> PluginFault {
    PluginFault {
        plugin: slot.name().to_string(),
        phase,
        error,
    }
}
