//! Application runtime

use std::any::Any;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep, timeout, Duration};
use tracing::{error, info};

use crate::core::{Context, EventEngine, Plugin};
use crate::error::{CoreError, Result};
use crate::runtime::plugin_manager::{PluginManager, PluginManagerConfig};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub name: String,
    pub version: String,
    pub description: String,
    pub plugin_config: PluginManagerConfig,
    pub graceful_shutdown_timeout: Duration,
    pub enable_signal_handling: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "QuantApp".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: String::new(),
            plugin_config: PluginManagerConfig::default(),
            graceful_shutdown_timeout: Duration::from_secs(30),
            enable_signal_handling: true,
        }
    }
}

impl AppConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn with_plugin_config(mut self, config: PluginManagerConfig) -> Self {
        self.plugin_config = config;
        self
    }

    pub fn with_graceful_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_shutdown_timeout = timeout;
        self
    }

    pub fn with_signal_handling(mut self, enable: bool) -> Self {
        self.enable_signal_handling = enable;
        self
    }
}

type ResourceInstaller = Box<dyn FnOnce(&Context) + Send>;

pub struct AppBuilder {
    config: Option<AppConfig>,
    plugins_to_add: Vec<Box<dyn Plugin>>,
    engine: Option<Arc<EventEngine>>,
    resources: Vec<ResourceInstaller>,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            plugins_to_add: Vec::new(),
            engine: None,
            resources: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn add_plugin<P: Plugin>(mut self, plugin: P) -> Self {
        self.plugins_to_add.push(Box::new(plugin));
        self
    }

    pub fn add_plugins<I>(mut self, plugins: I) -> Self
    where
        I: IntoIterator<Item = Box<dyn Plugin>>,
    {
        self.plugins_to_add.extend(plugins);
        self
    }

    pub fn with_engine(mut self, engine: Arc<EventEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Makes a shared component (configuration, portfolio, risk manager, ...)
    /// available to every plugin through [`Context::get`].
    pub fn with_resource<T: Any + Send + Sync>(mut self, resource: T) -> Self {
        self.resources
            .push(Box::new(move |ctx: &Context| ctx.insert(resource)));
        self
    }

    pub fn build(mut self) -> Result<QuantApp> {
        let config = self.config.take().unwrap_or_default();
        let engine = self.engine.unwrap_or_else(|| Arc::new(EventEngine::new()));
        let context = Context::new(Arc::clone(&engine));
        for install in self.resources {
            install(&context);
        }

        let plugin_manager = PluginManager::with_config(config.plugin_config.clone());
        for plugin in self.plugins_to_add {
            plugin_manager.register_boxed(plugin)?;
        }

        Ok(QuantApp {
            config,
            engine,
            context,
            plugin_manager,
            is_running: Arc::new(RwLock::new(false)),
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Wires an engine, a shared context and a plugin manager together and
/// drives them through start and shutdown.
pub struct QuantApp {
    config: AppConfig,
    engine: Arc<EventEngine>,
    context: Context,
    plugin_manager: PluginManager,
    is_running: Arc<RwLock<bool>>,
}

impl QuantApp {
    pub fn build() -> AppBuilder {
        AppBuilder::new()
    }

    /// Starts the engine and initializes all plugins. With signal handling
    /// enabled this waits for SIGINT/SIGTERM and shuts down before returning.
    pub async fn run(&self) -> Result<()> {
        {
            let mut running = self.is_running.write().await;
            if *running {
                return Err(CoreError::RuntimeError("Application already running".to_string()));
            }
            *running = true;
        }

        info!(app = %self.config.name, version = %self.config.version, "starting application");
        self.engine.start_async().await;

        if let Err(e) = self.plugin_manager.initialize(&self.context).await {
            error!(app = %self.config.name, "plugin initialization failed: {}", e);
            return Err(e);
        }

        if self.config.enable_signal_handling {
            self.wait_for_shutdown().await?;
        }

        Ok(())
    }

    async fn wait_for_shutdown(&self) -> Result<()> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigint = signal(SignalKind::interrupt())?;
            let mut sigterm = signal(SignalKind::terminate())?;

            tokio::select! {
                _ = sigint.recv() => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }

        #[cfg(windows)]
        {
            tokio::signal::ctrl_c().await?;
        }

        self.shutdown().await
    }

    /// Shuts plugins down in reverse initialization order, then stops the
    /// engine. Does nothing unless the application is running.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let running = self.is_running.read().await;
            if !*running {
                return Ok(());
            }
        }

        info!(app = %self.config.name, "shutting down");
        let result = self.plugin_manager.shutdown(&self.context).await;
        self.engine.stop_async().await;

        *self.is_running.write().await = false;
        result
    }

    pub async fn force_shutdown(&self) -> Result<()> {
        match timeout(self.config.graceful_shutdown_timeout, self.shutdown()).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::RuntimeError(format!(
                "Shutdown did not finish within {:?}",
                self.config.graceful_shutdown_timeout
            ))),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn plugin_manager(&self) -> &PluginManager {
        &self.plugin_manager
    }

    pub fn engine(&self) -> &Arc<EventEngine> {
        &self.engine
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub async fn wait_until_started(&self, limit: Duration) -> Result<()> {
        let start = std::time::Instant::now();

        while start.elapsed() < limit {
            if *self.is_running.read().await {
                return Ok(());
            }
            sleep(Duration::from_millis(10)).await;
        }

        Err(CoreError::RuntimeError(
            "Application failed to start within timeout".to_string(),
        ))
    }
}
