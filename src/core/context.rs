//! Context shared with every plugin call
//!
//! A [`Context`] is cheap to clone; every clone and every plugin-scoped view
//! made with [`Context::with_plugin`] shares the same engine, resources and
//! key/value store.

use parking_lot::RwLock;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::engine::EventEngine;
use crate::core::event::Event;
use crate::core::plugin::PluginMetadata;
use crate::error::{CoreError, Result};

type ResourceFactory = Box<dyn Fn() -> Result<Box<dyn Any + Send + Sync>> + Send + Sync>;

#[derive(Clone)]
pub struct Context {
    resources: Arc<RwLock<ResourceRegistry>>,
    values: Arc<RwLock<HashMap<String, Value>>>,
    engine: Arc<EventEngine>,
    plugin_meta: Option<Arc<PluginMetadata>>,
}

impl Context {
    pub fn new(engine: Arc<EventEngine>) -> Self {
        Self {
            resources: Arc::new(RwLock::new(ResourceRegistry::new())),
            values: Arc::new(RwLock::new(HashMap::new())),
            engine,
            plugin_meta: None,
        }
    }

    /// A view of this context attributed to one plugin.
    pub fn with_plugin(&self, plugin_meta: PluginMetadata) -> Self {
        Self {
            plugin_meta: Some(Arc::new(plugin_meta)),
            ..self.clone()
        }
    }

    pub fn engine(&self) -> &Arc<EventEngine> {
        &self.engine
    }

    pub fn emit(&self, event: Event) {
        self.engine.emit(event);
    }

    pub async fn emit_async(&self, event: Event) {
        self.engine.emit_async(event).await;
    }

    /// Stores a value in the shared scratch space.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.write().insert(key.into(), value.into());
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    pub fn get_or(&self, key: &str, default: impl Into<Value>) -> Value {
        self.get_value(key).unwrap_or_else(|| default.into())
    }

    pub fn remove_value(&self, key: &str) -> Option<Value> {
        self.values.write().remove(key)
    }

    /// Registers a shared component (configuration, portfolio, risk
    /// manager, ...) under its type.
    pub fn insert<T: Send + Sync + 'static>(&self, resource: T) {
        self.resources.write().insert(resource);
    }

    pub fn insert_lazy<T, F>(&self, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        self.resources.write().insert_lazy(factory);
    }

    pub fn get<T: 'static + Send + Sync>(&self) -> Option<Arc<T>> {
        self.resources.write().get::<T>()
    }

    pub fn try_get<T: 'static + Send + Sync>(&self) -> Result<Arc<T>> {
        self.get::<T>().ok_or_else(|| {
            CoreError::RuntimeError(format!(
                "Resource not found: {}",
                std::any::type_name::<T>()
            ))
        })
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.resources.read().contains::<T>()
    }

    pub fn remove<T: 'static + Send + Sync>(&self) -> Option<Arc<T>> {
        self.resources.write().remove::<T>()
    }
}

/// Type-keyed registry of shared components.
struct ResourceRegistry {
    resources: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    lazy_factories: HashMap<TypeId, ResourceFactory>,
}

impl ResourceRegistry {
    fn new() -> Self {
        Self {
            resources: HashMap::new(),
            lazy_factories: HashMap::new(),
        }
    }

    fn insert<T: Send + Sync + 'static>(&mut self, resource: T) {
        let type_id = TypeId::of::<T>();
        self.lazy_factories.remove(&type_id);
        self.resources.insert(type_id, Arc::new(resource));
    }

    fn insert_lazy<T, F>(&mut self, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn() -> Result<T> + Send + Sync + 'static,
    {
        let type_id = TypeId::of::<T>();
        let factory: ResourceFactory = Box::new(move || {
            let resource = factory()?;
            Ok(Box::new(resource))
        });

        self.resources.remove(&type_id);
        self.lazy_factories.insert(type_id, factory);
    }

    fn get<T: 'static + Send + Sync>(&mut self) -> Option<Arc<T>> {
        let type_id = TypeId::of::<T>();

        if self.lazy_factories.contains_key(&type_id) {
            if let Err(e) = self.initialize_lazy::<T>() {
                tracing::warn!(resource = std::any::type_name::<T>(), "lazy resource failed: {}", e);
                return None;
            }
        }

        self.resources
            .get(&type_id)
            .and_then(|arc| arc.clone().downcast::<T>().ok())
    }

    fn initialize_lazy<T: 'static + Send + Sync>(&mut self) -> Result<()> {
        let type_id = TypeId::of::<T>();

        let factory = self.lazy_factories.remove(&type_id).ok_or_else(|| {
            CoreError::RuntimeError(format!(
                "Lazy factory not found for type: {}",
                std::any::type_name::<T>()
            ))
        })?;
        let boxed_resource = factory()?;

        match boxed_resource.downcast::<T>() {
            Ok(resource) => {
                self.resources.insert(type_id, Arc::new(*resource));
                Ok(())
            }
            Err(_) => Err(CoreError::RuntimeError(format!(
                "Failed to downcast lazy initialized resource: {}",
                std::any::type_name::<T>()
            ))),
        }
    }

    fn contains<T: 'static>(&self) -> bool {
        let type_id = TypeId::of::<T>();
        self.resources.contains_key(&type_id) || self.lazy_factories.contains_key(&type_id)
    }

    fn remove<T: 'static + Send + Sync>(&mut self) -> Option<Arc<T>> {
        let type_id = TypeId::of::<T>();
        self.lazy_factories.remove(&type_id);
        self.resources
            .remove(&type_id)
            .and_then(|arc| arc.downcast::<T>().ok())
    }
}

pub trait ContextExt {
    fn plugin_name(&self) -> &str;
    fn is_in_plugin(&self) -> bool;
}

impl ContextExt for Context {
    fn plugin_name(&self) -> &str {
        self.plugin_meta
            .as_ref()
            .map(|meta| meta.name.as_str())
            .unwrap_or("core")
    }

    fn is_in_plugin(&self) -> bool {
        self.plugin_meta.is_some()
    }
}

pub struct ContextBuilder {
    engine: Option<Arc<EventEngine>>,
    values: Vec<(String, Value)>,
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self {
            engine: None,
            values: Vec::new(),
        }
    }

    pub fn with_engine(mut self, engine: Arc<EventEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.push((key.into(), value.into()));
        self
    }

    pub fn build(self) -> Result<Context> {
        let engine = self
            .engine
            .ok_or_else(|| CoreError::ConfigError("EventEngine is required".to_string()))?;

        let ctx = Context::new(engine);
        for (key, value) in self.values {
            ctx.set(key, value);
        }
        Ok(ctx)
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
