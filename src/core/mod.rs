//! Core module: event model, dispatch engine, plugin contract and context

pub mod context;
pub mod engine;
pub mod event;
pub mod plugin;

pub use context::{Context, ContextBuilder, ContextExt};
pub use engine::{
    async_handler, async_middleware, handler, middleware, AsyncNext, EngineStats, EventEngine,
    EventHandler, Middleware, Next, ENGINE_SOURCE,
};
pub use event::{DispatchStage, ErrorPayload, Event, EventType};
pub use plugin::{FunctionPlugin, Plugin, PluginInstance, PluginMetadata, PluginState};
pub use crate::plugin_fn;
