//! Runtime module: dependency resolution, plugin lifecycle, hooks and the
//! application assembler

pub mod app;
pub mod hooks;
pub mod plugin_manager;
pub mod resolver;

pub use app::{AppBuilder, AppConfig, QuantApp};
pub use hooks::{builtin_hook_specs, HookFault, HookOutcome, HookResults, HookSpec};
pub use plugin_manager::{PluginManager, PluginManagerConfig};
pub use resolver::resolve_order;
