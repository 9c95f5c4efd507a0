//! QuantCore - event-driven plugin runtime for trading systems
//!
//! An [`EventEngine`](core::EventEngine) routes typed market and trading
//! events through a middleware chain to registered handlers; a
//! [`PluginManager`](runtime::PluginManager) brings plugins up in dependency
//! order, tears them down in reverse and broadcasts hooks between them.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod core;
pub mod error;
pub mod runtime;

pub mod prelude {
    //! Commonly used types and traits

    pub use crate::core::{async_handler, async_middleware, handler, middleware};
    pub use crate::core::{AsyncNext, EventEngine, EventHandler, Middleware, Next};
    pub use crate::core::{Context, ContextBuilder, ContextExt as _};
    pub use crate::core::{Event, EventType, ErrorPayload};
    pub use crate::core::{Plugin, PluginMetadata, PluginState};
    pub use crate::error::{CoreError, Result};
    pub use crate::runtime::{AppBuilder, AppConfig, QuantApp};
    pub use crate::runtime::{HookResults, HookSpec, PluginManager, PluginManagerConfig};
    pub use crate::{bail, plugin_fn};
    pub use async_trait::async_trait;
}

pub use core::{Context, Event, EventEngine, EventType, Plugin};
pub use error::{CoreError, Result};
pub use runtime::{PluginManager, QuantApp};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const AUTHORS: &str = env!("CARGO_PKG_AUTHORS");

pub fn build_info() -> String {
    format!("QuantCore {}", VERSION)
}

pub fn runtime_check() -> Result<()> {
    if tokio::runtime::Handle::try_current().is_err() {
        return Err(CoreError::RuntimeError(
            "No Tokio runtime found. Use #[tokio::main]".to_string(),
        ));
    }
    Ok(())
}
