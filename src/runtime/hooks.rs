//! Hook broadcasting
//!
//! A hook is a named extension point. [`PluginManager::call_hook`] offers it
//! to every enabled plugin that implements it and gathers one outcome per
//! plugin. A failing implementation is recorded and the broadcast moves on.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::Context;
use crate::error::{CoreError, Result};
use crate::runtime::plugin_manager::PluginManager;

pub const ON_INIT: &str = "on_init";
pub const ON_START: &str = "on_start";
pub const ON_STOP: &str = "on_stop";
pub const ON_BAR: &str = "on_bar";
pub const ON_ORDER: &str = "on_order";
pub const ON_TRADE: &str = "on_trade";
pub const ON_ERROR: &str = "on_error";

/// Declared calling convention of a hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookSpec {
    pub name: String,
    /// Callers usually want only the first answer.
    pub first_result: bool,
    /// A broadcast with no implementor is fine.
    pub optional: bool,
}

impl HookSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            first_result: false,
            optional: false,
        }
    }

    pub fn first_result(mut self) -> Self {
        self.first_result = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Hooks every trading application knows about.
pub fn builtin_hook_specs() -> Vec<HookSpec> {
    vec![
        HookSpec::new(ON_INIT),
        HookSpec::new(ON_START),
        HookSpec::new(ON_STOP),
        HookSpec::new(ON_BAR),
        HookSpec::new(ON_ORDER).first_result(),
        HookSpec::new(ON_TRADE),
        HookSpec::new(ON_ERROR).optional(),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookFault {
    pub plugin: String,
    pub error_type: String,
    pub message: String,
}

impl HookFault {
    fn new(plugin: &str, error: &CoreError) -> Self {
        Self {
            plugin: plugin.to_string(),
            error_type: error.kind().to_string(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HookOutcome {
    pub plugin: String,
    pub result: std::result::Result<Value, HookFault>,
}

/// Outcomes of one broadcast, in call order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookResults {
    outcomes: Vec<HookOutcome>,
}

impl HookResults {
    pub fn outcomes(&self) -> &[HookOutcome] {
        &self.outcomes
    }

    pub fn values(&self) -> Vec<&Value> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .collect()
    }

    pub fn failures(&self) -> Vec<&HookFault> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err())
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    /// First successful non-null value.
    pub fn first(&self) -> Option<&Value> {
        self.values().into_iter().find(|v| !v.is_null())
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

impl IntoIterator for HookResults {
    type Item = HookOutcome;
    type IntoIter = std::vec::IntoIter<HookOutcome>;

    fn into_iter(self) -> Self::IntoIter {
        self.outcomes.into_iter()
    }
}

impl PluginManager {
    /// Declares (or redeclares) the calling convention of a hook.
    pub fn declare_hook(&self, spec: HookSpec) {
        debug!(hook = %spec.name, first_result = spec.first_result, optional = spec.optional, "declared hook");
        self.hook_specs.write().insert(spec.name.clone(), spec);
    }

    pub fn declare_builtin_hooks(&self) {
        for spec in builtin_hook_specs() {
            self.declare_hook(spec);
        }
    }

    pub fn hook_spec(&self, hook: &str) -> Option<HookSpec> {
        self.hook_specs.read().get(hook).cloned()
    }

    /// Calls `hook` on every enabled implementor.
    ///
    /// Only a declared, non-optional hook with no enabled implementor is an
    /// error; faults inside implementations end up in the results.
    pub async fn call_hook(&self, hook: &str, args: &Value, ctx: &Context) -> Result<HookResults> {
        self.broadcast(hook, args, ctx, false).await
    }

    /// Like [`call_hook`](Self::call_hook) but stops at the first plugin that
    /// answers with a non-null value.
    pub async fn call_hook_first(&self, hook: &str, args: &Value, ctx: &Context) -> Result<Option<Value>> {
        let results = self.broadcast(hook, args, ctx, true).await?;
        Ok(results.first().cloned())
    }

    async fn broadcast(
        &self,
        hook: &str,
        args: &Value,
        ctx: &Context,
        stop_at_first: bool,
    ) -> Result<HookResults> {
        let mut results = HookResults::default();

        for slot in self.broadcast_order() {
            if !slot.is_enabled() {
                continue;
            }

            let mut plugin = slot.lock().await;
            if !plugin.implements_hook(hook) {
                continue;
            }

            let scoped = ctx.with_plugin(slot.metadata.clone());
            let result = self
                .guarded(slot.name(), "hook", plugin.call_hook(hook, args, &scoped))
                .await
                .map_err(|error| {
                    warn!(plugin = slot.name(), hook, "hook implementation failed: {}", error);
                    HookFault::new(slot.name(), &error)
                });
            drop(plugin);

            let answered = matches!(&result, Ok(value) if !value.is_null());
            results.outcomes.push(HookOutcome {
                plugin: slot.name().to_string(),
                result,
            });
            if stop_at_first && answered {
                break;
            }
        }

        if results.is_empty() {
            if let Some(spec) = self.hook_spec(hook) {
                if !spec.optional {
                    return Err(CoreError::NoHookImplementation(hook.to_string()));
                }
            }
        }

        debug!(hook, calls = results.len(), "hook broadcast finished");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EventEngine, Plugin, PluginMetadata};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    enum Reply {
        Value(Value),
        Fail,
        Panic,
    }

    struct Hooked {
        name: &'static str,
        hooks: Vec<&'static str>,
        reply: Reply,
    }

    impl Hooked {
        fn new(name: &'static str, hooks: &[&'static str], reply: Reply) -> Self {
            Self {
                name,
                hooks: hooks.to_vec(),
                reply,
            }
        }
    }

    #[async_trait]
    impl Plugin for Hooked {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata::new(self.name, "1.0.0")
        }

        fn implements_hook(&self, hook: &str) -> bool {
            self.hooks.iter().any(|h| *h == hook)
        }

        async fn call_hook(&mut self, _hook: &str, args: &Value, _ctx: &Context) -> Result<Value> {
            match &self.reply {
                Reply::Value(Value::Null) => Ok(Value::Null),
                Reply::Value(v) => Ok(json!({ "from": v, "args": args })),
                Reply::Fail => Err(CoreError::Other("no quote".to_string())),
                Reply::Panic => panic!("hook blew up"),
            }
        }
    }

    fn context() -> Context {
        Context::new(Arc::new(EventEngine::new()))
    }

    async fn started(plugins: Vec<Hooked>) -> (PluginManager, Context) {
        let manager = PluginManager::new();
        for plugin in plugins {
            manager.register(plugin).unwrap();
        }
        let ctx = context();
        manager.initialize(&ctx).await.unwrap();
        (manager, ctx)
    }

    #[test]
    fn test_builtin_specs() {
        let specs = builtin_hook_specs();

        assert_eq!(specs.len(), 7);
        let order = specs.iter().find(|s| s.name == ON_ORDER).unwrap();
        assert!(order.first_result);
        let error = specs.iter().find(|s| s.name == ON_ERROR).unwrap();
        assert!(error.optional);
        assert!(!specs.iter().find(|s| s.name == ON_BAR).unwrap().optional);
    }

    #[tokio::test]
    async fn test_call_hook_skips_non_implementors_and_disabled() {
        let (manager, ctx) = started(vec![
            Hooked::new("A", &[ON_BAR], Reply::Value(json!("A"))),
            Hooked::new("B", &[ON_TRADE], Reply::Value(json!("B"))),
            Hooked::new("C", &[ON_BAR], Reply::Value(json!("C"))),
        ])
        .await;
        manager.disable("C").await.unwrap();

        let results = manager.call_hook(ON_BAR, &json!({"symbol": "110001"}), &ctx).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results.outcomes()[0].plugin, "A");
        assert_eq!(
            results.values(),
            vec![&json!({"from": "A", "args": {"symbol": "110001"}})]
        );
    }

    #[tokio::test]
    async fn test_call_hook_continues_past_faults() {
        let (manager, ctx) = started(vec![
            Hooked::new("A", &[ON_BAR], Reply::Fail),
            Hooked::new("B", &[ON_BAR], Reply::Panic),
            Hooked::new("C", &[ON_BAR], Reply::Value(json!("C"))),
        ])
        .await;

        let results = manager.call_hook(ON_BAR, &Value::Null, &ctx).await.unwrap();

        assert_eq!(results.len(), 3);
        assert!(!results.is_success());
        assert_eq!(results.values().len(), 1);

        let failures = results.failures();
        assert_eq!(failures[0].plugin, "A");
        assert_eq!(failures[0].error_type, "Error");
        assert_eq!(failures[0].message, "no quote");
        assert_eq!(failures[1].plugin, "B");
        assert_eq!(failures[1].error_type, "Panic");
        assert!(failures[1].message.contains("hook blew up"));
    }

    #[tokio::test]
    async fn test_call_hook_follows_init_order() {
        let manager = PluginManager::new();
        manager
            .register(Hooked::new("strategy", &[ON_BAR], Reply::Value(json!(1))))
            .unwrap();
        manager
            .register(Hooked::new("data", &[ON_BAR], Reply::Value(json!(2))))
            .unwrap();
        let ctx = context();
        manager.initialize(&ctx).await.unwrap();

        let results = manager.call_hook(ON_BAR, &Value::Null, &ctx).await.unwrap();
        let plugins: Vec<_> = results.into_iter().map(|o| o.plugin).collect();

        assert_eq!(plugins, vec!["strategy", "data"]);
    }

    #[tokio::test]
    async fn test_call_hook_first_stops_at_first_answer() {
        let (manager, ctx) = started(vec![
            Hooked::new("silent", &[ON_ORDER], Reply::Value(Value::Null)),
            Hooked::new("router", &[ON_ORDER], Reply::Value(json!("router"))),
            Hooked::new("backup", &[ON_ORDER], Reply::Panic),
        ])
        .await;

        let answer = manager
            .call_hook_first(ON_ORDER, &json!({"qty": 10}), &ctx)
            .await
            .unwrap();

        assert_eq!(answer, Some(json!({"from": "router", "args": {"qty": 10}})));
    }

    #[tokio::test]
    async fn test_required_hook_without_implementor() {
        let (manager, ctx) = started(vec![Hooked::new("A", &[ON_BAR], Reply::Fail)]).await;

        let undeclared = manager.call_hook(ON_TRADE, &Value::Null, &ctx).await.unwrap();
        assert!(undeclared.is_empty());
        assert!(undeclared.is_success());

        manager.declare_builtin_hooks();
        let err = manager.call_hook(ON_TRADE, &Value::Null, &ctx).await.unwrap_err();
        assert!(matches!(err, CoreError::NoHookImplementation(ref h) if h == ON_TRADE));

        assert!(manager.call_hook(ON_ERROR, &Value::Null, &ctx).await.unwrap().is_empty());
        assert_eq!(manager.hook_spec(ON_ERROR), Some(HookSpec::new(ON_ERROR).optional()));
    }

    #[tokio::test]
    async fn test_hooks_need_enabled_plugins() {
        let manager = PluginManager::new();
        manager
            .register(Hooked::new("A", &[ON_BAR], Reply::Value(json!("A"))))
            .unwrap();

        let results = manager.call_hook(ON_BAR, &Value::Null, &context()).await.unwrap();

        assert!(results.is_empty());
    }
}
