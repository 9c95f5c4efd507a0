use parking_lot::Mutex;
use quantcore::core::ENGINE_SOURCE;
use quantcore::prelude::*;
use quantcore::runtime::hooks::{ON_BAR, ON_ORDER};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type Journal = Arc<Mutex<Vec<String>>>;

/// Plugin that registers a BAR handler in setup and answers `on_bar`.
struct Desk {
    name: &'static str,
    deps: Vec<&'static str>,
    journal: Journal,
    bar_hook: bool,
}

impl Desk {
    fn new(name: &'static str, deps: &[&'static str], journal: &Journal) -> Self {
        Self {
            name,
            deps: deps.to_vec(),
            journal: Arc::clone(journal),
            bar_hook: true,
        }
    }

    fn without_hook(mut self) -> Self {
        self.bar_hook = false;
        self
    }
}

#[async_trait]
impl Plugin for Desk {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new(self.name, "1.0.0").with_dependencies(self.deps.clone())
    }

    async fn setup(&mut self, ctx: &Context) -> Result<()> {
        self.journal.lock().push(format!("setup {}", self.name));
        let journal = Arc::clone(&self.journal);
        let name = self.name;
        ctx.engine().on(EventType::Bar, name, move |event: &Event| {
            journal
                .lock()
                .push(format!("bar {} {}", name, event.payload()["symbol"]));
            Ok(())
        });
        Ok(())
    }

    async fn teardown(&mut self, _ctx: &Context) -> Result<()> {
        self.journal.lock().push(format!("teardown {}", self.name));
        Ok(())
    }

    fn implements_hook(&self, hook: &str) -> bool {
        self.bar_hook && hook == ON_BAR
    }

    async fn call_hook(&mut self, _hook: &str, args: &Value, _ctx: &Context) -> Result<Value> {
        if args["fail_in"] == self.name {
            return Err(CoreError::Other(format!("{} rejected bar", self.name)));
        }
        Ok(json!(self.name))
    }
}

fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

fn quiet(name: &str) -> AppConfig {
    AppConfig::new(name).with_signal_handling(false)
}

fn entries(journal: &Journal, prefix: &str) -> Vec<String> {
    journal
        .lock()
        .iter()
        .filter(|e| e.starts_with(prefix))
        .cloned()
        .collect()
}

#[tokio::test]
async fn test_application_lifecycle_end_to_end() {
    let j = journal();
    let app = QuantApp::build()
        .with_config(quiet("e2e"))
        .add_plugin(Desk::new("strategy", &["data"], &j))
        .add_plugin(Desk::new("report", &["strategy", "risk"], &j))
        .add_plugin(Desk::new("data", &[], &j))
        .add_plugin(Desk::new("risk", &["data"], &j))
        .build()
        .unwrap();

    app.run().await.unwrap();
    assert_eq!(
        app.plugin_manager().init_order(),
        vec!["data", "strategy", "risk", "report"]
    );

    app.context()
        .emit_async(Event::new(EventType::Bar, json!({"symbol": "110001"})))
        .await;
    assert_eq!(
        entries(&j, "bar "),
        vec![
            "bar data \"110001\"",
            "bar strategy \"110001\"",
            "bar risk \"110001\"",
            "bar report \"110001\"",
        ]
    );

    app.shutdown().await.unwrap();
    assert_eq!(
        entries(&j, "teardown "),
        vec![
            "teardown report",
            "teardown risk",
            "teardown strategy",
            "teardown data",
        ]
    );
}

#[tokio::test]
async fn test_bar_payload_reaches_handler_unchanged() {
    let engine = EventEngine::new();
    let received: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    engine.on(EventType::Bar, "append", move |event: &Event| {
        sink.lock().push(event.payload().clone());
        Ok(())
    });

    engine.emit(Event::new(EventType::Bar, json!({"symbol": "110001"})));

    assert_eq!(*received.lock(), vec![json!({"symbol": "110001"})]);
}

#[tokio::test]
async fn test_middlewares_run_once_per_emit() {
    let engine = EventEngine::new();
    let counter = Arc::new(AtomicUsize::new(0));
    let handled = Arc::new(AtomicUsize::new(0));

    for name in ["first", "second"] {
        let counter = Arc::clone(&counter);
        engine.add_middleware(middleware(name, move |event: Event, next: Next<'_>| {
            counter.fetch_add(1, Ordering::SeqCst);
            next.run(event);
            Ok(())
        }));
    }
    let seen = Arc::clone(&handled);
    engine.on(EventType::Tick, "count", move |_: &Event| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    engine.emit(Event::new(EventType::Tick, json!({"price": 101.5})));

    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(handled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_faulting_plugin_handler_is_reported_once() {
    let errors: Arc<Mutex<Vec<ErrorPayload>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    let app = QuantApp::build()
        .with_config(quiet("faults"))
        .add_plugin(plugin_fn!("broken", "0.1.0", |ctx: &Context| -> Result<()> {
            ctx.engine().on(EventType::Order, "broken.order", |_: &Event| {
                Err(CoreError::EventError("order book unavailable".to_string()))
            });
            Ok(())
        }))
        .build()
        .unwrap();
    app.engine().on(EventType::Error, "collector", move |event: &Event| {
        sink.lock().extend(ErrorPayload::from_event(event));
        Ok(())
    });

    app.run().await.unwrap();
    app.context()
        .emit_async(Event::new(EventType::Order, json!({"qty": 100})))
        .await;

    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].target, "broken.order");
    assert_eq!(errors[0].error_type, "EventError");
    drop(errors);

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_error_events_carry_engine_source() {
    let engine = EventEngine::new();
    let sources = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&sources);
    engine.on(EventType::Log, "noisy", |_: &Event| {
        Err(CoreError::Other("log sink full".to_string()))
    });
    engine.on(EventType::Error, "watch", move |event: &Event| {
        sink.lock().push(event.source().map(str::to_string));
        Ok(())
    });

    engine.emit(Event::new(EventType::Log, Value::Null));

    assert_eq!(*sources.lock(), vec![Some(ENGINE_SOURCE.to_string())]);
}

#[tokio::test]
async fn test_hooks_across_plugins() {
    let j = journal();
    let app = QuantApp::build()
        .with_config(quiet("hooks"))
        .add_plugin(Desk::new("data", &[], &j))
        .add_plugin(Desk::new("silent", &[], &j).without_hook())
        .add_plugin(Desk::new("strategy", &["data"], &j))
        .add_plugin(Desk::new("risk", &["data"], &j))
        .build()
        .unwrap();
    app.run().await.unwrap();
    app.plugin_manager().disable("risk").await.unwrap();

    let results = app
        .plugin_manager()
        .call_hook(ON_BAR, &json!({"fail_in": "data"}), app.context())
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results.values(), vec![&json!("strategy")]);
    assert_eq!(results.failures()[0].plugin, "data");
    assert_eq!(results.failures()[0].message, "data rejected bar");

    app.plugin_manager().declare_hook(HookSpec::new(ON_ORDER).first_result());
    let err = app
        .plugin_manager()
        .call_hook_first(ON_ORDER, &Value::Null, app.context())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NoHookImplementation(_)));

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_graphs_initialize_nothing() {
    let j = journal();
    let missing = QuantApp::build()
        .with_config(quiet("missing"))
        .add_plugin(Desk::new("P1", &[], &j))
        .add_plugin(Desk::new("P4", &["Px"], &j))
        .build()
        .unwrap();
    assert!(matches!(
        missing.run().await,
        Err(CoreError::MissingDependency { .. })
    ));

    let cyclic = QuantApp::build()
        .with_config(quiet("cyclic"))
        .add_plugin(Desk::new("P5", &["P6"], &j))
        .add_plugin(Desk::new("P6", &["P5"], &j))
        .build()
        .unwrap();
    match cyclic.run().await {
        Err(CoreError::CyclicDependency { cycle }) => assert_eq!(cycle, vec!["P5", "P6", "P5"]),
        other => panic!("unexpected result: {other:?}"),
    }

    assert!(entries(&j, "setup ").is_empty());
}

#[tokio::test]
async fn test_force_shutdown_reports_plugin_faults() {
    struct Sticky;

    #[async_trait]
    impl Plugin for Sticky {
        fn metadata(&self) -> PluginMetadata {
            PluginMetadata::new("sticky", "0.1.0")
        }

        async fn teardown(&mut self, _ctx: &Context) -> Result<()> {
            Err(anyhow::anyhow!("socket still open").into())
        }
    }

    let app = QuantApp::build()
        .with_config(quiet("sticky"))
        .add_plugin(Sticky)
        .build()
        .unwrap();
    app.run().await.unwrap();

    match app.force_shutdown().await {
        Err(CoreError::ShutdownFailed(faults)) => {
            assert_eq!(faults.len(), 1);
            assert_eq!(faults[0].plugin, "sticky");
            assert_eq!(faults[0].error.kind(), "InternalError");
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(!app.is_running().await);
    assert_eq!(
        app.plugin_manager().get_state("sticky"),
        Some(PluginState::TornDown)
    );
}

#[tokio::test]
async fn test_signal_emitting_handler_does_not_keep_engine_alive() {
    let signals = Arc::new(AtomicUsize::new(0));
    let app = QuantApp::build()
        .with_config(quiet("weak"))
        .add_plugin(plugin_fn!("signaller", "0.1.0", |ctx: &Context| -> Result<()> {
            let engine = Arc::downgrade(ctx.engine());
            let book = Arc::new(Mutex::new(Vec::new()));
            ctx.engine().on(EventType::Bar, "signaller.bar", move |bar: &Event| {
                let depth = {
                    let mut book = book.lock();
                    book.push(bar.payload()["close"].clone());
                    book.len()
                };
                if let Some(engine) = engine.upgrade() {
                    engine.emit(Event::new(EventType::Signal, json!({ "depth": depth })));
                }
                Ok(())
            });
            Ok(())
        }))
        .build()
        .unwrap();
    let seen = Arc::clone(&signals);
    app.engine().on(EventType::Signal, "count", move |_: &Event| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    app.run().await.unwrap();
    app.context()
        .emit_async(Event::new(EventType::Bar, json!({"close": 101.5})))
        .await;
    app.shutdown().await.unwrap();
    assert_eq!(signals.load(Ordering::SeqCst), 1);

    let engine = Arc::downgrade(app.engine());
    drop(app);
    assert!(engine.upgrade().is_none());
}
