//! Dispatch engine
//!
//! [`EventEngine`] owns the per-type handler lists and the global middleware
//! chain. Every dispatch pass works on a snapshot of both, taken when the pass
//! starts, so handlers may register or unregister other handlers while an
//! event is in flight without disturbing it.
//!
//! ```text
//!  emit(event)
//!     │
//!     ▼
//!  [M1] ─next─► [M2] ─next─► ... ─► handlers[event.type] (registration order)
//!     │
//!     └─ faults collected per step ─► ERROR event (at most one level deep)
//! ```

use async_trait::async_trait;
use futures::future::{BoxFuture, Future};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, error, info, warn};

use crate::core::event::{DispatchStage, ErrorPayload, Event, EventType};
use crate::error::{CoreError, Result};

/// Source tag of events produced by the engine itself.
pub const ENGINE_SOURCE: &str = "EventEngine";

/// A callback bound to one [`EventType`].
///
/// `handle` is used by [`EventEngine::emit`], `handle_async` by
/// [`EventEngine::emit_async`]. Handlers that only have a synchronous body
/// implement `handle` and inherit the async path.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    fn handle(&self, event: &Event) -> Result<()>;

    async fn handle_async(&self, event: &Event) -> Result<()> {
        self.handle(event)
    }
}

/// A step wrapping every dispatched event.
///
/// A middleware continues the chain by calling [`Next::run`], possibly with a
/// different event, and short-circuits by returning without calling it.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    fn process(&self, event: Event, next: Next<'_>) -> Result<()>;

    /// Async entry point used by [`EventEngine::emit_async`].
    ///
    /// The default hands `process` a synchronous link, so the rest of the
    /// chain runs inside the call exactly as under [`EventEngine::emit`].
    /// Downstream async handlers are then driven through
    /// [`EventHandler::handle`]; override this (or use [`async_middleware`])
    /// to keep them awaited.
    async fn process_async(&self, event: Event, next: AsyncNext<'_>) -> Result<()> {
        self.process(event, Next::chain(next.pass, next.index, next.called))
    }
}

type HandlerMap = HashMap<EventType, Vec<Arc<dyn EventHandler>>>;
type MiddlewareChain = Vec<Arc<dyn Middleware>>;

/// Link to the rest of the chain, handed to [`Middleware::process`].
pub struct Next<'a> {
    pass: &'a Pass<'a>,
    index: usize,
    called: &'a AtomicBool,
}

impl<'a> Next<'a> {
    fn chain(pass: &'a Pass<'a>, index: usize, called: &'a AtomicBool) -> Self {
        Self {
            pass,
            index,
            called,
        }
    }

    /// Passes `event` to the next middleware, or to the handlers when this
    /// is the last link.
    pub fn run(self, event: Event) {
        self.called.store(true, Ordering::SeqCst);
        self.pass.run_from(self.index, event);
    }
}

/// Link to the rest of the chain, handed to [`Middleware::process_async`].
pub struct AsyncNext<'a> {
    pass: &'a Pass<'a>,
    index: usize,
    called: &'a AtomicBool,
}

impl<'a> AsyncNext<'a> {
    pub async fn run(self, event: Event) {
        self.called.store(true, Ordering::SeqCst);
        self.pass.run_from_async(self.index, event).await;
    }
}

/// One dispatch of one event over a snapshot of the registry.
struct Pass<'e> {
    middlewares: Arc<MiddlewareChain>,
    handlers: Arc<HandlerMap>,
    faults: Mutex<Vec<ErrorPayload>>,
    engine: &'e EventEngine,
}

impl<'e> Pass<'e> {
    fn new(engine: &'e EventEngine) -> Self {
        Self {
            middlewares: Arc::clone(&*engine.middlewares.read()),
            handlers: Arc::clone(&*engine.handlers.read()),
            faults: Mutex::new(Vec::new()),
            engine,
        }
    }

    fn record(&self, stage: DispatchStage, target: &str, fault: (String, String)) {
        let (error_type, error_message) = fault;
        warn!(
            %stage,
            target_name = target,
            error_type = %error_type,
            "{} fault: {}",
            stage,
            error_message
        );
        self.engine.error_count.fetch_add(1, Ordering::Relaxed);
        self.faults.lock().push(ErrorPayload {
            stage,
            target: target.to_string(),
            error_type,
            error_message,
        });
    }

    fn run_from(&self, index: usize, event: Event) {
        let Some(middleware) = self.middlewares.get(index) else {
            self.run_handlers(&event);
            return;
        };

        let called = AtomicBool::new(false);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            middleware.process(event.clone(), Next::chain(self, index + 1, &called))
        }));

        if let Some(fault) = fault_of(outcome) {
            self.record(DispatchStage::Middleware, middleware.name(), fault);
            if !called.load(Ordering::SeqCst) {
                self.run_from(index + 1, event);
            }
        }
    }

    fn run_handlers(&self, event: &Event) {
        let Some(handlers) = self.handlers.get(&event.event_type()) else {
            return;
        };

        for handler in handlers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(event)));
            if let Some(fault) = fault_of(outcome) {
                self.record(DispatchStage::Handler, handler.name(), fault);
            }
        }
    }

    fn run_from_async<'s>(&'s self, index: usize, event: Event) -> BoxFuture<'s, ()> {
        async move {
            let Some(middleware) = self.middlewares.get(index) else {
                self.run_handlers_async(&event).await;
                return;
            };

            let called = AtomicBool::new(false);
            let next = AsyncNext {
                pass: self,
                index: index + 1,
                called: &called,
            };
            let outcome = AssertUnwindSafe(middleware.process_async(event.clone(), next))
                .catch_unwind()
                .await;

            if let Some(fault) = fault_of(outcome) {
                self.record(DispatchStage::Middleware, middleware.name(), fault);
                if !called.load(Ordering::SeqCst) {
                    self.run_from_async(index + 1, event).await;
                }
            }
        }
        .boxed()
    }

    async fn run_handlers_async(&self, event: &Event) {
        let Some(handlers) = self.handlers.get(&event.event_type()) else {
            return;
        };

        for handler in handlers {
            let outcome = AssertUnwindSafe(handler.handle_async(event))
                .catch_unwind()
                .await;
            if let Some(fault) = fault_of(outcome) {
                self.record(DispatchStage::Handler, handler.name(), fault);
            }
        }
    }

    fn into_faults(self) -> Vec<ErrorPayload> {
        self.faults.into_inner()
    }
}

fn fault_of(outcome: std::thread::Result<Result<()>>) -> Option<(String, String)> {
    match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some((e.kind().to_string(), e.to_string())),
        Err(panic) => Some(("Panic".to_string(), panic_message(panic.as_ref()))),
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Tracks how deep the engine is inside ERROR-event dispatch.
struct ErrorScope<'a> {
    depth: Option<&'a AtomicUsize>,
}

impl<'a> ErrorScope<'a> {
    fn enter(depth: &'a AtomicUsize, event: &Event) -> Self {
        if event.is_error() {
            depth.fetch_add(1, Ordering::SeqCst);
            Self { depth: Some(depth) }
        } else {
            Self { depth: None }
        }
    }
}

impl Drop for ErrorScope<'_> {
    fn drop(&mut self) {
        if let Some(depth) = self.depth {
            depth.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Snapshot of engine counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub running: bool,
    pub event_count: u64,
    pub error_count: u64,
    pub handlers: BTreeMap<EventType, usize>,
    pub middlewares: usize,
}

/// In-process event bus with ordered, fault-isolated dispatch.
///
/// The engine assumes a single logical thread of control: the ERROR recursion
/// guard is per engine, so a fault raised by an unrelated concurrent
/// `emit_async` while an ERROR event is being dispatched is dropped too.
pub struct EventEngine {
    handlers: RwLock<Arc<HandlerMap>>,
    middlewares: RwLock<Arc<MiddlewareChain>>,
    running: AtomicBool,
    event_count: AtomicU64,
    error_count: AtomicU64,
    error_depth: AtomicUsize,
}

impl EventEngine {
    pub fn new() -> Self {
        debug!("EventEngine initialized");
        Self {
            handlers: RwLock::new(Arc::new(HashMap::new())),
            middlewares: RwLock::new(Arc::new(Vec::new())),
            running: AtomicBool::new(false),
            event_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            error_depth: AtomicUsize::new(0),
        }
    }

    /// Appends `handler` to the list for `event_type`. Registering the same
    /// handler twice makes it run twice.
    pub fn register_handler(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
        debug!(%event_type, handler = handler.name(), "registered handler");
        let mut guard = self.handlers.write();
        Arc::make_mut(&mut *guard)
            .entry(event_type)
            .or_default()
            .push(handler);
    }

    /// Removes the first registration of `handler` for `event_type`.
    pub fn unregister_handler(&self, event_type: EventType, handler: &Arc<dyn EventHandler>) -> bool {
        let mut guard = self.handlers.write();
        let position = guard
            .get(&event_type)
            .and_then(|list| list.iter().position(|h| Arc::ptr_eq(h, handler)));

        match position {
            Some(index) => {
                if let Some(list) = Arc::make_mut(&mut *guard).get_mut(&event_type) {
                    list.remove(index);
                }
                debug!(%event_type, handler = handler.name(), "unregistered handler");
                true
            }
            None => false,
        }
    }

    /// Shortcut for registering a closure handler. The returned handle can be
    /// passed to [`EventEngine::unregister_handler`].
    pub fn on<F>(&self, event_type: EventType, name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        let h = handler(name, f);
        self.register_handler(event_type, Arc::clone(&h));
        h
    }

    pub fn add_middleware(&self, middleware: Arc<dyn Middleware>) {
        debug!(middleware = middleware.name(), "added middleware");
        let mut guard = self.middlewares.write();
        Arc::make_mut(&mut *guard).push(middleware);
    }

    /// Dispatches `event` on the calling thread and returns after every
    /// handler has run. Faults never reach the caller.
    pub fn emit(&self, event: Event) {
        for fault in self.dispatch(event) {
            // ERROR events never yield reportable faults, so this stops here.
            self.dispatch(fault.into_event(ENGINE_SOURCE));
        }
    }

    /// Same as [`EventEngine::emit`], awaiting each middleware and handler in
    /// turn. Handlers of one event never run concurrently.
    pub async fn emit_async(&self, event: Event) {
        for fault in self.dispatch_async(event).await {
            self.dispatch_async(fault.into_event(ENGINE_SOURCE)).await;
        }
    }

    fn dispatch(&self, event: Event) -> Vec<ErrorPayload> {
        let _scope = ErrorScope::enter(&self.error_depth, &event);
        let suppress = self.suppressing(&event);
        self.event_count.fetch_add(1, Ordering::Relaxed);

        let pass = Pass::new(self);
        pass.run_from(0, event);
        self.reportable(pass.into_faults(), suppress)
    }

    async fn dispatch_async(&self, event: Event) -> Vec<ErrorPayload> {
        let _scope = ErrorScope::enter(&self.error_depth, &event);
        let suppress = self.suppressing(&event);
        self.event_count.fetch_add(1, Ordering::Relaxed);

        let pass = Pass::new(self);
        pass.run_from_async(0, event).await;
        self.reportable(pass.into_faults(), suppress)
    }

    fn suppressing(&self, event: &Event) -> bool {
        event.is_error() || self.error_depth.load(Ordering::SeqCst) > 0
    }

    fn reportable(&self, faults: Vec<ErrorPayload>, suppress: bool) -> Vec<ErrorPayload> {
        if !suppress {
            return faults;
        }
        for fault in &faults {
            error!(
                stage = %fault.stage,
                target_name = %fault.target,
                error_type = %fault.error_type,
                "fault while handling ERROR event dropped: {}",
                fault.error_message
            );
        }
        Vec::new()
    }

    /// Marks the engine running and emits a START event.
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.emit(Event::new(EventType::Start, serde_json::Value::Null).with_source(ENGINE_SOURCE));
        info!("EventEngine started");
    }

    /// Emits a STOP event and marks the engine stopped.
    pub fn stop(&self) {
        self.emit(Event::new(EventType::Stop, serde_json::Value::Null).with_source(ENGINE_SOURCE));
        self.running.store(false, Ordering::SeqCst);
        self.log_stopped();
    }

    pub async fn start_async(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.emit_async(Event::new(EventType::Start, serde_json::Value::Null).with_source(ENGINE_SOURCE))
            .await;
        info!("EventEngine started");
    }

    pub async fn stop_async(&self) {
        self.emit_async(Event::new(EventType::Stop, serde_json::Value::Null).with_source(ENGINE_SOURCE))
            .await;
        self.running.store(false, Ordering::SeqCst);
        self.log_stopped();
    }

    fn log_stopped(&self) {
        info!(
            events = self.event_count.load(Ordering::Relaxed),
            errors = self.error_count.load(Ordering::Relaxed),
            "EventEngine stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn handler_count(&self, event_type: EventType) -> usize {
        self.handlers.read().get(&event_type).map_or(0, Vec::len)
    }

    pub fn middleware_count(&self) -> usize {
        self.middlewares.read().len()
    }

    pub fn stats(&self) -> EngineStats {
        let handlers = self
            .handlers
            .read()
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(kind, list)| (*kind, list.len()))
            .collect();

        EngineStats {
            running: self.is_running(),
            event_count: self.event_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            handlers,
            middlewares: self.middleware_count(),
        }
    }
}

impl Default for EventEngine {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Event) -> Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, event: &Event) -> Result<()> {
        (self.f)(event)
    }
}

/// Wraps a synchronous closure as a handler.
pub fn handler<F>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}

pub struct AsyncFnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for AsyncFnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    /// Blocks the calling thread until the future completes. Refused with a
    /// `RuntimeError` on a current-thread tokio runtime.
    fn handle(&self, event: &Event) -> Result<()> {
        block_on_sync(&self.name, (self.f)(event.clone()))
    }

    async fn handle_async(&self, event: &Event) -> Result<()> {
        (self.f)(event.clone()).await
    }
}

/// Wraps an async closure as a handler. The closure receives its own copy of
/// the event.
pub fn async_handler<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(AsyncFnHandler {
        name: name.into(),
        f,
    })
}

pub struct FnMiddleware<F> {
    name: String,
    f: F,
}

impl<F> Middleware for FnMiddleware<F>
where
    F: for<'a> Fn(Event, Next<'a>) -> Result<()> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, event: Event, next: Next<'_>) -> Result<()> {
        (self.f)(event, next)
    }
}

/// Wraps a closure as a middleware.
pub fn middleware<F>(name: impl Into<String>, f: F) -> Arc<dyn Middleware>
where
    F: for<'a> Fn(Event, Next<'a>) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(FnMiddleware {
        name: name.into(),
        f,
    })
}

pub struct AsyncFnMiddleware<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F> Middleware for AsyncFnMiddleware<F>
where
    F: for<'a> Fn(Event, AsyncNext<'a>) -> BoxFuture<'a, Result<()>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, event: Event, next: Next<'_>) -> Result<()> {
        let next = AsyncNext {
            pass: next.pass,
            index: next.index,
            called: next.called,
        };
        block_on_sync(&self.name, (self.f)(event, next))
    }

    async fn process_async(&self, event: Event, next: AsyncNext<'_>) -> Result<()> {
        (self.f)(event, next).await
    }
}

/// Wraps an async closure as a middleware. The closure returns a boxed
/// future borrowing the link, e.g. `async move { next.run(event).await; Ok(()) }.boxed()`.
pub fn async_middleware<F>(name: impl Into<String>, f: F) -> Arc<dyn Middleware>
where
    F: for<'a> Fn(Event, AsyncNext<'a>) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    Arc::new(AsyncFnMiddleware {
        name: name.into(),
        f,
    })
}

/// Runs an async callback to completion from the synchronous dispatch path.
///
/// On a multi-thread tokio runtime the worker is handed over with
/// `block_in_place`. A current-thread runtime cannot be blocked without
/// stalling the callback itself, so the call is refused there with
/// [`CoreError::RuntimeError`]. Outside tokio a local executor is used.
fn block_on_sync<F>(target: &str, fut: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| handle.block_on(fut))
        }
        Ok(_) => Err(CoreError::RuntimeError(format!(
            "'{}' is async and cannot block a current-thread runtime; use emit_async",
            target
        ))),
        Err(_) => futures::executor::block_on(fut),
    }
}
