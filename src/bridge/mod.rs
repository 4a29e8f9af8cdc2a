//! Runtime bridge
//!
//! A [`Bridge`] ties one engine [`Context`] to whichever host
//! [`EventLoop`] is currently driving it. It installs the timer globals,
//! converts values and awaitables in both directions and keeps the engine
//! job queue draining while the loop runs.
//!
//! # Example
//!
//! ```
//! use quickbridge::host::{EventLoop, HostValue};
//! use quickbridge::Bridge;
//!
//! let bridge = Bridge::new();
//! let event_loop = EventLoop::new();
//! let result = bridge
//!     .run_until_complete(&event_loop, async { Ok(HostValue::Int(1)) })
//!     .unwrap();
//! assert_eq!(result, HostValue::Int(1));
//! ```

pub mod coercion;
pub mod drain;
pub mod marshal;
pub mod running_loop;
pub mod timers;

pub use coercion::{Awaitable, CoercionRecord, Direction, SourceState};
pub use drain::JobDrain;
pub use running_loop::{RunningGuard, RunningLoop};
pub use timers::{TimerCallback, TimerEntry, TimerRegistry};

use crate::config::BridgeConfig;
use crate::engine::{AsyncGate, Context, Evaluator, JsResult, JsValue, SnippetEvaluator};
use crate::error::{messages, Error, Result, ScriptOrigin};
use crate::host::{EventLoop, HostFuture, HostValue, IdleHookId, Transfer};
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::{Rc, Weak};

struct BridgeInner {
    config: BridgeConfig,
    engine: Context,
    running: Rc<RunningLoop>,
    timers: RefCell<TimerRegistry>,
    next_record: Cell<u64>,
}

/// One engine bound to the host loop that drives it
#[derive(Clone)]
pub struct Bridge {
    inner: Rc<BridgeInner>,
}

/// Non-owning bridge reference held by engine globals and callbacks
#[derive(Clone)]
pub(crate) struct WeakBridge(Weak<BridgeInner>);

impl WeakBridge {
    pub(crate) fn upgrade(&self) -> Option<Bridge> {
        self.0.upgrade().map(|inner| Bridge { inner })
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

impl Bridge {
    /// Bridge with the default configuration and an empty snippet table
    pub fn new() -> Self {
        Self::build(BridgeConfig::default(), Rc::new(SnippetEvaluator::new()))
    }

    pub fn with_config(config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, Rc::new(SnippetEvaluator::new())))
    }

    /// Bridge whose engine evaluates source text with `evaluator`
    pub fn with_evaluator(config: BridgeConfig, evaluator: Rc<dyn Evaluator>) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config, evaluator))
    }

    fn build(config: BridgeConfig, evaluator: Rc<dyn Evaluator>) -> Self {
        let engine = Context::with_evaluator(evaluator);
        let running = Rc::new(RunningLoop::new(&config.engine_name, &config.host_name));
        engine.set_gate(Some(running.clone() as Rc<dyn AsyncGate>));

        let bridge = Bridge {
            inner: Rc::new(BridgeInner {
                timers: RefCell::new(TimerRegistry::new(config.min_timer_delay_ms)),
                config,
                engine,
                running,
                next_record: Cell::new(1),
            }),
        };
        bridge.install_globals();
        tracing::debug!(
            engine = %bridge.inner.config.engine_name,
            host = %bridge.inner.config.host_name,
            "bridge created"
        );
        bridge
    }

    fn install_globals(&self) {
        let cx = &self.inner.engine;
        let global = cx.global();

        let weak = self.downgrade();
        let set_timeout = cx.function("setTimeout", move |_cx, _this, args| {
            let bridge = upgrade_or_fatal(&weak)?;
            timers::set_timeout(&bridge, args)
        });
        cx.define(&global, "setTimeout", set_timeout);

        let weak = self.downgrade();
        let clear_timeout = cx.function("clearTimeout", move |_cx, _this, args| {
            let bridge = upgrade_or_fatal(&weak)?;
            timers::clear_timeout(&bridge, args)
        });
        cx.define(&global, "clearTimeout", clear_timeout);

        cx.define(&global, "globalThis", global.clone());
    }

    // ========================================================================
    // Crate internals
    // ========================================================================

    pub(crate) fn engine(&self) -> &Context {
        &self.inner.engine
    }

    pub(crate) fn running_loop(&self) -> &RunningLoop {
        &self.inner.running
    }

    pub(crate) fn timers(&self) -> &RefCell<TimerRegistry> {
        &self.inner.timers
    }

    pub(crate) fn downgrade(&self) -> WeakBridge {
        WeakBridge(Rc::downgrade(&self.inner))
    }

    pub(crate) fn next_record_id(&self) -> u64 {
        let id = self.inner.next_record.get();
        self.inner.next_record.set(id + 1);
        id
    }

    pub(crate) fn host_name(&self) -> &str {
        &self.inner.config.host_name
    }

    /// Origin stamped on errors raised while evaluating host-supplied source
    pub(crate) fn eval_origin(&self) -> ScriptOrigin {
        ScriptOrigin::new(self.inner.config.eval_file_name.clone(), 1)
    }

    // ========================================================================
    // Host-facing API
    // ========================================================================

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// The engine context, for registering native functions and snippets
    pub fn context(&self) -> &Context {
        &self.inner.engine
    }

    /// Whether a host loop is currently driving this bridge
    pub fn is_running(&self) -> bool {
        self.inner.running.is_running()
    }

    /// Evaluate source text and convert the completion value to the host
    pub fn eval(&self, source: &str) -> Result<HostValue> {
        let value = self.eval_value(source).map_err(marshal::engine_exception_to_host)?;
        self.to_host(&value)
    }

    /// Evaluate source text, keeping the engine completion
    pub fn eval_value(&self, source: &str) -> JsResult<JsValue> {
        self.inner.engine.evaluate(source, self.eval_origin())
    }

    /// Call an engine function or host callable with host arguments
    pub fn call(&self, function: &HostValue, args: &[HostValue]) -> Result<HostValue> {
        match function {
            HostValue::Script(value) if value.is_callable() => self.call_value(value, args),
            HostValue::Callable(callable) => callable.call(args),
            other => Err(Error::type_error(messages::not_callable(other.type_name()))),
        }
    }

    /// Call an engine function with host arguments; `this` is undefined
    pub fn call_value(&self, function: &JsValue, args: &[HostValue]) -> Result<HostValue> {
        let cx = &self.inner.engine;
        let args = args
            .iter()
            .cloned()
            .map(|arg| coercion::to_engine(self, arg))
            .collect::<JsResult<Vec<_>>>()
            .map_err(marshal::engine_exception_to_host)?;
        let value = cx
            .call(function, &JsValue::Undefined, &args)
            .map_err(marshal::engine_exception_to_host)?;
        self.to_host(&value)
    }

    pub fn get_global(&self, name: &str) -> Result<HostValue> {
        let cx = &self.inner.engine;
        let value = cx
            .get(&cx.global(), name)
            .map_err(marshal::engine_exception_to_host)?;
        self.to_host(&value)
    }

    pub fn set_global(&self, name: &str, value: HostValue) -> Result<()> {
        let cx = &self.inner.engine;
        let value = self.to_engine(value)?;
        cx.set(&cx.global(), name, value)
            .map_err(marshal::engine_exception_to_host)
    }

    /// Host value to engine value; awaitables become promises
    pub fn to_engine(&self, value: HostValue) -> Result<JsValue> {
        coercion::to_engine(self, value).map_err(marshal::engine_exception_to_host)
    }

    /// Engine value to host value; promises become host futures
    pub fn to_host(&self, value: &JsValue) -> Result<HostValue> {
        coercion::to_host(self, value)
    }

    /// Host future that settles with an engine thenable's outcome
    pub fn await_engine(&self, thenable: &JsValue) -> Result<HostFuture> {
        coercion::thenable_to_host(self, thenable)
    }

    /// Drive `event_loop` until `body` finishes.
    ///
    /// For the duration of the call the loop is recorded as this bridge's
    /// running loop and the engine job queue drains whenever the loop goes
    /// idle. Afterwards asynchronous operations fail with the missing-loop
    /// error again.
    pub fn run_until_complete<F>(&self, event_loop: &EventLoop, body: F) -> Result<HostValue>
    where
        F: Future<Output = Result<HostValue>> + 'static,
    {
        let _running = self.inner.running.enter(event_loop);
        let hook = event_loop.add_idle_hook(Rc::new(JobDrain::new(
            self.inner.engine.clone(),
            self.inner.config.report_unhandled_rejections,
        )));
        let _hook = HookGuard {
            event_loop,
            id: hook,
        };
        event_loop.block_on(body)
    }

    /// Run `work` on a native thread; the returned promise settles on the
    /// loop thread with its result
    pub fn spawn_background<W>(&self, name: &str, work: W) -> Result<JsValue>
    where
        W: FnOnce() -> Result<Transfer> + Send + 'static,
    {
        drain::spawn_background(self, name, work).map_err(marshal::engine_exception_to_host)
    }

    /// Timers that have neither fired nor been cleared
    pub fn pending_timers(&self) -> usize {
        self.inner.timers.borrow().pending()
    }
}

fn upgrade_or_fatal(weak: &WeakBridge) -> JsResult<Bridge> {
    weak.upgrade()
        .ok_or_else(|| Error::runtime_error("bridge has been dropped").into())
}

struct HookGuard<'a> {
    event_loop: &'a EventLoop,
    id: IdleHookId,
}

impl Drop for HookGuard<'_> {
    fn drop(&mut self) {
        self.event_loop.remove_idle_hook(self.id);
    }
}
