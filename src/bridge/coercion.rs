//! Awaitable coercion
//!
//! Wraps host futures, tasks and coroutines as engine promises, and engine
//! thenables as host futures. Every in-flight wrapping is a
//! [`CoercionRecord`] that settles its target at most once.
//!
//! Chains are never flattened up front. When a settlement value is itself
//! awaitable, the outer record is settled with a fresh wrapping of it and
//! the next link resolves on a later queue turn (an engine job or a host
//! `call_soon` callback), so arbitrarily deep chains use constant stack.

use super::marshal;
use super::Bridge;
use crate::engine::{
    Context, Exception, JsResult, JsValue, Object, ObjectKind, ResolvingFunctions,
};
use crate::error::{Error, Result};
use crate::host::{HostCallable, HostCoroutine, HostFuture, HostTask, HostValue};
use rustc_hash::FxHashSet;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Closed classification of anything that may cross the boundary
#[derive(Clone, Debug)]
pub enum Awaitable {
    HostFuture(HostFuture),
    HostTask(HostTask),
    HostCoroutine(HostCoroutine),
    /// An engine object with a callable `then`
    EngineThenable(JsValue),
    Plain(HostValue),
}

impl Awaitable {
    /// Classify a host value
    pub fn classify(bridge: &Bridge, value: HostValue) -> Awaitable {
        match value {
            HostValue::Future(future) => Awaitable::HostFuture(future),
            HostValue::Task(task) => Awaitable::HostTask(task),
            HostValue::Coroutine(coroutine) => Awaitable::HostCoroutine(coroutine),
            HostValue::Script(value) if is_thenable(bridge, &value) => {
                Awaitable::EngineThenable(value)
            }
            plain => Awaitable::Plain(plain),
        }
    }

    pub fn is_awaitable(&self) -> bool {
        !matches!(self, Awaitable::Plain(_))
    }
}

/// Whether an engine value is an object with a callable `then`
pub fn is_thenable(bridge: &Bridge, value: &JsValue) -> bool {
    if value.as_promise().is_some() {
        return true;
    }
    value.is_object()
        && bridge
            .engine()
            .get(value, "then")
            .map(|then| then.is_callable())
            .unwrap_or(false)
}

/// Which way a record carries its source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToEngine,
    EngineToHost,
}

/// Observed state of a record's source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Pending,
    SettledValue,
    SettledError,
}

enum Target {
    Engine(ResolvingFunctions),
    Host(HostFuture),
}

/// One in-flight bridging of an awaitable.
///
/// The target is released as soon as the record settles; later settlement
/// attempts are no-ops.
pub struct CoercionRecord {
    id: u64,
    direction: Direction,
    state: Cell<SourceState>,
    resolved: Cell<bool>,
    target: RefCell<Option<Target>>,
}

impl CoercionRecord {
    fn new(id: u64, direction: Direction, target: Target) -> Rc<Self> {
        tracing::trace!(record = id, ?direction, "coercion started");
        Rc::new(Self {
            id,
            direction,
            state: Cell::new(SourceState::Pending),
            resolved: Cell::new(false),
            target: RefCell::new(Some(target)),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> SourceState {
        self.state.get()
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.get()
    }

    fn take_target(&self, ok: bool) -> Option<Target> {
        if self.resolved.replace(true) {
            tracing::trace!(record = self.id, "coercion already settled");
            return None;
        }
        self.state.set(if ok {
            SourceState::SettledValue
        } else {
            SourceState::SettledError
        });
        self.target.borrow_mut().take()
    }

    /// Settle an engine-side target. Returns `false` if already settled.
    pub fn settle_engine(&self, bridge: &Bridge, outcome: JsResult<JsValue>) -> bool {
        let Some(target) = self.take_target(outcome.is_ok()) else {
            return false;
        };
        let cx = bridge.engine();
        match (target, outcome) {
            (Target::Engine(resolvers), Ok(value)) => resolvers.resolve(cx, value),
            (Target::Engine(resolvers), Err(Exception::Thrown(reason))) => {
                resolvers.reject(cx, reason)
            }
            (Target::Engine(resolvers), Err(Exception::Fatal(err))) => {
                let reason = marshal::host_error_to_engine(cx, bridge.host_name(), &err);
                resolvers.reject(cx, reason)
            }
            (Target::Host(_), _) => {
                tracing::error!(record = self.id, "engine outcome for a host target");
            }
        }
        true
    }

    /// Settle a host-side target. Returns `false` if already settled.
    pub fn settle_host(&self, outcome: Result<HostValue>) -> bool {
        let Some(target) = self.take_target(outcome.is_ok()) else {
            return false;
        };
        match target {
            Target::Host(future) => {
                // A cancelled target rejects the late result
                if future.complete(outcome).is_err() {
                    tracing::debug!(record = self.id, "target future already done");
                }
            }
            Target::Engine(_) => {
                tracing::error!(record = self.id, "host outcome for an engine target");
            }
        }
        true
    }
}

impl fmt::Debug for CoercionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoercionRecord")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("state", &self.state.get())
            .field("resolved", &self.resolved.get())
            .finish()
    }
}

// ============================================================================
// Host -> engine
// ============================================================================

/// Wrap a host future as an engine promise.
///
/// Settlement always arrives through the future's done callback, so an
/// already-settled future still resolves the promise asynchronously.
pub fn future_to_engine(bridge: &Bridge, future: &HostFuture) -> JsResult<JsValue> {
    bridge.running_loop().current()?;
    let (promise, resolvers) = bridge.engine().new_promise_capability()?;
    let record = CoercionRecord::new(
        bridge.next_record_id(),
        Direction::HostToEngine,
        Target::Engine(resolvers),
    );

    let weak = bridge.downgrade();
    future.add_done_callback(move |settled| {
        let Some(bridge) = weak.upgrade() else { return };
        let Some(outcome) = settled.outcome() else { return };
        let engine_outcome = match outcome {
            Ok(value) => to_engine(&bridge, value),
            Err(err) => Err(Exception::Thrown(marshal::host_error_to_engine(
                bridge.engine(),
                bridge.host_name(),
                &err,
            ))),
        };
        record.settle_engine(&bridge, engine_outcome);
    });
    Ok(promise)
}

/// Wrap a host task as an engine promise
pub fn task_to_engine(bridge: &Bridge, task: &HostTask) -> JsResult<JsValue> {
    future_to_engine(bridge, task.future())
}

/// Start a coroutine as a task and wrap it. Consumes the coroutine.
pub fn coroutine_to_engine(bridge: &Bridge, coroutine: &HostCoroutine) -> JsResult<JsValue> {
    let event_loop = bridge.running_loop().current()?;
    let task = event_loop
        .create_task(coroutine.clone())
        .map_err(|err| marshal::host_error_to_exception(bridge.engine(), bridge.host_name(), err))?;
    task_to_engine(bridge, &task)
}

// ============================================================================
// Engine -> host
// ============================================================================

/// Wrap an engine thenable as a host future
pub fn thenable_to_host(bridge: &Bridge, thenable: &JsValue) -> Result<HostFuture> {
    let event_loop = bridge.running_loop().current()?;
    let cx = bridge.engine();
    let promise = cx
        .promise_resolve(thenable)
        .map_err(marshal::engine_exception_to_host)?;

    let future = event_loop.create_future();
    let record = CoercionRecord::new(
        bridge.next_record_id(),
        Direction::EngineToHost,
        Target::Host(future.clone()),
    );

    let on_fulfilled = {
        let weak = bridge.downgrade();
        let record = record.clone();
        Rc::new(move |_: &Context, value: JsValue| -> JsResult<JsValue> {
            if let Some(bridge) = weak.upgrade() {
                settle_host_chained(&bridge, &record, to_host(&bridge, &value));
            }
            Ok(JsValue::Undefined)
        })
    };
    let on_rejected = {
        let weak = bridge.downgrade();
        Rc::new(move |_: &Context, reason: JsValue| -> JsResult<JsValue> {
            if weak.upgrade().is_some() {
                record.settle_host(Err(marshal::thrown_value_to_host(&reason)));
            }
            Ok(JsValue::Undefined)
        })
    };
    cx.react(&promise, on_fulfilled, on_rejected)
        .map_err(marshal::engine_exception_to_host)?;
    Ok(future)
}

/// Settle a host-side record, deferring to the next link when the value is
/// itself a host awaitable
fn settle_host_chained(bridge: &Bridge, record: &Rc<CoercionRecord>, outcome: Result<HostValue>) {
    let inner = match outcome {
        Ok(HostValue::Future(future)) => future,
        Ok(HostValue::Task(task)) => task.future().clone(),
        Ok(HostValue::Coroutine(coroutine)) => {
            let started = bridge
                .running_loop()
                .current()
                .and_then(|event_loop| event_loop.create_task(coroutine));
            match started {
                Ok(task) => task.future().clone(),
                Err(err) => {
                    record.settle_host(Err(err));
                    return;
                }
            }
        }
        other => {
            record.settle_host(other);
            return;
        }
    };

    let weak = bridge.downgrade();
    let record = record.clone();
    inner.add_done_callback(move |inner| {
        let Some(bridge) = weak.upgrade() else { return };
        if let Some(outcome) = inner.outcome() {
            settle_host_chained(&bridge, &record, outcome);
        }
    });
}

// ============================================================================
// Value conversion
// ============================================================================

/// Host value to engine value. Host awaitables become promises.
pub fn to_engine(bridge: &Bridge, value: HostValue) -> JsResult<JsValue> {
    match Awaitable::classify(bridge, value) {
        Awaitable::HostFuture(future) => future_to_engine(bridge, &future),
        Awaitable::HostTask(task) => task_to_engine(bridge, &task),
        Awaitable::HostCoroutine(coroutine) => coroutine_to_engine(bridge, &coroutine),
        Awaitable::EngineThenable(thenable) => Ok(thenable),
        Awaitable::Plain(value) => plain_to_engine(bridge, value),
    }
}

fn plain_to_engine(bridge: &Bridge, value: HostValue) -> JsResult<JsValue> {
    Ok(match value {
        HostValue::None => JsValue::Null,
        HostValue::Bool(b) => JsValue::Boolean(b),
        HostValue::Int(i) => JsValue::Number(i as f64),
        HostValue::Float(n) => JsValue::Number(n),
        HostValue::Str(s) => JsValue::String(s),
        HostValue::List(items) => {
            let items = items
                .into_iter()
                .map(|item| to_engine(bridge, item))
                .collect::<JsResult<Vec<_>>>()?;
            bridge.engine().new_array(items)
        }
        HostValue::Callable(callable) => host_callable_to_engine(bridge, callable),
        HostValue::Script(value) => value,
        awaitable => return to_engine(bridge, awaitable),
    })
}

/// Engine value to host value. Promises become host futures; objects with
/// no host form stay opaque.
///
/// An array that contains itself converts to an opaque `Script` value at the
/// point where it repeats.
pub fn to_host(bridge: &Bridge, value: &JsValue) -> Result<HostValue> {
    let mut ancestors = FxHashSet::default();
    to_host_inner(bridge, value, &mut ancestors)
}

fn to_host_inner(
    bridge: &Bridge,
    value: &JsValue,
    ancestors: &mut FxHashSet<*const RefCell<Object>>,
) -> Result<HostValue> {
    let obj = match value {
        JsValue::Undefined | JsValue::Null => return Ok(HostValue::None),
        JsValue::Boolean(b) => return Ok(HostValue::Bool(*b)),
        JsValue::Number(n) => return Ok(HostValue::Float(*n)),
        JsValue::String(s) => return Ok(HostValue::Str(s.clone())),
        JsValue::Object(obj) => obj,
    };

    if let Some(callable) = value.host_data::<HostCallable>() {
        return Ok(HostValue::Callable((*callable).clone()));
    }

    let items = match obj.borrow().kind {
        ObjectKind::Array(ref items) => Some(items.clone()),
        ObjectKind::Promise(_) => None,
        _ => return Ok(HostValue::Script(value.clone())),
    };
    let Some(items) = items else {
        return thenable_to_host(bridge, value).map(HostValue::Future);
    };

    let key = Rc::as_ptr(obj);
    if !ancestors.insert(key) {
        tracing::debug!("cyclic array kept opaque");
        return Ok(HostValue::Script(value.clone()));
    }
    let converted = items
        .iter()
        .map(|item| to_host_inner(bridge, item, ancestors))
        .collect::<Result<Vec<_>>>()
        .map(HostValue::List);
    ancestors.remove(&key);
    converted
}

/// Expose a host callable to engine code.
///
/// Arguments are converted positionally, awaitable results become promises
/// and host errors are thrown as engine errors.
pub fn host_callable_to_engine(bridge: &Bridge, callable: HostCallable) -> JsValue {
    let weak = bridge.downgrade();
    let target = callable.clone();
    let function = bridge.engine().function(callable.name(), move |cx, _this, args| {
        let Some(bridge) = weak.upgrade() else {
            return Err(Exception::Fatal(Error::runtime_error("bridge has been dropped")));
        };
        let host_args = args
            .iter()
            .map(|arg| to_host(&bridge, arg))
            .collect::<Result<Vec<_>>>()
            .map_err(|err| marshal::host_error_to_exception(cx, bridge.host_name(), err))?;
        match target.call(&host_args) {
            Ok(result) => to_engine(&bridge, result),
            Err(err) => Err(marshal::host_error_to_exception(cx, bridge.host_name(), err)),
        }
    });
    if let JsValue::Object(ref obj) = function {
        obj.borrow_mut().host_data = Some(Rc::new(callable));
    }
    function
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PromiseState;
    use crate::host::{EventLoop, HostException};

    #[test]
    fn test_engine_record_settles_once() {
        let bridge = Bridge::new();
        let event_loop = EventLoop::new();
        let _running = bridge.running_loop().enter(&event_loop);
        let cx = bridge.engine();
        let (promise, resolvers) = cx.new_promise_capability().unwrap();
        let record = CoercionRecord::new(1, Direction::HostToEngine, Target::Engine(resolvers));

        assert!(record.settle_engine(&bridge, Ok(JsValue::Number(1.0))));
        assert!(!record.settle_engine(&bridge, Ok(JsValue::Number(2.0))));
        assert!(!record.settle_engine(&bridge, Err(Exception::Thrown(JsValue::from("late")))));
        assert!(record.is_resolved());
        assert_eq!(record.state(), SourceState::SettledValue);

        cx.run_jobs();
        let slots = promise.as_promise().unwrap();
        assert_eq!(slots.borrow().state, PromiseState::Fulfilled);
        assert_eq!(slots.borrow().result.to_number(), 1.0);
    }

    #[test]
    fn test_host_record_settles_once() {
        let event_loop = EventLoop::new();
        let future = event_loop.create_future();
        let record = CoercionRecord::new(2, Direction::EngineToHost, Target::Host(future.clone()));

        assert!(record.settle_host(Err(HostException::runtime_error("first").into())));
        assert!(!record.settle_host(Ok(HostValue::Int(2))));
        assert_eq!(record.state(), SourceState::SettledError);
        assert_eq!(future.outcome().unwrap().unwrap_err().host_message(), "first");
    }

    #[test]
    fn test_late_result_for_cancelled_target_is_dropped() {
        let event_loop = EventLoop::new();
        let future = event_loop.create_future();
        let record = CoercionRecord::new(3, Direction::EngineToHost, Target::Host(future.clone()));

        assert!(future.cancel());
        assert!(record.settle_host(Ok(HostValue::Int(5))));
        assert!(record.is_resolved());
        assert!(!record.settle_host(Ok(HostValue::Int(6))));
        let err = future.outcome().unwrap().unwrap_err();
        assert_eq!(err.host_type_name(), "CancelledError");
    }

    #[test]
    fn test_self_containing_array_stays_opaque_where_it_repeats() {
        let bridge = Bridge::new();
        let cx = bridge.engine();
        let array = cx.new_array(vec![JsValue::Number(1.0)]);
        if let JsValue::Object(ref obj) = array {
            obj.borrow_mut().kind = ObjectKind::Array(vec![JsValue::Number(1.0), array.clone()]);
        }
        match to_host(&bridge, &array).unwrap() {
            HostValue::List(items) => {
                assert_eq!(items[0], HostValue::Float(1.0));
                assert!(matches!(items[1], HostValue::Script(ref v) if v.strict_equals(&array)));
            }
            other => panic!("expected a list, got {:?}", other),
        }
    }

    #[test]
    fn test_shared_array_converts_at_every_position() {
        let bridge = Bridge::new();
        let cx = bridge.engine();
        let inner = cx.new_array(vec![JsValue::from("x")]);
        let outer = cx.new_array(vec![inner.clone(), inner]);
        let expected = HostValue::List(vec![
            HostValue::List(vec![HostValue::from("x")]),
            HostValue::List(vec![HostValue::from("x")]),
        ]);
        assert_eq!(to_host(&bridge, &outer).unwrap(), expected);
    }
}
