//! Host Event Loop
//!
//! A single-threaded cooperative executor with a virtual millisecond clock.
//!
//! Each iteration of the loop:
//! 1. moves task wakeups and off-thread completions onto the ready queue,
//! 2. moves due timers onto the ready queue (earliest deadline first, FIFO
//!    among equal deadlines),
//! 3. runs the current batch of ready callbacks, giving the idle hooks a turn
//!    after each one,
//! 4. when nothing was ready, runs the idle hooks, then advances the clock to
//!    the next timer, then blocks on outstanding off-thread work, and stops
//!    when there is none.

use super::coroutine::{HostCoroutine, HostTask, LocalBoxFuture};
use super::future::HostFuture;
use super::value::{HostException, HostValue, Transfer};
use crate::error::{messages, Error, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::thread;
use std::time::Duration;

type Callback = Box<dyn FnOnce()>;

pub(crate) type WeakLoop = Weak<LoopInner>;

/// Work the loop performs whenever it is about to go idle.
///
/// Returns the number of units of work done; zero means the hook had
/// nothing to do.
pub trait IdleHook {
    fn run_before_idle(&self) -> usize;
}

/// Registration token for an idle hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdleHookId(u64);

/// Event loop statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoopStats {
    /// Loop iterations
    pub iterations: u64,
    /// Ready callbacks executed
    pub callbacks_run: u64,
    /// Timers that reached their deadline
    pub timers_fired: u64,
    /// Tasks started
    pub tasks_spawned: u64,
    /// Task polls
    pub task_polls: u64,
    /// Times the virtual clock jumped forward
    pub clock_advances: u64,
    /// Off-thread results received
    pub remote_completions: u64,
    /// Units of work reported by idle hooks
    pub idle_work: u64,
}

struct TimerEntry {
    fire_at: u64,
    seq: u64,
    callback: Callback,
    cancelled: Rc<Cell<bool>>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the BinaryHeap pops the earliest deadline first
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Handle to a scheduled `call_later` callback
#[derive(Debug, Clone)]
pub struct TimerHandle {
    when: u64,
    cancelled: Rc<Cell<bool>>,
}

impl TimerHandle {
    /// Prevent the callback from running
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled.get()
    }

    /// Virtual time at which the callback is due
    pub fn when(&self) -> u64 {
        self.when
    }
}

struct TaskSlot {
    body: Option<LocalBoxFuture<Result<HostValue>>>,
    result: HostFuture,
    waker: Waker,
}

struct TaskWaker {
    id: u64,
    tx: Sender<u64>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        let _ = self.tx.send(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let _ = self.tx.send(self.id);
    }
}

struct RemoteCompletion {
    id: u64,
    outcome: Result<Transfer>,
}

pub(crate) struct LoopInner {
    now: Cell<u64>,
    next_id: Cell<u64>,
    ready: RefCell<VecDeque<Callback>>,
    timers: RefCell<BinaryHeap<TimerEntry>>,
    tasks: RefCell<FxHashMap<u64, TaskSlot>>,
    wake_tx: Sender<u64>,
    wake_rx: Receiver<u64>,
    remote_tx: Sender<RemoteCompletion>,
    remote_rx: Receiver<RemoteCompletion>,
    remote_pending: RefCell<FxHashMap<u64, HostFuture>>,
    idle_hooks: RefCell<Vec<(IdleHookId, Rc<dyn IdleHook>)>>,
    running: Cell<bool>,
    stats: RefCell<LoopStats>,
}

/// The host event loop
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    /// Create a new, idle event loop at virtual time zero
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = channel::unbounded();
        let (remote_tx, remote_rx) = channel::unbounded();
        Self {
            inner: Rc::new(LoopInner {
                now: Cell::new(0),
                next_id: Cell::new(1),
                ready: RefCell::new(VecDeque::new()),
                timers: RefCell::new(BinaryHeap::new()),
                tasks: RefCell::new(FxHashMap::default()),
                wake_tx,
                wake_rx,
                remote_tx,
                remote_rx,
                remote_pending: RefCell::new(FxHashMap::default()),
                idle_hooks: RefCell::new(Vec::new()),
                running: Cell::new(false),
                stats: RefCell::new(LoopStats::default()),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakLoop {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &WeakLoop) -> Option<EventLoop> {
        weak.upgrade().map(|inner| EventLoop { inner })
    }

    /// Whether both handles refer to the same loop
    pub fn ptr_eq(&self, other: &EventLoop) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Current virtual time in milliseconds
    pub fn time(&self) -> u64 {
        self.inner.now.get()
    }

    /// Whether the loop is currently being driven
    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    /// Snapshot of the loop statistics
    pub fn stats(&self) -> LoopStats {
        self.inner.stats.borrow().clone()
    }

    fn next_id(&self) -> u64 {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        id
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    /// Run `callback` on a later iteration, after already-ready callbacks
    pub fn call_soon<F>(&self, callback: F)
    where
        F: FnOnce() + 'static,
    {
        self.inner.ready.borrow_mut().push_back(Box::new(callback));
    }

    /// Run `callback` once `delay_ms` of virtual time has elapsed
    pub fn call_later<F>(&self, delay_ms: u64, callback: F) -> TimerHandle
    where
        F: FnOnce() + 'static,
    {
        let fire_at = self.time().saturating_add(delay_ms);
        let cancelled = Rc::new(Cell::new(false));
        self.inner.timers.borrow_mut().push(TimerEntry {
            fire_at,
            seq: self.next_id(),
            callback: Box::new(callback),
            cancelled: cancelled.clone(),
        });
        tracing::trace!(fire_at, "timer scheduled");
        TimerHandle {
            when: fire_at,
            cancelled,
        }
    }

    /// Create a pending future owned by this loop
    pub fn create_future(&self) -> HostFuture {
        HostFuture::new(self.next_id(), self.downgrade())
    }

    /// Start a coroutine as a task. Consumes the coroutine.
    pub fn create_task(&self, coroutine: HostCoroutine) -> Result<HostTask> {
        let body = coroutine.take()?;
        Ok(self.spawn_boxed(coroutine.name(), body))
    }

    /// Start a future as a task
    pub fn spawn<F>(&self, name: &str, body: F) -> HostTask
    where
        F: Future<Output = Result<HostValue>> + 'static,
    {
        self.spawn_boxed(name, Box::pin(body))
    }

    fn spawn_boxed(&self, name: &str, body: LocalBoxFuture<Result<HostValue>>) -> HostTask {
        let id = self.next_id();
        let result = self.create_future();
        let waker = Waker::from(Arc::new(TaskWaker {
            id,
            tx: self.inner.wake_tx.clone(),
        }));
        self.inner.tasks.borrow_mut().insert(
            id,
            TaskSlot {
                body: Some(body),
                result: result.clone(),
                waker: waker.clone(),
            },
        );
        self.inner.stats.borrow_mut().tasks_spawned += 1;
        tracing::debug!(task = id, name, "task spawned");
        waker.wake();
        HostTask::new(id, name, result)
    }

    pub(crate) fn drop_task(&self, id: u64) {
        let removed = self.inner.tasks.borrow_mut().remove(&id);
        if removed.is_some() {
            tracing::debug!(task = id, "task dropped");
        }
    }

    /// A future fulfilled with `None` after `delay_ms`
    pub fn sleep(&self, delay_ms: u64) -> HostFuture {
        let future = self.create_future();
        let done = future.clone();
        self.call_later(delay_ms, move || {
            // Ignored when the sleeper was cancelled first
            let _ = done.set_result(HostValue::None);
        });
        future
    }

    /// Wait for an awaitable with a deadline.
    ///
    /// The returned future settles with the inner outcome, or with
    /// `TimeoutError` once `timeout_ms` passes first, in which case the
    /// inner work is cancelled.
    pub fn wait_for(&self, awaitable: HostValue, timeout_ms: u64) -> Result<HostFuture> {
        let (inner, task) = match awaitable {
            HostValue::Future(future) => (future, None),
            HostValue::Task(task) => (task.future().clone(), Some(task)),
            HostValue::Coroutine(coroutine) => {
                let task = self.create_task(coroutine)?;
                (task.future().clone(), Some(task))
            }
            other => {
                return Err(Error::type_error(messages::not_awaitable(other.type_name())));
            }
        };

        let outer = self.create_future();
        let timeout = {
            let outer = outer.clone();
            let inner = inner.clone();
            self.call_later(timeout_ms, move || {
                if outer.done() {
                    return;
                }
                match task {
                    Some(task) => task.cancel(),
                    None => inner.cancel(),
                };
                let _ = outer.set_exception(HostException::timeout().into());
            })
        };
        {
            let outer = outer.clone();
            inner.add_done_callback(move |inner| {
                timeout.cancel();
                if let Some(outcome) = inner.outcome() {
                    if !outer.done() {
                        let _ = outer.complete(outcome);
                    }
                }
            });
        }
        Ok(outer)
    }

    /// Run `work` on a native thread.
    ///
    /// The returned future is settled on the loop thread once the work
    /// finishes; a panic in `work` becomes a host `RuntimeError`.
    pub fn spawn_blocking<W>(&self, name: &str, work: W) -> HostFuture
    where
        W: FnOnce() -> Result<Transfer> + Send + 'static,
    {
        let future = self.create_future();
        let id = future.id();
        self.inner
            .remote_pending
            .borrow_mut()
            .insert(id, future.clone());

        let tx = self.inner.remote_tx.clone();
        let spawned = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(work))
                    .unwrap_or_else(|_| Err(Error::runtime_error(messages::BACKGROUND_PANICKED)));
                let _ = tx.send(RemoteCompletion { id, outcome });
            });

        if let Err(err) = spawned {
            self.inner.remote_pending.borrow_mut().remove(&id);
            let _ = future.set_exception(Error::runtime_error(err.to_string()));
        }
        future
    }

    // ========================================================================
    // Idle hooks
    // ========================================================================

    pub fn add_idle_hook(&self, hook: Rc<dyn IdleHook>) -> IdleHookId {
        let id = IdleHookId(self.next_id());
        self.inner.idle_hooks.borrow_mut().push((id, hook));
        id
    }

    pub fn remove_idle_hook(&self, id: IdleHookId) -> bool {
        let mut hooks = self.inner.idle_hooks.borrow_mut();
        let before = hooks.len();
        hooks.retain(|(hook_id, _)| *hook_id != id);
        hooks.len() != before
    }

    fn run_idle_hooks(&self) -> usize {
        let hooks: Vec<Rc<dyn IdleHook>> = self
            .inner
            .idle_hooks
            .borrow()
            .iter()
            .map(|(_, hook)| hook.clone())
            .collect();
        let work: usize = hooks.iter().map(|hook| hook.run_before_idle()).sum();
        self.inner.stats.borrow_mut().idle_work += work as u64;
        work
    }

    // ========================================================================
    // Driving
    // ========================================================================

    /// Drive the loop until `future` settles and return its outcome
    pub fn run_until_complete(&self, future: HostFuture) -> Result<HostValue> {
        let _running = self.enter_running()?;
        while !future.done() {
            if !self.run_once() {
                break;
            }
        }
        future
            .outcome()
            .unwrap_or_else(|| Err(Error::runtime_error(messages::LOOP_STOPPED)))
    }

    /// Spawn `body` as the main task and drive the loop until it finishes
    pub fn block_on<F>(&self, body: F) -> Result<HostValue>
    where
        F: Future<Output = Result<HostValue>> + 'static,
    {
        let task = self.spawn("main", body);
        self.run_until_complete(task.future().clone())
    }

    /// Drive the loop until it has no work left
    pub fn run_until_idle(&self) {
        if let Ok(_running) = self.enter_running() {
            while self.run_once() {}
        }
    }

    fn enter_running(&self) -> Result<RunningFlag> {
        if self.inner.running.replace(true) {
            return Err(Error::runtime_error(messages::LOOP_ALREADY_RUNNING));
        }
        Ok(RunningFlag {
            event_loop: self.clone(),
        })
    }

    /// One loop iteration. Returns `false` once there is nothing left to do.
    fn run_once(&self) -> bool {
        self.inner.stats.borrow_mut().iterations += 1;
        self.collect_wakeups();
        self.collect_remote();
        self.collect_due_timers();

        let batch: Vec<Callback> = self.inner.ready.borrow_mut().drain(..).collect();
        if !batch.is_empty() {
            for callback in batch {
                callback();
                self.inner.stats.borrow_mut().callbacks_run += 1;
                self.run_idle_hooks();
            }
            return true;
        }

        if self.run_idle_hooks() > 0 {
            return true;
        }
        if !self.inner.wake_rx.is_empty() || !self.inner.ready.borrow().is_empty() {
            return true;
        }

        let outstanding = !self.inner.remote_pending.borrow().is_empty();
        if let Some(fire_at) = self.next_deadline() {
            let now = self.time();
            if outstanding && fire_at > now {
                // Give background work up to the virtual delay in real time
                match self
                    .inner
                    .remote_rx
                    .recv_timeout(Duration::from_millis(fire_at - now))
                {
                    Ok(completion) => {
                        self.finish_remote(completion);
                        return true;
                    }
                    Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
                }
            }
            if fire_at > now {
                tracing::trace!(from = now, to = fire_at, "advancing clock");
                self.inner.now.set(fire_at);
                self.inner.stats.borrow_mut().clock_advances += 1;
            }
            return true;
        }

        if outstanding {
            tracing::trace!("blocking on background work");
            if let Ok(completion) = self.inner.remote_rx.recv() {
                self.finish_remote(completion);
                return true;
            }
        }
        false
    }

    fn collect_wakeups(&self) {
        let mut seen = FxHashSet::default();
        while let Ok(id) = self.inner.wake_rx.try_recv() {
            if seen.insert(id) {
                let weak = self.downgrade();
                self.call_soon(move || {
                    if let Some(event_loop) = EventLoop::upgrade(&weak) {
                        event_loop.poll_task(id);
                    }
                });
            }
        }
    }

    fn collect_remote(&self) {
        while let Ok(completion) = self.inner.remote_rx.try_recv() {
            self.finish_remote(completion);
        }
    }

    fn finish_remote(&self, completion: RemoteCompletion) {
        let future = self.inner.remote_pending.borrow_mut().remove(&completion.id);
        self.inner.stats.borrow_mut().remote_completions += 1;
        if let Some(future) = future {
            let _ = future.complete(completion.outcome.map(HostValue::from));
        }
    }

    fn collect_due_timers(&self) {
        let now = self.time();
        loop {
            let entry = {
                let mut timers = self.inner.timers.borrow_mut();
                match timers.peek() {
                    Some(top) if top.fire_at <= now => timers.pop(),
                    _ => None,
                }
            };
            let Some(entry) = entry else { break };
            if entry.cancelled.get() {
                continue;
            }
            self.inner.stats.borrow_mut().timers_fired += 1;
            self.inner.ready.borrow_mut().push_back(entry.callback);
        }
    }

    /// Earliest live timer deadline, discarding cancelled entries
    fn next_deadline(&self) -> Option<u64> {
        let mut timers = self.inner.timers.borrow_mut();
        while let Some(top) = timers.peek() {
            if top.cancelled.get() {
                timers.pop();
            } else {
                return Some(top.fire_at);
            }
        }
        None
    }

    fn poll_task(&self, id: u64) {
        let (mut body, result, waker) = {
            let mut tasks = self.inner.tasks.borrow_mut();
            let Some(slot) = tasks.get_mut(&id) else { return };
            if slot.result.done() {
                drop(tasks.remove(&id));
                return;
            }
            match slot.body.take() {
                Some(body) => (body, slot.result.clone(), slot.waker.clone()),
                None => return,
            }
        };

        self.inner.stats.borrow_mut().task_polls += 1;
        let mut cx = Context::from_waker(&waker);
        match body.as_mut().poll(&mut cx) {
            Poll::Ready(outcome) => {
                let removed = self.inner.tasks.borrow_mut().remove(&id);
                drop(removed);
                tracing::debug!(task = id, ok = outcome.is_ok(), "task finished");
                if !result.done() {
                    let _ = result.complete(outcome);
                }
            }
            Poll::Pending => {
                if let Some(slot) = self.inner.tasks.borrow_mut().get_mut(&id) {
                    slot.body = Some(body);
                }
            }
        }
    }
}

struct RunningFlag {
    event_loop: EventLoop,
}

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.event_loop.inner.running.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_soon_is_fifo() {
        let event_loop = EventLoop::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let log = log.clone();
            event_loop.call_soon(move || log.borrow_mut().push(i));
        }
        event_loop.run_until_idle();
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_timers_fire_by_deadline_then_registration() {
        let event_loop = EventLoop::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        for (name, delay) in [("b", 20), ("a1", 10), ("a2", 10)] {
            let log = log.clone();
            event_loop.call_later(delay, move || log.borrow_mut().push(name));
        }
        event_loop.run_until_idle();
        assert_eq!(*log.borrow(), vec!["a1", "a2", "b"]);
        assert_eq!(event_loop.time(), 20);
    }

    #[test]
    fn test_cancelled_timer_never_runs() {
        let event_loop = EventLoop::new();
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        let handle = event_loop.call_later(5, move || f.set(true));
        handle.cancel();
        event_loop.run_until_idle();
        assert!(!fired.get());
        assert_eq!(event_loop.time(), 0);
    }

    #[test]
    fn test_sleep_advances_virtual_time() {
        let event_loop = EventLoop::new();
        let lp = event_loop.clone();
        let result = event_loop
            .block_on(async move {
                lp.sleep(100).await?;
                lp.sleep(50).await?;
                Ok(HostValue::Int(lp.time() as i64))
            })
            .unwrap();
        assert_eq!(result, HostValue::Int(150));
    }

    #[test]
    fn test_wait_for_times_out() {
        let event_loop = EventLoop::new();
        let slow = event_loop.sleep(300);
        let waited = event_loop.wait_for(HostValue::Future(slow.clone()), 190).unwrap();
        let err = event_loop.run_until_complete(waited).unwrap_err();
        assert_eq!(err.host_type_name(), "TimeoutError");
        assert!(slow.cancelled());
        assert_eq!(event_loop.time(), 190);
    }

    #[test]
    fn test_wait_for_passes_through_result() {
        let event_loop = EventLoop::new();
        let lp = event_loop.clone();
        let coro = HostCoroutine::new("quick", async move {
            lp.sleep(100).await?;
            Ok(HostValue::Str("done".into()))
        });
        let waited = event_loop.wait_for(HostValue::Coroutine(coro), 300).unwrap();
        assert_eq!(
            event_loop.run_until_complete(waited).unwrap(),
            HostValue::Str("done".into())
        );
    }

    #[test]
    fn test_pending_future_with_empty_loop_stops() {
        let event_loop = EventLoop::new();
        let never = event_loop.create_future();
        let err = event_loop.run_until_complete(never).unwrap_err();
        assert_eq!(err.host_message(), messages::LOOP_STOPPED);
    }

    #[test]
    fn test_run_is_not_reentrant() {
        let event_loop = EventLoop::new();
        let inner = event_loop.clone();
        let nested = Rc::new(RefCell::new(None));
        let slot = nested.clone();
        event_loop.call_soon(move || {
            let future = inner.create_future();
            *slot.borrow_mut() = Some(inner.run_until_complete(future));
        });
        event_loop.run_until_idle();
        let err = nested.borrow_mut().take().unwrap().unwrap_err();
        assert_eq!(err.host_message(), messages::LOOP_ALREADY_RUNNING);
    }

    #[test]
    fn test_spawn_blocking_settles_on_loop_thread() {
        let event_loop = EventLoop::new();
        let future = event_loop.spawn_blocking("worker", || Ok(Transfer::Int(42)));
        assert!(!future.done());
        assert_eq!(event_loop.run_until_complete(future).unwrap(), HostValue::Int(42));
        assert_eq!(event_loop.stats().remote_completions, 1);
    }

    #[test]
    fn test_spawn_blocking_panic_becomes_runtime_error() {
        let event_loop = EventLoop::new();
        let future = event_loop.spawn_blocking("boom", || panic!("boom"));
        let err = event_loop.run_until_complete(future).unwrap_err();
        assert_eq!(err.host_type_name(), "RuntimeError");
        assert_eq!(err.host_message(), messages::BACKGROUND_PANICKED);
    }

    struct CountingHook {
        budget: Cell<usize>,
    }

    impl IdleHook for CountingHook {
        fn run_before_idle(&self) -> usize {
            let left = self.budget.get();
            if left > 0 {
                self.budget.set(left - 1);
                1
            } else {
                0
            }
        }
    }

    #[test]
    fn test_idle_hooks_run_until_they_report_no_work() {
        let event_loop = EventLoop::new();
        let hook = Rc::new(CountingHook {
            budget: Cell::new(3),
        });
        let id = event_loop.add_idle_hook(hook.clone());
        event_loop.run_until_idle();
        assert_eq!(hook.budget.get(), 0);
        assert!(event_loop.remove_idle_hook(id));
        assert!(!event_loop.remove_idle_hook(id));
    }
}
