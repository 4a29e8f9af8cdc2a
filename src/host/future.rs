//! Host futures
//!
//! A [`HostFuture`] is a single-assignment result cell owned by one
//! [`EventLoop`]. Completion callbacks never run synchronously: they are
//! always handed to the loop through `call_soon`, including callbacks added
//! after the future has already settled.

use super::event_loop::{EventLoop, WeakLoop};
use super::value::{HostException, HostValue};
use crate::error::{messages, Error, Result};
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// Callback invoked (through the loop) once a future settles
pub type DoneCallback = Box<dyn FnOnce(&HostFuture)>;

struct FutureState {
    outcome: Option<Result<HostValue>>,
    cancelled: bool,
    callbacks: Vec<DoneCallback>,
    wakers: Vec<Waker>,
}

struct FutureInner {
    id: u64,
    event_loop: WeakLoop,
    state: RefCell<FutureState>,
}

/// A pending host result, settled exactly once
#[derive(Clone)]
pub struct HostFuture {
    inner: Rc<FutureInner>,
}

impl HostFuture {
    pub(crate) fn new(id: u64, event_loop: WeakLoop) -> Self {
        Self {
            inner: Rc::new(FutureInner {
                id,
                event_loop,
                state: RefCell::new(FutureState {
                    outcome: None,
                    cancelled: false,
                    callbacks: Vec::new(),
                    wakers: Vec::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The loop this future belongs to, if it is still alive
    pub fn event_loop(&self) -> Option<EventLoop> {
        EventLoop::upgrade(&self.inner.event_loop)
    }

    pub fn done(&self) -> bool {
        self.inner.state.borrow().outcome.is_some()
    }

    pub fn cancelled(&self) -> bool {
        self.inner.state.borrow().cancelled
    }

    /// The settled outcome, or `None` while pending
    pub fn outcome(&self) -> Option<Result<HostValue>> {
        self.inner.state.borrow().outcome.clone()
    }

    /// Fulfill the future
    pub fn set_result(&self, value: HostValue) -> Result<()> {
        self.complete(Ok(value))
    }

    /// Reject the future
    pub fn set_exception(&self, error: Error) -> Result<()> {
        self.complete(Err(error))
    }

    /// Settle with an outcome. Fails with `InvalidStateError` if already done.
    pub fn complete(&self, outcome: Result<HostValue>) -> Result<()> {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.outcome.is_some() {
                return Err(HostException::invalid_state(messages::INVALID_STATE).into());
            }
            state.outcome = Some(outcome);
        }
        self.settled();
        Ok(())
    }

    /// Cancel a pending future. Returns `false` if it had already settled.
    pub fn cancel(&self) -> bool {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.outcome.is_some() {
                return false;
            }
            state.cancelled = true;
            state.outcome = Some(Err(HostException::cancelled().into()));
        }
        tracing::trace!(future = self.inner.id, "future cancelled");
        self.settled();
        true
    }

    /// Register a completion callback.
    ///
    /// The callback is scheduled on the owning loop; if the future is
    /// already done it is scheduled right away.
    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: FnOnce(&HostFuture) + 'static,
    {
        let done = {
            let mut state = self.inner.state.borrow_mut();
            if state.outcome.is_none() {
                state.callbacks.push(Box::new(callback));
                return;
            }
            Box::new(callback) as DoneCallback
        };
        self.schedule(done);
    }

    /// Whether both handles refer to the same future
    pub fn ptr_eq(&self, other: &HostFuture) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    fn settled(&self) {
        let (callbacks, wakers) = {
            let mut state = self.inner.state.borrow_mut();
            (
                std::mem::take(&mut state.callbacks),
                std::mem::take(&mut state.wakers),
            )
        };
        for callback in callbacks {
            self.schedule(callback);
        }
        for waker in wakers {
            waker.wake();
        }
    }

    fn schedule(&self, callback: DoneCallback) {
        match self.event_loop() {
            Some(event_loop) => {
                let future = self.clone();
                event_loop.call_soon(move || callback(&future));
            }
            None => {
                tracing::debug!(future = self.inner.id, "loop gone, dropping done callback");
            }
        }
    }
}

impl Future for HostFuture {
    type Output = Result<HostValue>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state.borrow_mut();
        if let Some(ref outcome) = state.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl fmt::Debug for HostFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        let status = match state.outcome {
            None => "pending",
            Some(_) if state.cancelled => "cancelled",
            Some(Ok(_)) => "finished",
            Some(Err(_)) => "failed",
        };
        write!(f, "<Future #{} {}>", self.inner.id, status)
    }
}
