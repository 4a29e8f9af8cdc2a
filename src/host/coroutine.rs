//! Host coroutines and tasks

use super::future::HostFuture;
use super::value::HostValue;
use crate::error::{Error, Result};
use std::cell::RefCell;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

/// A boxed, non-`Send` future
pub type LocalBoxFuture<T> = Pin<Box<dyn Future<Output = T>>>;

struct CoroutineInner {
    name: String,
    body: RefCell<Option<LocalBoxFuture<Result<HostValue>>>>,
}

/// A single-use unit of host asynchronous work.
///
/// The first consumer (an `await`, a task, or a coercion into the engine)
/// takes the body; any later attempt fails with [`Error::AlreadyConsumed`].
#[derive(Clone)]
pub struct HostCoroutine {
    inner: Rc<CoroutineInner>,
}

impl HostCoroutine {
    pub fn new<F>(name: &str, body: F) -> Self
    where
        F: Future<Output = Result<HostValue>> + 'static,
    {
        Self {
            inner: Rc::new(CoroutineInner {
                name: name.to_string(),
                body: RefCell::new(Some(Box::pin(body))),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_consumed(&self) -> bool {
        self.inner.body.borrow().is_none()
    }

    /// Take the body out of the coroutine
    pub fn take(&self) -> Result<LocalBoxFuture<Result<HostValue>>> {
        self.inner
            .body
            .borrow_mut()
            .take()
            .ok_or(Error::AlreadyConsumed)
    }

    pub fn ptr_eq(&self, other: &HostCoroutine) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for HostCoroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<coroutine {}>", self.inner.name)
    }
}

/// Future returned by awaiting a [`HostCoroutine`] directly
pub struct CoroutineRun {
    body: Option<Result<LocalBoxFuture<Result<HostValue>>>>,
}

impl Future for CoroutineRun {
    type Output = Result<HostValue>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.body.as_mut() {
            Some(Ok(body)) => {
                let outcome = body.as_mut().poll(cx);
                if outcome.is_ready() {
                    self.body = None;
                }
                outcome
            }
            Some(Err(_)) => match self.body.take() {
                Some(Err(err)) => Poll::Ready(Err(err)),
                _ => Poll::Ready(Err(Error::AlreadyConsumed)),
            },
            None => Poll::Ready(Err(Error::AlreadyConsumed)),
        }
    }
}

impl IntoFuture for HostCoroutine {
    type Output = Result<HostValue>;
    type IntoFuture = CoroutineRun;

    fn into_future(self) -> CoroutineRun {
        CoroutineRun {
            body: Some(self.take()),
        }
    }
}

struct TaskInner {
    id: u64,
    name: String,
    future: HostFuture,
}

/// A coroutine scheduled on the loop
#[derive(Clone)]
pub struct HostTask {
    inner: Rc<TaskInner>,
}

impl HostTask {
    pub(crate) fn new(id: u64, name: &str, future: HostFuture) -> Self {
        Self {
            inner: Rc::new(TaskInner {
                id,
                name: name.to_string(),
                future,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The future settled with the task's outcome
    pub fn future(&self) -> &HostFuture {
        &self.inner.future
    }

    pub fn done(&self) -> bool {
        self.inner.future.done()
    }

    /// Cancel the task. Its body is dropped and awaiters see `CancelledError`.
    pub fn cancel(&self) -> bool {
        if !self.inner.future.cancel() {
            return false;
        }
        if let Some(event_loop) = self.inner.future.event_loop() {
            event_loop.drop_task(self.inner.id);
        }
        true
    }
}

impl fmt::Debug for HostTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Task #{} {}>", self.inner.id, self.inner.name)
    }
}

impl IntoFuture for HostTask {
    type Output = Result<HostValue>;
    type IntoFuture = HostFuture;

    fn into_future(self) -> HostFuture {
        self.inner.future.clone()
    }
}
