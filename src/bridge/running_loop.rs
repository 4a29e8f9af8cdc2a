//! The running-loop slot
//!
//! Each bridge owns one slot naming the host loop currently driving it.
//! The slot is filled by [`RunningLoop::enter`] for exactly as long as the
//! returned guard lives, and every asynchronous operation consults it first.

use crate::engine::AsyncGate;
use crate::error::{Error, Result};
use crate::host::EventLoop;
use std::cell::RefCell;

/// Context-scoped handle to the driving host loop
pub struct RunningLoop {
    current: RefCell<Option<EventLoop>>,
    engine_name: String,
    host_name: String,
}

impl RunningLoop {
    pub fn new(engine_name: &str, host_name: &str) -> Self {
        Self {
            current: RefCell::new(None),
            engine_name: engine_name.to_string(),
            host_name: host_name.to_string(),
        }
    }

    /// Mark `event_loop` as running until the guard is dropped.
    ///
    /// Entering while another loop is recorded shadows it; the previous loop
    /// is restored when the guard goes away, including during unwinding.
    pub fn enter(&self, event_loop: &EventLoop) -> RunningGuard<'_> {
        let previous = self.current.borrow_mut().replace(event_loop.clone());
        tracing::debug!(nested = previous.is_some(), "event loop entered");
        RunningGuard {
            slot: self,
            previous,
        }
    }

    /// The loop driving the bridge, or the missing-loop error
    pub fn current(&self) -> Result<EventLoop> {
        self.current
            .borrow()
            .clone()
            .ok_or_else(|| self.no_event_loop())
    }

    pub fn is_running(&self) -> bool {
        self.current.borrow().is_some()
    }

    pub fn no_event_loop(&self) -> Error {
        Error::no_event_loop(&self.engine_name, &self.host_name)
    }
}

impl AsyncGate for RunningLoop {
    fn check(&self) -> Result<()> {
        self.current().map(|_| ())
    }
}

/// Keeps a loop recorded as running
pub struct RunningGuard<'a> {
    slot: &'a RunningLoop,
    previous: Option<EventLoop>,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        *self.slot.current.borrow_mut() = self.previous.take();
        tracing::debug!("event loop exited");
    }
}
