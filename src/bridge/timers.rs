//! `setTimeout` / `clearTimeout`
//!
//! Timers are kept in a [`TimerRegistry`] keyed by numeric handle and fired
//! through the host loop's `call_later`.

use super::Bridge;
use crate::engine::{Exception, JsResult, JsValue};
use crate::host::TimerHandle;
use rustc_hash::FxHashMap;

/// What a timer runs when it fires
#[derive(Clone, Debug)]
pub enum TimerCallback {
    /// Called with the global object as receiver
    Function(JsValue),
    /// Evaluated as top-level code in the global scope
    Source(String),
}

impl TimerCallback {
    /// Functions are kept, anything else is converted to source text
    pub fn from_value(value: Option<&JsValue>) -> Self {
        match value {
            Some(value) if value.is_callable() => TimerCallback::Function(value.clone()),
            Some(value) => TimerCallback::Source(value.to_js_string()),
            None => TimerCallback::Source("undefined".to_string()),
        }
    }
}

/// A pending timer
#[derive(Debug)]
pub struct TimerEntry {
    pub handle: u64,
    pub delay_ms: u64,
    pub callback: TimerCallback,
    pub args: Vec<JsValue>,
    /// Always `false`; there is no `setInterval`
    pub repeating: bool,
    host_timer: Option<TimerHandle>,
}

/// Pending timers of one bridge.
///
/// Handles start at 1 and only grow, so a handle never names two timers.
/// Entries leave the table when they fire or are cancelled.
#[derive(Debug)]
pub struct TimerRegistry {
    next_handle: u64,
    entries: FxHashMap<u64, TimerEntry>,
    min_delay_ms: u64,
}

impl TimerRegistry {
    pub fn new(min_delay_ms: u64) -> Self {
        Self {
            next_handle: 1,
            entries: FxHashMap::default(),
            min_delay_ms,
        }
    }

    /// Coerce a `delay` argument to whole milliseconds.
    ///
    /// Missing, NaN, negative and infinite delays become the minimum delay.
    pub fn coerce_delay(&self, delay: Option<&JsValue>) -> u64 {
        let ms = delay.map(JsValue::to_number).unwrap_or(f64::NAN);
        if !ms.is_finite() || ms < 0.0 {
            return self.min_delay_ms;
        }
        (ms.floor() as u64).max(self.min_delay_ms)
    }

    /// Record a new timer and return its handle
    pub fn register(&mut self, callback: TimerCallback, delay_ms: u64, args: Vec<JsValue>) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.entries.insert(
            handle,
            TimerEntry {
                handle,
                delay_ms,
                callback,
                args,
                repeating: false,
                host_timer: None,
            },
        );
        handle
    }

    pub fn attach_host_timer(&mut self, handle: u64, host_timer: TimerHandle) {
        if let Some(entry) = self.entries.get_mut(&handle) {
            entry.host_timer = Some(host_timer);
        }
    }

    /// Cancel the timer named by `handle`, if any. Returns whether a live
    /// timer was cancelled; invalid handles are ignored.
    ///
    /// The entry leaves the table and its host timer is cancelled, so a
    /// cleared timer neither fires nor holds the clock back.
    pub fn cancel(&mut self, handle: &JsValue) -> bool {
        let Some(handle) = handle_from_value(handle) else {
            return false;
        };
        match self.entries.remove(&handle) {
            Some(entry) => {
                if let Some(ref host_timer) = entry.host_timer {
                    host_timer.cancel();
                }
                tracing::trace!(handle, "timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Remove a due timer for firing; `None` if it was cancelled or is unknown
    pub fn take_due(&mut self, handle: u64) -> Option<TimerEntry> {
        self.entries.remove(&handle)
    }

    /// Number of timers that have neither fired nor been cancelled
    pub fn pending(&self) -> usize {
        self.entries.len()
    }
}

/// A usable handle: a positive, finite, integral Number
pub fn handle_from_value(value: &JsValue) -> Option<u64> {
    match value {
        JsValue::Number(n) if n.is_finite() && *n >= 1.0 && n.fract() == 0.0 => Some(*n as u64),
        _ => None,
    }
}

// ============================================================================
// Engine globals
// ============================================================================

/// `setTimeout(callback, delay, ...args)`
pub(crate) fn set_timeout(bridge: &Bridge, args: &[JsValue]) -> JsResult<JsValue> {
    let event_loop = bridge.running_loop().current()?;
    let callback = TimerCallback::from_value(args.first());
    let extra: Vec<JsValue> = args.iter().skip(2).cloned().collect();

    let handle = {
        let mut timers = bridge.timers().borrow_mut();
        let delay_ms = timers.coerce_delay(args.get(1));
        let handle = timers.register(callback, delay_ms, extra);
        let weak = bridge.downgrade();
        let host_timer = event_loop.call_later(delay_ms, move || {
            if let Some(bridge) = weak.upgrade() {
                fire(&bridge, handle);
            }
        });
        timers.attach_host_timer(handle, host_timer);
        tracing::debug!(handle, delay_ms, "setTimeout");
        handle
    };
    Ok(JsValue::Number(handle as f64))
}

/// `clearTimeout(handle)`
pub(crate) fn clear_timeout(bridge: &Bridge, args: &[JsValue]) -> JsResult<JsValue> {
    bridge.running_loop().current()?;
    let handle = args.first().cloned().unwrap_or_default();
    bridge.timers().borrow_mut().cancel(&handle);
    Ok(JsValue::Undefined)
}

fn fire(bridge: &Bridge, handle: u64) {
    let entry = bridge.timers().borrow_mut().take_due(handle);
    let Some(entry) = entry else {
        tracing::trace!(handle, "timer gone before firing");
        return;
    };

    let cx = bridge.engine();
    let outcome = match entry.callback {
        TimerCallback::Function(ref callback) => cx.call(callback, &cx.global(), &entry.args),
        TimerCallback::Source(ref source) => cx.evaluate(source, bridge.eval_origin()),
    };
    match outcome {
        Ok(_) => tracing::trace!(handle, "timer fired"),
        Err(Exception::Thrown(value)) => {
            tracing::warn!(handle, error = %value, "uncaught exception in timer callback");
        }
        Err(Exception::Fatal(err)) => {
            tracing::error!(handle, error = %err, "timer callback failed");
        }
    }
}
