//! Job drain
//!
//! The engine's job queue never advances on its own. A [`JobDrain`] is
//! registered as an idle hook on the driving loop so that pending jobs run
//! after every host callback and before the loop waits for timers.

use super::coercion;
use super::Bridge;
use crate::engine::{Context, JsResult, JsValue};
use crate::error::Result;
use crate::host::{IdleHook, Transfer};

/// Idle hook that empties the engine job queue
pub struct JobDrain {
    engine: Context,
    report_unhandled: bool,
}

impl JobDrain {
    pub fn new(engine: Context, report_unhandled: bool) -> Self {
        Self {
            engine,
            report_unhandled,
        }
    }
}

impl IdleHook for JobDrain {
    fn run_before_idle(&self) -> usize {
        let ran = self.engine.run_jobs();
        // Taken on every drain so the tracking list stays bounded
        let unhandled = self.engine.take_unhandled_rejections();
        if self.report_unhandled {
            for reason in unhandled {
                tracing::warn!(reason = %reason, "unhandled promise rejection");
            }
        }
        ran
    }
}

/// Run `work` on a native thread and expose its result as an engine promise.
///
/// The promise settles on the loop thread once the work finishes.
pub fn spawn_background<W>(bridge: &Bridge, name: &str, work: W) -> JsResult<JsValue>
where
    W: FnOnce() -> Result<Transfer> + Send + 'static,
{
    let event_loop = bridge.running_loop().current()?;
    let future = event_loop.spawn_blocking(name, work);
    tracing::debug!(name, future = future.id(), "background work started");
    coercion::future_to_engine(bridge, &future)
}
