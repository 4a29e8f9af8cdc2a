//! Host runtime
//!
//! The cooperative side of the bridge: a single-threaded event loop with a
//! virtual clock, single-assignment futures, single-use coroutines and the
//! tasks that run them.

mod coroutine;
mod event_loop;
mod future;
mod value;

pub use coroutine::{CoroutineRun, HostCoroutine, HostTask, LocalBoxFuture};
pub use event_loop::{EventLoop, IdleHook, IdleHookId, LoopStats, TimerHandle};
pub use future::{DoneCallback, HostFuture};
pub use value::{format_float, HostCallable, HostException, HostFn, HostValue, Transfer};
