//! Quickbridge: one async system out of a host event loop and an embedded
//! JavaScript engine
//!
//! The engine's Promise job queue never advances by itself and the host loop
//! knows nothing about engine timers. Quickbridge joins the two so that
//! `setTimeout`, Promises, host coroutines and exceptions behave as if they
//! belonged to a single runtime.
//!
//! # Quick Start
//!
//! ```
//! use quickbridge::host::{EventLoop, HostValue};
//! use quickbridge::Bridge;
//!
//! fn main() -> quickbridge::Result<()> {
//!     let bridge = Bridge::new();
//!     let event_loop = EventLoop::new();
//!     let engine_side = bridge.clone();
//!     let sleeper = event_loop.clone();
//!     let result = bridge.run_until_complete(&event_loop, async move {
//!         // host future -> engine promise -> host future
//!         let promise = engine_side.to_engine(HostValue::Future(sleeper.sleep(5)))?;
//!         engine_side.await_engine(&promise)?.await
//!     })?;
//!     assert_eq!(result, HostValue::None);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Host** | [`host`]: event loop, futures, coroutines, tasks |
//! | **Engine** | [`engine`]: values, Promise state machine, job queue |
//! | **Bridge** | [`bridge`]: timers, coercion, exception marshaling, job drain |
//! | **Support** | [`config`], [`Error`] |
#![allow(clippy::type_complexity)]
#![allow(clippy::new_without_default)]

pub mod bridge;
pub mod config;
pub mod engine;
pub mod host;

mod error;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use error::{messages, Error, Result, ScriptError, ScriptOrigin};

/// Quickbridge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
