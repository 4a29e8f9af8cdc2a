//! Embedded script engine
//!
//! The engine side of the bridge: an object model, the `Promise` state
//! machine and a job queue that only advances when an embedder drains it.
//! Engine functions are native closures; source text goes through a
//! pluggable [`Evaluator`].

mod context;
mod job_queue;
mod promise;
mod value;

pub use context::{AsyncGate, Context, Evaluator, NoEvaluator, Snippet, SnippetEvaluator};
pub use job_queue::{Job, JobQueueStats};
pub use promise::{
    NativeHandler, PromiseInternal, PromiseReaction, PromiseRef, PromiseState, ReactionHandler,
    ReactionType, ResolvingFunctions,
};
pub use value::{
    number_to_string, ErrorData, ErrorKind, Exception, JsFunction, JsResult, JsValue, NativeFn,
    Object, ObjectKind, ObjectRef,
};
