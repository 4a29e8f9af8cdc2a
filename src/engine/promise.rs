//! Promise state machine
//!
//! Promise/A+ with ECMAScript resolution semantics. Settling a promise never
//! runs reactions synchronously: every reaction, and every adoption of a
//! thenable, is a job on the context's job queue.

use super::context::Context;
use super::value::{ErrorKind, Exception, JsResult, JsValue, Object, ObjectKind};
use crate::error::messages;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Shared promise slots
pub type PromiseRef = Rc<RefCell<PromiseInternal>>;

/// Native reaction handler; receives the fulfillment value or rejection reason
pub type NativeHandler = Rc<dyn Fn(&Context, JsValue) -> JsResult<JsValue>>;

/// Promise state enum
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PromiseState {
    /// Promise is pending - not yet settled
    Pending,
    /// Promise is fulfilled with a value
    Fulfilled,
    /// Promise is rejected with a reason
    Rejected,
}

impl PromiseState {
    pub fn label(&self) -> &'static str {
        match self {
            PromiseState::Pending => "pending",
            PromiseState::Fulfilled => "fulfilled",
            PromiseState::Rejected => "rejected",
        }
    }
}

/// Type of promise reaction
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReactionType {
    Fulfill,
    Reject,
}

/// The code a reaction runs
#[derive(Clone)]
pub enum ReactionHandler {
    /// Pass the value (or reason) straight through
    Identity,
    /// An engine function
    Script(JsValue),
    /// A native closure
    Native(NativeHandler),
}

impl ReactionHandler {
    pub(crate) fn from_value(value: &JsValue) -> Self {
        if value.is_callable() {
            ReactionHandler::Script(value.clone())
        } else {
            ReactionHandler::Identity
        }
    }
}

/// A Promise reaction (then/catch/finally callback)
#[derive(Clone)]
pub struct PromiseReaction {
    pub handler: ReactionHandler,
    /// The derived promise to settle with the handler's outcome, if any
    pub capability: Option<ResolvingFunctions>,
    pub reaction_type: ReactionType,
}

/// Internal Promise state
pub struct PromiseInternal {
    pub id: u64,
    /// Current state of the promise
    pub state: PromiseState,
    /// The settled value (fulfillment value or rejection reason)
    pub result: JsValue,
    /// Reactions waiting for this promise to settle
    pub reactions: Vec<PromiseReaction>,
    /// Whether a rejection handler has been attached
    pub handled: bool,
}

impl PromiseInternal {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            state: PromiseState::Pending,
            result: JsValue::Undefined,
            reactions: Vec::new(),
            handled: false,
        }
    }
}

/// The `resolve`/`reject` pair of a promise.
///
/// Both share one `already_resolved` flag: whichever is called first wins
/// and every later call is ignored.
#[derive(Clone)]
pub struct ResolvingFunctions {
    promise: PromiseRef,
    already_resolved: Rc<Cell<bool>>,
}

impl ResolvingFunctions {
    pub fn new(promise: PromiseRef) -> Self {
        Self {
            promise,
            already_resolved: Rc::new(Cell::new(false)),
        }
    }

    pub fn promise(&self) -> &PromiseRef {
        &self.promise
    }

    pub fn already_resolved(&self) -> bool {
        self.already_resolved.get()
    }

    /// Resolve with a value, adopting it when it is a thenable
    pub fn resolve(&self, cx: &Context, resolution: JsValue) {
        if self.already_resolved.replace(true) {
            return;
        }
        resolve_promise(cx, &self.promise, resolution);
    }

    /// Reject with a reason
    pub fn reject(&self, cx: &Context, reason: JsValue) {
        if self.already_resolved.replace(true) {
            return;
        }
        reject_promise(cx, &self.promise, reason);
    }

    /// Settle from a completion: a value resolves, a throw rejects
    pub fn settle(&self, cx: &Context, outcome: JsResult<JsValue>) {
        match outcome {
            Ok(value) => self.resolve(cx, value),
            Err(Exception::Thrown(reason)) => self.reject(cx, reason),
            Err(Exception::Fatal(err)) => {
                let reason = cx.new_error(ErrorKind::InternalError, &err.to_string());
                self.reject(cx, reason);
            }
        }
    }

    /// Engine function objects for the pair, for handing to script code
    pub fn to_functions(&self, cx: &Context) -> (JsValue, JsValue) {
        let resolver = self.clone();
        let resolve = cx.function("", move |cx, _this, args| {
            resolver.resolve(cx, args.first().cloned().unwrap_or_default());
            Ok(JsValue::Undefined)
        });
        let rejecter = self.clone();
        let reject = cx.function("", move |cx, _this, args| {
            rejecter.reject(cx, args.first().cloned().unwrap_or_default());
            Ok(JsValue::Undefined)
        });
        (resolve, reject)
    }
}

/// Promise resolve functions: self-resolution rejects, thenables are adopted
/// through a job, anything else fulfills.
fn resolve_promise(cx: &Context, promise: &PromiseRef, resolution: JsValue) {
    if let Some(inner) = resolution.as_promise() {
        if Rc::ptr_eq(&inner, promise) {
            let reason = cx.new_error(ErrorKind::TypeError, messages::CHAINING_CYCLE);
            reject_promise(cx, promise, reason);
            return;
        }
    }

    if !resolution.is_object() {
        fulfill_promise(cx, promise, resolution);
        return;
    }

    let then = match cx.get(&resolution, "then") {
        Ok(then) => then,
        Err(Exception::Thrown(reason)) => {
            reject_promise(cx, promise, reason);
            return;
        }
        Err(Exception::Fatal(err)) => {
            let reason = cx.new_error(ErrorKind::InternalError, &err.to_string());
            reject_promise(cx, promise, reason);
            return;
        }
    };

    if !then.is_callable() {
        fulfill_promise(cx, promise, resolution);
        return;
    }

    let adopting = ResolvingFunctions::new(promise.clone());
    cx.enqueue_job("promise-resolve-thenable", move |cx| {
        let (resolve, reject) = adopting.to_functions(cx);
        match cx.call(&then, &resolution, &[resolve, reject]) {
            Ok(_) => Ok(()),
            Err(Exception::Thrown(reason)) => {
                adopting.reject(cx, reason);
                Ok(())
            }
            Err(fatal) => Err(fatal),
        }
    });
}

/// Fulfill a promise with a value
pub fn fulfill_promise(cx: &Context, promise: &PromiseRef, value: JsValue) {
    let reactions = {
        let mut p = promise.borrow_mut();
        if p.state != PromiseState::Pending {
            return;
        }
        p.state = PromiseState::Fulfilled;
        p.result = value.clone();
        std::mem::take(&mut p.reactions)
    };

    for reaction in reactions {
        if reaction.reaction_type == ReactionType::Fulfill {
            enqueue_reaction(cx, reaction, value.clone());
        }
    }
}

/// Reject a promise with a reason
pub fn reject_promise(cx: &Context, promise: &PromiseRef, reason: JsValue) {
    let (reactions, handled) = {
        let mut p = promise.borrow_mut();
        if p.state != PromiseState::Pending {
            return;
        }
        p.state = PromiseState::Rejected;
        p.result = reason.clone();
        (std::mem::take(&mut p.reactions), p.handled)
    };

    if !handled {
        cx.track_unhandled_rejection(promise.clone());
    }

    for reaction in reactions {
        if reaction.reaction_type == ReactionType::Reject {
            enqueue_reaction(cx, reaction, reason.clone());
        }
    }
}

fn enqueue_reaction(cx: &Context, reaction: PromiseReaction, argument: JsValue) {
    cx.enqueue_job("promise-reaction", move |cx| run_reaction(cx, reaction, argument));
}

fn run_reaction(cx: &Context, reaction: PromiseReaction, argument: JsValue) -> JsResult<()> {
    let outcome = match reaction.handler {
        ReactionHandler::Identity => match reaction.reaction_type {
            ReactionType::Fulfill => Ok(argument),
            ReactionType::Reject => Err(Exception::Thrown(argument)),
        },
        ReactionHandler::Script(ref handler) => cx.call(handler, &JsValue::Undefined, &[argument]),
        ReactionHandler::Native(ref handler) => handler(cx, argument),
    };

    match reaction.capability {
        Some(capability) => {
            capability.settle(cx, outcome);
            Ok(())
        }
        None => outcome.map(|_| ()),
    }
}

/// Attach reactions to a promise.
///
/// Marks the promise handled. When it has already settled the matching
/// reaction is queued right away.
pub fn add_reactions(
    cx: &Context,
    promise: &PromiseRef,
    on_fulfilled: ReactionHandler,
    on_rejected: ReactionHandler,
    capability: Option<ResolvingFunctions>,
) {
    let settled = {
        let mut p = promise.borrow_mut();
        let was_handled = p.handled;
        p.handled = true;
        match p.state {
            PromiseState::Pending => {
                p.reactions.push(PromiseReaction {
                    handler: on_fulfilled,
                    capability: capability.clone(),
                    reaction_type: ReactionType::Fulfill,
                });
                p.reactions.push(PromiseReaction {
                    handler: on_rejected,
                    capability,
                    reaction_type: ReactionType::Reject,
                });
                None
            }
            PromiseState::Fulfilled => Some((
                PromiseReaction {
                    handler: on_fulfilled,
                    capability,
                    reaction_type: ReactionType::Fulfill,
                },
                p.result.clone(),
                false,
            )),
            PromiseState::Rejected => Some((
                PromiseReaction {
                    handler: on_rejected,
                    capability,
                    reaction_type: ReactionType::Reject,
                },
                p.result.clone(),
                !was_handled,
            )),
        }
    };

    if let Some((reaction, argument, newly_handled)) = settled {
        if newly_handled {
            cx.forget_unhandled_rejection(promise);
        }
        enqueue_reaction(cx, reaction, argument);
    }
}

// ============================================================================
// Promise built-ins
// ============================================================================

fn this_promise(cx: &Context, this: &JsValue, method: &str) -> JsResult<()> {
    if this.as_promise().is_some() {
        return Ok(());
    }
    Err(cx.type_error(&format!(
        "Promise.prototype.{} called on incompatible receiver {}",
        method,
        this.to_js_string()
    )))
}

/// Install `then`, `catch` and `finally` on the prototype, and `resolve`
/// and `reject` on the constructor.
pub(crate) fn install(cx: &Context, ctor: &JsValue, proto: &JsValue) {
    let then = cx.function("then", |cx, this, args| {
        this_promise(cx, this, "then")?;
        let on_fulfilled = args.first().cloned().unwrap_or_default();
        let on_rejected = args.get(1).cloned().unwrap_or_default();
        cx.then(this, &on_fulfilled, &on_rejected)
    });
    cx.define(proto, "then", then);

    let catch = cx.function("catch", |cx, this, args| {
        this_promise(cx, this, "catch")?;
        let on_rejected = args.first().cloned().unwrap_or_default();
        cx.then(this, &JsValue::Undefined, &on_rejected)
    });
    cx.define(proto, "catch", catch);

    let finally = cx.function("finally", |cx, this, args| {
        this_promise(cx, this, "finally")?;
        let on_finally = args.first().cloned().unwrap_or_default();
        if !on_finally.is_callable() {
            return cx.then(this, &on_finally, &on_finally);
        }
        let after_value = on_finally.clone();
        let after_reason = on_finally;
        cx.then_native(
            this,
            move |cx, value| {
                let result = cx.call(&after_value, &JsValue::Undefined, &[])?;
                let waited = cx.promise_resolve(&result)?;
                cx.then_native(&waited, move |_, _| Ok(value.clone()), |_, reason| {
                    Err(Exception::Thrown(reason))
                })
            },
            move |cx, reason| {
                let result = cx.call(&after_reason, &JsValue::Undefined, &[])?;
                let waited = cx.promise_resolve(&result)?;
                cx.then_native(
                    &waited,
                    move |_, _| Err(Exception::Thrown(reason.clone())),
                    |_, inner| Err(Exception::Thrown(inner)),
                )
            },
        )
    });
    cx.define(proto, "finally", finally);

    let resolve = cx.function("resolve", |cx, this, args| {
        require_promise_receiver(cx, this)?;
        cx.promise_resolve(&args.first().cloned().unwrap_or_default())
    });
    cx.define(ctor, "resolve", resolve);

    let reject = cx.function("reject", |cx, this, args| {
        require_promise_receiver(cx, this)?;
        cx.promise_reject(args.first().cloned().unwrap_or_default())
    });
    cx.define(ctor, "reject", reject);

    cx.define(ctor, "prototype", proto.clone());
    cx.define(proto, "constructor", ctor.clone());
}

fn require_promise_receiver(cx: &Context, this: &JsValue) -> JsResult<()> {
    if this.strict_equals(&cx.promise_constructor()) {
        Ok(())
    } else {
        Err(cx.type_error(&messages::not_a_constructor(&this.to_js_string())))
    }
}

/// A promise object wrapping fresh slots
pub(crate) fn new_promise_object(cx: &Context, id: u64) -> (JsValue, PromiseRef) {
    let promise = Rc::new(RefCell::new(PromiseInternal::new(id)));
    let object = Object::with_prototype(
        ObjectKind::Promise(promise.clone()),
        cx.promise_prototype().as_object().cloned(),
    )
    .into_value();
    (object, promise)
}
