//! Engine context
//!
//! A [`Context`] owns the global object, the `Promise` built-ins, the job
//! queue and the hooks an embedder plugs in: an [`AsyncGate`] consulted
//! before any promise is created, and an [`Evaluator`] for source text.

use super::job_queue::{JobQueue, JobQueueStats};
use super::promise::{
    self, add_reactions, NativeHandler, PromiseRef, PromiseState, ReactionHandler,
    ResolvingFunctions,
};
use super::value::{
    ErrorData, ErrorKind, Exception, JsFunction, JsResult, JsValue, NativeFn, Object, ObjectKind,
};
use crate::error::{messages, Result, ScriptOrigin};
use rustc_hash::FxHashMap;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Checked before the engine creates a promise or starts other async work
pub trait AsyncGate {
    fn check(&self) -> Result<()>;
}

/// Turns source text into a completion value
pub trait Evaluator {
    fn evaluate(&self, cx: &Context, source: &str) -> JsResult<JsValue>;
}

/// Evaluator for engines without source support
pub struct NoEvaluator;

impl Evaluator for NoEvaluator {
    fn evaluate(&self, cx: &Context, _source: &str) -> JsResult<JsValue> {
        Err(cx.error(ErrorKind::SyntaxError, messages::SOURCE_EVALUATION_UNSUPPORTED))
    }
}

/// A registered snippet body
pub type Snippet = Rc<dyn Fn(&Context) -> JsResult<JsValue>>;

/// Table-driven evaluator: each known source text maps to a native body.
///
/// Lookups ignore surrounding whitespace.
#[derive(Default)]
pub struct SnippetEvaluator {
    snippets: RefCell<FxHashMap<String, Snippet>>,
}

impl SnippetEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the body that runs when `source` is evaluated
    pub fn define<F>(&self, source: &str, body: F)
    where
        F: Fn(&Context) -> JsResult<JsValue> + 'static,
    {
        self.snippets
            .borrow_mut()
            .insert(source.trim().to_string(), Rc::new(body));
    }

    pub fn len(&self) -> usize {
        self.snippets.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snippets.borrow().is_empty()
    }
}

impl Evaluator for SnippetEvaluator {
    fn evaluate(&self, cx: &Context, source: &str) -> JsResult<JsValue> {
        let body = self.snippets.borrow().get(source.trim()).cloned();
        match body {
            Some(body) => body(cx),
            None => Err(cx.error(
                ErrorKind::SyntaxError,
                &format!("{}: {}", messages::SOURCE_EVALUATION_UNSUPPORTED, source.trim()),
            )),
        }
    }
}

struct ContextInner {
    global: JsValue,
    promise_ctor: JsValue,
    promise_proto: JsValue,
    jobs: RefCell<JobQueue>,
    evaluator: RefCell<Rc<dyn Evaluator>>,
    gate: RefCell<Option<Rc<dyn AsyncGate>>>,
    origins: RefCell<Vec<ScriptOrigin>>,
    unhandled: RefCell<Vec<PromiseRef>>,
    next_promise_id: Cell<u64>,
}

/// The engine
#[derive(Clone)]
pub struct Context {
    inner: Rc<ContextInner>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

fn make_function(name: &str, call: Rc<NativeFn>, construct: Option<Rc<NativeFn>>) -> JsValue {
    Object::new(ObjectKind::Function(JsFunction {
        name: name.to_string(),
        call,
        construct,
    }))
    .into_value()
}

impl Context {
    /// Create a context with a fresh global object and no evaluator
    pub fn new() -> Self {
        Self::with_evaluator(Rc::new(NoEvaluator))
    }

    pub fn with_evaluator(evaluator: Rc<dyn Evaluator>) -> Self {
        let promise_ctor = make_function(
            "Promise",
            Rc::new(|cx: &Context, _this: &JsValue, _args: &[JsValue]| -> JsResult<JsValue> {
                Err(cx.type_error(messages::PROMISE_NEEDS_NEW))
            }),
            Some(Rc::new(|cx: &Context, _this: &JsValue, args: &[JsValue]| -> JsResult<JsValue> {
                cx.construct_promise(&args.first().cloned().unwrap_or_default())
            })),
        );

        let cx = Context {
            inner: Rc::new(ContextInner {
                global: Object::new(ObjectKind::Ordinary).into_value(),
                promise_ctor,
                promise_proto: Object::new(ObjectKind::Ordinary).into_value(),
                jobs: RefCell::new(JobQueue::default()),
                evaluator: RefCell::new(evaluator),
                gate: RefCell::new(None),
                origins: RefCell::new(Vec::new()),
                unhandled: RefCell::new(Vec::new()),
                next_promise_id: Cell::new(1),
            }),
        };

        let ctor = cx.inner.promise_ctor.clone();
        let proto = cx.inner.promise_proto.clone();
        promise::install(&cx, &ctor, &proto);
        cx.define(&cx.global(), "Promise", ctor);
        cx
    }

    pub fn global(&self) -> JsValue {
        self.inner.global.clone()
    }

    pub fn promise_constructor(&self) -> JsValue {
        self.inner.promise_ctor.clone()
    }

    pub fn promise_prototype(&self) -> JsValue {
        self.inner.promise_proto.clone()
    }

    pub fn set_gate(&self, gate: Option<Rc<dyn AsyncGate>>) {
        *self.inner.gate.borrow_mut() = gate;
    }

    pub fn set_evaluator(&self, evaluator: Rc<dyn Evaluator>) {
        *self.inner.evaluator.borrow_mut() = evaluator;
    }

    // ========================================================================
    // Objects
    // ========================================================================

    /// Create a native function object
    pub fn function<F>(&self, name: &str, body: F) -> JsValue
    where
        F: Fn(&Context, &JsValue, &[JsValue]) -> JsResult<JsValue> + 'static,
    {
        make_function(name, Rc::new(body), None)
    }

    pub fn new_object(&self) -> JsValue {
        Object::new(ObjectKind::Ordinary).into_value()
    }

    pub fn new_array(&self, items: Vec<JsValue>) -> JsValue {
        Object::new(ObjectKind::Array(items)).into_value()
    }

    /// Create an error object, stamped with the current evaluation origin
    pub fn new_error(&self, kind: ErrorKind, message: &str) -> JsValue {
        let mut object = Object::new(ObjectKind::Error(ErrorData {
            origin: self.current_origin(),
        }));
        object
            .properties
            .insert("name".to_string(), JsValue::from(kind.name()));
        object
            .properties
            .insert("message".to_string(), JsValue::from(message));
        object.into_value()
    }

    /// A `throw` of a fresh error object
    pub fn error(&self, kind: ErrorKind, message: &str) -> Exception {
        Exception::Thrown(self.new_error(kind, message))
    }

    pub fn type_error(&self, message: &str) -> Exception {
        self.error(ErrorKind::TypeError, message)
    }

    /// Define an own property without any checks. Ignored on primitives.
    pub fn define(&self, target: &JsValue, key: &str, value: JsValue) {
        if let JsValue::Object(obj) = target {
            obj.borrow_mut().properties.insert(key.to_string(), value);
        }
    }

    /// Property lookup along the prototype chain
    pub fn get(&self, target: &JsValue, key: &str) -> JsResult<JsValue> {
        let obj = match target {
            JsValue::Undefined | JsValue::Null => {
                return Err(self.type_error(&format!("{} has no properties", target)));
            }
            JsValue::String(s) if key == "length" => {
                return Ok(JsValue::Number(s.chars().count() as f64));
            }
            JsValue::Object(obj) => obj.clone(),
            _ => return Ok(JsValue::Undefined),
        };

        {
            let o = obj.borrow();
            match o.kind {
                ObjectKind::Array(ref items) => {
                    if key == "length" {
                        return Ok(JsValue::Number(items.len() as f64));
                    }
                    if let Ok(index) = key.parse::<usize>() {
                        return Ok(items.get(index).cloned().unwrap_or_default());
                    }
                }
                ObjectKind::Function(ref func)
                    if key == "name" && !o.properties.contains_key("name") =>
                {
                    return Ok(JsValue::from(func.name.as_str()));
                }
                _ => {}
            }
        }

        let mut current = Some(obj);
        while let Some(o) = current {
            let next = {
                let o = o.borrow();
                if let Some(value) = o.properties.get(key) {
                    return Ok(value.clone());
                }
                o.prototype.clone()
            };
            current = next;
        }
        Ok(JsValue::Undefined)
    }

    pub fn set(&self, target: &JsValue, key: &str, value: JsValue) -> JsResult<()> {
        match target {
            JsValue::Undefined | JsValue::Null => {
                Err(self.type_error(&format!("{} has no properties", target)))
            }
            JsValue::Object(obj) => {
                let mut o = obj.borrow_mut();
                if let ObjectKind::Array(ref mut items) = o.kind {
                    if let Ok(index) = key.parse::<usize>() {
                        if index >= items.len() {
                            items.resize(index + 1, JsValue::Undefined);
                        }
                        items[index] = value;
                        return Ok(());
                    }
                }
                o.properties.insert(key.to_string(), value);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Remove an own property; returns whether it existed
    pub fn delete(&self, target: &JsValue, key: &str) -> bool {
        match target {
            JsValue::Object(obj) => obj.borrow_mut().properties.remove(key).is_some(),
            _ => false,
        }
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Call `callee` with a receiver and arguments
    pub fn call(&self, callee: &JsValue, this: &JsValue, args: &[JsValue]) -> JsResult<JsValue> {
        match callee.as_function() {
            Some(func) => (func.call)(self, this, args),
            None => Err(self.type_error(&messages::not_a_function(&callee.to_js_string()))),
        }
    }

    /// `new callee(...args)`
    pub fn construct(&self, callee: &JsValue, args: &[JsValue]) -> JsResult<JsValue> {
        match callee.as_function().and_then(|func| func.construct) {
            Some(construct) => construct(self, &JsValue::Undefined, args),
            None => Err(self.type_error(&messages::not_a_constructor(&callee.to_js_string()))),
        }
    }

    /// `Function.prototype.bind`
    pub fn bind(&self, target: &JsValue, this: JsValue, bound: Vec<JsValue>) -> JsResult<JsValue> {
        let func = match target.as_function() {
            Some(func) => func,
            None => {
                return Err(self.type_error(&messages::not_a_function(&target.to_js_string())));
            }
        };
        let call = func.call.clone();
        Ok(self.function(&format!("bound {}", func.name), move |cx, _this, args| {
            let mut all = bound.clone();
            all.extend_from_slice(args);
            call(cx, &this, &all)
        }))
    }

    // ========================================================================
    // Promises
    // ========================================================================

    /// Consult the async gate; failures are fatal, script code cannot catch them
    pub fn check_async(&self) -> JsResult<()> {
        let gate = self.inner.gate.borrow().clone();
        match gate {
            Some(gate) => gate.check().map_err(Exception::Fatal),
            None => Ok(()),
        }
    }

    pub fn is_promise(&self, value: &JsValue) -> bool {
        value.as_promise().is_some()
    }

    /// A pending promise and its resolving functions
    pub fn new_promise_capability(&self) -> JsResult<(JsValue, ResolvingFunctions)> {
        self.check_async()?;
        let id = self.inner.next_promise_id.get();
        self.inner.next_promise_id.set(id + 1);
        let (object, slots) = promise::new_promise_object(self, id);
        Ok((object, ResolvingFunctions::new(slots)))
    }

    /// `new Promise(executor)`
    pub fn construct_promise(&self, executor: &JsValue) -> JsResult<JsValue> {
        if !executor.is_callable() {
            return Err(self.type_error(&messages::bad_resolver(&executor.to_js_string())));
        }
        let (object, resolvers) = self.new_promise_capability()?;
        let (resolve, reject) = resolvers.to_functions(self);
        match self.call(executor, &JsValue::Undefined, &[resolve, reject]) {
            Ok(_) => {}
            Err(Exception::Thrown(reason)) => resolvers.reject(self, reason),
            Err(fatal) => return Err(fatal),
        }
        Ok(object)
    }

    /// `Promise.resolve(value)`
    pub fn promise_resolve(&self, value: &JsValue) -> JsResult<JsValue> {
        if self.is_promise(value) {
            return Ok(value.clone());
        }
        let (object, resolvers) = self.new_promise_capability()?;
        resolvers.resolve(self, value.clone());
        Ok(object)
    }

    /// `Promise.reject(reason)`
    pub fn promise_reject(&self, reason: JsValue) -> JsResult<JsValue> {
        let (object, resolvers) = self.new_promise_capability()?;
        resolvers.reject(self, reason);
        Ok(object)
    }

    fn promise_slots(&self, promise: &JsValue) -> JsResult<PromiseRef> {
        promise.as_promise().ok_or_else(|| {
            self.type_error(&format!("{} is not a promise", promise.to_js_string()))
        })
    }

    /// `promise.then(on_fulfilled, on_rejected)`
    pub fn then(
        &self,
        promise: &JsValue,
        on_fulfilled: &JsValue,
        on_rejected: &JsValue,
    ) -> JsResult<JsValue> {
        let slots = self.promise_slots(promise)?;
        let (derived, resolvers) = self.new_promise_capability()?;
        add_reactions(
            self,
            &slots,
            ReactionHandler::from_value(on_fulfilled),
            ReactionHandler::from_value(on_rejected),
            Some(resolvers),
        );
        Ok(derived)
    }

    /// `then` with native handlers; the derived promise adopts their outcome
    pub fn then_native<F, R>(&self, promise: &JsValue, on_fulfilled: F, on_rejected: R) -> JsResult<JsValue>
    where
        F: Fn(&Context, JsValue) -> JsResult<JsValue> + 'static,
        R: Fn(&Context, JsValue) -> JsResult<JsValue> + 'static,
    {
        let slots = self.promise_slots(promise)?;
        let (derived, resolvers) = self.new_promise_capability()?;
        add_reactions(
            self,
            &slots,
            ReactionHandler::Native(Rc::new(on_fulfilled)),
            ReactionHandler::Native(Rc::new(on_rejected)),
            Some(resolvers),
        );
        Ok(derived)
    }

    /// Observe a promise without deriving a new one
    pub fn react(
        &self,
        promise: &JsValue,
        on_fulfilled: NativeHandler,
        on_rejected: NativeHandler,
    ) -> JsResult<()> {
        let slots = self.promise_slots(promise)?;
        add_reactions(
            self,
            &slots,
            ReactionHandler::Native(on_fulfilled),
            ReactionHandler::Native(on_rejected),
            None,
        );
        Ok(())
    }

    pub(crate) fn track_unhandled_rejection(&self, promise: PromiseRef) {
        self.inner.unhandled.borrow_mut().push(promise);
    }

    pub(crate) fn forget_unhandled_rejection(&self, promise: &PromiseRef) {
        self.inner
            .unhandled
            .borrow_mut()
            .retain(|p| !Rc::ptr_eq(p, promise));
    }

    /// Reasons of rejected promises that still have no handler
    pub fn take_unhandled_rejections(&self) -> Vec<JsValue> {
        let tracked = std::mem::take(&mut *self.inner.unhandled.borrow_mut());
        tracked
            .into_iter()
            .filter_map(|p| {
                let p = p.borrow();
                if p.state == PromiseState::Rejected && !p.handled {
                    Some(p.result.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    pub fn enqueue_job<F>(&self, label: &'static str, job: F)
    where
        F: FnOnce(&Context) -> JsResult<()> + 'static,
    {
        self.inner.jobs.borrow_mut().push(label, Box::new(job));
    }

    pub fn pending_jobs(&self) -> usize {
        self.inner.jobs.borrow().len()
    }

    pub fn job_stats(&self) -> JobQueueStats {
        self.inner.jobs.borrow().stats()
    }

    /// Run jobs until the queue is empty, including jobs enqueued meanwhile.
    ///
    /// A job that throws is logged and does not stop the drain.
    pub fn run_jobs(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = self.inner.jobs.borrow_mut().pop();
            let Some(job) = next else { break };
            let label = job.label;
            let outcome = (job.run)(self);
            ran += 1;
            match outcome {
                Ok(()) => self.inner.jobs.borrow_mut().record(true),
                Err(Exception::Thrown(value)) => {
                    self.inner.jobs.borrow_mut().record(false);
                    tracing::warn!(job = label, error = %value, "uncaught exception in job");
                }
                Err(Exception::Fatal(err)) => {
                    self.inner.jobs.borrow_mut().record(false);
                    tracing::error!(job = label, error = %err, "job failed");
                }
            }
        }
        if ran > 0 {
            self.inner.jobs.borrow_mut().record_drain();
            tracing::trace!(jobs = ran, "job queue drained");
        }
        ran
    }

    // ========================================================================
    // Evaluation
    // ========================================================================

    /// Evaluate source text; errors created meanwhile carry `origin`
    pub fn evaluate(&self, source: &str, origin: ScriptOrigin) -> JsResult<JsValue> {
        let evaluator = self.inner.evaluator.borrow().clone();
        self.inner.origins.borrow_mut().push(origin);
        let _scope = OriginScope { cx: self };
        evaluator.evaluate(self, source)
    }

    /// Innermost evaluation in progress
    pub fn current_origin(&self) -> Option<ScriptOrigin> {
        self.inner.origins.borrow().last().cloned()
    }

    /// `import(specifier)`: module loading is not available to embedded code
    pub fn dynamic_import(&self, _specifier: &JsValue) -> JsResult<JsValue> {
        Err(self.error(ErrorKind::Error, messages::DYNAMIC_IMPORT_DISABLED))
    }
}

struct OriginScope<'a> {
    cx: &'a Context,
}

impl Drop for OriginScope<'_> {
    fn drop(&mut self) {
        self.cx.inner.origins.borrow_mut().pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct Closed;

    impl AsyncGate for Closed {
        fn check(&self) -> Result<()> {
            Err(Error::no_event_loop("Quickbridge", "Rust"))
        }
    }

    #[test]
    fn test_property_lookup_follows_prototypes() {
        let cx = Context::new();
        let promise = cx.promise_resolve(&JsValue::Null).unwrap();
        assert!(cx.get(&promise, "then").unwrap().is_callable());
        assert!(cx.get(&promise, "missing").unwrap().is_undefined());
    }

    #[test]
    fn test_get_on_undefined_throws() {
        let cx = Context::new();
        match cx.get(&JsValue::Undefined, "x") {
            Err(Exception::Thrown(err)) => {
                assert_eq!(err.to_js_string(), "TypeError: undefined has no properties")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bind_prepends_arguments() {
        let cx = Context::new();
        let join = cx.function("join", |_, this, args| {
            let parts: Vec<String> = std::iter::once(this.to_js_string())
                .chain(args.iter().map(JsValue::to_js_string))
                .collect();
            Ok(JsValue::from(parts.join("-")))
        });
        let bound = cx
            .bind(&join, JsValue::from("self"), vec![JsValue::from(1.0)])
            .unwrap();
        let out = cx
            .call(&bound, &JsValue::Undefined, &[JsValue::from(2.0)])
            .unwrap();
        assert_eq!(out.to_js_string(), "self-1-2");
        assert_eq!(cx.get(&bound, "name").unwrap().to_js_string(), "bound join");
    }

    #[test]
    fn test_closed_gate_blocks_promise_creation() {
        let cx = Context::new();
        cx.set_gate(Some(Rc::new(Closed)));
        match cx.promise_resolve(&JsValue::from(1.0)) {
            Err(Exception::Fatal(err)) => assert!(err.is_no_event_loop()),
            other => panic!("unexpected {:?}", other),
        }
        let executor = cx.function("executor", |_, _, _| Ok(JsValue::Undefined));
        let ctor = cx.promise_constructor();
        assert!(matches!(cx.construct(&ctor, &[executor]), Err(Exception::Fatal(_))));
    }

    #[test]
    fn test_promise_requires_new() {
        let cx = Context::new();
        let ctor = cx.promise_constructor();
        match cx.call(&ctor, &JsValue::Undefined, &[]) {
            Err(Exception::Thrown(err)) => {
                assert_eq!(
                    err.to_js_string(),
                    format!("TypeError: {}", messages::PROMISE_NEEDS_NEW)
                )
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_throwing_job_does_not_stop_the_drain() {
        let cx = Context::new();
        let seen = Rc::new(Cell::new(0));
        cx.enqueue_job("boom", |cx| Err(cx.error(ErrorKind::Error, "boom")));
        let s = seen.clone();
        cx.enqueue_job("after", move |cx| {
            s.set(s.get() + 1);
            let s = s.clone();
            cx.enqueue_job("nested", move |_| {
                s.set(s.get() + 1);
                Ok(())
            });
            Ok(())
        });
        assert_eq!(cx.run_jobs(), 3);
        assert_eq!(seen.get(), 2);
        assert_eq!(cx.job_stats().failed, 1);
    }

    #[test]
    fn test_evaluation_stamps_origin() {
        let snippets = Rc::new(SnippetEvaluator::new());
        snippets.define("undefined.x", |cx| cx.get(&JsValue::Undefined, "x"));
        let cx = Context::with_evaluator(snippets);
        let err = match cx.evaluate("undefined.x", ScriptOrigin::new("evaluate", 1)) {
            Err(Exception::Thrown(err)) => err,
            other => panic!("unexpected {:?}", other),
        };
        match err.as_object().map(|o| o.borrow().kind.clone()) {
            Some(ObjectKind::Error(data)) => {
                assert_eq!(data.origin, Some(ScriptOrigin::new("evaluate", 1)))
            }
            _ => panic!("expected an error object"),
        }
        assert!(cx.current_origin().is_none());
    }

    #[test]
    fn test_dynamic_import_always_throws() {
        let cx = Context::new();
        match cx.dynamic_import(&JsValue::from("./mod.js")) {
            Err(Exception::Thrown(err)) => assert_eq!(
                err.to_js_string(),
                format!("Error: {}", messages::DYNAMIC_IMPORT_DISABLED)
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_snippet_is_a_syntax_error() {
        let cx = Context::with_evaluator(Rc::new(SnippetEvaluator::new()));
        match cx.evaluate("1 +", ScriptOrigin::new("evaluate", 1)) {
            Err(Exception::Thrown(err)) => assert!(err.to_js_string().starts_with("SyntaxError")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
