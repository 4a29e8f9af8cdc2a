//! Host runtime values
//!
//! The host side of the bridge speaks in [`HostValue`]s: plain data, host
//! callables, the three kinds of host awaitables, and opaque proxies for
//! engine objects that have no host representation.

use super::coroutine::{HostCoroutine, HostTask};
use super::future::HostFuture;
use crate::engine::JsValue;
use crate::error::{messages, Error, Result};
use std::fmt;
use std::rc::Rc;

/// An exception raised by host code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostException {
    /// Exception type (`TypeError`, `AttributeError`, ...)
    pub type_name: String,
    /// The exception's text
    pub message: String,
}

impl HostException {
    /// Create an exception of an arbitrary type
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn runtime_error(message: impl Into<String>) -> Self {
        Self::new("RuntimeError", message)
    }

    pub fn attribute_error(message: impl Into<String>) -> Self {
        Self::new("AttributeError", message)
    }

    pub fn timeout() -> Self {
        Self::new("TimeoutError", "")
    }

    pub fn cancelled() -> Self {
        Self::new("CancelledError", "")
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new("InvalidStateError", message)
    }

    /// Whether this exception has the given type
    pub fn is(&self, type_name: &str) -> bool {
        self.type_name == type_name
    }
}

impl fmt::Display for HostException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.type_name)
        } else {
            write!(f, "{}: {}", self.type_name, self.message)
        }
    }
}

impl From<HostException> for Error {
    fn from(exc: HostException) -> Self {
        Error::Host(exc)
    }
}

/// Type alias for host function implementations
pub type HostFn = dyn Fn(&[HostValue]) -> Result<HostValue>;

/// A host function that script code may call
#[derive(Clone)]
pub struct HostCallable {
    name: Rc<str>,
    func: Rc<HostFn>,
}

impl HostCallable {
    pub fn new<F>(name: &str, func: F) -> Self
    where
        F: Fn(&[HostValue]) -> Result<HostValue> + 'static,
    {
        Self {
            name: Rc::from(name),
            func: Rc::new(func),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke with positional arguments
    pub fn call(&self, args: &[HostValue]) -> Result<HostValue> {
        (self.func)(args)
    }

    /// Whether both handles refer to the same function
    pub fn ptr_eq(&self, other: &HostCallable) -> bool {
        Rc::ptr_eq(&self.func, &other.func)
    }
}

impl fmt::Debug for HostCallable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<function {}>", self.name)
    }
}

/// A host runtime value
#[derive(Clone)]
pub enum HostValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<HostValue>),
    Callable(HostCallable),
    Future(HostFuture),
    Task(HostTask),
    Coroutine(HostCoroutine),
    /// Opaque proxy for an engine object with no host representation
    Script(JsValue),
}

impl HostValue {
    /// Host type name used in diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::None => "NoneType",
            HostValue::Bool(_) => "bool",
            HostValue::Int(_) => "int",
            HostValue::Float(_) => "float",
            HostValue::Str(_) => "str",
            HostValue::List(_) => "list",
            HostValue::Callable(_) => "function",
            HostValue::Future(_) => "Future",
            HostValue::Task(_) => "Task",
            HostValue::Coroutine(_) => "coroutine",
            HostValue::Script(_) => "ScriptObject",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, HostValue::None)
    }

    /// Whether awaiting this value is meaningful on the host
    pub fn is_awaitable(&self) -> bool {
        matches!(
            self,
            HostValue::Future(_) | HostValue::Task(_) | HostValue::Coroutine(_)
        )
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Int(i) => Some(*i as f64),
            HostValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Await this value on the host.
    ///
    /// Futures, tasks and coroutines are awaited; any other value fails with
    /// the host `TypeError` for non-awaitable objects.
    pub async fn resolve(self) -> Result<HostValue> {
        match self {
            HostValue::Future(future) => future.await,
            HostValue::Task(task) => task.await,
            HostValue::Coroutine(coroutine) => coroutine.await,
            other => Err(Error::type_error(messages::not_awaitable(other.type_name()))),
        }
    }
}

/// Render a float the way the host prints it (`nan`, `inf`, `123.0`)
pub fn format_float(n: f64) -> String {
    if n.is_nan() {
        "nan".to_string()
    } else if n.is_infinite() {
        if n > 0.0 {
            "inf".to_string()
        } else {
            "-inf".to_string()
        }
    } else if n.fract() == 0.0 && n.abs() < 1e16 {
        format!("{:.1}", n)
    } else {
        format!("{}", n)
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::None => write!(f, "None"),
            HostValue::Bool(b) => write!(f, "{}", b),
            HostValue::Int(i) => write!(f, "{}", i),
            HostValue::Float(n) => write!(f, "{}", format_float(*n)),
            HostValue::Str(s) => write!(f, "{}", s),
            HostValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            HostValue::Callable(c) => write!(f, "{:?}", c),
            HostValue::Future(fut) => write!(f, "<Future #{}>", fut.id()),
            HostValue::Task(task) => write!(f, "<Task {}>", task.name()),
            HostValue::Coroutine(coro) => write!(f, "<coroutine {}>", coro.name()),
            HostValue::Script(v) => write!(f, "{}", v),
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Str(s) => write!(f, "{:?}", s),
            HostValue::Script(v) => write!(f, "Script({:?})", v),
            other => write!(f, "{}", other),
        }
    }
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (HostValue::None, HostValue::None) => true,
            (HostValue::Bool(a), HostValue::Bool(b)) => a == b,
            (HostValue::Str(a), HostValue::Str(b)) => a == b,
            (HostValue::List(a), HostValue::List(b)) => a == b,
            (HostValue::Callable(a), HostValue::Callable(b)) => a.ptr_eq(b),
            (HostValue::Future(a), HostValue::Future(b)) => a.ptr_eq(b),
            (HostValue::Task(a), HostValue::Task(b)) => a.future().ptr_eq(b.future()),
            (HostValue::Coroutine(a), HostValue::Coroutine(b)) => a.ptr_eq(b),
            (HostValue::Script(a), HostValue::Script(b)) => a.strict_equals(b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        HostValue::Bool(b)
    }
}

impl From<i64> for HostValue {
    fn from(i: i64) -> Self {
        HostValue::Int(i)
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        HostValue::Float(n)
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::Str(s.to_string())
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        HostValue::Str(s)
    }
}

impl From<Vec<HostValue>> for HostValue {
    fn from(items: Vec<HostValue>) -> Self {
        HostValue::List(items)
    }
}

impl From<HostCallable> for HostValue {
    fn from(c: HostCallable) -> Self {
        HostValue::Callable(c)
    }
}

impl From<HostFuture> for HostValue {
    fn from(f: HostFuture) -> Self {
        HostValue::Future(f)
    }
}

impl From<HostTask> for HostValue {
    fn from(t: HostTask) -> Self {
        HostValue::Task(t)
    }
}

impl From<HostCoroutine> for HostValue {
    fn from(c: HostCoroutine) -> Self {
        HostValue::Coroutine(c)
    }
}

/// Plain data that background threads hand back to the loop thread
#[derive(Debug, Clone, PartialEq)]
pub enum Transfer {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<Transfer> for HostValue {
    fn from(t: Transfer) -> Self {
        match t {
            Transfer::None => HostValue::None,
            Transfer::Bool(b) => HostValue::Bool(b),
            Transfer::Int(i) => HostValue::Int(i),
            Transfer::Float(n) => HostValue::Float(n),
            Transfer::Str(s) => HostValue::Str(s),
        }
    }
}
