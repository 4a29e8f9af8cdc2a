//! Engine values and the object model

use super::context::Context;
use super::promise::PromiseRef;
use crate::error::{Error, ScriptOrigin};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Shared, mutable engine object
pub type ObjectRef = Rc<RefCell<Object>>;

/// Signature of native engine functions: `(context, this, arguments)`
pub type NativeFn = dyn Fn(&Context, &JsValue, &[JsValue]) -> JsResult<JsValue>;

/// Result of running engine code
pub type JsResult<T> = std::result::Result<T, Exception>;

/// Abrupt completion of engine code
#[derive(Clone)]
pub enum Exception {
    /// A catchable `throw`
    Thrown(JsValue),
    /// A host-level failure that script code cannot catch
    Fatal(Error),
}

impl From<Error> for Exception {
    fn from(err: Error) -> Self {
        Exception::Fatal(err)
    }
}

impl fmt::Debug for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exception::Thrown(value) => write!(f, "Thrown({:?})", value),
            Exception::Fatal(err) => write!(f, "Fatal({})", err),
        }
    }
}

/// Built-in error constructors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Error,
    TypeError,
    RangeError,
    ReferenceError,
    SyntaxError,
    InternalError,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::Error => "Error",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::RangeError => "RangeError",
            ErrorKind::ReferenceError => "ReferenceError",
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::InternalError => "InternalError",
        }
    }
}

/// Internal slots of an error object; `name` and `message` live in its properties
#[derive(Debug, Clone, Default)]
pub struct ErrorData {
    /// Where the error was created, when it happened during an evaluation
    pub origin: Option<ScriptOrigin>,
}

/// A callable engine object
#[derive(Clone)]
pub struct JsFunction {
    pub name: String,
    pub call: Rc<NativeFn>,
    /// Behavior under `new`; `None` for plain functions
    pub construct: Option<Rc<NativeFn>>,
}

/// What kind of object this is
#[derive(Clone)]
pub enum ObjectKind {
    Ordinary,
    Array(Vec<JsValue>),
    Function(JsFunction),
    Promise(PromiseRef),
    Error(ErrorData),
}

/// An engine object
pub struct Object {
    pub kind: ObjectKind,
    pub properties: FxHashMap<String, JsValue>,
    pub prototype: Option<ObjectRef>,
    /// Embedder slot, used to tie proxies back to the host value they wrap
    pub host_data: Option<Rc<dyn Any>>,
}

impl Object {
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            properties: FxHashMap::default(),
            prototype: None,
            host_data: None,
        }
    }

    pub fn with_prototype(kind: ObjectKind, prototype: Option<ObjectRef>) -> Self {
        Self {
            prototype,
            ..Self::new(kind)
        }
    }

    pub fn into_value(self) -> JsValue {
        JsValue::Object(Rc::new(RefCell::new(self)))
    }
}

/// An engine value
#[derive(Clone, Default)]
pub enum JsValue {
    #[default]
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    Object(ObjectRef),
}

impl JsValue {
    pub fn string(s: impl Into<String>) -> Self {
        JsValue::String(s.into())
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, JsValue::Undefined)
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, JsValue::Undefined | JsValue::Null)
    }

    pub fn is_object(&self) -> bool {
        matches!(self, JsValue::Object(_))
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            JsValue::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            JsValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            JsValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_callable(&self) -> bool {
        self.as_function().is_some()
    }

    /// The function slots of a callable object
    pub fn as_function(&self) -> Option<JsFunction> {
        match self {
            JsValue::Object(obj) => match obj.borrow().kind {
                ObjectKind::Function(ref func) => Some(func.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// The promise slots of a promise object
    pub fn as_promise(&self) -> Option<PromiseRef> {
        match self {
            JsValue::Object(obj) => match obj.borrow().kind {
                ObjectKind::Promise(ref promise) => Some(promise.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        match self {
            JsValue::Object(obj) => matches!(obj.borrow().kind, ObjectKind::Error(_)),
            _ => false,
        }
    }

    /// Embedder data attached to an object, downcast to `T`
    pub fn host_data<T: 'static>(&self) -> Option<Rc<T>> {
        let obj = self.as_object()?;
        let data = obj.borrow().host_data.clone()?;
        data.downcast::<T>().ok()
    }

    /// The `typeof` operator
    pub fn type_of(&self) -> &'static str {
        match self {
            JsValue::Undefined => "undefined",
            JsValue::Null => "object",
            JsValue::Boolean(_) => "boolean",
            JsValue::Number(_) => "number",
            JsValue::String(_) => "string",
            JsValue::Object(_) if self.is_callable() => "function",
            JsValue::Object(_) => "object",
        }
    }

    pub fn to_boolean(&self) -> bool {
        match self {
            JsValue::Undefined | JsValue::Null => false,
            JsValue::Boolean(b) => *b,
            JsValue::Number(n) => *n != 0.0 && !n.is_nan(),
            JsValue::String(s) => !s.is_empty(),
            JsValue::Object(_) => true,
        }
    }

    /// `ToNumber`, without invoking user-defined conversions
    pub fn to_number(&self) -> f64 {
        match self {
            JsValue::Undefined => f64::NAN,
            JsValue::Null => 0.0,
            JsValue::Boolean(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            JsValue::Number(n) => *n,
            JsValue::String(s) => string_to_number(s),
            JsValue::Object(obj) => match obj.borrow().kind {
                ObjectKind::Array(ref items) if items.is_empty() => 0.0,
                ObjectKind::Array(ref items) if items.len() == 1 => items[0].to_number(),
                _ => f64::NAN,
            },
        }
    }

    /// `ToString`, without invoking user-defined conversions
    pub fn to_js_string(&self) -> String {
        match self {
            JsValue::Undefined => "undefined".to_string(),
            JsValue::Null => "null".to_string(),
            JsValue::Boolean(b) => b.to_string(),
            JsValue::Number(n) => number_to_string(*n),
            JsValue::String(s) => s.clone(),
            JsValue::Object(obj) => {
                let obj = obj.borrow();
                match obj.kind {
                    ObjectKind::Ordinary => "[object Object]".to_string(),
                    ObjectKind::Array(ref items) => items
                        .iter()
                        .map(|item| {
                            if item.is_nullish() {
                                String::new()
                            } else {
                                item.to_js_string()
                            }
                        })
                        .collect::<Vec<_>>()
                        .join(","),
                    ObjectKind::Function(ref func) => {
                        format!("function {}() {{\n    [native code]\n}}", func.name)
                    }
                    ObjectKind::Promise(_) => "[object Promise]".to_string(),
                    ObjectKind::Error(_) => {
                        let name = obj
                            .properties
                            .get("name")
                            .map(JsValue::to_js_string)
                            .unwrap_or_else(|| "Error".to_string());
                        let message = obj
                            .properties
                            .get("message")
                            .map(JsValue::to_js_string)
                            .unwrap_or_default();
                        if message.is_empty() {
                            name
                        } else {
                            format!("{}: {}", name, message)
                        }
                    }
                }
            }
        }
    }

    /// `===`
    pub fn strict_equals(&self, other: &JsValue) -> bool {
        match (self, other) {
            (JsValue::Undefined, JsValue::Undefined) => true,
            (JsValue::Null, JsValue::Null) => true,
            (JsValue::Boolean(a), JsValue::Boolean(b)) => a == b,
            (JsValue::Number(a), JsValue::Number(b)) => a == b,
            (JsValue::String(a), JsValue::String(b)) => a == b,
            (JsValue::Object(a), JsValue::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

fn string_to_number(s: &str) -> f64 {
    let trimmed = s.trim();
    match trimmed {
        "" => 0.0,
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        _ => {
            if let Some(hex) = trimmed
                .strip_prefix("0x")
                .or_else(|| trimmed.strip_prefix("0X"))
            {
                return u64::from_str_radix(hex, 16)
                    .map(|n| n as f64)
                    .unwrap_or(f64::NAN);
            }
            // Rust accepts "inf"/"nan" spellings that JS does not
            if trimmed.chars().any(|c| c.is_ascii_alphabetic() && c != 'e' && c != 'E') {
                return f64::NAN;
            }
            trimmed.parse::<f64>().unwrap_or(f64::NAN)
        }
    }
}

/// Number formatting for `ToString`
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 {
            "Infinity".to_string()
        } else {
            "-Infinity".to_string()
        }
    } else if n == 0.0 {
        "0".to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl fmt::Display for JsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_js_string())
    }
}

impl fmt::Debug for JsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsValue::String(s) => write!(f, "{:?}", s),
            JsValue::Object(obj) => {
                let state = match obj.try_borrow() {
                    Ok(o) => match o.kind {
                        ObjectKind::Promise(ref p) => Some(p.borrow().state),
                        _ => None,
                    },
                    Err(_) => return write!(f, "[object]"),
                };
                match state {
                    Some(state) => write!(f, "Promise {{ <{}> }}", state.label()),
                    None => write!(f, "{}", self.to_js_string()),
                }
            }
            other => write!(f, "{}", other.to_js_string()),
        }
    }
}

impl From<bool> for JsValue {
    fn from(b: bool) -> Self {
        JsValue::Boolean(b)
    }
}

impl From<f64> for JsValue {
    fn from(n: f64) -> Self {
        JsValue::Number(n)
    }
}

impl From<&str> for JsValue {
    fn from(s: &str) -> Self {
        JsValue::String(s.to_string())
    }
}

impl From<String> for JsValue {
    fn from(s: String) -> Self {
        JsValue::String(s)
    }
}
