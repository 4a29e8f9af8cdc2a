//! Exception marshaling
//!
//! Converts failures between the two runtimes at every coercion boundary.
//! Host errors become engine `Error` objects whose message is prefixed with
//! the host runtime name and exception type; engine throws become
//! [`Error::Script`], or [`Error::UnsupportedValue`] when the thrown object
//! has no host form.

use crate::engine::{Context, ErrorKind, Exception, JsValue, ObjectKind};
use crate::error::{Error, ScriptError};
use crate::host::{format_float, HostValue};

/// Message an engine-side `catch` sees for a host error
pub fn host_error_message(host_name: &str, err: &Error) -> String {
    let message = err.host_message();
    if message.is_empty() {
        format!("{} {}", host_name, err.host_type_name())
    } else {
        format!("{} {}: {}", host_name, err.host_type_name(), message)
    }
}

/// Host error to an engine error value
pub fn host_error_to_engine(cx: &Context, host_name: &str, err: &Error) -> JsValue {
    match err {
        // A script error coming back keeps its original shape
        Error::Script(script) => match script.name {
            Some(ref name) => {
                let value = cx.new_error(ErrorKind::Error, &script.message);
                cx.define(&value, "name", JsValue::from(name.as_str()));
                value
            }
            None => JsValue::from(script.message.as_str()),
        },
        other => cx.new_error(ErrorKind::Error, &host_error_message(host_name, other)),
    }
}

/// Host error as an engine completion.
///
/// The missing-loop and already-consumed errors stay fatal so they reach the
/// host caller unchanged.
pub fn host_error_to_exception(cx: &Context, host_name: &str, err: Error) -> Exception {
    if err.is_no_event_loop() || err == Error::AlreadyConsumed {
        Exception::Fatal(err)
    } else {
        Exception::Thrown(host_error_to_engine(cx, host_name, &err))
    }
}

/// Engine completion to a host error
pub fn engine_exception_to_host(exception: Exception) -> Error {
    match exception {
        Exception::Fatal(err) => err,
        Exception::Thrown(value) => thrown_value_to_host(&value),
    }
}

/// A thrown engine value to a host error.
///
/// Error objects keep their name, message and origin; primitives are
/// rendered the way the host prints them (`nan`, `123.0`, `anything`).
pub fn thrown_value_to_host(value: &JsValue) -> Error {
    let JsValue::Object(obj) = value else {
        return Error::Script(ScriptError::primitive(render_primitive(value)));
    };

    let structured = {
        let obj = obj.borrow();
        match obj.kind {
            ObjectKind::Error(ref data) => {
                let name = obj
                    .properties
                    .get("name")
                    .map(JsValue::to_js_string)
                    .unwrap_or_else(|| ErrorKind::Error.name().to_string());
                let message = obj
                    .properties
                    .get("message")
                    .map(JsValue::to_js_string)
                    .unwrap_or_default();
                Some(ScriptError::structured(name, message).with_origin(data.origin.clone()))
            }
            _ => None,
        }
    };

    match structured {
        Some(script) => Error::Script(script),
        None => Error::UnsupportedValue(format!(
            "thrown value {} has no host representation",
            value.to_js_string()
        )),
    }
}

/// Host rendering of an engine primitive
pub fn render_primitive(value: &JsValue) -> String {
    match value {
        JsValue::Undefined | JsValue::Null => HostValue::None.to_string(),
        JsValue::Boolean(b) => HostValue::Bool(*b).to_string(),
        JsValue::Number(n) => format_float(*n),
        JsValue::String(s) => s.clone(),
        JsValue::Object(_) => value.to_js_string(),
    }
}
