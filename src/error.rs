//! Error types for the Quickbridge runtime bridge

use crate::host::HostException;
use std::fmt;
use thiserror::Error;

/// Where a piece of script source came from
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScriptOrigin {
    /// File name reported in diagnostics
    pub file: String,
    /// Line number (1-indexed)
    pub line: u32,
}

impl ScriptOrigin {
    /// Create a new origin
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for ScriptOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// A value thrown by script code, rendered into host form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptError {
    /// Error name (`TypeError`, `Error`, ...) when the thrown value was an error object
    pub name: Option<String>,
    /// Message, or the rendered primitive for non-error throws
    pub message: String,
    /// Location of the throw when the engine knows it
    pub origin: Option<ScriptOrigin>,
}

impl ScriptError {
    /// A structured error object
    pub fn structured(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            message: message.into(),
            origin: None,
        }
    }

    /// A thrown primitive (string, number, ...)
    pub fn primitive(rendered: impl Into<String>) -> Self {
        Self {
            name: None,
            message: rendered.into(),
            origin: None,
        }
    }

    /// Attach a source location
    pub fn with_origin(mut self, origin: Option<ScriptOrigin>) -> Self {
        self.origin = origin;
        self
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref origin) = self.origin {
            writeln!(f, "Error in file {}, on line {}:", origin.file, origin.line)?;
        }
        match self.name {
            Some(ref name) if self.message.is_empty() => write!(f, "{}", name),
            Some(ref name) => write!(f, "{}: {}", name, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Main error type for Quickbridge
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// An asynchronous operation was attempted with no host loop driving the bridge
    #[error("{engine} cannot find a running {host} event-loop to make asynchronous calls.")]
    NoEventLoop { engine: String, host: String },

    /// A single-use host coroutine was consumed a second time
    #[error("RuntimeError: {}", messages::ALREADY_CONSUMED)]
    AlreadyConsumed,

    /// A value thrown by script code
    #[error("{0}")]
    Script(ScriptError),

    /// An exception raised by host code
    #[error("{0}")]
    Host(HostException),

    /// A thrown value that cannot be represented on the other side of the bridge
    #[error("UnsupportedValueError: {0}")]
    UnsupportedValue(String),

    /// Invalid or unreadable configuration
    #[error("ConfigError: {0}")]
    Config(String),
}

impl Error {
    /// Create the missing-loop error for the given runtime names
    pub fn no_event_loop(engine: impl Into<String>, host: impl Into<String>) -> Self {
        Error::NoEventLoop {
            engine: engine.into(),
            host: host.into(),
        }
    }

    /// Create a host exception of an arbitrary type
    pub fn host(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Host(HostException::new(type_name, message))
    }

    /// Create a host `TypeError`
    pub fn type_error(message: impl Into<String>) -> Self {
        Error::Host(HostException::type_error(message))
    }

    /// Create a host `RuntimeError`
    pub fn runtime_error(message: impl Into<String>) -> Self {
        Error::Host(HostException::runtime_error(message))
    }

    /// Whether this is the missing-loop failure
    pub fn is_no_event_loop(&self) -> bool {
        matches!(self, Error::NoEventLoop { .. })
    }

    /// Host exception type this error surfaces as when handed to script code
    pub fn host_type_name(&self) -> &str {
        match self {
            Error::NoEventLoop { .. } | Error::AlreadyConsumed => "RuntimeError",
            Error::Script(_) => "ScriptError",
            Error::Host(exc) => &exc.type_name,
            Error::UnsupportedValue(_) => "TypeError",
            Error::Config(_) => "ValueError",
        }
    }

    /// Message without the type prefix
    pub fn host_message(&self) -> String {
        match self {
            Error::Host(exc) => exc.message.clone(),
            Error::AlreadyConsumed => messages::ALREADY_CONSUMED.to_string(),
            Error::UnsupportedValue(msg) | Error::Config(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

/// Result type alias for Quickbridge
pub type Result<T> = std::result::Result<T, Error>;

/// Standardized error message templates
pub mod messages {
    pub const ALREADY_CONSUMED: &str = "cannot reuse already awaited coroutine";
    pub const LOOP_STOPPED: &str = "Event loop stopped before Future completed.";
    pub const LOOP_ALREADY_RUNNING: &str = "This event loop is already running";
    pub const INVALID_STATE: &str = "invalid state";
    pub const DYNAMIC_IMPORT_DISABLED: &str =
        "Dynamic module import is disabled or not supported in this context";
    pub const CHAINING_CYCLE: &str = "Chaining cycle detected for promise";
    pub const SOURCE_EVALUATION_UNSUPPORTED: &str = "source evaluation is not supported by this engine";
    pub const BACKGROUND_PANICKED: &str = "background work panicked";
    pub const PROMISE_NEEDS_NEW: &str = "Promise constructor cannot be invoked without 'new'";

    /// Format a "X is not a function" error message
    pub fn not_a_function(name: &str) -> String {
        format!("{} is not a function", name)
    }

    /// Format a "X is not a constructor" error message
    pub fn not_a_constructor(name: &str) -> String {
        format!("{} is not a constructor", name)
    }

    /// Format the host-side message for awaiting a plain value
    pub fn not_awaitable(type_name: &str) -> String {
        format!("object {} can't be used in 'await' expression", type_name)
    }

    /// Format the host-side message for calling a plain value
    pub fn not_callable(type_name: &str) -> String {
        format!("'{}' object is not callable", type_name)
    }

    /// Format a "Promise resolver X is not a function" error message
    pub fn bad_resolver(name: &str) -> String {
        format!("Promise resolver {} is not a function", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_event_loop_message_is_exact() {
        let err = Error::no_event_loop("Quickbridge", "Rust");
        assert_eq!(
            err.to_string(),
            "Quickbridge cannot find a running Rust event-loop to make asynchronous calls."
        );
        assert!(err.is_no_event_loop());
    }

    #[test]
    fn test_script_error_rendering() {
        let plain = ScriptError::structured("TypeError", "undefined has no properties");
        assert_eq!(plain.to_string(), "TypeError: undefined has no properties");

        let located = plain.with_origin(Some(ScriptOrigin::new("evaluate", 1)));
        assert_eq!(
            located.to_string(),
            "Error in file evaluate, on line 1:\nTypeError: undefined has no properties"
        );

        assert_eq!(ScriptError::primitive("123.0").to_string(), "123.0");
    }

    #[test]
    fn test_host_type_names() {
        assert_eq!(Error::AlreadyConsumed.host_type_name(), "RuntimeError");
        assert_eq!(Error::type_error("x").host_type_name(), "TypeError");
        assert_eq!(Error::type_error("x").host_message(), "x");
        assert_eq!(Error::AlreadyConsumed.host_message(), messages::ALREADY_CONSUMED);
    }
}
