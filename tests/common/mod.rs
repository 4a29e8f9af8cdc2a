//! Shared test helpers for integration tests

#![allow(dead_code)]

use quickbridge::engine::{JsValue, SnippetEvaluator};
use quickbridge::host::EventLoop;
use quickbridge::{Bridge, BridgeConfig};
use std::cell::RefCell;
use std::rc::Rc;

/// A bridge with an empty snippet table and a fresh loop
pub fn setup() -> (Bridge, Rc<SnippetEvaluator>, EventLoop) {
    setup_with(BridgeConfig::default())
}

pub fn setup_with(config: BridgeConfig) -> (Bridge, Rc<SnippetEvaluator>, EventLoop) {
    let snippets = Rc::new(SnippetEvaluator::new());
    let bridge = Bridge::with_evaluator(config, snippets.clone()).unwrap();
    (bridge, snippets, EventLoop::new())
}

/// Look up a global of the bridge's engine
pub fn global(bridge: &Bridge, name: &str) -> JsValue {
    let cx = bridge.context();
    cx.get(&cx.global(), name).unwrap()
}

/// Call a global function with the global object as receiver
pub fn call_global(
    bridge: &Bridge,
    name: &str,
    args: &[JsValue],
) -> quickbridge::engine::JsResult<JsValue> {
    let cx = bridge.context();
    cx.call(&global(bridge, name), &cx.global(), args)
}

/// Engine function pushing its arguments, joined by spaces, onto `log`
pub fn recorder(bridge: &Bridge, log: &Rc<RefCell<Vec<String>>>) -> JsValue {
    let log = log.clone();
    bridge.context().function("record", move |_cx, _this, args| {
        let line = args
            .iter()
            .map(JsValue::to_js_string)
            .collect::<Vec<_>>()
            .join(" ");
        log.borrow_mut().push(line);
        Ok(JsValue::Undefined)
    })
}

pub fn new_log() -> Rc<RefCell<Vec<String>>> {
    Rc::new(RefCell::new(Vec::new()))
}
