//! Integration tests for promises and awaitable coercion

mod common;
use common::{call_global, global, new_log, recorder, setup};
use quickbridge::engine::{Exception, JsValue};
use quickbridge::host::{HostCallable, HostCoroutine, HostTask, HostValue};
use quickbridge::{Bridge, Error};
use std::cell::RefCell;
use std::rc::Rc;

/// `new Promise(resolve => setTimeout(resolve, delay_ms, value))`
fn delayed_promise(bridge: &Bridge, delay_ms: f64, value: JsValue) -> JsValue {
    let cx = bridge.context();
    let set_timeout = global(bridge, "setTimeout");
    let executor = cx.function("executor", move |cx, _this, args| {
        let resolve = args.first().cloned().unwrap_or_default();
        cx.call(
            &set_timeout,
            &cx.global(),
            &[resolve, JsValue::Number(delay_ms), value.clone()],
        )
    });
    cx.construct_promise(&executor).unwrap()
}

mod ordering {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_promise_chain_beats_zero_delay_timer() {
        let (bridge, _snippets, event_loop) = setup();
        let log = new_log();
        let record = recorder(&bridge, &log);
        let engine = bridge.clone();
        let clock = event_loop.clone();
        bridge
            .run_until_complete(&event_loop, async move {
                call_global(
                    &engine,
                    "setTimeout",
                    &[record.clone(), JsValue::Number(0.0), JsValue::from("timer")],
                )
                .unwrap();
                let cx = engine.context();
                let mut promise = cx.promise_resolve(&JsValue::Undefined).unwrap();
                for step in ["then 1", "then 2", "then 3"] {
                    let record = record.clone();
                    promise = cx
                        .then_native(
                            &promise,
                            move |cx, _| cx.call(&record, &JsValue::Undefined, &[JsValue::from(step)]),
                            |_, reason| Err(Exception::Thrown(reason)),
                        )
                        .unwrap();
                }
                clock.sleep(1).await
            })
            .unwrap();
        assert_eq!(*log.borrow(), vec!["then 1", "then 2", "then 3", "timer"]);
    }

    #[test]
    fn test_jobs_drain_between_host_callbacks() {
        let (bridge, _snippets, event_loop) = setup();
        let log = new_log();
        let engine = bridge.clone();
        let clock = event_loop.clone();
        let inner = log.clone();
        bridge
            .run_until_complete(&event_loop, async move {
                let cx = engine.context();
                let promise = cx.promise_resolve(&JsValue::Number(1.0)).unwrap();
                let seen = inner.clone();
                cx.then_native(
                    &promise,
                    move |_, value| {
                        seen.borrow_mut().push(format!("job {}", value));
                        Ok(value)
                    },
                    |_, reason| Ok(reason),
                )
                .unwrap();
                let later = inner.clone();
                clock.call_soon(move || later.borrow_mut().push("host callback".to_string()));
                Ok(HostValue::None)
            })
            .unwrap();
        assert_eq!(log.borrow().first().map(String::as_str), Some("job 1"));
    }
}

mod host_to_engine {
    use super::*;
    use pretty_assertions::assert_eq;

    /// `sum3(a, b, c) => a.then(v => v + b + c)`
    fn sum3(bridge: &Bridge) -> JsValue {
        bridge.context().function("sum3", |cx, _this, args| {
            let b = args.get(1).map(JsValue::to_number).unwrap_or(f64::NAN);
            let c = args.get(2).map(JsValue::to_number).unwrap_or(f64::NAN);
            let a = args.first().cloned().unwrap_or_default();
            cx.then_native(
                &a,
                move |_, v| Ok(JsValue::Number(v.to_number() + b + c)),
                |_, reason| Err(Exception::Thrown(reason)),
            )
        })
    }

    #[test]
    fn test_future_resolved_later_feeds_engine_sum() {
        let (bridge, _snippets, event_loop) = setup();
        let sum3 = sum3(&bridge);
        let engine = bridge.clone();
        let clock = event_loop.clone();
        let result = bridge
            .run_until_complete(&event_loop, async move {
                let future = clock.create_future();
                let setter = future.clone();
                clock.call_later(5, move || {
                    setter.set_result(HostValue::Int(6)).unwrap();
                });
                let promise = engine.call_value(
                    &sum3,
                    &[HostValue::Future(future), HostValue::Int(1), HostValue::Int(2)],
                )?;
                promise.resolve().await
            })
            .unwrap();
        assert_eq!(result, HostValue::Float(9.0));
    }

    #[test]
    fn test_already_settled_future_feeds_engine_sum() {
        let (bridge, _snippets, event_loop) = setup();
        let sum3 = sum3(&bridge);
        let engine = bridge.clone();
        let clock = event_loop.clone();
        let result = bridge
            .run_until_complete(&event_loop, async move {
                let future = clock.create_future();
                future.set_result(HostValue::Int(6))?;
                assert!(future.done());
                let promise = engine.call_value(
                    &sum3,
                    &[HostValue::Future(future), HostValue::Int(1), HostValue::Int(2)],
                )?;
                promise.resolve().await
            })
            .unwrap();
        assert_eq!(result, HostValue::Float(9.0));
    }

    #[test]
    fn test_host_callable_result_is_awaited_by_engine() {
        let (bridge, _snippets, event_loop) = setup();
        let fn1 = HostCallable::new("fn1", |_args| {
            let ident0 = HostCoroutine::new("ident0", async { Ok(HostValue::from("innermost")) });
            let ident1 =
                HostCoroutine::new("ident1", async move { Ok(HostValue::Coroutine(ident0)) });
            Ok(HostValue::Coroutine(ident1))
        });
        bridge.set_global("fn1", HostValue::Callable(fn1)).unwrap();

        let engine = bridge.clone();
        let result = bridge
            .run_until_complete(&event_loop, async move {
                let cx = engine.context();
                let start = cx.promise_resolve(&JsValue::Undefined).unwrap();
                let chained = cx
                    .then_native(
                        &start,
                        |cx, _| {
                            let fn1 = cx.get(&cx.global(), "fn1")?;
                            let returned = cx.call(&fn1, &JsValue::Undefined, &[])?;
                            assert!(returned.as_promise().is_some());
                            Ok(returned)
                        },
                        |_, reason| Err(Exception::Thrown(reason)),
                    )
                    .unwrap();
                engine.await_engine(&chained)?.await
            })
            .unwrap();
        assert_eq!(result, HostValue::from("innermost"));
    }

    #[test]
    fn test_settled_future_still_resolves_asynchronously() {
        let (bridge, _snippets, event_loop) = setup();
        let engine = bridge.clone();
        let clock = event_loop.clone();
        let result = bridge
            .run_until_complete(&event_loop, async move {
                let future = clock.create_future();
                future.set_result(HostValue::from("ready")).unwrap();
                let promise = engine.to_engine(HostValue::Future(future))?;
                let state = format!("{:?}", promise);
                assert_eq!(state, "Promise { <pending> }");
                engine.await_engine(&promise)?.await
            })
            .unwrap();
        assert_eq!(result, HostValue::from("ready"));
    }

    #[test]
    fn test_nested_coroutines_resolve_to_innermost_value() {
        let (bridge, _snippets, event_loop) = setup();
        let innermost = HostCoroutine::new("c3", async { Ok(HostValue::from("nested")) });
        let middle = HostCoroutine::new("c2", async move { Ok(HostValue::Coroutine(innermost)) });
        let outer = HostCoroutine::new("c1", async move { Ok(HostValue::Coroutine(middle)) });

        let engine = bridge.clone();
        let result = bridge
            .run_until_complete(&event_loop, async move {
                let promise = engine.to_engine(HostValue::Coroutine(outer))?;
                engine.await_engine(&promise)?.await
            })
            .unwrap();
        assert_eq!(result, HostValue::from("nested"));
    }

    #[test]
    fn test_deep_future_chain() {
        let (bridge, _snippets, event_loop) = setup();
        let engine = bridge.clone();
        let clock = event_loop.clone();
        let result = bridge
            .run_until_complete(&event_loop, async move {
                let mut value = HostValue::from("bottom");
                for _ in 0..200 {
                    let future = clock.create_future();
                    future.set_result(value).unwrap();
                    value = HostValue::Future(future);
                }
                let promise = engine.to_engine(value)?;
                engine.await_engine(&promise)?.await
            })
            .unwrap();
        assert_eq!(result, HostValue::from("bottom"));
    }

    #[test]
    fn test_consumed_coroutine_cannot_be_reused() {
        let (bridge, _snippets, event_loop) = setup();
        let engine = bridge.clone();
        let result = bridge
            .run_until_complete(&event_loop, async move {
                let coroutine = HostCoroutine::new("once", async { Ok(HostValue::Int(1)) });
                assert_eq!(coroutine.clone().await?, HostValue::Int(1));

                let again = coroutine.clone().await.unwrap_err();
                assert_eq!(again, Error::AlreadyConsumed);
                assert_eq!(
                    again.to_string(),
                    "RuntimeError: cannot reuse already awaited coroutine"
                );

                let err = engine.to_engine(HostValue::Coroutine(coroutine)).unwrap_err();
                assert_eq!(err, Error::AlreadyConsumed);
                Ok(HostValue::Str(err.to_string()))
            })
            .unwrap();
        assert_eq!(
            result,
            HostValue::from("RuntimeError: cannot reuse already awaited coroutine")
        );
    }

    #[test]
    fn test_cancelled_task_rejects_engine_promise() {
        let (bridge, _snippets, event_loop) = setup();
        let engine = bridge.clone();
        let clock = event_loop.clone();
        let reason = Rc::new(RefCell::new(None));
        let seen = reason.clone();
        bridge
            .run_until_complete(&event_loop, async move {
                let sleeper = clock.clone();
                let task: HostTask =
                    clock.spawn("sleeper", async move { sleeper.sleep(100).await });
                let promise = engine.to_engine(HostValue::Task(task.clone()))?;
                engine
                    .context()
                    .then_native(
                        &promise,
                        |_, value| Ok(value),
                        move |cx, reason| {
                            *seen.borrow_mut() = Some(cx.get(&reason, "message")?.to_js_string());
                            Ok(JsValue::Undefined)
                        },
                    )
                    .map_err(quickbridge::bridge::marshal::engine_exception_to_host)?;
                assert!(task.cancel());
                clock.sleep(1).await
            })
            .unwrap();
        assert_eq!(reason.borrow().as_deref(), Some("Rust CancelledError"));
    }
}

mod engine_to_host {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_timer_backed_promise_awaited_on_host() {
        let (bridge, _snippets, event_loop) = setup();
        let engine = bridge.clone();
        let clock = event_loop.clone();
        let result = bridge
            .run_until_complete(&event_loop, async move {
                let promise = delayed_promise(&engine, 40.0, JsValue::from("late value"));
                let value = engine.await_engine(&promise)?.await?;
                Ok(HostValue::List(vec![value, HostValue::Int(clock.time() as i64)]))
            })
            .unwrap();
        assert_eq!(
            result,
            HostValue::List(vec![HostValue::from("late value"), HostValue::Int(40)])
        );
    }

    #[test]
    fn test_rejected_promise_raises_on_host() {
        let (bridge, _snippets, event_loop) = setup();
        let engine = bridge.clone();
        let err = bridge
            .run_until_complete(&event_loop, async move {
                let cx = engine.context();
                let reason = cx.new_error(quickbridge::engine::ErrorKind::RangeError, "out of range");
                let promise = cx.promise_reject(reason).unwrap();
                engine.await_engine(&promise)?.await
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "RangeError: out of range");
    }

    #[test]
    fn test_promise_resolving_to_host_future_is_flattened() {
        let (bridge, _snippets, event_loop) = setup();
        let engine = bridge.clone();
        let clock = event_loop.clone();
        let result = bridge
            .run_until_complete(&event_loop, async move {
                let inner = clock.sleep(10);
                let cx = engine.context();
                let wrapped = engine.to_engine(HostValue::Future(inner))?;
                let outer = cx
                    .then_native(
                        &cx.promise_resolve(&JsValue::Undefined).unwrap(),
                        move |_, _| Ok(wrapped.clone()),
                        |_, reason| Err(Exception::Thrown(reason)),
                    )
                    .unwrap();
                engine.await_engine(&outer)?.await?;
                Ok(HostValue::Int(clock.time() as i64))
            })
            .unwrap();
        assert_eq!(result, HostValue::Int(10));
    }

    #[test]
    fn test_custom_thenable_is_adopted() {
        let (bridge, _snippets, event_loop) = setup();
        let engine = bridge.clone();
        let result = bridge
            .run_until_complete(&event_loop, async move {
                let cx = engine.context();
                let thenable = cx.new_object();
                let then = cx.function("then", |cx, _this, args| {
                    let on_fulfilled = args.first().cloned().unwrap_or_default();
                    cx.call(&on_fulfilled, &JsValue::Undefined, &[JsValue::from("adopted")])
                });
                cx.define(&thenable, "then", then);
                engine.await_engine(&thenable)?.await
            })
            .unwrap();
        assert_eq!(result, HostValue::from("adopted"));
    }

    #[test]
    fn test_awaiting_plain_value_on_host_fails() {
        let (bridge, _snippets, event_loop) = setup();
        let err = bridge
            .run_until_complete(&event_loop, async { HostValue::from("text").resolve().await })
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "TypeError: object str can't be used in 'await' expression"
        );
    }
}

mod statics {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_promise_statics_require_constructor_receiver() {
        let (bridge, _snippets, event_loop) = setup();
        let engine = bridge.clone();
        bridge
            .run_until_complete(&event_loop, async move {
                let cx = engine.context();
                let promise_ctor = global(&engine, "Promise");
                for name in ["resolve", "reject"] {
                    let method = cx.get(&promise_ctor, name).unwrap();
                    match cx.call(&method, &JsValue::Undefined, &[JsValue::Number(1.0)]) {
                        Err(Exception::Thrown(err)) => {
                            assert_eq!(err.to_js_string(), "TypeError: undefined is not a constructor");
                        }
                        other => panic!("expected a TypeError, got {:?}", other.map(|v| v.to_js_string())),
                    }
                    assert!(cx.call(&method, &promise_ctor, &[JsValue::Number(1.0)]).is_ok());
                }
                Ok(HostValue::None)
            })
            .unwrap();
    }
}
