//! Performance benchmarks for the Quickbridge runtime bridge
//!
//! Run with: cargo bench
//!
//! These benchmarks measure:
//! - Bridge construction
//! - Engine job queue throughput
//! - Timer scheduling and firing
//! - Host/engine awaitable round trips

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use quickbridge::engine::{Exception, JsValue};
use quickbridge::host::{EventLoop, HostValue};
use quickbridge::Bridge;

/// Benchmark: bridge construction (engine, globals, running-loop slot)
fn bench_bridge_new(c: &mut Criterion) {
    c.bench_function("bridge_new", |b| b.iter(|| black_box(Bridge::new())));
}

/// Benchmark: promise chains drained by the job queue
fn bench_promise_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("promise_chain");
    for length in [10usize, 100, 1_000] {
        group.throughput(Throughput::Elements(length as u64));
        group.bench_with_input(BenchmarkId::from_parameter(length), &length, |b, &length| {
            b.iter(|| {
                let bridge = Bridge::new();
                let event_loop = EventLoop::new();
                let engine = bridge.clone();
                bridge
                    .run_until_complete(&event_loop, async move {
                        let cx = engine.context();
                        let mut promise = cx.promise_resolve(&JsValue::Number(0.0)).unwrap();
                        for _ in 0..length {
                            promise = cx
                                .then_native(
                                    &promise,
                                    |_, v| Ok(JsValue::Number(v.to_number() + 1.0)),
                                    |_, reason| Err(Exception::Thrown(reason)),
                                )
                                .unwrap();
                        }
                        engine.await_engine(&promise)?.await
                    })
                    .unwrap()
            })
        });
    }
    group.finish();
}

/// Benchmark: setTimeout registration and firing in virtual time
fn bench_timers(c: &mut Criterion) {
    let mut group = c.benchmark_group("timers");
    for count in [10usize, 1_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let bridge = Bridge::new();
                let event_loop = EventLoop::new();
                let engine = bridge.clone();
                let clock = event_loop.clone();
                bridge
                    .run_until_complete(&event_loop, async move {
                        let cx = engine.context();
                        let global = cx.global();
                        let set_timeout = cx.get(&global, "setTimeout").unwrap();
                        let noop = cx.function("noop", |_, _, _| Ok(JsValue::Undefined));
                        for i in 0..count {
                            cx.call(
                                &set_timeout,
                                &global,
                                &[noop.clone(), JsValue::Number((i % 50) as f64)],
                            )
                            .unwrap();
                        }
                        clock.sleep(100).await
                    })
                    .unwrap()
            })
        });
    }
    group.finish();
}

/// Benchmark: host future -> engine promise -> host future
fn bench_round_trip(c: &mut Criterion) {
    c.bench_function("future_round_trip", |b| {
        let bridge = Bridge::new();
        let event_loop = EventLoop::new();
        b.iter(|| {
            let engine = bridge.clone();
            let clock = event_loop.clone();
            let result = bridge
                .run_until_complete(&event_loop, async move {
                    let future = clock.create_future();
                    future.set_result(HostValue::Int(1))?;
                    let promise = engine.to_engine(HostValue::Future(future))?;
                    engine.await_engine(&promise)?.await
                })
                .unwrap();
            black_box(result)
        })
    });
}

criterion_group!(
    benches,
    bench_bridge_new,
    bench_promise_chain,
    bench_timers,
    bench_round_trip,
);

criterion_main!(benches);
