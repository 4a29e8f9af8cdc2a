//! Quickbridge CLI
//!
//! Runs the built-in demonstration scenarios and prints the effective
//! configuration.

use anyhow::{anyhow, Context as _};
use clap::{Parser, Subcommand, ValueEnum};
use quickbridge::bridge::marshal::{engine_exception_to_host, thrown_value_to_host};
use quickbridge::engine::{Exception, JsValue};
use quickbridge::host::{
    EventLoop, HostCallable, HostCoroutine, HostException, HostValue, Transfer,
};
use quickbridge::{Bridge, BridgeConfig, VERSION};
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quickbridge")]
#[command(author, version, about = "Host event loop and script engine bridge", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (JSON)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a demonstration scenario
    Demo {
        #[arg(value_enum)]
        scenario: Scenario,
    },

    /// Print the effective configuration as JSON
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum Scenario {
    /// Timers firing in virtual time order
    Timers,
    /// A promise chain racing a zero-delay timer
    Promises,
    /// Nested host coroutines awaited from the engine
    Chain,
    /// Exceptions crossing the bridge in both directions
    Errors,
    /// Native-thread work surfaced as a promise
    Background,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = match cli.config {
        Some(ref path) => BridgeConfig::from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => BridgeConfig::default(),
    };

    match cli.command {
        Commands::Config => {
            println!("{}", config.to_json_pretty()?);
            Ok(())
        }
        Commands::Demo { scenario } => {
            println!("Quickbridge {}", VERSION);
            let bridge = Bridge::with_config(config)?;
            match scenario {
                Scenario::Timers => demo_timers(&bridge),
                Scenario::Promises => demo_promises(&bridge),
                Scenario::Chain => demo_chain(&bridge),
                Scenario::Errors => demo_errors(&bridge),
                Scenario::Background => demo_background(&bridge),
            }
        }
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn global_fn(bridge: &Bridge, name: &str) -> anyhow::Result<JsValue> {
    let cx = bridge.context();
    cx.get(&cx.global(), name)
        .map_err(|_| anyhow!("global {} is missing", name))
}

/// Engine function that appends a label and the loop time to `log`
fn recorder(bridge: &Bridge, event_loop: &EventLoop, log: &Rc<RefCell<Vec<String>>>) -> JsValue {
    let log = log.clone();
    let event_loop = event_loop.clone();
    bridge.context().function("record", move |_cx, _this, args| {
        let label = args.first().map(JsValue::to_js_string).unwrap_or_default();
        log.borrow_mut()
            .push(format!("{:>4}ms  {}", event_loop.time(), label));
        Ok(JsValue::Undefined)
    })
}

fn print_log(log: &Rc<RefCell<Vec<String>>>) {
    for line in log.borrow().iter() {
        println!("  {}", line);
    }
}

fn demo_timers(bridge: &Bridge) -> anyhow::Result<()> {
    let event_loop = EventLoop::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let record = recorder(bridge, &event_loop, &log);
    let set_timeout = global_fn(bridge, "setTimeout")?;
    let clear_timeout = global_fn(bridge, "clearTimeout")?;

    let engine = bridge.clone();
    let clock = event_loop.clone();
    bridge.run_until_complete(&event_loop, async move {
        let cx = engine.context();
        let global = cx.global();
        let schedule = |label: &str, delay: f64| {
            cx.call(
                &set_timeout,
                &global,
                &[record.clone(), JsValue::Number(delay), JsValue::from(label)],
            )
            .map_err(engine_exception_to_host)
        };
        schedule("third (30ms)", 30.0)?;
        schedule("first (10ms)", 10.0)?;
        let cancelled = schedule("never runs", 20.0)?;
        schedule("second (10ms, registered later)", 10.0)?;
        cx.call(&clear_timeout, &global, &[cancelled])
            .map_err(engine_exception_to_host)?;
        clock.sleep(50).await
    })?;

    println!("timers:");
    print_log(&log);
    Ok(())
}

fn demo_promises(bridge: &Bridge) -> anyhow::Result<()> {
    let event_loop = EventLoop::new();
    let log = Rc::new(RefCell::new(Vec::new()));
    let record = recorder(bridge, &event_loop, &log);
    let set_timeout = global_fn(bridge, "setTimeout")?;

    let engine = bridge.clone();
    let inner_log = log.clone();
    let clock = event_loop.clone();
    bridge.run_until_complete(&event_loop, async move {
        let cx = engine.context();
        cx.call(
            &set_timeout,
            &cx.global(),
            &[record, JsValue::Number(0.0), JsValue::from("zero-delay timer")],
        )
        .map_err(engine_exception_to_host)?;

        let mut promise = cx
            .promise_resolve(&JsValue::Number(0.0))
            .map_err(engine_exception_to_host)?;
        for step in 1..=3 {
            let log = inner_log.clone();
            let clock = clock.clone();
            promise = cx
                .then_native(
                    &promise,
                    move |_, value| {
                        log.borrow_mut()
                            .push(format!("{:>4}ms  promise step {}", clock.time(), step));
                        Ok(JsValue::Number(value.to_number() + 1.0))
                    },
                    |_, reason| Err(Exception::Thrown(reason)),
                )
                .map_err(engine_exception_to_host)?;
        }
        let total = engine.await_engine(&promise)?.await?;
        inner_log.borrow_mut().push(format!("chain result {}", total));
        // give the timer its turn
        clock.sleep(1).await
    })?;

    println!("promises:");
    print_log(&log);
    Ok(())
}

fn demo_chain(bridge: &Bridge) -> anyhow::Result<()> {
    let event_loop = EventLoop::new();
    let innermost = HostCoroutine::new("innermost", async { Ok(HostValue::from("nested")) });
    let middle = HostCoroutine::new("middle", async move { Ok(HostValue::Coroutine(innermost)) });
    let outer = HostCoroutine::new("outer", async move { Ok(HostValue::Coroutine(middle)) });

    let engine = bridge.clone();
    let result = bridge.run_until_complete(&event_loop, async move {
        let promise = engine.to_engine(HostValue::Coroutine(outer))?;
        engine.await_engine(&promise)?.await
    })?;
    println!("chain: {}", result);
    Ok(())
}

fn demo_errors(bridge: &Bridge) -> anyhow::Result<()> {
    let thrower = HostCallable::new("lookup", |_args| {
        Err(HostException::attribute_error("'list' object has no attribute 'non_exist'").into())
    });
    bridge.set_global("lookup", HostValue::Callable(thrower))?;
    let lookup = global_fn(bridge, "lookup")?;

    let cx = bridge.context();
    match cx.call(&lookup, &JsValue::Undefined, &[]) {
        Err(Exception::Thrown(error)) => {
            let message = cx.get(&error, "message").unwrap_or_default();
            println!("engine caught: {}", message);
        }
        other => println!("unexpected: {:?}", other.map(|v| v.to_js_string())),
    }

    for thrown in [JsValue::Number(f64::NAN), JsValue::Number(123.0), JsValue::from("anything")] {
        let err = thrown_value_to_host(&thrown);
        println!("host caught: {}", err);
    }

    match bridge.call_value(&global_fn(bridge, "setTimeout")?, &[]) {
        Err(err) => println!("outside the loop: {}", err),
        Ok(value) => println!("unexpected: {}", value),
    }
    Ok(())
}

fn demo_background(bridge: &Bridge) -> anyhow::Result<()> {
    let event_loop = EventLoop::new();
    let engine = bridge.clone();
    let result = bridge.run_until_complete(&event_loop, async move {
        let promise = engine.spawn_background("sum", || {
            let total: i64 = (1..=1_000).sum();
            Ok(Transfer::Int(total))
        })?;
        engine.await_engine(&promise)?.await
    })?;
    println!("background: sum(1..=1000) = {}", result);
    Ok(())
}
