//! End-to-end tests: a controller driving a calc worker through the bridge.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::sync::Notify;
use xpy::bridge::transport::{SpawnError, WorkerLink};
use xpy::{
    Bridge, BridgeConfig, BridgeError, Context, ExecRequest, InProcessSpawner, ProcessSpawner,
    SetupError, WorkerSpawner, host_fn, host_fn_async,
};
use xpy_calc::CalcEngine;

fn calc_bridge() -> Bridge {
    Bridge::new(BridgeConfig::new(InProcessSpawner::new(CalcEngine::new)))
}

/// Counts spawns and delegates to an in-process worker.
struct CountingSpawner {
    inner: InProcessSpawner,
    spawns: Arc<AtomicUsize>,
}

impl WorkerSpawner for CountingSpawner {
    fn spawn(&self) -> Result<WorkerLink, SpawnError> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        self.inner.spawn()
    }

    fn shares_memory(&self) -> bool {
        true
    }
}

/// A worker that never says anything; its end of the pipe stays open.
#[derive(Default)]
struct SilentSpawner {
    held: Mutex<Vec<tokio::io::DuplexStream>>,
}

impl WorkerSpawner for SilentSpawner {
    fn spawn(&self) -> Result<WorkerLink, SpawnError> {
        let (controller, worker) = tokio::io::duplex(1024);
        self.held.lock().unwrap().push(worker);
        let (reader, writer) = tokio::io::split(controller);
        Ok(WorkerLink::new(reader, writer))
    }

    fn shares_memory(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn exec_returns_result_and_output() {
    let bridge = calc_bridge();

    let outcome = bridge.exec("1 + 1").await.unwrap();
    assert_eq!(outcome.result, Some(json!("2")));
    assert_eq!(outcome.stdout.as_deref(), Some(""));
    assert_eq!(outcome.stderr.as_deref(), Some(""));
    assert_eq!(outcome.error, None);

    let outcome = bridge
        .exec("x = 'hello'\nprint(x, 3)\neprint('careful')")
        .await
        .unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.result, None, "a none result crosses the wire as null");
    assert_eq!(outcome.stdout.as_deref(), Some("hello 3\n"));
    assert_eq!(outcome.stderr.as_deref(), Some("careful\n"));

    let outcome = bridge.exec("len(x)").await.unwrap();
    assert_eq!(outcome.result, Some(json!("5")), "globals persist across execs");
}

#[tokio::test]
async fn program_errors_do_not_break_the_bridge() {
    let bridge = calc_bridge();

    let outcome = bridge.exec("1 / 0").await.unwrap();
    assert_eq!(outcome.error.as_deref(), Some("ZeroDivisionError: division by zero"));
    assert_eq!(outcome.result, None);

    let outcome = bridge.exec("2 * 21").await.unwrap();
    assert_eq!(outcome.result, Some(json!("42")));
}

#[tokio::test]
async fn oversized_programs_fail_without_killing_the_worker() {
    let bridge = calc_bridge();

    let outcome = bridge.exec("'ab' * 9223372036854775807").await.unwrap();
    assert_eq!(outcome.error.as_deref(), Some("MemoryError: string too large"));

    let outcome = bridge
        .exec(format!("{}1", "-".repeat(200_000)))
        .await
        .unwrap();
    assert_eq!(
        outcome.error.as_deref(),
        Some("SyntaxError: too deeply nested (line 1)")
    );

    let outcome = bridge.exec("'ab' * 2").await.unwrap();
    assert_eq!(outcome.result, Some(json!("abab")));
}

#[tokio::test]
async fn context_values_and_functions_are_bound_for_one_exec() {
    let bridge = calc_bridge();
    let context = Context::new()
        .with_value("base", 40)
        .with_function("answer", host_fn(|_| Ok(json!(2))));

    let outcome = bridge
        .exec(ExecRequest::new("base + answer()").with_context(context))
        .await
        .unwrap();
    assert_eq!(outcome.result, Some(json!("42")));

    let stats = bridge.stats();
    assert!(stats.ready);
    assert_eq!(stats.functions, 0, "function scope released after the exec");
    assert_eq!(stats.pending, 0);

    let outcome = bridge.exec("answer()").await.unwrap();
    assert_eq!(
        outcome.error.as_deref(),
        Some("NameError: name 'answer' is not defined")
    );
}

#[tokio::test]
async fn aliased_function_stops_working_after_its_exec() {
    let bridge = calc_bridge();
    let context = Context::new().with_function("answer", host_fn(|_| Ok(json!(42))));
    let outcome = bridge
        .exec(ExecRequest::new("g = answer
g()").with_context(context))
        .await
        .unwrap();
    assert_eq!(outcome.result, Some(json!("42")));

    let later = Context::new().with_function("answer", host_fn(|_| Ok(json!("other exec"))));
    let outcome = bridge
        .exec(ExecRequest::new("g()").with_context(later))
        .await
        .unwrap();
    assert_eq!(
        outcome.error.as_deref(),
        Some("HostFunctionError: `answer` was bound for an exec that has finished")
    );
}

#[tokio::test]
async fn host_functions_receive_arguments_and_report_errors() {
    let bridge = calc_bridge();
    let context = Context::new()
        .with_function(
            "add",
            host_fn(|args| Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))),
        )
        .with_function("lookup", host_fn(|_| Err(anyhow::anyhow!("no such user"))))
        .with_function("explode", host_fn(|_| panic!("boom")));

    let outcome = bridge
        .exec(ExecRequest::new("add(2, 3, add(4))").with_context(context.clone()))
        .await
        .unwrap();
    assert_eq!(outcome.result, Some(json!("9")));

    let outcome = bridge
        .exec(ExecRequest::new("lookup('ada')").with_context(context.clone()))
        .await
        .unwrap();
    assert_eq!(outcome.error.as_deref(), Some("HostFunctionError: no such user"));

    let outcome = bridge
        .exec(ExecRequest::new("explode()").with_context(context))
        .await
        .unwrap();
    assert_eq!(
        outcome.error.as_deref(),
        Some("HostFunctionError: host function panicked: boom")
    );
    assert_eq!(bridge.stats().functions, 0, "failed execs release their functions");

    assert_eq!(bridge.exec("1").await.unwrap().result, Some(json!("1")));
}

#[tokio::test]
async fn async_host_function_suspends_the_program() {
    let bridge = calc_bridge();
    let fetch = host_fn_async(|args: Vec<Value>| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(json!(format!("record {}", args[0])))
    });

    let outcome = bridge
        .exec(ExecRequest::new("fetch(7)").with_context(Context::new().with_function("fetch", fetch)))
        .await
        .unwrap();
    assert_eq!(outcome.result, Some(json!("record 7")));
}

#[tokio::test]
async fn interrupt_stops_a_running_program() {
    let bridge = calc_bridge();
    bridge.ensure_ready().await.unwrap();

    let running = tokio::spawn({
        let bridge = bridge.clone();
        async move { bridge.exec("spin()").await }
    });
    while !running.is_finished() {
        bridge.interrupt().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let outcome = running.await.unwrap().unwrap();
    assert_eq!(outcome.error.as_deref(), Some("KeyboardInterrupt"));

    let outcome = bridge.exec("1 + 1").await.unwrap();
    assert_eq!(outcome.result, Some(json!("2")));
}

#[tokio::test]
async fn interrupt_while_idle_does_not_affect_the_next_exec() {
    let bridge = calc_bridge();
    bridge.interrupt().unwrap();
    bridge.ensure_ready().await.unwrap();

    bridge.interrupt().unwrap();
    let outcome = bridge.exec("sleep(30); 3").await.unwrap();
    assert_eq!(outcome.result, Some(json!("3")));
}

#[tokio::test]
async fn complete_install_and_format() {
    let bridge = calc_bridge();

    let completions = bridge.complete("pri", None, None).await.unwrap();
    let names: Vec<&str> = completions.matches.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["print"]);
    assert_eq!(completions.matches[0].full_name, "builtins.print");

    let completions = bridge
        .complete("import math\nmath.sq", Some(2), Some(7))
        .await
        .unwrap();
    assert!(completions.matches.is_empty(), "math is not imported yet");
    bridge.exec("import math").await.unwrap();
    let completions = bridge.complete("math.sq", None, None).await.unwrap();
    assert_eq!(completions.matches[0].full_name, "math.sqrt");

    let outcome = bridge.exec("import strings").await.unwrap();
    assert_eq!(
        outcome.error.as_deref(),
        Some("ModuleNotFoundError: no module named 'strings'")
    );
    let installed = bridge.install(["strings", "stats"]).await.unwrap();
    assert!(installed.success);
    let outcome = bridge
        .exec("import strings\nstrings.upper('hi')")
        .await
        .unwrap();
    assert_eq!(outcome.result, Some(json!("HI")));

    let err = bridge.install(["stats", "left-pad"]).await.unwrap_err();
    assert_eq!(
        err,
        BridgeError::Execution("PackageNotFoundError: no package named 'left-pad'".to_string())
    );

    let formatted = bridge.format("x=(1+2)*3;print( x )", Map::new()).await.unwrap();
    assert_eq!(formatted, "x = (1 + 2) * 3\nprint(x)");

    let mut options = Map::new();
    options.insert("indent".to_string(), json!(2));
    let err = bridge.format("x", options).await.unwrap_err();
    assert_eq!(
        err,
        BridgeError::Execution("FormatError: unknown option 'indent'".to_string())
    );
}

#[tokio::test]
async fn concurrent_callers_share_one_worker() {
    let spawns = Arc::new(AtomicUsize::new(0));
    let bridge = Bridge::new(BridgeConfig::new(CountingSpawner {
        inner: InProcessSpawner::new(CalcEngine::new),
        spawns: Arc::clone(&spawns),
    }));

    let (a, b, c) = tokio::join!(bridge.exec("1"), bridge.exec("2"), bridge.exec("3"));
    assert_eq!(a.unwrap().result, Some(json!("1")));
    assert_eq!(b.unwrap().result, Some(json!("2")));
    assert_eq!(c.unwrap().result, Some(json!("3")));
    assert_eq!(spawns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn setup_failure_reaches_every_caller_and_is_final() {
    let spawns = Arc::new(AtomicUsize::new(0));
    let bridge = Bridge::new(BridgeConfig::new(CountingSpawner {
        inner: InProcessSpawner::new(|| CalcEngine::new().with_bootstrap_error("no interpreter image")),
        spawns: Arc::clone(&spawns),
    }));

    let expected = BridgeError::Setup(SetupError::Worker("no interpreter image".to_string()));
    let (a, b) = tokio::join!(bridge.exec("1"), bridge.complete("p", None, None));
    assert_eq!(a.unwrap_err(), expected);
    assert_eq!(b.unwrap_err(), expected);

    assert_eq!(bridge.ensure_ready().await.unwrap_err(), expected);
    assert_eq!(spawns.load(Ordering::SeqCst), 1, "failed setup is not retried");
    assert!(!bridge.stats().ready);
}

#[tokio::test]
async fn silent_worker_times_out() {
    let bridge = Bridge::new(
        BridgeConfig::new(SilentSpawner::default()).with_setup_timeout(Duration::from_millis(50)),
    );
    let err = bridge.exec("1").await.unwrap_err();
    assert_eq!(
        err,
        BridgeError::Setup(SetupError::Timeout(Duration::from_millis(50)))
    );
}

#[tokio::test]
async fn overlapping_execs_cannot_share_a_function_name() {
    let bridge = calc_bridge();
    bridge.ensure_ready().await.unwrap();

    let gate = Arc::new(Notify::new());
    let wait = {
        let gate = Arc::clone(&gate);
        host_fn_async(move |_| {
            let gate = Arc::clone(&gate);
            async move {
                gate.notified().await;
                Ok(json!("opened"))
            }
        })
    };

    let first = tokio::spawn({
        let bridge = bridge.clone();
        let context = Context::new().with_function("wait", wait);
        async move { bridge.exec(ExecRequest::new("wait()").with_context(context)).await }
    });
    while bridge.stats().functions == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let err = bridge
        .exec(
            ExecRequest::new("wait()")
                .with_context(Context::new().with_function("wait", host_fn(|_| Ok(json!(0))))),
        )
        .await
        .unwrap_err();
    assert_eq!(err, BridgeError::FunctionNameConflict("wait".to_string()));

    gate.notify_one();
    let outcome = first.await.unwrap().unwrap();
    assert_eq!(outcome.result, Some(json!("opened")));
    assert_eq!(bridge.stats().functions, 0);
}

#[tokio::test]
async fn shutdown_disconnects_later_calls() {
    let bridge = calc_bridge();
    bridge.exec("1").await.unwrap();

    bridge.shutdown().await.unwrap();
    assert_eq!(bridge.exec("1").await.unwrap_err(), BridgeError::Disconnected);
}

#[tokio::test]
async fn child_process_worker() {
    let bridge = Bridge::new(BridgeConfig::new(
        ProcessSpawner::new(env!("CARGO_BIN_EXE_xpy-calc-worker")).env("XPY_LOG", "debug"),
    ));

    let context = Context::new().with_function("double", host_fn(|args| {
        Ok(json!(args[0].as_i64().unwrap_or_default() * 2))
    }));
    let outcome = bridge
        .exec(ExecRequest::new("double(20) + 2").with_context(context))
        .await
        .unwrap();
    assert_eq!(outcome.result, Some(json!("42")));

    assert_eq!(bridge.interrupt().unwrap_err(), BridgeError::InterruptUnsupported);

    bridge.shutdown().await.unwrap();
}
