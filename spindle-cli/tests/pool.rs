//! Worker pool tests against real `spindle` worker processes

use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value as JsonValue};
use spindle::builtin_registry;
use spindle_config::{ExecutionConfig, LostTaskPolicy};
use spindle_execution::{
    ExecutionError, Executor, FunctionRegistry, MultiprocExecutor, TaskArgs, TaskError,
    WorkerState,
};

const SPINDLE: &str = env!("CARGO_BIN_EXE_spindle");

fn pool_config(num_workers: usize) -> ExecutionConfig {
    ExecutionConfig {
        heartbeat_interval: Duration::from_millis(100),
        poll_interval: Duration::from_millis(100),
        worker_timeout: Duration::from_millis(1500),
        shutdown_timeout: Duration::from_secs(2),
        startup_timeout: Duration::from_secs(10),
        ..ExecutionConfig::multiproc(num_workers)
    }
    .with_worker_program(SPINDLE)
}

fn start_pool(config: ExecutionConfig) -> MultiprocExecutor {
    let executor = MultiprocExecutor::new(config, builtin_registry().unwrap());
    executor.start().unwrap();
    executor
}

fn args(values: Vec<JsonValue>) -> TaskArgs {
    TaskArgs::positional(values)
}

/// Poll `condition` until it holds or `timeout` passes
fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    condition()
}

#[test]
fn test_single_task_returns_result() {
    let executor = start_pool(pool_config(2));
    assert!(executor.is_healthy());

    let future = executor.submit("add", args(vec![json!(2), json!(3)])).unwrap();
    assert_eq!(future.result(Some(Duration::from_secs(10))), Ok(json!(5)));
    assert!(future.done());

    executor.shutdown(true).unwrap();
}

#[test]
fn test_unknown_function_resolves_with_error() {
    let executor = start_pool(pool_config(1));

    let future = executor.submit("missing_fn", TaskArgs::default()).unwrap();
    assert!(future.done());
    let err = future.result(None).unwrap_err();
    assert_eq!(err, TaskError::UnknownFunction("missing_fn".to_string()));
    assert!(err.to_string().contains("Unknown function: missing_fn"));

    executor.shutdown(true).unwrap();
}

#[test]
fn test_many_tasks_spread_over_workers() {
    let executor = start_pool(pool_config(4));

    let futures: Vec<_> = (0..100)
        .map(|i| executor.submit("add", args(vec![json!(i), json!(1)])).unwrap())
        .collect();
    for (i, future) in futures.iter().enumerate() {
        assert_eq!(
            future.result(Some(Duration::from_secs(30))),
            Ok(json!(i as i64 + 1))
        );
    }

    let completed: u64 = executor
        .worker_stats()
        .values()
        .map(|info| info.tasks_completed)
        .sum();
    assert_eq!(completed, 100);
    assert_eq!(executor.pending_tasks(), 0);

    executor.shutdown(true).unwrap();
}

#[test]
fn test_task_failure_carries_traceback() {
    let executor = start_pool(pool_config(1));

    let future = executor.submit("fail", args(vec![json!("boom")])).unwrap();
    match future.result(Some(Duration::from_secs(10))) {
        Err(TaskError::Failed { error, traceback }) => {
            assert!(error.contains("boom"));
            assert!(!traceback.is_empty());
        }
        other => panic!("expected task failure, got {:?}", other),
    }

    // A panicking task fails its future but leaves the worker serving
    let future = executor.submit("panic", args(vec![json!("kaboom")])).unwrap();
    let err = future.result(Some(Duration::from_secs(10))).unwrap_err();
    assert!(err.to_string().contains("kaboom"));

    let future = executor.submit("add", args(vec![json!(1), json!(1)])).unwrap();
    assert_eq!(future.result(Some(Duration::from_secs(10))), Ok(json!(2)));

    let info = &executor.worker_stats()[&0];
    assert_eq!(info.tasks_failed, 2);
    assert_eq!(info.restart_count, 0);

    executor.shutdown(true).unwrap();
}

#[test]
fn test_start_rejects_functions_workers_lack() {
    let executor = MultiprocExecutor::new(pool_config(1), builtin_registry().unwrap());
    executor
        .register_function(
            "triple",
            Arc::new(|args: &TaskArgs| -> anyhow::Result<JsonValue> {
                Ok(json!(args.arg::<i64>(0)? * 3))
            }),
        )
        .unwrap();

    match executor.start() {
        Err(ExecutionError::ConfigurationError(message)) => assert!(message.contains("triple")),
        other => panic!("expected configuration error, got {:?}", other),
    }
    assert!(!executor.is_healthy());
    assert!(matches!(
        executor.submit("add", args(vec![json!(1), json!(1)])),
        Err(ExecutionError::NotRunning)
    ));
    assert!(executor
        .worker_stats()
        .values()
        .all(|info| info.state == WorkerState::Terminated));
}

#[test]
fn test_registered_function_served_by_workers() {
    let executor = MultiprocExecutor::new(pool_config(1), FunctionRegistry::new());
    executor
        .register_function(
            "add",
            Arc::new(|args: &TaskArgs| -> anyhow::Result<JsonValue> {
                Ok(json!(args.arg::<i64>(0)? + args.arg::<i64>(1)?))
            }),
        )
        .unwrap();
    executor.start().unwrap();

    let future = executor.submit("add", args(vec![json!(2), json!(3)])).unwrap();
    assert_eq!(future.result(Some(Duration::from_secs(10))), Ok(json!(5)));

    executor.shutdown(true).unwrap();
}

#[test]
fn test_pending_limit_rejects_submissions() {
    let config = ExecutionConfig {
        max_pending_tasks: Some(1),
        ..pool_config(1)
    };
    let executor = start_pool(config);

    let running = executor.submit("sleep_ms", args(vec![json!(300)])).unwrap();
    match executor.submit("add", args(vec![json!(1), json!(2)])) {
        Err(ExecutionError::QueueFull { pending, limit }) => {
            assert_eq!(pending, 1);
            assert_eq!(limit, 1);
        }
        other => panic!("expected full queue, got {:?}", other.map(|f| f.task_id())),
    }

    assert!(running.result(Some(Duration::from_secs(10))).is_ok());
    let future = executor.submit("add", args(vec![json!(1), json!(2)])).unwrap();
    assert_eq!(future.result(Some(Duration::from_secs(10))), Ok(json!(3)));

    executor.shutdown(true).unwrap();
}

#[test]
fn test_cancel_pending_future() {
    let executor = start_pool(pool_config(1));

    let future = executor.submit("sleep_ms", args(vec![json!(300)])).unwrap();
    assert!(future.cancel());
    assert!(future.cancelled());
    assert!(future.done());
    assert!(matches!(
        future.result(None),
        Err(TaskError::Cancelled { .. })
    ));
    assert!(!future.cancel());

    // The cancelled call still runs; its late result is dropped
    let next = executor.submit("add", args(vec![json!(4), json!(4)])).unwrap();
    assert_eq!(next.result(Some(Duration::from_secs(10))), Ok(json!(8)));
    assert!(future.cancelled());

    executor.shutdown(true).unwrap();
}

#[test]
fn test_silent_worker_is_restarted() {
    let executor = start_pool(pool_config(1));

    let first_pid = executor
        .submit("pid", TaskArgs::default())
        .unwrap()
        .result(Some(Duration::from_secs(10)))
        .unwrap();

    // Blocks the only worker well past its heartbeat deadline
    let lost = executor.submit("sleep_ms", args(vec![json!(5000)])).unwrap();

    let restarted = wait_for(Duration::from_secs(10), || {
        executor
            .worker_stats()
            .get(&0)
            .map(|info| info.restart_count >= 1 && info.state.is_serving())
            .unwrap_or(false)
    });
    assert!(restarted, "worker was not restarted: {:?}", executor.worker_stats());

    let info = &executor.worker_stats()[&0];
    assert!(info.error_count >= 1);

    let second_pid = executor
        .submit("pid", TaskArgs::default())
        .unwrap()
        .result(Some(Duration::from_secs(10)))
        .unwrap();
    assert_ne!(first_pid, second_pid);
    assert_eq!(Some(second_pid), executor.worker_stats()[&0].pid.map(|pid| json!(pid)));

    // Abandoned with its worker; only shutdown resolves it
    assert!(!lost.done());
    executor.shutdown(false).unwrap();
    assert!(matches!(
        lost.result(None),
        Err(TaskError::ExecutorShutdown { .. })
    ));
}

#[test]
fn test_lost_task_fails_under_fail_policy() {
    let config = ExecutionConfig {
        lost_task_policy: LostTaskPolicy::Fail,
        ..pool_config(1)
    };
    let executor = start_pool(config);

    let future = executor.submit("sleep_ms", args(vec![json!(5000)])).unwrap();
    match future.result(Some(Duration::from_secs(15))) {
        Err(TaskError::WorkerLost { task_id, worker_id }) => {
            assert_eq!(task_id, future.task_id());
            assert_eq!(worker_id, 0);
        }
        other => panic!("expected lost task, got {:?}", other),
    }

    executor.shutdown(true).unwrap();
}

#[test]
fn test_broadcast_submits_one_call_per_worker() {
    let executor = start_pool(pool_config(3));

    let futures = executor.broadcast("pid", TaskArgs::default()).unwrap();
    assert_eq!(futures.len(), executor.num_workers());
    for future in futures {
        assert!(future.result(Some(Duration::from_secs(10))).is_ok());
    }

    executor.shutdown(true).unwrap();
}

#[test]
fn test_graceful_shutdown_terminates_workers() {
    let executor = start_pool(pool_config(2));
    let future = executor.submit("add", args(vec![json!(1), json!(2)])).unwrap();
    assert_eq!(future.result(Some(Duration::from_secs(10))), Ok(json!(3)));

    executor.shutdown(true).unwrap();
    assert!(!executor.is_healthy());

    let stats = executor.worker_stats();
    assert_eq!(stats.len(), 2);
    assert!(stats
        .values()
        .all(|info| info.state == WorkerState::Terminated));

    assert!(executor.submit("add", args(vec![json!(1), json!(2)])).is_err());
    // Shutting down twice is a no-op
    executor.shutdown(true).unwrap();
}

#[test]
fn test_drop_stops_running_pool() {
    let executor = start_pool(pool_config(2));
    let future = executor.submit("sleep_ms", args(vec![json!(2000)])).unwrap();
    drop(executor);
    assert!(matches!(
        future.result(Some(Duration::from_secs(10))),
        Err(TaskError::ExecutorShutdown { .. })
    ));
}

#[test]
fn test_cli_call_prints_result() {
    for backend in ["uniproc", "multiproc"] {
        let output = Command::new(SPINDLE)
            .args(["--log-level", "error", "call", "add", "2", "3"])
            .args(["--backend", backend, "--workers", "1"])
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "spindle call failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "5");
    }
}

#[test]
fn test_cli_call_reports_failure() {
    let output = Command::new(SPINDLE)
        .args(["--log-level", "error", "call", "fail", "boom", "--backend", "uniproc"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("boom"));
}

#[test]
fn test_cli_config_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("spindle.yaml");
    std::fs::write(&path, "execution:\n  num_workers: 7\n").unwrap();

    let output = Command::new(SPINDLE)
        .arg("--config")
        .arg(&path)
        .args(["--log-level", "error", "config", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let config: JsonValue = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(config["execution"]["num_workers"], json!(7));
}
