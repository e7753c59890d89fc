//! Main loop of a worker process
//!
//! A worker reads [`WorkerMessage`]s from its transport (stdin in
//! production), runs tasks one at a time and answers with
//! [`CoordinatorMessage`]s. While idle it sends a heartbeat every poll
//! interval; while busy, heartbeats resume as soon as the task finishes.

use std::time::{Duration, Instant};

use chrono::Utc;
use spindle_ipc::{
    CoordinatorMessage, IpcError, IpcTransport, MessageEnvelope, ResultMessage, StdioTransport,
    TaskMessage, WorkerId, WorkerMessage,
};
use tracing::{debug, error, info, warn};

use crate::registry::{FunctionRegistry, TaskArgs};

/// Parameters a worker process is launched with
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub worker_id: WorkerId,
    pub poll_interval: Duration,
}

/// Run the worker loop over this process's stdin/stdout
pub async fn run_worker_process(
    options: WorkerOptions,
    registry: FunctionRegistry,
) -> Result<(), IpcError> {
    let mut transport = StdioTransport::stdio();
    run_worker_loop(&mut transport, &options, &registry).await
}

/// Serve tasks until told to shut down or the controller goes away
pub async fn run_worker_loop<T: IpcTransport>(
    transport: &mut T,
    options: &WorkerOptions,
    registry: &FunctionRegistry,
) -> Result<(), IpcError> {
    let worker_id = options.worker_id;
    let pid = std::process::id();
    info!(worker_id, pid, functions = registry.len(), "Worker process starting");

    transport
        .send(&MessageEnvelope::new(CoordinatorMessage::Ready {
            worker_id,
            pid,
            functions: registry.names(),
        }))
        .await?;

    let mut last_heartbeat = Instant::now();
    loop {
        let received = tokio::time::timeout(
            options.poll_interval,
            transport.receive::<WorkerMessage>(),
        )
        .await;

        match received {
            Err(_elapsed) => {
                send_heartbeat(transport, worker_id).await?;
                last_heartbeat = Instant::now();
            }
            Ok(Ok(envelope)) => match envelope.message {
                WorkerMessage::ExecuteTask { task } => {
                    let result = execute_task(registry, worker_id, task);
                    transport
                        .send(&MessageEnvelope::new(CoordinatorMessage::TaskResult { result }))
                        .await?;

                    if last_heartbeat.elapsed() >= options.poll_interval {
                        send_heartbeat(transport, worker_id).await?;
                        last_heartbeat = Instant::now();
                    }
                }
                WorkerMessage::Shutdown => {
                    info!(worker_id, "Received shutdown message");
                    break;
                }
            },
            Ok(Err(IpcError::ConnectionClosed)) => {
                info!(worker_id, "Controller closed the connection");
                break;
            }
            Ok(Err(e @ IpcError::DeserializationError(_))) => {
                warn!(worker_id, "Skipping unreadable message: {}", e);
            }
            Ok(Err(e)) => {
                error!(worker_id, "Failed to receive message: {}", e);
                return Err(e);
            }
        }
    }

    let _ = transport.close().await;
    info!(worker_id, "Worker process shutting down");
    Ok(())
}

fn execute_task(registry: &FunctionRegistry, worker_id: WorkerId, task: TaskMessage) -> ResultMessage {
    debug!(
        worker_id,
        task_id = task.task_id,
        func_name = %task.func_name,
        priority = task.priority,
        "Executing task"
    );

    let args = TaskArgs::new(task.args, task.kwargs);
    let started = Instant::now();
    let outcome = registry.invoke(&task.func_name, &args);
    let execution_time_ns = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);

    if !outcome.is_success() {
        debug!(worker_id, task_id = task.task_id, "Task failed");
    }

    ResultMessage::new(task.task_id, worker_id, outcome, execution_time_ns)
}

async fn send_heartbeat<T: IpcTransport>(transport: &mut T, worker_id: WorkerId) -> Result<(), IpcError> {
    transport
        .send(&MessageEnvelope::new(CoordinatorMessage::Heartbeat {
            worker_id,
            timestamp: Utc::now(),
        }))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use spindle_ipc::{FramedTransport, TaskOutcome};
    use tokio::io::{duplex, DuplexStream, ReadHalf, WriteHalf};

    type TestTransport = FramedTransport<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn transports() -> (TestTransport, TestTransport) {
        let (left, right) = duplex(64 * 1024);
        let (left_read, left_write) = tokio::io::split(left);
        let (right_read, right_write) = tokio::io::split(right);
        (
            FramedTransport::new(left_read, left_write),
            FramedTransport::new(right_read, right_write),
        )
    }

    fn registry() -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        registry
            .register("mul", |args: &TaskArgs| {
                Ok(json!(args.arg::<i64>(0)? * args.arg::<i64>(1)?))
            })
            .unwrap();
        registry
    }

    fn options(poll_ms: u64) -> WorkerOptions {
        WorkerOptions {
            worker_id: 4,
            poll_interval: Duration::from_millis(poll_ms),
        }
    }

    async fn next(controller: &mut TestTransport) -> CoordinatorMessage {
        controller
            .receive::<CoordinatorMessage>()
            .await
            .unwrap()
            .message
    }

    async fn next_non_heartbeat(controller: &mut TestTransport) -> CoordinatorMessage {
        loop {
            match next(controller).await {
                CoordinatorMessage::Heartbeat { .. } => continue,
                other => return other,
            }
        }
    }

    #[tokio::test]
    async fn test_ready_then_task_then_shutdown() {
        let (mut controller, mut worker) = transports();
        let handle = tokio::spawn(async move {
            run_worker_loop(&mut worker, &options(1_000), &registry()).await
        });

        match next(&mut controller).await {
            CoordinatorMessage::Ready {
                worker_id,
                pid,
                functions,
            } => {
                assert_eq!(worker_id, 4);
                assert_eq!(pid, std::process::id());
                assert_eq!(functions, vec!["mul"]);
            }
            other => panic!("expected ready, got {:?}", other),
        }

        let task = TaskMessage::new(11, "mul", vec![json!(6), json!(7)], Map::new());
        controller
            .send(&MessageEnvelope::new(WorkerMessage::ExecuteTask { task }))
            .await
            .unwrap();

        match next_non_heartbeat(&mut controller).await {
            CoordinatorMessage::TaskResult { result } => {
                assert_eq!(result.task_id, 11);
                assert_eq!(result.worker_id, 4);
                assert_eq!(result.outcome, TaskOutcome::success(json!(42)));
            }
            other => panic!("expected result, got {:?}", other),
        }

        controller
            .send(&MessageEnvelope::new(WorkerMessage::Shutdown))
            .await
            .unwrap();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_unknown_function_reported_as_failure() {
        let (mut controller, mut worker) = transports();
        let handle = tokio::spawn(async move {
            run_worker_loop(&mut worker, &options(1_000), &registry()).await
        });
        next(&mut controller).await;

        let task = TaskMessage::new(1, "missing_fn", vec![], Map::new());
        controller
            .send(&MessageEnvelope::new(WorkerMessage::ExecuteTask { task }))
            .await
            .unwrap();

        match next_non_heartbeat(&mut controller).await {
            CoordinatorMessage::TaskResult { result } => match result.outcome {
                TaskOutcome::Failure { error, .. } => {
                    assert_eq!(error, "Unknown function: missing_fn")
                }
                other => panic!("expected failure, got {:?}", other),
            },
            other => panic!("expected result, got {:?}", other),
        }

        drop(controller);
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_idle_worker_sends_heartbeats() {
        let (mut controller, mut worker) = transports();
        let handle = tokio::spawn(async move {
            run_worker_loop(&mut worker, &options(20), &registry()).await
        });
        next(&mut controller).await;

        for _ in 0..3 {
            match next(&mut controller).await {
                CoordinatorMessage::Heartbeat { worker_id, .. } => assert_eq!(worker_id, 4),
                other => panic!("expected heartbeat, got {:?}", other),
            }
        }

        controller
            .send(&MessageEnvelope::new(WorkerMessage::Shutdown))
            .await
            .unwrap();
        assert!(handle.await.unwrap().is_ok());
    }
}
