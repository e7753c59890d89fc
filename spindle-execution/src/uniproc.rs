//! Inline executor: every task runs synchronously in the submitting thread

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use serde_json::Value as JsonValue;
use spindle_config::ExecutorBackend;
use spindle_ipc::{TaskOutcome, WorkerId, WorkerInfo, WorkerState};
use tracing::{debug, info};

use crate::error::{ExecutionError, TaskError};
use crate::executor::{Executor, Lifecycle};
use crate::future::TaskFuture;
use crate::registry::{invoke_function, outcome_into_result, FunctionRegistry, TaskArgs, TaskFn};

/// Executor running tasks in the caller's thread.
///
/// Useful for debugging and for tests: every future returned by `submit` is
/// already resolved.
pub struct UniprocExecutor {
    registry: RwLock<FunctionRegistry>,
    lifecycle: Mutex<Lifecycle>,
    next_task_id: AtomicU64,
    info: Mutex<WorkerInfo>,
}

impl UniprocExecutor {
    pub fn new(registry: FunctionRegistry) -> Self {
        Self {
            registry: RwLock::new(registry),
            lifecycle: Mutex::new(Lifecycle::Created),
            next_task_id: AtomicU64::new(1),
            info: Mutex::new(WorkerInfo::new(0, Some(std::process::id()))),
        }
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn info(&self) -> MutexGuard<'_, WorkerInfo> {
        self.info.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Executor for UniprocExecutor {
    fn backend(&self) -> ExecutorBackend {
        ExecutorBackend::Uniproc
    }

    fn register_function(&self, name: &str, function: TaskFn) -> Result<(), ExecutionError> {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, function)
    }

    fn start(&self) -> Result<(), ExecutionError> {
        let mut lifecycle = self.lifecycle();
        match *lifecycle {
            Lifecycle::Running => return Err(ExecutionError::AlreadyStarted),
            Lifecycle::Stopped => {
                return Err(ExecutionError::InvalidState(
                    "executor was shut down and cannot be restarted".to_string(),
                ))
            }
            Lifecycle::Created => {}
        }
        *lifecycle = Lifecycle::Running;

        let mut info = self.info();
        info.state = WorkerState::Ready;
        info.touch();
        info!("Inline executor started");
        Ok(())
    }

    fn shutdown(&self, _graceful: bool) -> Result<(), ExecutionError> {
        let mut lifecycle = self.lifecycle();
        if *lifecycle == Lifecycle::Running {
            *lifecycle = Lifecycle::Stopped;
            self.info().state = WorkerState::Terminated;
            info!("Inline executor stopped");
        }
        Ok(())
    }

    fn submit(&self, func_name: &str, args: TaskArgs) -> Result<TaskFuture<JsonValue>, ExecutionError> {
        if *self.lifecycle() != Lifecycle::Running {
            return Err(ExecutionError::NotRunning);
        }

        let task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        let function = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(func_name);
        let Some(function) = function else {
            return Ok(TaskFuture::resolved(
                task_id,
                Err(TaskError::UnknownFunction(func_name.to_string())),
            ));
        };

        debug!(task_id, func_name, "Running task inline");
        {
            let mut info = self.info();
            info.state = WorkerState::Busy;
            info.current_task_id = Some(task_id);
        }

        let outcome = invoke_function(func_name, &function, &args);

        {
            let mut info = self.info();
            info.record_task_execution(outcome.is_success());
            info.touch();
        }
        if let TaskOutcome::Failure { error, .. } = &outcome {
            debug!(task_id, func_name, error = %error, "Task failed");
        }

        Ok(TaskFuture::resolved(task_id, outcome_into_result(outcome)))
    }

    fn broadcast(
        &self,
        func_name: &str,
        args: TaskArgs,
    ) -> Result<Vec<TaskFuture<JsonValue>>, ExecutionError> {
        Ok(vec![self.submit(func_name, args)?])
    }

    fn num_workers(&self) -> usize {
        1
    }

    fn is_healthy(&self) -> bool {
        *self.lifecycle() == Lifecycle::Running
    }

    fn worker_stats(&self) -> HashMap<WorkerId, WorkerInfo> {
        let info = self.info().clone();
        HashMap::from([(info.worker_id, info)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn executor() -> UniprocExecutor {
        let mut registry = FunctionRegistry::new();
        registry
            .register("add", |args: &TaskArgs| {
                Ok(json!(args.arg::<i64>(0)? + args.arg::<i64>(1)?))
            })
            .unwrap();
        registry
            .register("fail", |_: &TaskArgs| -> anyhow::Result<JsonValue> {
                anyhow::bail!("deliberate failure")
            })
            .unwrap();
        UniprocExecutor::new(registry)
    }

    #[test]
    fn test_submit_requires_start() {
        let executor = executor();
        assert!(matches!(
            executor.submit("add", TaskArgs::default()),
            Err(ExecutionError::NotRunning)
        ));
    }

    #[test]
    fn test_submit_resolves_immediately() {
        let executor = executor();
        executor.start().unwrap();

        let future = executor
            .submit("add", TaskArgs::positional(vec![json!(2), json!(3)]))
            .unwrap();
        assert!(future.done());
        assert_eq!(future.result(None), Ok(json!(5)));

        let stats = executor.worker_stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[&0].tasks_completed, 1);
        assert_eq!(stats[&0].pid, Some(std::process::id()));
    }

    #[test]
    fn test_failure_and_unknown_function() {
        let executor = executor();
        executor.start().unwrap();

        let failed = executor.submit("fail", TaskArgs::default()).unwrap();
        let err = failed.result(None).unwrap_err();
        assert!(err.to_string().contains("deliberate failure"));

        let unknown = executor.submit("missing_fn", TaskArgs::default()).unwrap();
        assert!(unknown
            .result(None)
            .unwrap_err()
            .to_string()
            .contains("Unknown function: missing_fn"));

        let stats = executor.worker_stats();
        assert_eq!(stats[&0].tasks_completed, 1);
        assert_eq!(stats[&0].tasks_failed, 1);
    }

    #[test]
    fn test_task_ids_are_unique() {
        let executor = executor();
        executor.start().unwrap();
        let a = executor.submit("add", TaskArgs::positional(vec![json!(1), json!(1)])).unwrap();
        let b = executor.submit("add", TaskArgs::positional(vec![json!(1), json!(1)])).unwrap();
        assert_ne!(a.task_id(), b.task_id());
    }

    #[test]
    fn test_broadcast_is_single_call() {
        let executor = executor();
        executor.start().unwrap();
        let futures = executor
            .broadcast("add", TaskArgs::positional(vec![json!(1), json!(2)]))
            .unwrap();
        assert_eq!(futures.len(), 1);
        assert_eq!(futures[0].result(None), Ok(json!(3)));
    }

    #[test]
    fn test_lifecycle() {
        let executor = executor();
        executor.shutdown(true).unwrap();
        assert!(!executor.is_healthy());

        executor.start().unwrap();
        assert!(matches!(executor.start(), Err(ExecutionError::AlreadyStarted)));
        assert!(executor.is_healthy());

        executor.shutdown(false).unwrap();
        executor.shutdown(false).unwrap();
        assert!(!executor.is_healthy());
        assert_eq!(executor.worker_stats()[&0].state, WorkerState::Terminated);
        assert!(matches!(executor.start(), Err(ExecutionError::InvalidState(_))));
    }

    #[test]
    fn test_register_after_start() {
        let executor = executor();
        executor.start().unwrap();
        executor
            .register_function("one", Arc::new(|_: &TaskArgs| -> anyhow::Result<JsonValue> { Ok(json!(1)) }))
            .unwrap();
        assert_eq!(executor.submit("one", TaskArgs::default()).unwrap().result(None), Ok(json!(1)));
    }
}
