//! Executor abstraction and backend selection

use std::collections::HashMap;

use serde_json::Value as JsonValue;
use spindle_config::{ExecutionConfig, ExecutorBackend, Validatable};
use spindle_ipc::{WorkerId, WorkerInfo};

use crate::error::ExecutionError;
use crate::future::TaskFuture;
use crate::process::MultiprocExecutor;
use crate::registry::{FunctionRegistry, TaskArgs, TaskFn};
use crate::uniproc::UniprocExecutor;

/// Lifecycle shared by all executor implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Created,
    Running,
    Stopped,
}

/// Uniform interface over execution backends.
///
/// All operations are blocking. They must not be called from inside an
/// async runtime worker thread.
pub trait Executor: Send + Sync {
    fn backend(&self) -> ExecutorBackend;

    /// Register a function by name. Must happen before `start` for worker
    /// processes to know it.
    fn register_function(&self, name: &str, function: TaskFn) -> Result<(), ExecutionError>;

    fn start(&self) -> Result<(), ExecutionError>;

    /// Stop the executor. Idempotent; a no-op before `start`.
    fn shutdown(&self, graceful: bool) -> Result<(), ExecutionError>;

    /// Queue one call of `func_name`. Task failures arrive through the future.
    fn submit(&self, func_name: &str, args: TaskArgs) -> Result<TaskFuture<JsonValue>, ExecutionError>;

    /// Submit the same call once per worker
    fn broadcast(
        &self,
        func_name: &str,
        args: TaskArgs,
    ) -> Result<Vec<TaskFuture<JsonValue>>, ExecutionError>;

    fn num_workers(&self) -> usize;

    fn is_healthy(&self) -> bool;

    /// Snapshot of per-worker bookkeeping
    fn worker_stats(&self) -> HashMap<WorkerId, WorkerInfo>;
}

/// Builds executors by backend name
pub struct ExecutorFactory;

impl ExecutorFactory {
    /// Create an executor for `backend` with default timings
    pub fn create(
        backend: ExecutorBackend,
        num_workers: usize,
        registry: FunctionRegistry,
    ) -> Result<Box<dyn Executor>, ExecutionError> {
        let config = ExecutionConfig {
            backend,
            num_workers,
            ..Default::default()
        };
        Self::from_config(&config, registry)
    }

    /// Create an executor from a full configuration
    pub fn from_config(
        config: &ExecutionConfig,
        registry: FunctionRegistry,
    ) -> Result<Box<dyn Executor>, ExecutionError> {
        match config.backend {
            ExecutorBackend::Uniproc => Ok(Box::new(UniprocExecutor::new(registry))),
            ExecutorBackend::Multiproc => {
                config.validate()?;
                Ok(Box::new(MultiprocExecutor::new(config.clone(), registry)))
            }
            ExecutorBackend::Distributed => {
                Err(ExecutionError::UnsupportedBackend(ExecutorBackend::Distributed))
            }
        }
    }
}
