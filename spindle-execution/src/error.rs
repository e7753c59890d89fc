//! Error types for task execution

use spindle_config::ExecutorBackend;
use spindle_ipc::{TaskId, WorkerId};
use thiserror::Error;

/// Executor-level errors, returned synchronously by executor operations
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Executor already started")]
    AlreadyStarted,

    #[error("Executor is not running")]
    NotRunning,

    #[error("Invalid execution state: {0}")]
    InvalidState(String),

    #[error("Function already registered: {0}")]
    DuplicateFunction(String),

    #[error("Task queue full: {pending} tasks pending (limit {limit})")]
    QueueFull { pending: usize, limit: usize },

    #[error("Unsupported executor backend: {0}")]
    UnsupportedBackend(ExecutorBackend),

    #[error("Failed to spawn worker: {0}")]
    SpawnError(String),

    #[error("Runtime error: {0}")]
    RuntimeError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl From<spindle_config::ConfigError> for ExecutionError {
    fn from(err: spindle_config::ConfigError) -> Self {
        Self::ConfigurationError(err.to_string())
    }
}

/// Error a task future resolves with
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TaskError {
    /// The function returned an error or panicked
    #[error("{error}\n{traceback}")]
    Failed { error: String, traceback: String },

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Timed out waiting for task {task_id}")]
    Timeout { task_id: TaskId },

    #[error("Task {task_id} was cancelled")]
    Cancelled { task_id: TaskId },

    #[error("Task {task_id} was lost when worker {worker_id} was restarted")]
    WorkerLost { task_id: TaskId, worker_id: WorkerId },

    #[error("Executor shut down before task {task_id} completed")]
    ExecutorShutdown { task_id: TaskId },
}
