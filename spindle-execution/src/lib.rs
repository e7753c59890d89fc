//! Spindle execution engine
//!
//! This crate provides the task executors: an inline executor for
//! debugging and a supervised multi-process pool. Both take named functions
//! from a [`FunctionRegistry`] and hand back [`TaskFuture`]s.

// Task panics are caught and reported as failures; aborting would take the
// worker or the inline executor down with the task.
#[cfg(panic = "abort")]
compile_error!("spindle-execution requires panic = \"unwind\"");

pub mod error;
pub mod executor;
pub mod future;
pub mod process;
pub mod registry;
pub mod uniproc;
pub mod worker_loop;

mod supervisor;
mod worker;

// Re-export main types
pub use error::{ExecutionError, TaskError};
pub use executor::{Executor, ExecutorFactory};
pub use future::TaskFuture;
pub use process::MultiprocExecutor;
pub use registry::{invoke_function, FunctionRegistry, TaskArgs, TaskFn};
pub use uniproc::UniprocExecutor;
pub use worker_loop::{run_worker_loop, run_worker_process, WorkerOptions};

// Re-export configuration and protocol types used in the executor API
pub use spindle_config::{ExecutionConfig, ExecutorBackend, LostTaskPolicy};
pub use spindle_ipc::{TaskId, WorkerId, WorkerInfo, WorkerState};
