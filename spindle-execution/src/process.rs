//! Process-based executor: a supervised pool of worker processes

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde_json::Value as JsonValue;
use spindle_config::{ExecutionConfig, ExecutorBackend, Validatable};
use spindle_ipc::{TaskMessage, WorkerId, WorkerInfo};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ExecutionError, TaskError};
use crate::executor::{Executor, Lifecycle};
use crate::future::TaskFuture;
use crate::registry::{FunctionRegistry, TaskArgs, TaskFn};
use crate::supervisor::{collect_results, monitor_health, PoolShared, WorkerEvent};
use crate::worker::WorkerProcess;

/// Executor distributing tasks over worker processes.
///
/// Workers are re-executions of a worker program (the current executable by
/// default) that serve tasks over stdin/stdout. The controller keeps its
/// supervising tasks on a private runtime, so the public API is blocking and
/// must not be used from inside another async runtime's worker threads.
/// Dropping a running executor shuts it down without waiting for workers.
///
/// The worker program builds its own function table. Every function
/// registered with the controller must also be in that table; `start` fails
/// with [`ExecutionError::ConfigurationError`] when a ready worker lacks one.
pub struct MultiprocExecutor {
    config: ExecutionConfig,
    registry: RwLock<FunctionRegistry>,
    lifecycle: Mutex<Lifecycle>,
    next_task_id: AtomicU64,
    shared: Arc<PoolShared>,
    events: Mutex<Option<mpsc::UnboundedReceiver<WorkerEvent>>>,
    pool: Mutex<Option<PoolRuntime>>,
}

struct PoolRuntime {
    runtime: Runtime,
    collector: JoinHandle<()>,
    monitor: JoinHandle<()>,
}

impl MultiprocExecutor {
    /// Create an executor. No process is spawned before [`Executor::start`].
    pub fn new(config: ExecutionConfig, registry: FunctionRegistry) -> Self {
        let (shared, events) = PoolShared::new(config.clone());
        Self {
            config,
            registry: RwLock::new(registry),
            lifecycle: Mutex::new(Lifecycle::Created),
            next_task_id: AtomicU64::new(1),
            shared,
            events: Mutex::new(Some(events)),
            pool: Mutex::new(None),
        }
    }

    /// Number of submitted tasks whose futures are not resolved yet
    pub fn pending_tasks(&self) -> usize {
        self.shared.lock_state().pending.len()
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn build_runtime() -> Result<Runtime, ExecutionError> {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("spindle-pool")
            .enable_all()
            .build()
            .map_err(|e| ExecutionError::RuntimeError(format!("Failed to build pool runtime: {}", e)))
    }

    fn spawn_workers(&self, runtime: &Runtime) -> Result<(), ExecutionError> {
        let shared = &self.shared;
        runtime.block_on(async {
            for worker_id in 0..self.config.num_workers {
                let process = WorkerProcess::spawn(shared, worker_id, 0)?;
                shared.install(worker_id, process);
            }
            Ok::<(), ExecutionError>(())
        })
    }

    fn stop_workers(&self, runtime: &Runtime, graceful: bool) {
        let timeout = self.config.shutdown_timeout;
        let processes = self.shared.take_processes();
        runtime.block_on(async move {
            let stopping: Vec<_> = processes
                .into_iter()
                .map(|process| tokio::spawn(process.shutdown(graceful, timeout)))
                .collect();
            for handle in stopping {
                if let Err(e) = handle.await {
                    warn!("Worker shutdown task failed: {}", e);
                }
            }
        });
    }

    /// Stop supervision and workers, then fail whatever is still pending
    fn teardown(&self, pool: PoolRuntime, graceful: bool) {
        let PoolRuntime {
            runtime,
            collector,
            monitor,
        } = pool;

        self.shared.begin_shutdown();
        if let Err(e) = runtime.block_on(monitor) {
            warn!("Health monitor ended abnormally: {}", e);
        }
        self.stop_workers(&runtime, graceful);

        let _ = self.shared.event_tx.send(WorkerEvent::Stop);
        if let Err(e) = runtime.block_on(collector) {
            warn!("Result collector ended abnormally: {}", e);
        }

        self.shared.fail_pending();
        runtime.shutdown_background();
    }

    /// Registered functions the ready workers do not provide
    fn missing_worker_functions(&self) -> Vec<String> {
        let required = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .names();
        self.shared.missing_functions(&required)
    }
}

impl Executor for MultiprocExecutor {
    fn backend(&self) -> ExecutorBackend {
        ExecutorBackend::Multiproc
    }

    fn register_function(&self, name: &str, function: TaskFn) -> Result<(), ExecutionError> {
        if *self.lifecycle() != Lifecycle::Created {
            return Err(ExecutionError::InvalidState(
                "functions must be registered before the pool starts".to_string(),
            ));
        }
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
        self.config.validate()?;

        let events = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| ExecutionError::InvalidState("event channel already in use".to_string()))?;

        let runtime = Self::build_runtime()?;
        info!(num_workers = self.config.num_workers, "Starting worker pool");

        if let Err(e) = self.spawn_workers(&runtime) {
            error!("Failed to start worker pool: {}", e);
            self.shared.begin_shutdown();
            self.stop_workers(&runtime, false);
            runtime.shutdown_background();
            *lifecycle = Lifecycle::Stopped;
            return Err(e);
        }

        let collector = runtime.spawn(collect_results(Arc::clone(&self.shared), events));
        let monitor = runtime.spawn(monitor_health(Arc::clone(&self.shared)));

        if runtime.block_on(self.shared.wait_until_ready(self.config.startup_timeout)) {
            info!("All {} workers ready", self.config.num_workers);
        } else {
            warn!(
                ready = self.shared.serving_count(),
                num_workers = self.config.num_workers,
                "Not all workers reported ready within {:?}, continuing",
                self.config.startup_timeout
            );
        }

        let pool = PoolRuntime {
            runtime,
            collector,
            monitor,
        };

        let missing = self.missing_worker_functions();
        if !missing.is_empty() {
            error!(?missing, "Worker program does not provide every registered function");
            self.teardown(pool, false);
            *lifecycle = Lifecycle::Stopped;
            return Err(ExecutionError::ConfigurationError(format!(
                "worker program does not provide: {}",
                missing.join(", ")
            )));
        }

        *self.pool.lock().unwrap_or_else(PoisonError::into_inner) = Some(pool);
        *lifecycle = Lifecycle::Running;
        Ok(())
    }

    fn shutdown(&self, graceful: bool) -> Result<(), ExecutionError> {
        {
            let mut lifecycle = self.lifecycle();
            if *lifecycle != Lifecycle::Running {
                return Ok(());
            }
            // Released before waiting: done callbacks may call back into the executor
            *lifecycle = Lifecycle::Stopped;
        }

        let pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(pool) = pool else {
            return Ok(());
        };

        info!(graceful, "Shutting down worker pool");
        self.teardown(pool, graceful);
        info!("Worker pool stopped");
        Ok(())
    }

    fn submit(&self, func_name: &str, args: TaskArgs) -> Result<TaskFuture<JsonValue>, ExecutionError> {
        if *self.lifecycle() != Lifecycle::Running {
            return Err(ExecutionError::NotRunning);
        }

        let task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        let known = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(func_name);
        if !known {
            return Ok(TaskFuture::resolved(
                task_id,
                Err(TaskError::UnknownFunction(func_name.to_string())),
            ));
        }

        let future = TaskFuture::new(task_id);
        {
            let mut state = self.shared.lock_state();
            // Checked under the state lock: shutdown drains pending under it too
            if self.shared.is_shutting_down() {
                return Err(ExecutionError::NotRunning);
            }
            if let Some(limit) = self.config.max_pending_tasks {
                if state.pending.len() >= limit {
                    return Err(ExecutionError::QueueFull {
                        pending: state.pending.len(),
                        limit,
                    });
                }
            }
            // Registered before queueing so a fast result always finds its future
            state.pending.insert(task_id, future.clone());
        }

        let task = TaskMessage::new(task_id, func_name, args.args, args.kwargs);
        if !self.shared.enqueue(task) {
            self.shared.lock_state().pending.remove(&task_id);
            return Err(ExecutionError::NotRunning);
        }

        debug!(task_id, func_name, "Submitted task");
        Ok(future)
    }

    /// Fan-out by volume: one submission per worker, with no guarantee that
    /// each worker runs exactly one of them. Capacity for all of them is
    /// checked up front.
    fn broadcast(
        &self,
        func_name: &str,
        args: TaskArgs,
    ) -> Result<Vec<TaskFuture<JsonValue>>, ExecutionError> {
        if *self.lifecycle() != Lifecycle::Running {
            return Err(ExecutionError::NotRunning);
        }
        if let Some(limit) = self.config.max_pending_tasks {
            let pending = self.pending_tasks();
            if pending + self.config.num_workers > limit {
                return Err(ExecutionError::QueueFull { pending, limit });
            }
        }

        (0..self.config.num_workers)
            .map(|_| self.submit(func_name, args.clone()))
            .collect()
    }

    fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    fn is_healthy(&self) -> bool {
        if *self.lifecycle() != Lifecycle::Running {
            return false;
        }
        self.shared.is_healthy()
    }

    fn worker_stats(&self) -> HashMap<WorkerId, WorkerInfo> {
        self.shared.snapshot()
    }
}

impl Drop for MultiprocExecutor {
    fn drop(&mut self) {
        if *self.lifecycle() == Lifecycle::Running {
            if let Err(e) = self.shutdown(false) {
                warn!("Failed to shut down worker pool on drop: {}", e);
            }
        }
    }
}
