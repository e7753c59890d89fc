//! Write-once result handles for submitted tasks
//!
//! A [`TaskFuture`] is resolved exactly once, by whichever of `set_result`,
//! `set_exception` or `cancel` gets there first. Callers may block on it with
//! [`TaskFuture::result`] from any thread, await it with [`TaskFuture::wait`],
//! or register callbacks that fire once on resolution.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use spindle_ipc::TaskId;
use tracing::warn;

use crate::error::TaskError;

type DoneCallback<T> = Box<dyn FnOnce(&TaskFuture<T>) + Send + 'static>;

struct FutureState<T> {
    outcome: Option<Result<T, TaskError>>,
    cancelled: bool,
    callbacks: Vec<DoneCallback<T>>,
}

struct Inner<T> {
    task_id: TaskId,
    state: Mutex<FutureState<T>>,
    resolved: Condvar,
}

/// Handle to the eventual outcome of one task
pub struct TaskFuture<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for TaskFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> TaskFuture<T> {
    /// Create an unresolved future
    pub fn new(task_id: TaskId) -> Self {
        Self {
            inner: Arc::new(Inner {
                task_id,
                state: Mutex::new(FutureState {
                    outcome: None,
                    cancelled: false,
                    callbacks: Vec::new(),
                }),
                resolved: Condvar::new(),
            }),
        }
    }

    /// Create a future that is already resolved
    pub fn resolved(task_id: TaskId, outcome: Result<T, TaskError>) -> Self {
        let future = Self::new(task_id);
        future.resolve(outcome, false);
        future
    }

    pub fn task_id(&self) -> TaskId {
        self.inner.task_id
    }

    /// Resolve with a value. Returns false if the future was already resolved.
    pub fn set_result(&self, value: T) -> bool {
        self.resolve(Ok(value), false)
    }

    /// Resolve with an error. Returns false if the future was already resolved.
    pub fn set_exception(&self, error: TaskError) -> bool {
        self.resolve(Err(error), false)
    }

    /// Resolve as cancelled.
    ///
    /// This only affects the handle: a task already dispatched to a worker
    /// still runs, and its result is discarded.
    pub fn cancel(&self) -> bool {
        let task_id = self.task_id();
        self.resolve(Err(TaskError::Cancelled { task_id }), true)
    }

    pub fn done(&self) -> bool {
        self.lock().outcome.is_some()
    }

    pub fn cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Current outcome without blocking
    pub fn try_result(&self) -> Option<Result<T, TaskError>> {
        self.lock().outcome.clone()
    }

    /// Block until resolved, or until `timeout` elapses.
    ///
    /// Timing out leaves the future untouched; a later call may still succeed.
    pub fn result(&self, timeout: Option<Duration>) -> Result<T, TaskError> {
        let state = self.lock();
        let state = match timeout {
            None => self
                .inner
                .resolved
                .wait_while(state, |s| s.outcome.is_none())
                .unwrap_or_else(PoisonError::into_inner),
            Some(timeout) => {
                self.inner
                    .resolved
                    .wait_timeout_while(state, timeout, |s| s.outcome.is_none())
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
        };

        match &state.outcome {
            Some(outcome) => outcome.clone(),
            None => Err(TaskError::Timeout {
                task_id: self.task_id(),
            }),
        }
    }

    /// Error the future resolved with, if any
    pub fn exception(&self, timeout: Option<Duration>) -> Option<TaskError> {
        self.result(timeout).err()
    }

    /// Run `callback` once the future resolves; immediately if it already has.
    ///
    /// A panicking callback is logged and does not affect other callbacks.
    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: FnOnce(&TaskFuture<T>) + Send + 'static,
    {
        {
            let mut state = self.lock();
            if state.outcome.is_none() {
                state.callbacks.push(Box::new(callback));
                return;
            }
        }
        self.run_callback(Box::new(callback));
    }

    /// Await resolution from async code
    pub async fn wait(&self) -> Result<T, TaskError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.add_done_callback(move |future| {
            if let Some(outcome) = future.try_result() {
                let _ = tx.send(outcome);
            }
        });

        let task_id = self.task_id();
        rx.await
            .unwrap_or(Err(TaskError::ExecutorShutdown { task_id }))
    }

    fn resolve(&self, outcome: Result<T, TaskError>, cancelled: bool) -> bool {
        let callbacks = {
            let mut state = self.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
            state.cancelled = cancelled;
            std::mem::take(&mut state.callbacks)
        };
        self.inner.resolved.notify_all();

        for callback in callbacks {
            self.run_callback(callback);
        }
        true
    }

    fn run_callback(&self, callback: DoneCallback<T>) {
        if panic::catch_unwind(AssertUnwindSafe(|| callback(self))).is_err() {
            warn!(task_id = self.task_id(), "Done callback panicked");
        }
    }

    fn lock(&self) -> MutexGuard<'_, FutureState<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> fmt::Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = self
            .inner
            .state
            .lock()
            .map(|s| s.outcome.is_some())
            .unwrap_or(false);
        f.debug_struct("TaskFuture")
            .field("task_id", &self.inner.task_id)
            .field("done", &done)
            .finish()
    }
}
