//! IPC protocol definitions and message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

/// IPC protocol version for compatibility checking
pub const IPC_PROTOCOL_VERSION: u32 = 1;

/// Identifier of a worker slot. Stable across restarts of the slot's process.
pub type WorkerId = usize;

/// Identifier of a submitted task, unique within one executor's lifetime.
pub type TaskId = u64;

/// A single call of a registered function, as dispatched to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: TaskId,
    pub func_name: String,
    #[serde(default)]
    pub args: Vec<JsonValue>,
    #[serde(default)]
    pub kwargs: Map<String, JsonValue>,
    #[serde(default)]
    pub priority: i32,
    pub timestamp: DateTime<Utc>,
}

impl TaskMessage {
    /// Create a task message stamped with the current time
    pub fn new(
        task_id: TaskId,
        func_name: impl Into<String>,
        args: Vec<JsonValue>,
        kwargs: Map<String, JsonValue>,
    ) -> Self {
        Self {
            task_id,
            func_name: func_name.into(),
            args,
            kwargs,
            priority: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Outcome of running one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Success { value: JsonValue },
    Failure { error: String, traceback: String },
}

impl TaskOutcome {
    pub fn success(value: JsonValue) -> Self {
        TaskOutcome::Success { value }
    }

    pub fn failure(error: impl Into<String>, traceback: impl Into<String>) -> Self {
        TaskOutcome::Failure {
            error: error.into(),
            traceback: traceback.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success { .. })
    }
}

/// Result of a task, sent from the worker that executed it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub outcome: TaskOutcome,
    pub execution_time_ns: u64,
}

impl ResultMessage {
    pub fn new(
        task_id: TaskId,
        worker_id: WorkerId,
        outcome: TaskOutcome,
        execution_time_ns: u64,
    ) -> Self {
        Self {
            task_id,
            worker_id,
            outcome,
            execution_time_ns,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

/// Messages sent from the controller to a worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Execute a task
    ExecuteTask { task: TaskMessage },

    /// Shutdown signal
    Shutdown,
}

/// Messages sent from worker processes to the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorMessage {
    /// Worker finished start-up and can take tasks. `functions` lists the
    /// names in the worker's function table.
    Ready {
        worker_id: WorkerId,
        pid: u32,
        #[serde(default)]
        functions: Vec<String>,
    },

    /// Task execution result
    TaskResult { result: ResultMessage },

    /// Liveness signal, sent while idle and between tasks
    Heartbeat {
        worker_id: WorkerId,
        timestamp: DateTime<Utc>,
    },
}

/// Lifecycle state of a worker slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    Starting,
    Ready,
    Busy,
    Error,
    Terminated,
}

impl WorkerState {
    /// Whether a worker in this state counts towards pool health
    pub fn is_serving(&self) -> bool {
        matches!(self, WorkerState::Ready | WorkerState::Busy)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Starting => "STARTING",
            WorkerState::Ready => "READY",
            WorkerState::Busy => "BUSY",
            WorkerState::Error => "ERROR",
            WorkerState::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}

/// Bookkeeping for one worker slot, as exposed to telemetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_id: WorkerId,
    pub pid: Option<u32>,
    pub state: WorkerState,
    pub start_time: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub error_count: u64,
    pub restart_count: u32,
    pub current_task_id: Option<TaskId>,
}

impl WorkerInfo {
    /// Create info for a freshly spawned worker process
    pub fn new(worker_id: WorkerId, pid: Option<u32>) -> Self {
        let now = Utc::now();
        Self {
            worker_id,
            pid,
            state: WorkerState::Starting,
            start_time: now,
            last_heartbeat: now,
            tasks_completed: 0,
            tasks_failed: 0,
            error_count: 0,
            restart_count: 0,
            current_task_id: None,
        }
    }

    /// Update heartbeat timestamp
    pub fn touch(&mut self) {
        self.last_heartbeat = Utc::now();
    }

    /// Record a finished task and return the worker to `Ready`
    pub fn record_task_execution(&mut self, success: bool) {
        self.tasks_completed += 1;
        if !success {
            self.tasks_failed += 1;
        }
        self.current_task_id = None;
        self.state = WorkerState::Ready;
    }

    /// Reset for a replacement process under the same worker id.
    /// Counters survive the restart.
    pub fn respawned(&mut self, pid: Option<u32>) {
        let now = Utc::now();
        self.pid = pid;
        self.state = WorkerState::Starting;
        self.start_time = now;
        self.last_heartbeat = now;
        self.current_task_id = None;
        self.restart_count += 1;
    }
}

/// Message envelope for all IPC communications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub protocol_version: u32,
    pub timestamp: DateTime<Utc>,
    pub message: T,
}

impl<T> MessageEnvelope<T> {
    /// Create a new message envelope
    pub fn new(message: T) -> Self {
        Self {
            protocol_version: IPC_PROTOCOL_VERSION,
            timestamp: Utc::now(),
            message,
        }
    }

    /// Check if protocol version is compatible
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == IPC_PROTOCOL_VERSION
    }
}
