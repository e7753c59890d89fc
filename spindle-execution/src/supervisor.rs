//! Shared state of a worker pool and the tasks supervising it
//!
//! The result collector applies every message coming back from workers to
//! the pool state and resolves futures. The health monitor periodically
//! looks for workers whose last heartbeat is older than the configured
//! timeout and replaces them under the same worker id.
//!
//! Every slot carries a generation number that changes whenever its process
//! is replaced or retired, so late messages from a previous process never
//! change the state of its successor.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use spindle_config::{ExecutionConfig, LostTaskPolicy};
use spindle_ipc::{
    CoordinatorMessage, ResultMessage, TaskId, TaskMessage, WorkerId, WorkerInfo, WorkerState,
};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Notify};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::TaskError;
use crate::future::TaskFuture;
use crate::registry::outcome_into_result;
use crate::worker::WorkerProcess;

/// Something that happened to a worker, as seen by the collector
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Message {
        worker_id: WorkerId,
        generation: u64,
        message: CoordinatorMessage,
    },
    Disconnected {
        worker_id: WorkerId,
        generation: u64,
    },
    /// Ends the collector once everything queued before it was handled
    Stop,
}

pub(crate) struct WorkerSlot {
    pub info: WorkerInfo,
    pub generation: u64,
    pub heartbeat_at: Instant,
    pub process: Option<WorkerProcess>,
    /// Function table the current process reported when it became ready
    pub functions: Vec<String>,
}

#[derive(Default)]
pub(crate) struct PoolState {
    pub pending: HashMap<TaskId, TaskFuture<JsonValue>>,
    pub workers: BTreeMap<WorkerId, WorkerSlot>,
}

impl PoolState {
    fn current_slot(&mut self, worker_id: WorkerId, generation: u64) -> Option<&mut WorkerSlot> {
        self.workers
            .get_mut(&worker_id)
            .filter(|slot| slot.generation == generation)
    }
}

/// A worker taken out of service by the health monitor
pub(crate) struct StaleWorker {
    pub worker_id: WorkerId,
    pub generation: u64,
    pub process: Option<WorkerProcess>,
    pub lost_task: Option<TaskId>,
}

pub(crate) struct PoolShared {
    pub config: ExecutionConfig,
    pub event_tx: mpsc::UnboundedSender<WorkerEvent>,
    state: Mutex<PoolState>,
    task_tx: mpsc::UnboundedSender<TaskMessage>,
    task_rx: AsyncMutex<mpsc::UnboundedReceiver<TaskMessage>>,
    /// Tasks a feeder took but could not deliver; served before the queue
    held_back: Mutex<VecDeque<TaskMessage>>,
    requeued: Notify,
    shutdown_tx: watch::Sender<bool>,
}

impl PoolShared {
    pub fn new(config: ExecutionConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        let shared = Arc::new(Self {
            config,
            event_tx,
            state: Mutex::new(PoolState::default()),
            task_tx,
            task_rx: AsyncMutex::new(task_rx),
            held_back: Mutex::new(VecDeque::new()),
            requeued: Notify::new(),
            shutdown_tx,
        });
        (shared, event_rx)
    }

    pub fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, task: TaskMessage) -> bool {
        self.task_tx.send(task).is_ok()
    }

    /// Put back a task a feeder could not deliver, ahead of everything
    /// submitted after it
    pub fn requeue(&self, task: TaskMessage) {
        debug!(task_id = task.task_id, "Requeueing undelivered task");
        self.held_back
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_front(task);
        self.requeued.notify_one();
    }

    fn take_held_back(&self) -> Option<TaskMessage> {
        self.held_back
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Next queued task, in submission order
    pub async fn next_task(&self) -> Option<TaskMessage> {
        loop {
            if let Some(task) = self.take_held_back() {
                return Some(task);
            }
            let requeued = self.requeued.notified();
            let mut rx = self.task_rx.lock().await;
            if let Some(task) = self.take_held_back() {
                return Some(task);
            }
            tokio::select! {
                biased;
                _ = requeued => {}
                task = rx.recv() => return task,
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn begin_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Add a freshly spawned worker to the table
    pub fn install(&self, worker_id: WorkerId, process: WorkerProcess) {
        let slot = WorkerSlot {
            info: WorkerInfo::new(worker_id, process.pid()),
            generation: 0,
            heartbeat_at: Instant::now(),
            process: Some(process),
            functions: Vec::new(),
        };
        self.lock_state().workers.insert(worker_id, slot);
    }

    /// Record that a worker was handed `task_id`. False if the worker's
    /// process was replaced or the pool is stopping.
    pub fn mark_busy(&self, worker_id: WorkerId, generation: u64, task_id: TaskId) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        let mut state = self.lock_state();
        match state.current_slot(worker_id, generation) {
            Some(slot) if slot.info.state.is_serving() => {
                slot.info.state = WorkerState::Busy;
                slot.info.current_task_id = Some(task_id);
                true
            }
            _ => false,
        }
    }

    pub fn handle_event(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::Message {
                worker_id,
                generation,
                message,
            } => match message {
                CoordinatorMessage::Ready { pid, functions, .. } => {
                    self.on_ready(worker_id, generation, pid, functions)
                }
                CoordinatorMessage::Heartbeat { .. } => self.on_heartbeat(worker_id, generation),
                CoordinatorMessage::TaskResult { result } => {
                    self.on_result(worker_id, generation, result)
                }
            },
            WorkerEvent::Disconnected {
                worker_id,
                generation,
            } => {
                if !self.is_shutting_down() {
                    warn!(
                        worker_id,
                        generation, "Worker output closed; it will be replaced once its heartbeat expires"
                    );
                }
            }
            WorkerEvent::Stop => {}
        }
    }

    fn on_ready(&self, worker_id: WorkerId, generation: u64, pid: u32, functions: Vec<String>) {
        let mut state = self.lock_state();
        let Some(slot) = state.current_slot(worker_id, generation) else {
            debug!(worker_id, generation, "Ignoring ready message from a replaced worker");
            return;
        };

        slot.info.state = WorkerState::Ready;
        slot.info.pid = Some(pid);
        slot.functions = functions;
        slot.info.touch();
        slot.heartbeat_at = Instant::now();
        if let Some(process) = &slot.process {
            process.grant_credit();
        }
        info!(worker_id, pid, "Worker ready");
    }

    fn on_heartbeat(&self, worker_id: WorkerId, generation: u64) {
        let mut state = self.lock_state();
        if let Some(slot) = state.current_slot(worker_id, generation) {
            slot.info.touch();
            slot.heartbeat_at = Instant::now();
        }
    }

    fn on_result(&self, worker_id: WorkerId, generation: u64, result: ResultMessage) {
        let success = result.is_success();
        let future = {
            let mut state = self.lock_state();
            let future = state.pending.remove(&result.task_id);

            if let Some(slot) = state.workers.get_mut(&worker_id) {
                let current = slot.generation == generation;
                if current && slot.info.state.is_serving() {
                    slot.info.record_task_execution(success);
                    if let Some(process) = &slot.process {
                        process.grant_credit();
                    }
                } else {
                    // Work a previous process of this slot finished still counts
                    slot.info.tasks_completed += 1;
                    if !success {
                        slot.info.tasks_failed += 1;
                    }
                }
            }
            future
        };

        debug!(
            task_id = result.task_id,
            worker_id,
            execution_time_ns = result.execution_time_ns,
            success,
            "Task completed"
        );

        match future {
            Some(future) => {
                match outcome_into_result(result.outcome) {
                    Ok(value) => future.set_result(value),
                    Err(error) => future.set_exception(error),
                };
            }
            None => debug!(task_id = result.task_id, "No pending future for result, discarding"),
        }
    }

    /// Take every worker silent for longer than the timeout out of service
    pub fn collect_stale(&self, now: Instant) -> Vec<StaleWorker> {
        if self.is_shutting_down() {
            return Vec::new();
        }

        let timeout = self.config.worker_timeout;
        let mut state = self.lock_state();
        let mut stale = Vec::new();

        for (worker_id, slot) in state.workers.iter_mut() {
            if slot.info.state == WorkerState::Terminated {
                continue;
            }
            let silent_for = now.saturating_duration_since(slot.heartbeat_at);
            if silent_for <= timeout {
                continue;
            }

            warn!(
                worker_id,
                ?silent_for,
                state = %slot.info.state,
                "Worker missed its heartbeat deadline, restarting"
            );
            slot.info.state = WorkerState::Error;
            slot.info.error_count += 1;
            slot.generation += 1;
            slot.heartbeat_at = now;
            slot.functions.clear();

            stale.push(StaleWorker {
                worker_id: *worker_id,
                generation: slot.generation,
                process: slot.process.take(),
                lost_task: slot.info.current_task_id.take(),
            });
        }
        stale
    }

    /// Apply the lost-task policy to a task that died with its worker
    pub fn handle_lost_task(&self, task_id: TaskId, worker_id: WorkerId) {
        match self.config.lost_task_policy {
            LostTaskPolicy::Abandon => {
                warn!(task_id, worker_id, "Task was lost with its worker and will not complete");
            }
            LostTaskPolicy::Fail => {
                let future = self.lock_state().pending.remove(&task_id);
                if let Some(future) = future {
                    future.set_exception(TaskError::WorkerLost { task_id, worker_id });
                }
            }
        }
    }

    /// Install a replacement process. Hands the process back if the slot
    /// moved on in the meantime.
    pub fn replace_process(
        &self,
        worker_id: WorkerId,
        generation: u64,
        process: WorkerProcess,
    ) -> Option<WorkerProcess> {
        if self.is_shutting_down() {
            return Some(process);
        }
        let mut state = self.lock_state();
        match state.current_slot(worker_id, generation) {
            Some(slot) => {
                slot.info.respawned(process.pid());
                slot.heartbeat_at = Instant::now();
                slot.process = Some(process);
                None
            }
            None => Some(process),
        }
    }

    /// Retire every slot and hand over its process for shutdown
    pub fn take_processes(&self) -> Vec<WorkerProcess> {
        let mut state = self.lock_state();
        state
            .workers
            .values_mut()
            .filter_map(|slot| {
                slot.info.state = WorkerState::Terminated;
                slot.info.current_task_id = None;
                slot.generation += 1;
                slot.process.take()
            })
            .collect()
    }

    /// Resolve every unresolved future with a shutdown error
    pub fn fail_pending(&self) {
        let pending: Vec<TaskFuture<JsonValue>> =
            self.lock_state().pending.drain().map(|(_, f)| f).collect();

        if !pending.is_empty() {
            info!(count = pending.len(), "Failing tasks still pending at shutdown");
        }
        for future in pending {
            let task_id = future.task_id();
            future.set_exception(TaskError::ExecutorShutdown { task_id });
        }
    }

    pub fn serving_count(&self) -> usize {
        self.lock_state()
            .workers
            .values()
            .filter(|slot| slot.info.state.is_serving())
            .count()
    }

    /// At least half of the configured workers are ready or busy
    pub fn is_healthy(&self) -> bool {
        self.serving_count() * 2 >= self.config.num_workers
    }

    /// Names in `required` that some ready worker does not provide, sorted
    pub fn missing_functions(&self, required: &[String]) -> Vec<String> {
        let state = self.lock_state();
        let mut missing: Vec<String> = required
            .iter()
            .filter(|name| {
                state
                    .workers
                    .values()
                    .filter(|slot| slot.info.state.is_serving())
                    .any(|slot| !slot.functions.contains(*name))
            })
            .cloned()
            .collect();
        missing.sort();
        missing
    }

    pub fn snapshot(&self) -> HashMap<WorkerId, WorkerInfo> {
        self.lock_state()
            .workers
            .iter()
            .map(|(id, slot)| (*id, slot.info.clone()))
            .collect()
    }

    /// Wait until every worker reported ready, up to `timeout`
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.serving_count() >= self.config.num_workers {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Resolves once the watched flag is set or its sender is gone
pub(crate) async fn stopped(rx: &mut watch::Receiver<bool>) {
    loop {
        let stop = *rx.borrow_and_update();
        if stop {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Apply worker messages to the pool until a [`WorkerEvent::Stop`] arrives
pub(crate) async fn collect_results(
    shared: Arc<PoolShared>,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
) {
    while let Some(event) = events.recv().await {
        if matches!(event, WorkerEvent::Stop) {
            break;
        }
        shared.handle_event(event);
    }
    debug!("Result collector stopped");
}

/// Replace workers that stop heartbeating, until the pool shuts down
pub(crate) async fn monitor_health(shared: Arc<PoolShared>) {
    let mut shutdown = shared.subscribe_shutdown();
    let mut ticker = tokio::time::interval(shared.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stopped(&mut shutdown) => break,
        }

        for stale in shared.collect_stale(Instant::now()) {
            restart_worker(&shared, stale).await;
            if shared.is_shutting_down() {
                break;
            }
        }
    }
    debug!("Health monitor stopped");
}

async fn restart_worker(shared: &Arc<PoolShared>, stale: StaleWorker) {
    let StaleWorker {
        worker_id,
        generation,
        process,
        lost_task,
    } = stale;

    if let Some(process) = process {
        process.terminate(shared.config.shutdown_timeout).await;
    }
    if let Some(task_id) = lost_task {
        shared.handle_lost_task(task_id, worker_id);
    }
    if shared.is_shutting_down() {
        return;
    }

    match WorkerProcess::spawn(shared, worker_id, generation) {
        Ok(process) => {
            let pid = process.pid();
            if let Some(orphan) = shared.replace_process(worker_id, generation, process) {
                orphan.shutdown(false, shared.config.shutdown_timeout).await;
                return;
            }
            info!(worker_id, ?pid, "Restarted worker");
        }
        Err(e) => {
            // Retried after another timeout period
            error!(worker_id, "Failed to restart worker: {}", e);
        }
    }
}
