//! Controller-side handle to one worker process
//!
//! Each spawned worker gets three tasks on the pool runtime: a stdin writer,
//! a stdout reader forwarding [`CoordinatorMessage`]s to the result
//! collector, and a feeder that moves one task at a time from the shared
//! queue to the worker whenever it holds a credit. A credit is granted when
//! the worker reports ready and after each of its results, so a busy worker
//! never has more than one task in flight.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use spindle_config::ExecutionConfig;
use spindle_ipc::{
    CoordinatorMessage, FrameReader, FrameWriter, IpcError, MessageEnvelope, WorkerId,
    WorkerMessage,
};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::ExecutionError;
use crate::supervisor::{stopped, PoolShared, WorkerEvent};

/// A running worker process and its I/O tasks
#[derive(Debug)]
pub(crate) struct WorkerProcess {
    worker_id: WorkerId,
    generation: u64,
    pid: Option<u32>,
    child: Child,
    writer_tx: mpsc::UnboundedSender<WorkerMessage>,
    credit_tx: mpsc::UnboundedSender<()>,
    stop_tx: watch::Sender<bool>,
    reader: JoinHandle<()>,
}

impl WorkerProcess {
    /// Spawn a worker process. Must be called from within the pool runtime.
    pub fn spawn(
        shared: &Arc<PoolShared>,
        worker_id: WorkerId,
        generation: u64,
    ) -> Result<Self, ExecutionError> {
        let mut command = worker_command(&shared.config, worker_id)?;
        let mut child = command.spawn().map_err(|e| {
            ExecutionError::SpawnError(format!("Failed to spawn worker {}: {}", worker_id, e))
        })?;

        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExecutionError::SpawnError("Failed to get stdin".to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutionError::SpawnError("Failed to get stdout".to_string()))?;

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (credit_tx, credit_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        tokio::spawn(write_messages(FrameWriter::new(stdin), worker_id, writer_rx));

        let reader = tokio::spawn(read_messages(
            FrameReader::new(stdout),
            worker_id,
            generation,
            shared.event_tx.clone(),
        ));

        tokio::spawn(feed_tasks(
            Arc::clone(shared),
            worker_id,
            generation,
            credit_rx,
            stop_rx,
            writer_tx.clone(),
        ));

        debug!(worker_id, generation, ?pid, "Spawned worker process");

        Ok(Self {
            worker_id,
            generation,
            pid,
            child,
            writer_tx,
            credit_tx,
            stop_tx,
            reader,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Allow the feeder to hand this worker one more task
    pub fn grant_credit(&self) {
        let _ = self.credit_tx.send(());
    }

    /// Ask the worker to exit, then wait for it.
    ///
    /// With `graceful`, the worker gets up to `timeout` to finish its current
    /// task; otherwise it is killed right away if still running. Output the
    /// worker produced before exiting is forwarded before this returns.
    pub async fn shutdown(mut self, graceful: bool, timeout: Duration) {
        let _ = self.stop_tx.send(true);
        let _ = self.writer_tx.send(WorkerMessage::Shutdown);

        if graceful {
            match tokio::time::timeout(timeout, self.child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(worker_id = self.worker_id, %status, "Worker exited");
                }
                Ok(Err(e)) => {
                    debug!("Worker {} wait failed: {}", self.worker_id, e);
                }
                Err(_) => {
                    warn!(
                        "Worker {} did not exit within {:?}, force killing",
                        self.worker_id, timeout
                    );
                    self.kill().await;
                }
            }
        } else if !matches!(self.child.try_wait(), Ok(Some(_))) {
            self.kill().await;
        }

        if tokio::time::timeout(timeout, &mut self.reader).await.is_err() {
            debug!("Worker {} output did not close in time", self.worker_id);
            self.reader.abort();
        }
    }

    /// Stop a worker that stopped responding: SIGTERM, bounded wait, kill
    pub async fn terminate(mut self, timeout: Duration) {
        let _ = self.stop_tx.send(true);
        self.signal_terminate();

        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(worker_id = self.worker_id, generation = self.generation, %status, "Stalled worker exited");
            }
            Ok(Err(e)) => {
                debug!("Worker {} wait failed: {}", self.worker_id, e);
            }
            Err(_) => {
                warn!(
                    "Worker {} ignored termination for {:?}, force killing",
                    self.worker_id, timeout
                );
                self.kill().await;
            }
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("Failed to kill worker process {}: {}", self.worker_id, e);
        }
    }

    #[cfg(unix)]
    fn signal_terminate(&mut self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match self.pid {
            Some(pid) => {
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    debug!("Failed to signal worker {}: {}", self.worker_id, e);
                }
            }
            None => {
                let _ = self.child.start_kill();
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(&mut self) {
        let _ = self.child.start_kill();
    }
}

/// Command line for worker `worker_id`
fn worker_command(config: &ExecutionConfig, worker_id: WorkerId) -> Result<Command, ExecutionError> {
    let program = match &config.worker.program {
        Some(program) => program.clone(),
        None => std::env::current_exe().map_err(|e| {
            ExecutionError::SpawnError(format!("Failed to get current exe: {}", e))
        })?,
    };

    let mut cmd = Command::new(program);
    cmd.args(&config.worker.args)
        .arg("--worker")
        .arg("--worker-id")
        .arg(worker_id.to_string())
        .arg("--poll-interval-ms")
        .arg(config.poll_interval.as_millis().to_string());

    if let Some(level) = &config.worker.log_level {
        cmd.arg("--log-level").arg(level);
    }

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    Ok(cmd)
}

async fn write_messages(
    mut writer: FrameWriter<ChildStdin>,
    worker_id: WorkerId,
    mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = writer.send(&MessageEnvelope::new(message)).await {
            match e {
                // Expected while a worker is being replaced or shut down
                IpcError::ConnectionClosed => {
                    debug!("Worker {} stdin closed (worker likely terminated)", worker_id);
                }
                e => error!("Failed to write to worker {} stdin: {}", worker_id, e),
            }
            break;
        }
    }
}

async fn read_messages(
    mut reader: FrameReader<ChildStdout>,
    worker_id: WorkerId,
    generation: u64,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    loop {
        match reader.next::<CoordinatorMessage>().await {
            Ok(envelope) => {
                let event = WorkerEvent::Message {
                    worker_id,
                    generation,
                    message: envelope.message,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            Err(IpcError::DeserializationError(e)) => {
                warn!("Ignoring unreadable output from worker {}: {}", worker_id, e);
            }
            Err(e) => {
                if e.is_fatal() {
                    error!("Worker {} speaks an incompatible protocol: {}", worker_id, e);
                } else if !matches!(e, IpcError::ConnectionClosed) {
                    warn!("Failed to read from worker {}: {}", worker_id, e);
                }
                let _ = events.send(WorkerEvent::Disconnected {
                    worker_id,
                    generation,
                });
                break;
            }
        }
    }
    debug!(worker_id, generation, "Worker stdout closed");
}

async fn feed_tasks(
    shared: Arc<PoolShared>,
    worker_id: WorkerId,
    generation: u64,
    mut credits: mpsc::UnboundedReceiver<()>,
    mut stop: watch::Receiver<bool>,
    writer_tx: mpsc::UnboundedSender<WorkerMessage>,
) {
    loop {
        tokio::select! {
            credit = credits.recv() => {
                if credit.is_none() {
                    break;
                }
            }
            _ = stopped(&mut stop) => break,
        }

        let task = tokio::select! {
            task = shared.next_task() => match task {
                Some(task) => task,
                None => break,
            },
            _ = stopped(&mut stop) => break,
        };

        if !shared.mark_busy(worker_id, generation, task.task_id) {
            // Replaced or shutting down since the credit was granted
            shared.requeue(task);
            break;
        }

        let task_id = task.task_id;
        if writer_tx.send(WorkerMessage::ExecuteTask { task }).is_err() {
            warn!(worker_id, task_id, "Worker input closed before task could be sent");
            break;
        }
    }
    debug!(worker_id, generation, "Task feeder stopped");
}
