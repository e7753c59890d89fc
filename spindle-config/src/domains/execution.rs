//! Executor and worker pool configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigResult;
use crate::validation::{validate_positive, validate_positive_duration, Validatable};

/// Which executor implementation to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorBackend {
    /// Inline execution in the caller's thread
    Uniproc,
    /// Supervised pool of worker processes
    Multiproc,
    /// Multi-host execution; reserved, no implementation ships
    Distributed,
}

impl Default for ExecutorBackend {
    fn default() -> Self {
        ExecutorBackend::Multiproc
    }
}

impl fmt::Display for ExecutorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutorBackend::Uniproc => "uniproc",
            ExecutorBackend::Multiproc => "multiproc",
            ExecutorBackend::Distributed => "distributed",
        };
        f.write_str(name)
    }
}

impl FromStr for ExecutorBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "uniproc" | "inline" => Ok(ExecutorBackend::Uniproc),
            "multiproc" | "process" => Ok(ExecutorBackend::Multiproc),
            "distributed" => Ok(ExecutorBackend::Distributed),
            _ => Err(format!("Invalid executor backend: {}", s)),
        }
    }
}

/// What happens to the in-flight task of a worker that gets restarted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LostTaskPolicy {
    /// The task's future is never resolved
    Abandon,
    /// The task's future resolves with a worker-lost error
    Fail,
}

impl Default for LostTaskPolicy {
    fn default() -> Self {
        LostTaskPolicy::Abandon
    }
}

impl FromStr for LostTaskPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "abandon" => Ok(LostTaskPolicy::Abandon),
            "fail" => Ok(LostTaskPolicy::Fail),
            _ => Err(format!("Invalid lost task policy: {}", s)),
        }
    }
}

/// How worker processes are launched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerCommandConfig {
    /// Worker executable; the current executable when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<PathBuf>,

    /// Arguments placed before the worker flags
    pub args: Vec<String>,

    /// Log filter handed to workers via `--log-level`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

/// Executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Executor implementation
    pub backend: ExecutorBackend,

    /// Number of worker processes
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Health monitor period
    #[serde(with = "crate::domains::utils::serde_duration_ms", default = "default_heartbeat_interval")]
    pub heartbeat_interval: Duration,

    /// Heartbeat age after which a worker is considered stalled and restarted
    #[serde(with = "crate::domains::utils::serde_duration_ms", default = "default_worker_timeout")]
    pub worker_timeout: Duration,

    /// Bounded wait of an idle worker before it emits a heartbeat
    #[serde(with = "crate::domains::utils::serde_duration_ms", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Bounded join for a terminating worker before it is killed
    #[serde(with = "crate::domains::utils::serde_duration_ms", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,

    /// How long `start` waits for every worker to report ready
    #[serde(with = "crate::domains::utils::serde_duration_ms", default = "default_startup_timeout")]
    pub startup_timeout: Duration,

    /// Reject submissions beyond this many unresolved tasks; unbounded when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pending_tasks: Option<usize>,

    /// Handling of tasks in flight on a restarted worker
    pub lost_task_policy: LostTaskPolicy,

    /// Worker launch command
    pub worker: WorkerCommandConfig,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            backend: ExecutorBackend::default(),
            num_workers: default_num_workers(),
            heartbeat_interval: default_heartbeat_interval(),
            worker_timeout: default_worker_timeout(),
            poll_interval: default_poll_interval(),
            shutdown_timeout: default_shutdown_timeout(),
            startup_timeout: default_startup_timeout(),
            max_pending_tasks: None,
            lost_task_policy: LostTaskPolicy::default(),
            worker: WorkerCommandConfig::default(),
        }
    }
}

impl ExecutionConfig {
    /// Configuration for a process pool of the given size
    pub fn multiproc(num_workers: usize) -> Self {
        Self {
            backend: ExecutorBackend::Multiproc,
            num_workers,
            ..Default::default()
        }
    }

    /// Configuration for inline execution
    pub fn uniproc() -> Self {
        Self {
            backend: ExecutorBackend::Uniproc,
            num_workers: 1,
            ..Default::default()
        }
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker.program = Some(program.into());
        self
    }
}

impl Validatable for ExecutionConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(self.num_workers, "num_workers", self.domain_name())?;
        validate_positive_duration(self.heartbeat_interval, "heartbeat_interval", self.domain_name())?;
        validate_positive_duration(self.worker_timeout, "worker_timeout", self.domain_name())?;
        validate_positive_duration(self.poll_interval, "poll_interval", self.domain_name())?;
        validate_positive_duration(self.shutdown_timeout, "shutdown_timeout", self.domain_name())?;

        if self.poll_interval >= self.worker_timeout {
            return Err(self.validation_error(format!(
                "poll_interval ({}ms) must be shorter than worker_timeout ({}ms)",
                self.poll_interval.as_millis(),
                self.worker_timeout.as_millis()
            )));
        }

        if let Some(limit) = self.max_pending_tasks {
            validate_positive(limit, "max_pending_tasks", self.domain_name())?;
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "execution"
    }
}

fn default_num_workers() -> usize {
    num_cpus::get()
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_worker_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_startup_timeout() -> Duration {
    Duration::from_secs(10)
}
