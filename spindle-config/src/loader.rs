//! Configuration loading and environment variable handling

use crate::domains::SpindleConfig;
use crate::error::{ConfigError, ConfigResult};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "SPINDLE".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<SpindleConfig> {
        let content = std::fs::read_to_string(path)?;
        let mut config: SpindleConfig = serde_yaml::from_str(&content)?;

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<SpindleConfig> {
        let mut config = SpindleConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<SpindleConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut SpindleConfig) -> ConfigResult<()> {
        self.apply_execution_overrides(&mut config.execution)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    /// Apply execution config overrides
    fn apply_execution_overrides(
        &self,
        config: &mut crate::domains::execution::ExecutionConfig,
    ) -> ConfigResult<()> {
        use crate::domains::execution::{ExecutorBackend, LostTaskPolicy};

        if let Ok(backend) = self.get_env_var("BACKEND") {
            config.backend = ExecutorBackend::from_str(&backend)
                .map_err(|_| ConfigError::EnvError(format!("Invalid BACKEND: {}", backend)))?;
        }

        if let Ok(workers) = self.get_env_var("NUM_WORKERS") {
            config.num_workers = workers
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid NUM_WORKERS: {}", e)))?;
        }

        if let Some(interval) = self.get_env_millis("HEARTBEAT_INTERVAL_MS")? {
            config.heartbeat_interval = interval;
        }

        if let Some(timeout) = self.get_env_millis("WORKER_TIMEOUT_MS")? {
            config.worker_timeout = timeout;
        }

        if let Some(poll) = self.get_env_millis("POLL_INTERVAL_MS")? {
            config.poll_interval = poll;
        }

        if let Some(timeout) = self.get_env_millis("SHUTDOWN_TIMEOUT_MS")? {
            config.shutdown_timeout = timeout;
        }

        if let Ok(limit) = self.get_env_var("MAX_PENDING_TASKS") {
            let limit: usize = limit
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid MAX_PENDING_TASKS: {}", e)))?;
            config.max_pending_tasks = Some(limit);
        }

        if let Ok(policy) = self.get_env_var("LOST_TASK_POLICY") {
            config.lost_task_policy = LostTaskPolicy::from_str(&policy)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOST_TASK_POLICY: {}", policy)))?;
        }

        if let Ok(program) = self.get_env_var("WORKER_PROGRAM") {
            config.worker.program = Some(program.into());
        }

        Ok(())
    }

    /// Apply logging config overrides
    fn apply_logging_overrides(
        &self,
        config: &mut crate::domains::logging::LoggingConfig,
    ) -> ConfigResult<()> {
        use crate::domains::logging::{LogFormat, LogLevel};

        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    /// Read a millisecond duration from a prefixed variable
    fn get_env_millis(&self, name: &str) -> ConfigResult<Option<Duration>> {
        match self.get_env_var(name) {
            Ok(value) => {
                let millis: u64 = value
                    .parse()
                    .map_err(|e| ConfigError::EnvError(format!("Invalid {}: {}", name, e)))?;
                Ok(Some(Duration::from_millis(millis)))
            }
            Err(_) => Ok(None),
        }
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
