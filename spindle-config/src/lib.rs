//! Configuration for spindle executors
//!
//! Configuration is split by domain (execution, logging), loaded from YAML,
//! overridden from `SPINDLE_*` environment variables and validated.

pub mod domains;
pub mod error;
pub mod loader;
pub mod validation;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;

// Re-export domain configurations
pub use domains::{
    execution::{ExecutionConfig, ExecutorBackend, LostTaskPolicy, WorkerCommandConfig},
    logging::{LogFormat, LogLevel, LogOutput, LoggingConfig},
    SpindleConfig,
};

// Re-export utilities
pub use domains::utils::serde_duration_ms;
