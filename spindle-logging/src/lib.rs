//! Logging setup for spindle
//!
//! Controller processes log according to [`LoggingConfig`]; worker processes
//! always log to stderr because their stdout carries the IPC protocol.

pub mod init;

pub use init::{build_filter, init_logging, init_worker_logging};
pub use spindle_config::LoggingConfig;
