//! CLI argument parsing definitions

use clap::{Args, Parser, Subcommand};
use spindle_config::ExecutorBackend;
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Run as worker process (internal use)
    #[arg(long, hide = true)]
    pub worker: bool,

    /// Worker ID (used with --worker)
    #[arg(long, value_name = "ID", hide = true)]
    pub worker_id: Option<usize>,

    /// Idle wait before a worker sends a heartbeat (used with --worker)
    #[arg(long, value_name = "MS", hide = true, default_value_t = 1000)]
    pub poll_interval_ms: u64,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one call of a built-in function and print its result
    Call {
        /// Function name
        function: String,

        /// Positional arguments as JSON; anything that is not JSON is passed as a string
        #[arg(value_name = "JSON", allow_negative_numbers = true)]
        args: Vec<String>,

        /// Keyword arguments as a JSON object (example: --kwargs='{"greeting":"hi"}')
        #[arg(long, value_name = "JSON")]
        kwargs: Option<String>,

        #[command(flatten)]
        pool: PoolArgs,
    },

    /// Submit many small tasks and report throughput and worker statistics
    Bench {
        /// Number of tasks to submit
        #[arg(long, value_name = "N", default_value_t = 1000)]
        tasks: usize,

        #[command(flatten)]
        pool: PoolArgs,
    },

    /// List the built-in functions
    Functions,

    /// Show the configuration in use
    Config {
        /// Output format: yaml, json
        #[arg(long, value_name = "FORMAT", default_value = "yaml")]
        format: String,

        /// Show defaults instead of the loaded configuration
        #[arg(long)]
        sample: bool,
    },
}

/// Overrides for the executor configuration
#[derive(Args, Debug, Clone, Default)]
pub struct PoolArgs {
    /// Executor backend: uniproc, multiproc
    #[arg(long, value_name = "BACKEND")]
    pub backend: Option<ExecutorBackend>,

    /// Number of worker processes
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,
}
