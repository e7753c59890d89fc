use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde_json::{Map, Value as JsonValue};
use spindle::builtin_registry;
use spindle::cli::{Cli, Commands, PoolArgs};
use spindle_config::{ConfigLoader, SpindleConfig};
use spindle_execution::{
    run_worker_process, Executor, ExecutorFactory, TaskArgs, TaskError, WorkerOptions,
};
use tracing::{debug, info, warn};

/// Load configuration from file or use defaults
fn load_config(config_path: Option<&PathBuf>) -> Result<SpindleConfig> {
    let loader = ConfigLoader::new();

    match config_path {
        Some(path) => {
            if path.exists() {
                info!("Loading configuration from: {:?}", path);
                loader
                    .from_file(path)
                    .context(format!("Failed to load configuration from {:?}", path))
            } else {
                warn!("Configuration file not found: {:?}. Using defaults.", path);
                loader
                    .from_env()
                    .context("Failed to load configuration from environment")
            }
        }
        None => {
            debug!("No configuration file specified. Loading from environment or defaults.");
            loader
                .from_env()
                .context("Failed to load configuration from environment")
        }
    }
}

/// Serve tasks over stdin/stdout until the controller stops this worker
fn run_worker(cli: &Cli) -> Result<()> {
    let worker_id = cli
        .worker_id
        .ok_or_else(|| anyhow!("--worker requires --worker-id"))?;

    // Worker processes output to stderr to avoid conflicts with IPC on stdout
    spindle_logging::init_worker_logging(cli.log_level.as_deref())?;

    let options = WorkerOptions {
        worker_id,
        poll_interval: Duration::from_millis(cli.poll_interval_ms),
    };
    let registry = builtin_registry()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build worker runtime")?;
    let result = runtime.block_on(run_worker_process(options, registry));

    // A pending stdin read lives on a blocking thread that would otherwise hold the exit
    runtime.shutdown_background();

    result.context(format!("Worker {} failed", worker_id))
}

fn apply_pool_args(config: &mut SpindleConfig, pool: &PoolArgs) {
    if let Some(backend) = pool.backend {
        config.execution.backend = backend;
    }
    if let Some(workers) = pool.workers {
        config.execution.num_workers = workers;
    }
}

fn start_executor(config: &SpindleConfig) -> Result<Box<dyn Executor>> {
    let executor = ExecutorFactory::from_config(&config.execution, builtin_registry()?)
        .context("Failed to create executor")?;
    executor.start().context("Failed to start executor")?;
    Ok(executor)
}

/// Parse positional arguments as JSON, keeping anything else as a plain string
fn parse_args(args: &[String], kwargs: Option<&String>) -> Result<TaskArgs> {
    let args = args
        .iter()
        .map(|arg| serde_json::from_str(arg).unwrap_or_else(|_| JsonValue::String(arg.clone())))
        .collect();

    let kwargs = match kwargs {
        Some(json_str) => {
            match serde_json::from_str(json_str).context("Failed to parse --kwargs JSON")? {
                JsonValue::Object(map) => map,
                other => return Err(anyhow!("--kwargs must be a JSON object, got: {}", other)),
            }
        }
        None => Map::new(),
    };

    Ok(TaskArgs::new(args, kwargs))
}

fn handle_call(
    config: &SpindleConfig,
    function: &str,
    args: &[String],
    kwargs: Option<&String>,
) -> Result<()> {
    let task_args = parse_args(args, kwargs)?;
    let executor = start_executor(config)?;

    let outcome = executor
        .submit(function, task_args)
        .context("Failed to submit task")?
        .result(None);
    executor.shutdown(true)?;

    match outcome {
        Ok(value) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&value).context("Failed to serialize result")?
            );
            Ok(())
        }
        Err(TaskError::Failed { error, traceback }) => {
            eprintln!("{}", traceback);
            Err(anyhow!("Task {} failed: {}", function, error))
        }
        Err(e) => Err(anyhow!("Task {} failed: {}", function, e)),
    }
}

fn handle_bench(config: &SpindleConfig, tasks: usize) -> Result<()> {
    let executor = start_executor(config)?;
    info!(
        backend = %executor.backend(),
        workers = executor.num_workers(),
        tasks,
        "Running benchmark"
    );

    let started = Instant::now();
    let futures = (0..tasks)
        .map(|i| executor.submit("add", TaskArgs::positional(vec![i.into(), 1.into()])))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to submit benchmark tasks")?;

    let mut failures = 0usize;
    for future in &futures {
        if let Err(e) = future.result(None) {
            warn!(task_id = future.task_id(), "Benchmark task failed: {}", e);
            failures += 1;
        }
    }
    let elapsed = started.elapsed();

    let mut stats: Vec<_> = executor.worker_stats().into_values().collect();
    stats.sort_by_key(|info| info.worker_id);
    executor.shutdown(true)?;

    let throughput = tasks as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
    println!(
        "{} tasks in {:.3}s ({:.1} tasks/s), {} failed",
        tasks,
        elapsed.as_secs_f64(),
        throughput,
        failures
    );
    println!(
        "{:>6} {:>8} {:>10} {:>9} {:>7} {:>8}",
        "worker", "pid", "completed", "failed", "errors", "restarts"
    );
    for info in stats {
        let pid = info.pid.map(|pid| pid.to_string()).unwrap_or_else(|| "-".to_string());
        println!(
            "{:>6} {:>8} {:>10} {:>9} {:>7} {:>8}",
            info.worker_id,
            pid,
            info.tasks_completed,
            info.tasks_failed,
            info.error_count,
            info.restart_count
        );
    }

    Ok(())
}

fn handle_functions() -> Result<()> {
    for name in builtin_registry()?.names() {
        println!("{}", name);
    }
    Ok(())
}

fn handle_config_show(config: &SpindleConfig, format: &str) -> Result<()> {
    let output_value = serde_json::to_value(config).context("Failed to serialize config")?;

    match format.to_lowercase().as_str() {
        "yaml" | "yml" => {
            let yaml_output =
                serde_yaml::to_string(&output_value).context("Failed to serialize to YAML")?;
            println!("{}", yaml_output);
        }
        "json" => {
            let json_output = serde_json::to_string_pretty(&output_value)
                .context("Failed to serialize to JSON")?;
            println!("{}", json_output);
        }
        _ => {
            return Err(anyhow!(
                "Unknown output format: {}. Valid formats: yaml, json",
                format
            ));
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle worker mode first (before any logging setup to avoid conflicts)
    if cli.worker {
        return run_worker(&cli);
    }

    // Load configuration first
    let mut config = load_config(cli.config.as_ref())?;
    spindle_logging::init_logging(&config.logging, cli.log_level.as_deref())?;

    if config.execution.worker.log_level.is_none() {
        config.execution.worker.log_level = cli.log_level.clone();
    }

    debug!("Spindle CLI starting");

    match &cli.command {
        Some(Commands::Call {
            function,
            args,
            kwargs,
            pool,
        }) => {
            apply_pool_args(&mut config, pool);
            handle_call(&config, function, args, kwargs.as_ref())
        }
        Some(Commands::Bench { tasks, pool }) => {
            apply_pool_args(&mut config, pool);
            handle_bench(&config, *tasks)
        }
        Some(Commands::Functions) => handle_functions(),
        Some(Commands::Config { format, sample }) => {
            if *sample {
                handle_config_show(&SpindleConfig::default(), format)
            } else {
                handle_config_show(&config, format)
            }
        }
        None => {
            println!("No command specified. Use --help for usage information.");
            Ok(())
        }
    }
}
