//! Integration tests for spindle-config

use spindle_config::*;
use std::io::Write;
use std::time::Duration;
use temp_env::with_vars;

const ENV_VARS: [&str; 6] = [
    "SPINDLE_BACKEND",
    "SPINDLE_NUM_WORKERS",
    "SPINDLE_WORKER_TIMEOUT_MS",
    "SPINDLE_POLL_INTERVAL_MS",
    "SPINDLE_LOG_LEVEL",
    "SPINDLE_WORKER_PROGRAM",
];

fn clean_env() -> Vec<(&'static str, Option<&'static str>)> {
    ENV_VARS.iter().map(|name| (*name, None)).collect()
}

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_default_config_validation() {
    let config = SpindleConfig::default();
    assert!(config.validate_all().is_ok());
}

#[test]
fn test_config_loader_from_env() {
    let vars = vec![
        ("SPINDLE_BACKEND", Some("multiproc")),
        ("SPINDLE_NUM_WORKERS", Some("3")),
        ("SPINDLE_WORKER_TIMEOUT_MS", Some("2500")),
        ("SPINDLE_POLL_INTERVAL_MS", Some("200")),
        ("SPINDLE_LOG_LEVEL", Some("debug")),
        ("SPINDLE_WORKER_PROGRAM", Some("/usr/local/bin/spindle")),
    ];

    with_vars(vars, || {
        let config = ConfigLoader::new().load(None::<&str>).unwrap();

        assert_eq!(config.execution.backend, ExecutorBackend::Multiproc);
        assert_eq!(config.execution.num_workers, 3);
        assert_eq!(config.execution.worker_timeout, Duration::from_millis(2500));
        assert_eq!(config.execution.poll_interval, Duration::from_millis(200));
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(
            config.execution.worker.program.as_deref(),
            Some(std::path::Path::new("/usr/local/bin/spindle"))
        );
    });
}

#[test]
fn test_yaml_file_with_worker_command() {
    let file = write_config(
        r#"
execution:
  backend: multiproc
  num_workers: 2
  heartbeat_interval: 250
  lost_task_policy: fail
  max_pending_tasks: 64
  worker:
    program: /opt/spindle/bin/spindle
    args: ["--config", "/etc/spindle.yaml"]
    log_level: warn
logging:
  format: json
"#,
    );

    let config = with_vars(clean_env(), || ConfigLoader::new().load(Some(file.path()))).unwrap();

    assert_eq!(config.execution.num_workers, 2);
    assert_eq!(config.execution.heartbeat_interval, Duration::from_millis(250));
    assert_eq!(config.execution.lost_task_policy, LostTaskPolicy::Fail);
    assert_eq!(config.execution.max_pending_tasks, Some(64));
    assert_eq!(config.execution.worker.args, vec!["--config", "/etc/spindle.yaml"]);
    assert_eq!(config.execution.worker.log_level.as_deref(), Some("warn"));
    assert_eq!(config.logging.format, LogFormat::Json);
    // Unset fields keep their defaults
    assert_eq!(config.execution.worker_timeout, Duration::from_secs(10));
}

#[test]
fn test_poll_interval_must_undercut_worker_timeout() {
    let file = write_config("execution:\n  poll_interval: 5000\n  worker_timeout: 2000\n");

    let result = with_vars(clean_env(), || ConfigLoader::new().from_file(file.path()));
    match result {
        Err(ConfigError::DomainError { domain, message }) => {
            assert_eq!(domain, "execution");
            assert!(message.contains("poll_interval"));
        }
        other => panic!("expected domain error, got {:?}", other),
    }
}

#[test]
fn test_missing_and_malformed_files() {
    let missing = ConfigLoader::new().from_file("/nonexistent/spindle.yaml");
    assert!(matches!(missing, Err(ConfigError::FileReadError(_))));

    let file = write_config("execution:\n  backend: gpu\n");
    let malformed = with_vars(clean_env(), || ConfigLoader::new().from_file(file.path()));
    assert!(matches!(malformed, Err(ConfigError::ParseError(_))));
}

#[test]
fn test_serialized_config_reloads() {
    let mut config = SpindleConfig::default();
    config.execution = ExecutionConfig::multiproc(5).with_worker_program("/bin/spindle");
    config.execution.worker_timeout = Duration::from_millis(7500);

    let file = write_config(&serde_yaml::to_string(&config).unwrap());
    let reloaded = with_vars(clean_env(), || ConfigLoader::new().from_file(file.path())).unwrap();

    assert_eq!(reloaded.execution.num_workers, 5);
    assert_eq!(reloaded.execution.worker_timeout, Duration::from_millis(7500));
    assert_eq!(
        reloaded.execution.worker.program,
        Some(std::path::PathBuf::from("/bin/spindle"))
    );
}
