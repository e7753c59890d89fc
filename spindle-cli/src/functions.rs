//! Built-in task functions
//!
//! The controller and every worker build the same registry from
//! [`builtin_registry`], so names resolve identically on both sides of the
//! process boundary.

use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde_json::{json, Number, Value as JsonValue};
use spindle_execution::{ExecutionError, FunctionRegistry, TaskArgs};

/// Registry with every built-in function
pub fn builtin_registry() -> Result<FunctionRegistry, ExecutionError> {
    let mut registry = FunctionRegistry::new();
    registry.register("add", add)?;
    registry.register("mul", mul)?;
    registry.register("sum", sum)?;
    registry.register("echo", echo)?;
    registry.register("word_count", word_count)?;
    registry.register("fail", fail)?;
    registry.register("panic", panic_task)?;
    registry.register("sleep_ms", sleep_ms)?;
    registry.register("pid", pid)?;
    Ok(registry)
}

fn add(args: &TaskArgs) -> Result<JsonValue> {
    arithmetic(args, i64::checked_add, |a, b| a + b)
}

fn mul(args: &TaskArgs) -> Result<JsonValue> {
    arithmetic(args, i64::checked_mul, |a, b| a * b)
}

/// Integer arithmetic when both operands are integers, float otherwise
fn arithmetic(
    args: &TaskArgs,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<JsonValue> {
    let a: Number = args.arg(0)?;
    let b: Number = args.arg(1)?;

    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return int_op(a, b)
            .map(|value| json!(value))
            .ok_or_else(|| anyhow!("integer overflow"));
    }

    match (a.as_f64(), b.as_f64()) {
        (Some(a), Some(b)) => Ok(json!(float_op(a, b))),
        _ => bail!("operands must be numbers"),
    }
}

fn sum(args: &TaskArgs) -> Result<JsonValue> {
    let values: Vec<Number> = args.arg(0)?;
    let ints: Option<Vec<i64>> = values.iter().map(Number::as_i64).collect();

    match ints {
        Some(ints) => ints
            .into_iter()
            .try_fold(0i64, i64::checked_add)
            .map(|total| json!(total))
            .ok_or_else(|| anyhow!("integer overflow")),
        None => {
            let total: f64 = values.iter().filter_map(Number::as_f64).sum();
            Ok(json!(total))
        }
    }
}

fn echo(args: &TaskArgs) -> Result<JsonValue> {
    Ok(args.args.first().cloned().unwrap_or(JsonValue::Null))
}

fn word_count(args: &TaskArgs) -> Result<JsonValue> {
    let text: String = args.arg(0)?;
    let lowercase: bool = args.kwarg_or("lowercase", true)?;

    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    for word in text.split_whitespace() {
        let word = word.trim_matches(|c: char| !c.is_alphanumeric());
        if word.is_empty() {
            continue;
        }
        let word = if lowercase {
            word.to_lowercase()
        } else {
            word.to_string()
        };
        *counts.entry(word).or_default() += 1;
    }
    Ok(json!(counts))
}

fn fail(args: &TaskArgs) -> Result<JsonValue> {
    let message: String = args
        .arg(0)
        .unwrap_or_else(|_| "requested failure".to_string());
    Err(anyhow!(message).context("task failed on request"))
}

fn panic_task(args: &TaskArgs) -> Result<JsonValue> {
    let message: String = args
        .arg(0)
        .unwrap_or_else(|_| "requested panic".to_string());
    panic!("{}", message)
}

/// Blocks the worker; also how tests withhold heartbeats
fn sleep_ms(args: &TaskArgs) -> Result<JsonValue> {
    let millis: u64 = args.arg(0)?;
    thread::sleep(Duration::from_millis(millis));
    Ok(json!(millis))
}

fn pid(_args: &TaskArgs) -> Result<JsonValue> {
    Ok(json!(std::process::id()))
}
