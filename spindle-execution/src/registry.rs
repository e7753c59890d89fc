//! Registry of named task functions
//!
//! Functions take positional and keyword JSON arguments and return a JSON
//! value. The same registry is used by the inline executor and inside every
//! worker process, so a function name means the same thing everywhere.

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::fmt::{self, Write as _};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use spindle_ipc::TaskOutcome;

use crate::error::{ExecutionError, TaskError};

/// A registered task function
pub type TaskFn = Arc<dyn Fn(&TaskArgs) -> anyhow::Result<JsonValue> + Send + Sync>;

/// Arguments of one task invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskArgs {
    pub args: Vec<JsonValue>,
    pub kwargs: Map<String, JsonValue>,
}

impl TaskArgs {
    pub fn new(args: Vec<JsonValue>, kwargs: Map<String, JsonValue>) -> Self {
        Self { args, kwargs }
    }

    /// Positional arguments only
    pub fn positional(args: Vec<JsonValue>) -> Self {
        Self {
            args,
            kwargs: Map::new(),
        }
    }

    pub fn with_kwarg(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.kwargs.insert(name.into(), value);
        self
    }

    /// Positional argument `index`, deserialized as `T`
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> anyhow::Result<T> {
        let value = self
            .args
            .get(index)
            .ok_or_else(|| anyhow!("missing positional argument {}", index))?;
        serde_json::from_value(value.clone())
            .with_context(|| format!("positional argument {} has the wrong type", index))
    }

    /// Keyword argument `name`, deserialized as `T`
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<T> {
        let value = self
            .kwargs
            .get(name)
            .ok_or_else(|| anyhow!("missing keyword argument '{}'", name))?;
        serde_json::from_value(value.clone())
            .with_context(|| format!("keyword argument '{}' has the wrong type", name))
    }

    /// Keyword argument `name`, or `default` when absent
    pub fn kwarg_or<T: DeserializeOwned>(&self, name: &str, default: T) -> anyhow::Result<T> {
        if self.kwargs.contains_key(name) {
            self.kwarg(name)
        } else {
            Ok(default)
        }
    }
}

/// Name to function mapping
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, TaskFn>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure under `name`
    pub fn register<F>(&mut self, name: impl Into<String>, function: F) -> Result<(), ExecutionError>
    where
        F: Fn(&TaskArgs) -> anyhow::Result<JsonValue> + Send + Sync + 'static,
    {
        self.insert(name, Arc::new(function))
    }

    /// Register an already shared function. Names are unique.
    pub fn insert(&mut self, name: impl Into<String>, function: TaskFn) -> Result<(), ExecutionError> {
        let name = name.into();
        if self.functions.contains_key(&name) {
            return Err(ExecutionError::DuplicateFunction(name));
        }
        self.functions.insert(name, function);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<TaskFn> {
        self.functions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Look up and run `func_name`; a missing name becomes a failure outcome
    pub fn invoke(&self, func_name: &str, args: &TaskArgs) -> TaskOutcome {
        match self.functions.get(func_name) {
            Some(function) => invoke_function(func_name, function, args),
            None => TaskOutcome::failure(
                format!("Unknown function: {}", func_name),
                format!(
                    "no function named '{}' is registered (known: {})",
                    func_name,
                    self.names().join(", ")
                ),
            ),
        }
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

/// Run one function, turning errors and panics into a failure outcome.
///
/// The traceback of a failure is never empty: it names the function, lists
/// the error's cause chain and ends with a captured backtrace.
pub fn invoke_function(func_name: &str, function: &TaskFn, args: &TaskArgs) -> TaskOutcome {
    match panic::catch_unwind(AssertUnwindSafe(|| function(args))) {
        Ok(Ok(value)) => TaskOutcome::success(value),
        Ok(Err(err)) => TaskOutcome::failure(format!("{:#}", err), error_traceback(func_name, &err)),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            let traceback = format!(
                "function '{}' panicked: {}\nstack backtrace:\n{}",
                func_name,
                message,
                Backtrace::force_capture()
            );
            TaskOutcome::failure(format!("panicked: {}", message), traceback)
        }
    }
}

/// Map a task outcome onto what its future resolves with
pub(crate) fn outcome_into_result(outcome: TaskOutcome) -> Result<JsonValue, TaskError> {
    match outcome {
        TaskOutcome::Success { value } => Ok(value),
        TaskOutcome::Failure { error, traceback } => Err(TaskError::Failed { error, traceback }),
    }
}

fn error_traceback(func_name: &str, err: &anyhow::Error) -> String {
    let mut traceback = format!("function '{}' failed: {}\n", func_name, err);
    for (depth, cause) in err.chain().skip(1).enumerate() {
        let _ = writeln!(traceback, "  {}: caused by: {}", depth, cause);
    }
    let _ = write!(traceback, "stack backtrace:\n{}", Backtrace::force_capture());
    traceback
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
