//! Mocks and fixtures shared by the varflow test suites.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use varflow_core::error::{Result, VarflowError};
use varflow_core::markers::sentinel_line;
use varflow_core::traits::{RawScript, ScriptExecutor};
use varflow_core::types::{ExecutionOutput, Registry, ScriptDescriptor, VarValue, VariableMap};

/// One recorded call to [`MockExecutor::execute`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecCall {
    pub path: String,
    pub inputs: VariableMap,
    pub stop_at_first_produce: bool,
}

/// In-process executor that records every call.
///
/// By default a run binds every declared produced variable to the string
/// `"<name>@<script file name>"`. With `stop_at_first_produce` only the first
/// declared variable is bound and the partial-stop names are reported.
/// Values and failures can be overridden per script path.
#[derive(Debug, Clone, Default)]
pub struct MockExecutor {
    calls: Arc<Mutex<Vec<ExecCall>>>,
    values: Arc<Mutex<HashMap<String, VariableMap>>>,
    failures: Arc<Mutex<HashMap<String, String>>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make runs of `path` fail with `message`.
    pub fn inject_failure(&self, path: impl Into<String>, message: impl Into<String>) {
        self.failures
            .lock()
            .expect("lock")
            .insert(path.into(), message.into());
    }

    pub fn clear_failures(&self) {
        self.failures.lock().expect("lock").clear();
    }

    /// Make runs of `path` return exactly `values`.
    pub fn set_values(&self, path: impl Into<String>, values: VariableMap) {
        self.values.lock().expect("lock").insert(path.into(), values);
    }

    pub fn calls(&self) -> Vec<ExecCall> {
        self.calls.lock().expect("lock").clone()
    }

    /// Paths in execution order.
    pub fn executed(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.path).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("lock").len()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().expect("lock").clear();
    }

    /// Default value bound for `name` by `script`.
    pub fn value_for(name: &str, script: &ScriptDescriptor) -> VarValue {
        VarValue::json(serde_json::Value::String(format!("{}@{}", name, script.name)))
    }

    fn respond(
        &self,
        script: &ScriptDescriptor,
        inputs: VariableMap,
        stop_at_first_produce: bool,
    ) -> Result<ExecutionOutput> {
        self.calls.lock().expect("lock").push(ExecCall {
            path: script.path.clone(),
            inputs,
            stop_at_first_produce,
        });

        if let Some(message) = self.failures.lock().expect("lock").get(&script.path) {
            return Err(VarflowError::ScriptExecution {
                script: script.path.clone(),
                message: message.clone(),
            });
        }

        let mut values = match self.values.lock().expect("lock").get(&script.path) {
            Some(v) => v.clone(),
            None => script
                .produces
                .iter()
                .map(|n| (n.clone(), Self::value_for(n, script)))
                .collect(),
        };

        let mut output = ExecutionOutput::default();
        if stop_at_first_produce {
            if let Some(first) = script.produces.first() {
                values.retain(|k, _| k == first);
                let names = vec![first.clone()];
                output.stdout = format!("{}\n", sentinel_line(&names));
                output.partial_stop = Some(names);
            }
        }
        output.values = values;
        Ok(output)
    }
}

impl ScriptExecutor for MockExecutor {
    fn execute<'a>(
        &'a self,
        script: &'a ScriptDescriptor,
        inputs: VariableMap,
        stop_at_first_produce: bool,
    ) -> BoxFuture<'a, Result<ExecutionOutput>> {
        let result = self.respond(script, inputs, stop_at_first_produce);
        Box::pin(async move { result })
    }
}

/// Descriptor with the given declarations and no source.
pub fn descriptor(path: &str, produces: &[&str], requires: &[&str]) -> ScriptDescriptor {
    ScriptDescriptor {
        produces: produces.iter().map(|s| s.to_string()).collect(),
        requires: requires.iter().map(|s| s.to_string()).collect(),
        ..ScriptDescriptor::new(path)
    }
}

/// Registry keyed by each descriptor's path.
pub fn registry(scripts: Vec<ScriptDescriptor>) -> Registry {
    scripts.into_iter().map(|s| (s.path.clone(), s)).collect()
}

/// In-memory script source built from `(path, source)` pairs.
pub fn memory_source<S: AsRef<str>>(scripts: &[(&str, S)]) -> Vec<RawScript> {
    scripts
        .iter()
        .map(|(path, src)| RawScript {
            path: path.to_string(),
            bytes: src.as_ref().as_bytes().to_vec(),
        })
        .collect()
}

/// Source text declaring `produces`/`requires` with marker comments and
/// binding every produced name.
pub fn script_source(produces: &[&str], requires: &[&str]) -> String {
    let mut src = String::new();
    if !requires.is_empty() {
        src.push_str(&format!("# ORCHESTRATOR.REQUIRES: {}\n", requires.join(", ")));
    }
    for name in produces {
        src.push_str(&format!("{} = {:?}\n", name, name));
        src.push_str(&format!("# ORCHESTRATOR.PRODUCE: {}\n", name));
    }
    src
}

/// Write `contents` to `dir/name`, creating parent directories.
pub fn write_file(dir: &Path, name: &str, contents: &str) -> String {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent dirs");
    }
    std::fs::write(&path, contents).expect("write fixture file");
    path.to_string_lossy().to_string()
}

/// A temporary workspace directory that lives as long as the guard.
pub fn temp_workspace() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("varflow-test-")
        .tempdir()
        .expect("create temp workspace")
}
