use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use futures::future::BoxFuture;
use tracing::{debug, info};

use varflow_core::config::ExecutorConfig;
use varflow_core::error::{Result, VarflowError};
use varflow_core::markers::parse_partial_stop;
use varflow_core::traits::ScriptExecutor;
use varflow_core::types::{ExecutionOutput, ScriptDescriptor, VariableMap};

use crate::harness::{stop_points, HarnessPlan, HARNESS};

const INPUT_FILE: &str = "inputs.json";
const OUTPUT_FILE: &str = "outputs.json";
const BODY_FILE: &str = "body.py";
const PLAN_FILE: &str = "plan.json";
const HARNESS_FILE: &str = "harness.py";

/// Runs each script in a fresh interpreter process.
///
/// Inputs and outputs cross the process boundary as files inside a per-run
/// temporary directory, which is removed when the run ends on any path
/// (success, error, or the future being dropped). Each value is a tagged
/// [`VarValue`](varflow_core::types::VarValue), so pickled objects pass
/// through untouched.
pub struct ProcessExecutor {
    config: ExecutorConfig,
}

impl ProcessExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    async fn run(
        &self,
        script: &ScriptDescriptor,
        inputs: VariableMap,
        stop_at_first_produce: bool,
    ) -> Result<ExecutionOutput> {
        let fail = |message: String| VarflowError::ScriptExecution {
            script: script.path.clone(),
            message,
        };

        let mut builder = tempfile::Builder::new();
        builder.prefix("varflow-run-");
        let scratch = match self.config.scratch_dir {
            Some(ref dir) => builder.tempdir_in(dir),
            None => builder.tempdir(),
        }
        .map_err(|e| fail(format!("Failed to create scratch directory: {}", e)))?;
        let input_path = scratch.path().join(INPUT_FILE);
        let output_path = scratch.path().join(OUTPUT_FILE);
        let body_path = scratch.path().join(BODY_FILE);
        let plan_path = scratch.path().join(PLAN_FILE);
        let harness_path = scratch.path().join(HARNESS_FILE);

        let plan = HarnessPlan {
            script_path: &script.path,
            body_path: &body_path,
            input_path: &input_path,
            output_path: &output_path,
            produces: &script.produces,
            stops: if stop_at_first_produce {
                stop_points(&script.source)
            } else {
                Vec::new()
            },
        };

        tokio::fs::write(&input_path, serde_json::to_vec(&inputs)?).await?;
        tokio::fs::write(&body_path, &script.source).await?;
        tokio::fs::write(&plan_path, serde_json::to_vec(&plan)?).await?;
        tokio::fs::write(&harness_path, HARNESS).await?;

        let working_dir = self.working_dir_for(script);
        debug!(
            script = %script.path,
            interpreter = %self.config.interpreter,
            inputs = inputs.len(),
            partial = stop_at_first_produce,
            "Spawning script process"
        );

        let start = Instant::now();
        let output = tokio::process::Command::new(&self.config.interpreter)
            .args(&self.config.extra_args)
            .arg(&harness_path)
            .arg(&plan_path)
            .current_dir(&working_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| fail(format!("Failed to spawn {}: {}", self.config.interpreter, e)))?;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() || !stderr.is_empty() {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            debug!(script = %script.path, stdout = %stdout, "Failed run stdout");
            return Err(fail(format!("exit {}: {}", code, stderr.trim())));
        }

        let values = read_outputs(&output_path, &script.produces).await?;
        let partial_stop = if stop_at_first_produce {
            parse_partial_stop(&stdout)
        } else {
            None
        };

        info!(
            script = %script.path,
            produced = values.len(),
            partial = partial_stop.is_some(),
            elapsed_ms,
            "Script process finished"
        );

        Ok(ExecutionOutput {
            values,
            stdout,
            stderr,
            partial_stop,
        })
    }

    fn working_dir_for(&self, script: &ScriptDescriptor) -> PathBuf {
        if let Some(ref dir) = self.config.working_dir {
            return PathBuf::from(dir);
        }
        Path::new(&script.path)
            .parent()
            .filter(|p| p.is_dir())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

impl ScriptExecutor for ProcessExecutor {
    fn execute<'a>(
        &'a self,
        script: &'a ScriptDescriptor,
        inputs: VariableMap,
        stop_at_first_produce: bool,
    ) -> BoxFuture<'a, Result<ExecutionOutput>> {
        Box::pin(self.run(script, inputs, stop_at_first_produce))
    }
}

/// Read the harness output file, keeping only declared produced names.
///
/// A value with an unknown encoding tag fails the whole read.
async fn read_outputs(path: &Path, produces: &[String]) -> Result<VariableMap> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(VariableMap::new()),
        Err(e) => return Err(e.into()),
    };
    let mut values: VariableMap = serde_json::from_slice(&raw)?;
    values.retain(|name, _| produces.contains(name));
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use varflow_core::types::VarValue;

    #[test]
    fn test_working_dir_defaults_to_script_parent() {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("a.py");
        let executor = ProcessExecutor::new(ExecutorConfig::default());
        let descriptor = ScriptDescriptor::new(script_path.to_string_lossy().to_string());
        assert_eq!(executor.working_dir_for(&descriptor), dir.path());
    }

    #[test]
    fn test_working_dir_override() {
        let config = ExecutorConfig {
            working_dir: Some("/srv".into()),
            ..ExecutorConfig::default()
        };
        let executor = ProcessExecutor::new(config);
        let descriptor = ScriptDescriptor::new("/elsewhere/a.py");
        assert_eq!(executor.working_dir_for(&descriptor), PathBuf::from("/srv"));
    }

    #[tokio::test]
    async fn test_read_outputs_filters_undeclared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(OUTPUT_FILE);
        tokio::fs::write(
            &path,
            br#"{"a": {"encoding": "pickle", "data": "gARLAS4=", "preview": 1},
                 "sneaky": {"encoding": "json", "value": 2}}"#,
        )
        .await
        .unwrap();
        let values = read_outputs(&path, &["a".to_string()]).await.unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(
            values["a"],
            VarValue::pickle("gARLAS4=", Some(serde_json::json!(1)))
        );
    }

    #[tokio::test]
    async fn test_read_outputs_rejects_untagged_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(OUTPUT_FILE);
        tokio::fs::write(&path, br#"{"a": 1}"#).await.unwrap();
        assert!(read_outputs(&path, &["a".to_string()]).await.is_err());
    }

    #[tokio::test]
    async fn test_read_outputs_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let values = read_outputs(&dir.path().join("nope.json"), &[]).await.unwrap();
        assert!(values.is_empty());
    }
}
