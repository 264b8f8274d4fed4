use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, VarflowError};

/// Top-level varflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directories scanned (recursively) for scripts.
    #[serde(default = "default_script_dirs")]
    pub script_dirs: Vec<String>,
    /// File extensions treated as scripts, without the dot.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    /// State directory for the snapshot and schedule files.
    #[serde(default = "default_workspace")]
    pub workspace: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            script_dirs: default_script_dirs(),
            extensions: default_extensions(),
            workspace: default_workspace(),
        }
    }
}

fn default_script_dirs() -> Vec<String> { vec!["scripts".to_string()] }
fn default_extensions() -> Vec<String> { vec!["py".to_string()] }
fn default_workspace() -> String { ".varflow".to_string() }

/// Process executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Interpreter that runs the generated harness.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Extra arguments placed before the harness path.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Working directory for spawned scripts. Default: the script's directory.
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Parent of the per-run scratch directories. Default: the system temp dir.
    #[serde(default)]
    pub scratch_dir: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            extra_args: Vec::new(),
            working_dir: None,
            scratch_dir: None,
        }
    }
}

fn default_interpreter() -> String { "python3".to_string() }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite snapshot of the variable store. Default: <workspace>/variables.db
    #[serde(default)]
    pub snapshot_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// JSON schedule file. Default: <workspace>/schedule.json
    #[serde(default)]
    pub schedule_file: Option<String>,
    /// Seconds between evaluation passes.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Offset applied to UTC when matching time of day and weekday.
    #[serde(default)]
    pub utc_offset_hours: i32,
    /// Run fired scripts forced, so a finished script runs again.
    #[serde(default)]
    pub force_runs: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            schedule_file: None,
            tick_secs: default_tick_secs(),
            utc_offset_hours: 0,
            force_runs: false,
        }
    }
}

fn default_tick_secs() -> u64 { 60 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| VarflowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| VarflowError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.scheduler.tick_secs == 0 {
            return Err(VarflowError::Config(
                "scheduler.tick_secs must be greater than 0".into(),
            ));
        }
        if !(-23..=23).contains(&self.scheduler.utc_offset_hours) {
            return Err(VarflowError::Config(format!(
                "scheduler.utc_offset_hours out of range: {}",
                self.scheduler.utc_offset_hours
            )));
        }
        if self.executor.interpreter.trim().is_empty() {
            return Err(VarflowError::Config("executor.interpreter is empty".into()));
        }
        Ok(())
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        expand_home(&self.engine.workspace)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        match self.store.snapshot_file {
            Some(ref p) => expand_home(p),
            None => self.workspace_dir().join("variables.db"),
        }
    }

    pub fn schedule_path(&self) -> PathBuf {
        match self.scheduler.schedule_file {
            Some(ref p) => expand_home(p),
            None => self.workspace_dir().join("schedule.json"),
        }
    }

    pub fn script_dirs(&self) -> Vec<PathBuf> {
        self.engine
            .script_dirs
            .iter()
            .map(|d| expand_home(d))
            .collect()
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
