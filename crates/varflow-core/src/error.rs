use thiserror::Error;

#[derive(Debug, Error)]
pub enum VarflowError {
    // Extraction errors
    #[error("Cannot read script {path}: {message}")]
    Parse { path: String, message: String },

    // Resolution errors
    #[error("Dependency cycle while resolving {target}: {}", path.join(" -> "))]
    Cycle { target: String, path: Vec<String> },

    #[error("Unsatisfied dependencies for {target}: {}", variables.join(", "))]
    DependencyUnsatisfied {
        target: String,
        variables: Vec<String>,
    },

    #[error("Unknown script: {0}")]
    UnknownScript(String),

    // Execution errors
    #[error("Script execution failed: {script}: {message}")]
    ScriptExecution { script: String, message: String },

    // Storage errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    // Schedule errors
    #[error("Invalid schedule entry: {0}")]
    ScheduleConfig(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VarflowError {
    /// Short machine-friendly kind, used in events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "parse",
            Self::Cycle { .. } => "cycle",
            Self::DependencyUnsatisfied { .. } => "dependency_unsatisfied",
            Self::UnknownScript(_) => "unknown_script",
            Self::ScriptExecution { .. } => "script_execution",
            Self::Persistence(_) => "persistence",
            Self::ScheduleConfig(_) => "schedule_config",
            Self::Config(_) | Self::ConfigNotFound(_) => "config",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}

pub type Result<T> = std::result::Result<T, VarflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let err = VarflowError::Cycle {
            target: "a.py".into(),
            path: vec!["a.py".into(), "b.py".into(), "a.py".into()],
        };
        assert_eq!(
            err.to_string(),
            "Dependency cycle while resolving a.py: a.py -> b.py -> a.py"
        );
        assert_eq!(err.kind(), "cycle");
    }

    #[test]
    fn test_unsatisfied_message() {
        let err = VarflowError::DependencyUnsatisfied {
            target: "c.py".into(),
            variables: vec!["z".into(), "w".into()],
        };
        assert!(err.to_string().ends_with("z, w"));
    }
}
