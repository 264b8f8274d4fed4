use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Live variable values keyed by name.
pub type VariableMap = BTreeMap<String, VarValue>;

/// One variable's value as it crosses the process boundary.
///
/// Interpreter objects travel pickled and stay opaque to the engine. A pickled
/// value carries a JSON `preview` when the object has a short JSON rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "encoding", rename_all = "snake_case")]
pub enum VarValue {
    Json {
        value: serde_json::Value,
    },
    Pickle {
        /// Base64 of the pickle bytes.
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preview: Option<serde_json::Value>,
    },
}

impl VarValue {
    pub fn json(value: serde_json::Value) -> Self {
        Self::Json { value }
    }

    pub fn pickle(data: impl Into<String>, preview: Option<serde_json::Value>) -> Self {
        Self::Pickle {
            data: data.into(),
            preview,
        }
    }

    /// Tag stored next to the payload.
    pub fn encoding(&self) -> &'static str {
        match self {
            Self::Json { .. } => "json",
            Self::Pickle { .. } => "pickle",
        }
    }

    /// A readable JSON form, if there is one.
    pub fn preview(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json { value } => Some(value),
            Self::Pickle { preview, .. } => preview.as_ref(),
        }
    }
}

impl From<serde_json::Value> for VarValue {
    fn from(value: serde_json::Value) -> Self {
        Self::json(value)
    }
}

impl std::fmt::Display for VarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json { value } => write!(f, "{}", value),
            Self::Pickle {
                preview: Some(preview),
                ..
            } => write!(f, "{}", preview),
            Self::Pickle { data, preview: None } => {
                let padding = data.bytes().rev().take_while(|b| *b == b'=').count();
                write!(f, "<pickled, {} bytes>", (data.len() / 4 * 3).saturating_sub(padding))
            }
        }
    }
}

/// All known scripts keyed by path.
pub type Registry = BTreeMap<String, ScriptDescriptor>;

/// Metadata extracted from one script's source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptDescriptor {
    pub path: String,
    pub name: String,
    pub produces: Vec<String>,
    pub requires: Vec<String>,
    #[serde(default)]
    pub docstring: String,
    #[serde(default)]
    pub source: String,
}

impl ScriptDescriptor {
    /// A descriptor with no declarations. `name` is the file name of `path`.
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let name = Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.clone());
        Self {
            path,
            name,
            produces: Vec::new(),
            requires: Vec::new(),
            docstring: String::new(),
            source: String::new(),
        }
    }

    pub fn produces_var(&self, var: &str) -> bool {
        self.produces.iter().any(|p| p == var)
    }

    pub fn requires_var(&self, var: &str) -> bool {
        self.requires.iter().any(|r| r == var)
    }
}

/// Per-script execution state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptState {
    #[default]
    Idle,
    Running,
    PartialFinished,
    Finished,
    Error,
}

impl ScriptState {
    /// True for the two success states.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Finished | Self::PartialFinished)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::PartialFinished | Self::Error)
    }
}

impl std::fmt::Display for ScriptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::PartialFinished => "partial_finished",
            Self::Finished => "finished",
            Self::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// What came back across the process boundary from one script run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutput {
    /// Newly bound values of declared produced variables.
    pub values: VariableMap,
    pub stdout: String,
    pub stderr: String,
    /// Names from the partial-stop sentinel, if the run halted early.
    pub partial_stop: Option<Vec<String>>,
}

impl ExecutionOutput {
    pub fn is_partial(&self) -> bool {
        self.partial_stop.is_some()
    }
}

/// How often a schedule entry fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    EveryNHours,
}

/// A persisted trigger for one script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub script: String,
    pub frequency: Frequency,
    #[serde(default, with = "hhmm", skip_serializing_if = "Option::is_none")]
    pub time_of_day: Option<NaiveTime>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub days_of_week: Vec<Weekday>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_hours: Option<u32>,
    #[serde(default)]
    pub retry_interval_minutes: u32,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_success: Option<DateTime<Utc>>,
}

impl ScheduleEntry {
    pub fn daily(script: impl Into<String>, at: NaiveTime) -> Self {
        Self::with_frequency(script, Frequency::Daily, Some(at))
    }

    pub fn weekly(script: impl Into<String>, at: NaiveTime, days: Vec<Weekday>) -> Self {
        let mut entry = Self::with_frequency(script, Frequency::Weekly, Some(at));
        entry.days_of_week = days;
        entry
    }

    pub fn every_n_hours(script: impl Into<String>, hours: u32) -> Self {
        let mut entry = Self::with_frequency(script, Frequency::EveryNHours, None);
        entry.interval_hours = Some(hours);
        entry
    }

    pub fn with_retry(mut self, minutes: u32) -> Self {
        self.retry_interval_minutes = minutes;
        self
    }

    fn with_frequency(
        script: impl Into<String>,
        frequency: Frequency,
        time_of_day: Option<NaiveTime>,
    ) -> Self {
        Self {
            script: script.into(),
            frequency,
            time_of_day,
            days_of_week: Vec::new(),
            interval_hours: None,
            retry_interval_minutes: 0,
            last_run: None,
            last_success: None,
        }
    }

    /// Check the fields the frequency depends on.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.script.trim().is_empty() {
            return Err("script path is empty".into());
        }
        match self.frequency {
            Frequency::Daily => {
                if self.time_of_day.is_none() {
                    return Err(format!("{}: daily entry needs time_of_day", self.script));
                }
            }
            Frequency::Weekly => {
                if self.time_of_day.is_none() {
                    return Err(format!("{}: weekly entry needs time_of_day", self.script));
                }
                if self.days_of_week.is_empty() {
                    return Err(format!("{}: weekly entry needs days_of_week", self.script));
                }
            }
            Frequency::EveryNHours => match self.interval_hours {
                Some(h) if h > 0 => {}
                _ => {
                    return Err(format!(
                        "{}: every_n_hours entry needs interval_hours > 0",
                        self.script
                    ))
                }
            },
        }
        Ok(())
    }

    /// The last run did not succeed (no success recorded at or after it).
    pub fn last_run_failed(&self) -> bool {
        match (self.last_run, self.last_success) {
            (Some(_), None) => true,
            (Some(run), Some(success)) => success < run,
            (None, _) => false,
        }
    }
}

/// `HH:MM` (de)serialization for optional times of day.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(t: &Option<NaiveTime>, s: S) -> Result<S::Ok, S::Error> {
        match t {
            Some(t) => s.serialize_str(&t.format(FORMAT).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveTime>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw {
            None => Ok(None),
            Some(s) => NaiveTime::parse_from_str(s.trim(), FORMAT)
                .or_else(|_| NaiveTime::parse_from_str(s.trim(), "%H:%M:%S"))
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Events published to presentation collaborators.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A script moved to a new state. `message` carries the error text for `Error`.
    ScriptStateChanged {
        path: String,
        state: ScriptState,
        message: Option<String>,
    },
    /// Captured streams of a finished process.
    ScriptOutput {
        path: String,
        stdout: String,
        stderr: String,
    },
    /// Values were merged into the variable store.
    VariablesUpdated { producer: String, names: Vec<String> },
    /// The registry and graph were rebuilt from a scan.
    RegistryRebuilt { scripts: usize, edges: usize },
    /// Every state and variable was cleared.
    StateReset,
    /// A schedule entry fired.
    ScheduleFired { script: String, reason: String },
    /// Snapshot or schedule persistence failed; in-memory state is kept.
    PersistenceFailed { message: String },
}
