use serde::{Deserialize, Serialize};

/// A producer → consumer edge in the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Path of the script that produces `variable`.
    pub from: String,
    /// Path of the script that requires it.
    pub to: String,
    /// The shared variable this edge is labeled with.
    pub variable: String,
}

impl Edge {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        variable: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            variable: variable.into(),
        }
    }
}

impl std::fmt::Display for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} --{}--> {}", self.from, self.variable, self.to)
    }
}
