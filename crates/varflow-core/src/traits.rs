use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{ExecutionOutput, ScriptDescriptor, VariableMap};

/// Script executor — runs one script behind an isolation boundary.
pub trait ScriptExecutor: Send + Sync + 'static {
    /// Run `script` with `inputs` bound before its body starts.
    ///
    /// With `stop_at_first_produce`, the run halts right after the first
    /// produce marker whose variables are bound. Returns the newly bound
    /// produced values plus the captured streams; a non-zero exit or any
    /// stderr output is a `ScriptExecution` error.
    fn execute<'a>(
        &'a self,
        script: &'a ScriptDescriptor,
        inputs: VariableMap,
        stop_at_first_produce: bool,
    ) -> BoxFuture<'a, Result<ExecutionOutput>>;
}

/// A raw script pulled from a source, before extraction.
#[derive(Debug, Clone)]
pub struct RawScript {
    pub path: String,
    pub bytes: Vec<u8>,
}

/// Script source — supplies raw `(path, bytes)` pairs on demand.
pub trait ScriptSource: Send + Sync {
    /// Every script currently available. Unreadable entries are reported
    /// as errors so the caller can skip them and continue.
    fn fetch(&self) -> Vec<Result<RawScript>>;
}

impl ScriptSource for Vec<RawScript> {
    fn fetch(&self) -> Vec<Result<RawScript>> {
        self.iter().cloned().map(Ok).collect()
    }
}
