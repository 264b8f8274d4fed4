//! Directory scanning and registry construction.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use varflow_core::error::{Result, VarflowError};
use varflow_core::traits::{RawScript, ScriptSource};
use varflow_core::types::Registry;

use crate::extractor::extract_bytes;

/// Registry built from a source, plus the scripts that had to be skipped.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub registry: Registry,
    pub failures: Vec<VarflowError>,
}

/// Walks directories recursively for files with the configured extensions.
pub struct DirectorySource {
    dirs: Vec<PathBuf>,
    extensions: Vec<String>,
}

impl DirectorySource {
    pub fn new(dirs: Vec<PathBuf>, extensions: Vec<String>) -> Self {
        let extensions = extensions
            .into_iter()
            .map(|e| e.trim_start_matches('.').to_string())
            .collect();
        Self { dirs, extensions }
    }

    fn matches(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| self.extensions.iter().any(|x| x == e))
    }
}

impl ScriptSource for DirectorySource {
    fn fetch(&self) -> Vec<Result<RawScript>> {
        let mut found = Vec::new();
        for dir in &self.dirs {
            if !dir.is_dir() {
                warn!(dir = %dir.display(), "Script directory not found, skipping");
                continue;
            }
            for entry in WalkDir::new(dir).sort_by_file_name() {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        let path = e
                            .path()
                            .map(|p| p.display().to_string())
                            .unwrap_or_else(|| dir.display().to_string());
                        found.push(Err(VarflowError::Parse {
                            path,
                            message: e.to_string(),
                        }));
                        continue;
                    }
                };
                if !entry.file_type().is_file() || !self.matches(entry.path()) {
                    continue;
                }
                let path = std::fs::canonicalize(entry.path())
                    .unwrap_or_else(|_| entry.path().to_path_buf());
                let path_str = path.display().to_string();
                found.push(
                    std::fs::read(&path)
                        .map(|bytes| RawScript {
                            path: path_str.clone(),
                            bytes,
                        })
                        .map_err(|e| VarflowError::Parse {
                            path: path_str,
                            message: e.to_string(),
                        }),
                );
            }
        }
        found
    }
}

/// Extract every script from `source`. Bad scripts are reported, not fatal.
pub fn build_registry(source: &dyn ScriptSource) -> ScanReport {
    let mut report = ScanReport::default();
    for raw in source.fetch() {
        match raw.and_then(|r| extract_bytes(&r.bytes, &r.path)) {
            Ok(descriptor) => {
                debug!(
                    script = %descriptor.path,
                    produces = ?descriptor.produces,
                    requires = ?descriptor.requires,
                    "Script extracted"
                );
                report.registry.insert(descriptor.path.clone(), descriptor);
            }
            Err(e) => {
                warn!(error = %e, "Skipping unreadable script");
                report.failures.push(e);
            }
        }
    }
    report
}

/// Scan `dirs` for scripts with one of `extensions`.
pub fn scan_dirs(dirs: Vec<PathBuf>, extensions: Vec<String>) -> ScanReport {
    build_registry(&DirectorySource::new(dirs, extensions))
}
