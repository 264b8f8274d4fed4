pub mod extractor;
pub mod graph;
pub mod legacy;
pub mod orchestrator;
pub mod scanner;
pub mod schedule;

pub use extractor::{extract, extract_bytes};
pub use graph::{DependencyGraph, Edge};
pub use legacy::convert_legacy;
pub use orchestrator::Orchestrator;
pub use scanner::{scan_dirs, DirectorySource, ScanReport};
pub use schedule::{ScheduleBook, Scheduler};
