pub mod harness;
pub mod process;

pub use process::ProcessExecutor;
