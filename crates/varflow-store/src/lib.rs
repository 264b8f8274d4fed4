pub mod snapshot;
pub mod variables;

pub use snapshot::{Snapshot, SqliteSnapshot};
pub use variables::VariableStore;
