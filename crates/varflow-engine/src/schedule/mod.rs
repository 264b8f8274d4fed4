//! Persisted schedule entries and the tick loop that fires them.

pub mod book;
pub mod scheduler;

pub use book::ScheduleBook;
pub use scheduler::{due_reason, Scheduler};
