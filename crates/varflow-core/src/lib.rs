pub mod config;
pub mod error;
pub mod event;
pub mod markers;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, VarflowError};
pub use event::EventBus;
pub use types::*;
