//! Runcast Common Library
//!
//! Shared types, persistence, the event wire format and the run reducer used by
//! the Runcast server, worker and CLI.

pub mod catalog;
pub mod db;
pub mod error;
pub mod event;
pub mod queue;
pub mod reducer;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use catalog::ScenarioCatalog;
pub use db::Database;
pub use error::{Error, Result};
pub use event::{RunEvent, StreamMessage};
pub use queue::{JobQueue, QueueDepth};
pub use reducer::{Applied, RunReducer, ViewerSession};
pub use store::{MemoryRunStore, RunStore, SqliteRunStore};
pub use types::*;

/// Runcast version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".runcast")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("state.db")
}

/// Default directory for screenshots and recordings
pub fn default_artifacts_path() -> std::path::PathBuf {
    default_store_path().join("artifacts")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
