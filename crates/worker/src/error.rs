//! Error types for the worker

use thiserror::Error;

use crate::engine::EngineError;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Event emitter stopped")]
    EmitterClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type WorkerResult<T> = Result<T, WorkerError>;

impl WorkerError {
    /// Whether repeating the same request may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Http(_) => true,
            WorkerError::Server { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }
}
