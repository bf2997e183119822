//! Browser automation engines
//!
//! The worker only cares about step outcomes; how an action is carried out is
//! up to the [`Engine`]. One engine instance serves one run at a time:
//! `start` → `execute`* → `finish`, and `shutdown` when the worker exits.

mod playwright;

pub use playwright::{DriverReply, PlaywrightEngine};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use runcast_common::{now_millis, Job, RunEvent, StepDefinition, StepError, StepStatus};

use crate::emitter::Emitter;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Driver not found: {0}. Install Node.js and run: npx playwright install")]
    DriverNotFound(String),

    #[error("Engine has no active run")]
    NotStarted,

    #[error("Step timed out after {0:?}")]
    Timeout(Duration),

    #[error("{message}")]
    Script {
        message: String,
        stack: Option<String>,
    },

    #[error("Driver exited: {0}")]
    DriverExited(String),

    #[error("Driver protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Error details recorded on the failed step
    pub fn to_step_error(&self) -> StepError {
        let stack = match self {
            EngineError::Script { stack, .. } => stack.clone(),
            _ => None,
        };
        StepError {
            message: self.to_string(),
            stack,
        }
    }
}

/// How a step that ran to completion turned out
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub error: Option<StepError>,
}

impl StepOutcome {
    pub fn passed() -> Self {
        Self {
            status: StepStatus::Passed,
            error: None,
        }
    }

    /// An expectation did not hold
    pub fn failed(message: impl Into<String>, stack: Option<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            error: Some(StepError {
                message: message.into(),
                stack,
            }),
        }
    }
}

/// Recorded video and trace of a run, as public URLs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Artifacts {
    pub video: Option<String>,
    pub trace: Option<String>,
}

/// Lets an engine report screenshots while a step is still running
#[derive(Clone)]
pub struct FrameSink {
    emitter: Emitter,
    run_id: String,
    step_id: String,
}

impl FrameSink {
    pub fn new(emitter: Emitter, run_id: &str, step_id: &str) -> Self {
        Self {
            emitter,
            run_id: run_id.to_string(),
            step_id: step_id.to_string(),
        }
    }

    pub fn frame(&self, url: impl Into<String>) {
        self.emitter.emit(RunEvent::Frame {
            run_id: self.run_id.clone(),
            step_id: self.step_id.clone(),
            url: url.into(),
            ts: now_millis(),
        });
    }
}

#[async_trait]
pub trait Engine: Send {
    /// Prepare a browser for `job`
    async fn start(&mut self, job: &Job) -> Result<(), EngineError>;

    /// Run one step. `Err` means the engine itself broke, not that the page
    /// failed an expectation.
    async fn execute(
        &mut self,
        step: &StepDefinition,
        frames: &FrameSink,
    ) -> Result<StepOutcome, EngineError>;

    /// Close the run's browser and collect its artifacts. Must release the
    /// browser even when it fails.
    async fn finish(&mut self) -> Result<Artifacts, EngineError>;

    /// Release everything; called once when the worker stops
    async fn shutdown(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_error_keeps_stack() {
        let error = EngineError::Script {
            message: "page crashed".into(),
            stack: Some("at run (driver.js:10)".into()),
        };
        let step = error.to_step_error();
        assert_eq!(step.message, "page crashed");
        assert_eq!(step.stack.as_deref(), Some("at run (driver.js:10)"));

        let timeout = EngineError::Timeout(Duration::from_secs(5)).to_step_error();
        assert!(timeout.message.contains("timed out"));
        assert_eq!(timeout.stack, None);
    }
}
