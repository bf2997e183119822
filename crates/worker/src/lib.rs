//! Runcast worker
//!
//! Claims scenario runs from the server, executes them step by step in a
//! browser and streams the resulting run events back.

pub mod config;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod source;
pub mod stats;
pub mod worker;

pub use config::{EngineConfig, RuntimeConfig, ServerConfig, WorkerConfig};
pub use emitter::{Emitter, EmitterConfig, EventTransport, HttpTransport};
pub use engine::{Artifacts, Engine, EngineError, FrameSink, PlaywrightEngine, StepOutcome};
pub use error::{WorkerError, WorkerResult};
pub use source::{HttpJobSource, JobSource};
pub use stats::{StatsSnapshot, WorkerStats};
pub use worker::Worker;
