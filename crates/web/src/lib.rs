//! Runcast Web Server
//!
//! Serves run snapshots, streams live run events to viewers over WebSockets,
//! ingests worker events and dispatches jobs to workers.

pub mod config;
pub mod error;
pub mod server;
pub mod sink;
pub mod stream;
pub mod viewer;

pub use config::{SocketConfig, StreamConfig, WebConfig};
pub use error::{ApiError, ApiResult};
pub use server::WebServer;
pub use sink::{Pushed, Sink, SinkReceiver};
pub use stream::{Published, StreamManager, StreamStats};
