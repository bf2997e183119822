//! Server configuration

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command line and environment configuration of `runcast-web`
#[derive(Parser, Debug, Clone)]
#[command(name = "runcast-web")]
#[command(about = "Runcast server - run snapshots, live event streams and job dispatch")]
#[command(version)]
pub struct WebConfig {
    /// Listen address
    #[arg(long, env = "RUNCAST_WEB_ADDR", default_value = "127.0.0.1:8080")]
    pub addr: SocketAddr,

    /// SQLite database path (defaults to ~/.runcast/state.db)
    #[arg(long, env = "RUNCAST_WEB_DB")]
    pub db: Option<PathBuf>,

    /// Directory served under /artifacts (defaults to ~/.runcast/artifacts)
    #[arg(long, env = "RUNCAST_WEB_ARTIFACTS")]
    pub artifacts: Option<PathBuf>,

    /// Messages buffered per viewer before the oldest is dropped
    #[arg(long, env = "RUNCAST_WEB_SINK_CAPACITY", default_value_t = 256)]
    pub sink_capacity: usize,

    /// WebSocket ping interval in seconds
    #[arg(long, env = "RUNCAST_WEB_KEEPALIVE_SECS", default_value_t = 15)]
    pub keepalive_secs: u64,

    /// Close a viewer connection after this many silent seconds
    #[arg(long, env = "RUNCAST_WEB_IDLE_TIMEOUT_SECS", default_value_t = 60)]
    pub idle_timeout_secs: u64,

    /// Delay before the all-steps-terminal guard finalizes a run (0 = immediately)
    #[arg(long, env = "RUNCAST_WEB_FINALIZE_GRACE_MS", default_value_t = 2000)]
    pub finalize_grace_ms: u64,

    /// Store write attempts for a finalized run before it is parked
    #[arg(long, env = "RUNCAST_WEB_FINALIZE_ATTEMPTS", default_value_t = 5)]
    pub finalize_attempts: u32,

    /// Retry interval for parked finalized runs, in seconds
    #[arg(long, env = "RUNCAST_WEB_FLUSH_INTERVAL_SECS", default_value_t = 10)]
    pub flush_interval_secs: u64,

    /// Job lease in seconds; unacked jobs are redelivered after it expires
    #[arg(long, env = "RUNCAST_WEB_JOB_LEASE_SECS", default_value_t = 600)]
    pub job_lease_secs: u64,

    /// Longest a worker's claim request may wait, in milliseconds
    #[arg(long, env = "RUNCAST_WEB_CLAIM_WAIT_MAX_MS", default_value_t = 60_000)]
    pub claim_wait_max_ms: u64,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Log as JSON lines
    #[arg(long, env = "RUNCAST_LOG_JSON")]
    pub log_json: bool,
}

/// Default claim wait when the worker does not ask for one
pub const DEFAULT_CLAIM_WAIT: Duration = Duration::from_secs(20);

impl WebConfig {
    pub fn db_path(&self) -> PathBuf {
        self.db.clone().unwrap_or_else(runcast_common::default_db_path)
    }

    pub fn artifacts_path(&self) -> PathBuf {
        self.artifacts
            .clone()
            .unwrap_or_else(runcast_common::default_artifacts_path)
    }

    pub fn stream(&self) -> StreamConfig {
        StreamConfig {
            sink_capacity: self.sink_capacity,
            finalize_grace: Duration::from_millis(self.finalize_grace_ms),
            finalize_attempts: self.finalize_attempts.max(1),
            flush_interval: Duration::from_secs(self.flush_interval_secs.max(1)),
            ..StreamConfig::default()
        }
    }

    pub fn socket(&self) -> SocketConfig {
        SocketConfig {
            keepalive: Duration::from_secs(self.keepalive_secs.max(1)),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs.max(1)),
        }
    }

    pub fn job_lease(&self) -> Duration {
        Duration::from_secs(self.job_lease_secs)
    }

    pub fn claim_wait_max(&self) -> Duration {
        Duration::from_millis(self.claim_wait_max_ms)
    }
}

/// Stream manager tuning
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub sink_capacity: usize,
    pub finalize_grace: Duration,
    pub finalize_attempts: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub flush_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sink_capacity: 256,
            finalize_grace: Duration::from_secs(2),
            finalize_attempts: 5,
            retry_base: Duration::from_millis(100),
            retry_cap: Duration::from_secs(5),
            flush_interval: Duration::from_secs(10),
        }
    }
}

/// Viewer connection timing
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub keepalive: Duration,
    pub idle_timeout: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            keepalive: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_command_line() {
        let config = WebConfig::try_parse_from(["runcast-web"]).unwrap();
        assert_eq!(config.sink_capacity, 256);
        assert_eq!(config.stream().finalize_grace, Duration::from_secs(2));
        assert_eq!(config.socket().keepalive, Duration::from_secs(15));
        assert_eq!(config.job_lease(), Duration::from_secs(600));
    }

    #[test]
    fn test_zero_grace_is_kept() {
        let config =
            WebConfig::try_parse_from(["runcast-web", "--finalize-grace-ms", "0"]).unwrap();
        assert_eq!(config.stream().finalize_grace, Duration::ZERO);
    }
}
