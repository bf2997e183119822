//! Worker configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{WorkerError, WorkerResult};

/// Worker configuration, read from a TOML file; every field has a default
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Runcast server connection
    pub server: ServerConfig,

    /// Browser automation engine
    pub engine: EngineConfig,

    /// Loop and emitter tuning
    pub runtime: RuntimeConfig,
}

/// Where jobs come from and events go to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL of the Runcast server
    pub url: String,

    /// Worker id reported on claims; `<hostname>-<pid>` when unset
    pub worker_id: Option<String>,

    /// Long-poll wait per claim request
    pub claim_wait_ms: u64,

    /// HTTP request timeout on top of the claim wait
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080".to_string(),
            worker_id: None,
            claim_wait_ms: 20_000,
            request_timeout_secs: 30,
        }
    }
}

/// Playwright engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// `node` binary used to run the driver script
    pub node_binary: String,

    /// Extra module search path for the driver, e.g. a global node_modules
    pub node_path: Option<PathBuf>,

    /// chromium, firefox or webkit
    pub browser: String,

    pub headless: bool,

    pub viewport_width: u32,
    pub viewport_height: u32,

    /// Per-step timeout; the driver is killed when a step overruns it
    pub step_timeout_secs: u64,

    /// Time allowed for the browser to launch and for artifacts to be written
    pub launch_timeout_secs: u64,

    /// Screenshots, videos and traces land under `<artifacts_dir>/<runId>/`
    pub artifacts_dir: Option<PathBuf>,

    /// Public prefix for artifact URLs: `<artifact_base_url>/<runId>/<file>`
    pub artifact_base_url: String,

    /// Capture a screenshot after every step
    pub screenshot_every_step: bool,

    pub record_video: bool,
    pub record_trace: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_binary: "node".to_string(),
            node_path: None,
            browser: "chromium".to_string(),
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
            step_timeout_secs: 60,
            launch_timeout_secs: 30,
            artifacts_dir: None,
            artifact_base_url: "http://127.0.0.1:8080/artifacts".to_string(),
            screenshot_every_step: true,
            record_video: true,
            record_trace: true,
        }
    }
}

impl EngineConfig {
    pub fn artifacts_dir(&self) -> PathBuf {
        self.artifacts_dir
            .clone()
            .unwrap_or_else(runcast_common::default_artifacts_path)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs.max(1))
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs.max(1))
    }

    /// Public URL of a file the driver wrote for `run_id`
    pub fn artifact_url(&self, run_id: &str, file: &str) -> String {
        format!(
            "{}/{}/{}",
            self.artifact_base_url.trim_end_matches('/'),
            run_id,
            file
        )
    }
}

/// Loop and emitter tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Interval of the stats log line
    pub stats_interval_secs: u64,

    /// Pause after a failed claim request
    pub idle_backoff_ms: u64,

    /// Largest event batch posted at once
    pub emit_batch_max: usize,

    /// Delivery attempts per batch before it is dropped
    pub emit_attempts: u32,

    pub emit_retry_base_ms: u64,
    pub emit_retry_cap_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stats_interval_secs: 60,
            idle_backoff_ms: 2_000,
            emit_batch_max: 64,
            emit_attempts: 8,
            emit_retry_base_ms: 100,
            emit_retry_cap_ms: 5_000,
        }
    }
}

impl RuntimeConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }
}

impl WorkerConfig {
    /// Load configuration from file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> WorkerResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> WorkerResult<Self> {
        toml::from_str(content).map_err(|e| WorkerError::Config(e.to_string()))
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> WorkerResult<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| WorkerError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn worker_id(&self) -> String {
        self.server.worker_id.clone().unwrap_or_else(default_worker_id)
    }

    pub fn claim_wait(&self) -> Duration {
        Duration::from_millis(self.server.claim_wait_ms)
    }

    pub fn validate(&self) -> WorkerResult<()> {
        if !self.server.url.starts_with("http://") && !self.server.url.starts_with("https://") {
            return Err(WorkerError::Config(format!(
                "server.url must be an http(s) URL, got {}",
                self.server.url
            )));
        }
        if !matches!(self.engine.browser.as_str(), "chromium" | "firefox" | "webkit") {
            return Err(WorkerError::Config(format!(
                "engine.browser must be chromium, firefox or webkit, got {}",
                self.engine.browser
            )));
        }
        if self.runtime.emit_batch_max == 0 || self.runtime.emit_attempts == 0 {
            return Err(WorkerError::Config(
                "runtime.emit_batch_max and runtime.emit_attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Default config file location
pub fn default_config_path() -> PathBuf {
    runcast_common::default_store_path().join("worker.toml")
}

fn default_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "worker".to_string());
    format!("{}-{}", host, std::process::id())
}
