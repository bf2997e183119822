//! Runcast worker daemon
//!
//! Claims runs from the Runcast server and executes them with Playwright.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use runcast_worker::config::default_config_path;
use runcast_worker::stats::run_reporter;
use runcast_worker::{
    Emitter, EmitterConfig, HttpJobSource, HttpTransport, PlaywrightEngine, Worker, WorkerConfig,
};

#[derive(Parser)]
#[command(name = "runcastd")]
#[command(about = "Runcast worker - executes browser scenario runs")]
#[command(version)]
struct Cli {
    /// Configuration file path (defaults to ~/.runcast/worker.toml)
    #[arg(short, long, env = "RUNCAST_WORKER_CONFIG")]
    config: Option<PathBuf>,

    /// Runcast server URL
    #[arg(short, long, env = "RUNCAST_SERVER")]
    server: Option<String>,

    /// Worker id reported to the server
    #[arg(long, env = "RUNCAST_WORKER_ID")]
    worker_id: Option<String>,

    /// Directory for screenshots, videos and traces
    #[arg(long, env = "RUNCAST_ARTIFACTS_DIR")]
    artifacts_dir: Option<PathBuf>,

    /// Public URL prefix of the artifacts directory
    #[arg(long, env = "RUNCAST_ARTIFACT_BASE_URL")]
    artifact_base_url: Option<String>,

    /// Show the browser window
    #[arg(long)]
    headed: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log as JSON lines
    #[arg(long, env = "RUNCAST_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn apply(&self, config: &mut WorkerConfig) {
        if let Some(server) = &self.server {
            config.server.url = server.clone();
        }
        if let Some(id) = &self.worker_id {
            config.server.worker_id = Some(id.clone());
        }
        if let Some(dir) = &self.artifacts_dir {
            config.engine.artifacts_dir = Some(dir.clone());
        }
        if let Some(url) = &self.artifact_base_url {
            config.engine.artifact_base_url = url.clone();
        }
        if self.headed {
            config.engine.headless = false;
        }
    }
}

/// First signal cancels `shutdown`; a second one exits immediately
fn install_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if wait_for_signal().await.is_err() {
            return;
        }
        info!("Received shutdown signal, finishing the current step (again to force exit)");
        shutdown.cancel();

        if wait_for_signal().await.is_ok() {
            warn!("Second shutdown signal, exiting now");
            std::process::exit(130);
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let registry = tracing_subscriber::registry().with(filter);
    if cli.log_json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }

    info!("Runcast worker v{}", env!("CARGO_PKG_VERSION"));

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = WorkerConfig::load(&config_path)?;
    cli.apply(&mut config);
    config.validate()?;

    let worker_id = config.worker_id();
    info!(
        "Worker {} using server {} (config {})",
        worker_id,
        config.server.url,
        config_path.display()
    );

    let client = reqwest::Client::builder()
        .user_agent(concat!("runcastd/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let request_timeout = Duration::from_secs(config.server.request_timeout_secs);
    let source = HttpJobSource::new(client.clone(), &config.server.url, request_timeout);
    let transport = HttpTransport::new(client, &config.server.url, request_timeout);
    let (emitter, forwarder) = Emitter::spawn(transport, EmitterConfig::from(&config.runtime));

    let engine = PlaywrightEngine::new(config.engine.clone());
    let worker = Worker::new(worker_id, source, engine, emitter)
        .with_claim_wait(config.claim_wait())
        .with_idle_backoff(config.runtime.idle_backoff());

    let shutdown = CancellationToken::new();
    install_signal_handler(shutdown.clone());
    let reporter = tokio::spawn(run_reporter(
        worker.stats(),
        config.runtime.stats_interval(),
        shutdown.clone(),
    ));

    worker.run(shutdown.clone()).await;

    shutdown.cancel();
    reporter.await?;
    forwarder.await?;
    info!("Worker shutdown complete");
    Ok(())
}
