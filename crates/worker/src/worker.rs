//! Runner loop
//!
//! Claims one job at a time and drives the engine through its steps:
//! `StepStart` → engine → `StepEnd` per step, `Frame`s in between, exactly one
//! `RunFinished` at the end. Once a step fails or errors the remaining steps
//! are reported SKIPPED without running.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use runcast_common::{now_millis, Job, RunEvent, RunStatus, StepError, StepStatus};

use crate::emitter::Emitter;
use crate::engine::{Artifacts, Engine, FrameSink};
use crate::source::JobSource;
use crate::stats::WorkerStats;

/// Reason recorded on steps skipped because the worker is stopping
pub const SHUTDOWN_MESSAGE: &str = "worker shutting down";

pub struct Worker<S, E> {
    id: String,
    source: S,
    engine: E,
    emitter: Emitter,
    stats: Arc<WorkerStats>,
    claim_wait: Duration,
    idle_backoff: Duration,
}

impl<S: JobSource, E: Engine> Worker<S, E> {
    pub fn new(id: impl Into<String>, source: S, engine: E, emitter: Emitter) -> Self {
        Self {
            id: id.into(),
            source,
            engine,
            emitter,
            stats: WorkerStats::new(),
            claim_wait: Duration::from_secs(20),
            idle_backoff: Duration::from_secs(2),
        }
    }

    pub fn with_claim_wait(mut self, wait: Duration) -> Self {
        self.claim_wait = wait;
        self
    }

    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Claim and execute jobs until `shutdown` fires, then release the engine
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Worker {} started", self.id);

        loop {
            let claimed = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                claimed = self.source.claim(&self.id, self.claim_wait) => claimed,
            };

            match claimed {
                Ok(Some(job)) => self.process(job, &shutdown).await,
                Ok(None) => debug!("No job available"),
                Err(e) => {
                    warn!("Failed to claim a job: {}", e);
                    self.stats.record_claim_error();
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.idle_backoff) => {}
                    }
                }
            }
        }

        self.engine.shutdown().await;
        if let Err(e) = self.emitter.flush().await {
            warn!("Failed to flush events on shutdown: {}", e);
        }
        info!("Worker {} stopped", self.id);
    }

    /// Execute one job, deliver its events, then ack it
    pub async fn process(&mut self, job: Job, shutdown: &CancellationToken) {
        let status = self.execute_job(&job, shutdown).await;
        self.stats.record_run(status);

        // Ack only after the events are out so a crash in between means redelivery
        if let Err(e) = self.emitter.flush().await {
            error!("Events for run {} could not be flushed: {}", job.run_id, e);
            return;
        }
        if let Err(e) = self.source.ack(&job.run_id).await {
            warn!("Failed to ack run {}: {}", job.run_id, e);
        }
    }

    /// Run every step of `job` and emit the run's events; returns the final status
    pub async fn execute_job(&mut self, job: &Job, shutdown: &CancellationToken) -> RunStatus {
        info!(
            "Starting run {} of scenario {} (attempt {})",
            job.run_id, job.scenario_id, job.attempt
        );

        let mut statuses = Vec::with_capacity(job.steps.len());
        let mut halted = false;
        let mut interrupted = false;

        let mut start_error = match self.engine.start(job).await {
            Ok(()) => None,
            Err(e) => {
                error!("Engine failed to start run {}: {}", job.run_id, e);
                Some(e.to_step_error())
            }
        };

        for (index, step) in job.steps.iter().enumerate() {
            if !halted && shutdown.is_cancelled() {
                info!("Shutdown requested, skipping the rest of run {}", job.run_id);
                interrupted = true;
                halted = true;
            }
            if halted {
                let reason = interrupted.then(|| StepError {
                    message: SHUTDOWN_MESSAGE.to_string(),
                    stack: None,
                });
                self.emit_step_end(job, index, StepStatus::Skipped, reason);
                self.stats.record_step(StepStatus::Skipped);
                statuses.push(StepStatus::Skipped);
                continue;
            }

            self.emitter.emit(RunEvent::StepStart {
                run_id: job.run_id.clone(),
                step_id: step.id.clone(),
                index: Some(index),
                name: Some(step.name.clone()),
                ts: now_millis(),
            });

            let (status, error) = match start_error.take() {
                // A browser that never came up fails the first step
                Some(error) => (StepStatus::Error, Some(error)),
                None => {
                    let frames = FrameSink::new(self.emitter.clone(), &job.run_id, &step.id);
                    match self.engine.execute(step, &frames).await {
                        Ok(outcome) => (outcome.status, outcome.error),
                        Err(e) => {
                            warn!("Step {} of run {} raised: {}", step.id, job.run_id, e);
                            (StepStatus::Error, Some(e.to_step_error()))
                        }
                    }
                }
            };

            debug!("Step {} of run {} ended {}", step.id, job.run_id, status);
            self.emit_step_end(job, index, status, error);
            self.stats.record_step(status);
            statuses.push(status);
            if matches!(status, StepStatus::Failed | StepStatus::Error) {
                halted = true;
            }
        }

        let artifacts = match self.engine.finish().await {
            Ok(artifacts) => artifacts,
            Err(e) => {
                warn!("Failed to collect artifacts of run {}: {}", job.run_id, e);
                Artifacts::default()
            }
        };

        let status = if interrupted {
            RunStatus::Error
        } else {
            RunStatus::aggregate(statuses)
        };
        self.emitter.emit(RunEvent::RunFinished {
            run_id: job.run_id.clone(),
            status,
            video: artifacts.video,
            trace: artifacts.trace,
            ts: now_millis(),
        });
        info!("Run {} finished {}", job.run_id, status);
        status
    }

    fn emit_step_end(&self, job: &Job, index: usize, status: StepStatus, error: Option<StepError>) {
        self.emitter.emit(RunEvent::StepEnd {
            run_id: job.run_id.clone(),
            step_id: job.steps[index].id.clone(),
            status,
            index: Some(index),
            error,
            ts: now_millis(),
        });
    }
}
