//! Liveness and throughput counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

use runcast_common::{RunStatus, StepStatus};

#[derive(Debug)]
pub struct WorkerStats {
    started: Instant,
    jobs_completed: AtomicU64,
    runs_passed: AtomicU64,
    runs_failed: AtomicU64,
    runs_errored: AtomicU64,
    steps_passed: AtomicU64,
    steps_failed: AtomicU64,
    steps_skipped: AtomicU64,
    steps_errored: AtomicU64,
    claim_errors: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub jobs_completed: u64,
    pub runs_passed: u64,
    pub runs_failed: u64,
    pub runs_errored: u64,
    pub steps_executed: u64,
    pub steps_passed: u64,
    pub steps_failed: u64,
    pub steps_skipped: u64,
    pub steps_errored: u64,
    pub claim_errors: u64,
}

impl Default for WorkerStats {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            jobs_completed: AtomicU64::new(0),
            runs_passed: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            runs_errored: AtomicU64::new(0),
            steps_passed: AtomicU64::new(0),
            steps_failed: AtomicU64::new(0),
            steps_skipped: AtomicU64::new(0),
            steps_errored: AtomicU64::new(0),
            claim_errors: AtomicU64::new(0),
        }
    }
}

impl WorkerStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_step(&self, status: StepStatus) {
        let counter = match status {
            StepStatus::Passed => &self.steps_passed,
            StepStatus::Failed => &self.steps_failed,
            StepStatus::Skipped => &self.steps_skipped,
            StepStatus::Error => &self.steps_errored,
            StepStatus::Pending | StepStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run(&self, status: RunStatus) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        let counter = match status {
            RunStatus::Passed => &self.runs_passed,
            RunStatus::Failed => &self.runs_failed,
            _ => &self.runs_errored,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_claim_error(&self) {
        self.claim_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let steps_passed = load(&self.steps_passed);
        let steps_failed = load(&self.steps_failed);
        let steps_errored = load(&self.steps_errored);
        StatsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            jobs_completed: load(&self.jobs_completed),
            runs_passed: load(&self.runs_passed),
            runs_failed: load(&self.runs_failed),
            runs_errored: load(&self.runs_errored),
            steps_executed: steps_passed + steps_failed + steps_errored,
            steps_passed,
            steps_failed,
            steps_skipped: load(&self.steps_skipped),
            steps_errored,
            claim_errors: load(&self.claim_errors),
        }
    }
}

/// Log a stats line every `interval` until `shutdown` fires
pub async fn run_reporter(stats: Arc<WorkerStats>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let s = stats.snapshot();
                info!(
                    uptime_secs = s.uptime_secs,
                    jobs = s.jobs_completed,
                    passed = s.runs_passed,
                    failed = s.runs_failed,
                    errored = s.runs_errored,
                    steps = s.steps_executed,
                    skipped = s.steps_skipped,
                    claim_errors = s.claim_errors,
                    "Worker stats"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts() {
        let stats = WorkerStats::new();
        stats.record_step(StepStatus::Passed);
        stats.record_step(StepStatus::Error);
        stats.record_step(StepStatus::Skipped);
        stats.record_step(StepStatus::Running);
        stats.record_run(RunStatus::Error);

        let s = stats.snapshot();
        assert_eq!(s.steps_executed, 2);
        assert_eq!(s.steps_skipped, 1);
        assert_eq!(s.jobs_completed, 1);
        assert_eq!(s.runs_errored, 1);
    }

    #[tokio::test]
    async fn test_reporter_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let reporter = tokio::spawn(run_reporter(
            WorkerStats::new(),
            Duration::from_millis(5),
            shutdown.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        reporter.await.unwrap();
    }
}
