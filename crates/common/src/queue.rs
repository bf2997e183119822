//! Durable job queue
//!
//! Jobs are appended once per run id and handed to one worker at a time under a
//! lease. A job whose lease expires without an ack is handed out again, so a
//! crashed worker's run is eventually redelivered.

use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::db::Database;
use crate::types::{now_millis, Job};
use crate::Result;

/// Queue counts by job state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDepth {
    pub queued: u64,
    pub claimed: u64,
    pub done: u64,
}

/// SQLite-backed competing-consumers queue
#[derive(Clone)]
pub struct JobQueue {
    db: Database,
    lease: Duration,
    notify: Arc<Notify>,
}

impl JobQueue {
    pub fn new(db: Database, lease: Duration) -> Self {
        Self {
            db,
            lease,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Append a job. Returns false if a job for this run id already exists.
    pub fn enqueue(&self, job: &Job) -> Result<bool> {
        let inserted = {
            let conn = self.db.conn();
            let now = now_millis();
            conn.execute(
                "INSERT OR IGNORE INTO jobs (run_id, scenario_id, payload, state, enqueued_at, updated_at)
                 VALUES (?1, ?2, ?3, 'queued', ?4, ?4)",
                params![job.run_id, job.scenario_id, serde_json::to_string(job)?, now],
            )? > 0
        };

        if inserted {
            debug!("Enqueued job for run {}", job.run_id);
            self.notify.notify_waiters();
        } else {
            debug!("Job for run {} already enqueued", job.run_id);
        }
        Ok(inserted)
    }

    /// Claim the oldest available job without waiting.
    ///
    /// Available means queued, or claimed by someone whose lease has expired.
    pub fn try_claim(&self, worker_id: &str) -> Result<Option<Job>> {
        let conn = self.db.conn();
        let now = now_millis();
        let lease_until = now + self.lease.as_millis() as i64;

        let claimed: Option<(String, u32)> = conn
            .query_row(
                "UPDATE jobs
                 SET state = 'claimed', worker_id = ?1, lease_until = ?2,
                     attempts = attempts + 1, updated_at = ?3
                 WHERE seq = (
                     SELECT seq FROM jobs
                     WHERE state = 'queued' OR (state = 'claimed' AND lease_until < ?3)
                     ORDER BY seq LIMIT 1
                 )
                 RETURNING payload, attempts",
                params![worker_id, lease_until, now],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match claimed {
            Some((payload, attempts)) => {
                let mut job: Job = serde_json::from_str(&payload)?;
                job.attempt = attempts;
                if attempts > 1 {
                    info!("Redelivering run {} to {} (attempt {})", job.run_id, worker_id, attempts);
                } else {
                    debug!("Run {} claimed by {}", job.run_id, worker_id);
                }
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Bounded long-poll: claim a job, waiting up to `wait` for one to arrive.
    pub async fn dequeue(&self, worker_id: &str, wait: Duration) -> Result<Option<Job>> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            // Register interest before checking so an enqueue in between is not missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.try_claim(worker_id)? {
                return Ok(Some(job));
            }

            // Expired leases are not announced, so wake up periodically as well
            let tick = Duration::from_millis(500);
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let sleep_until = std::cmp::min(deadline, now + tick);

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(sleep_until) => {}
            }
        }
    }

    /// Mark a job completed. Returns false for unknown run ids.
    pub fn ack(&self, run_id: &str) -> Result<bool> {
        let conn = self.db.conn();
        let rows = conn.execute(
            "UPDATE jobs SET state = 'done', lease_until = NULL, updated_at = ?1 WHERE run_id = ?2",
            params![now_millis(), run_id],
        )?;
        Ok(rows > 0)
    }

    /// Worker currently holding an unexpired lease on the run's job, if any
    pub fn lease_holder(&self, run_id: &str) -> Result<Option<String>> {
        let conn = self.db.conn();
        let holder = conn
            .query_row(
                "SELECT worker_id FROM jobs
                 WHERE run_id = ?1 AND state = 'claimed' AND lease_until >= ?2",
                params![run_id, now_millis()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(holder)
    }

    pub fn depth(&self) -> Result<QueueDepth> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut depth = QueueDepth::default();
        for row in rows {
            let (state, count) = row?;
            match state.as_str() {
                "queued" => depth.queued = count as u64,
                "claimed" => depth.claimed = count as u64,
                "done" => depth.done = count as u64,
                _ => {}
            }
        }
        Ok(depth)
    }
}
