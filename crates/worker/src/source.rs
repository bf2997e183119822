//! Where the worker gets its jobs from

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use runcast_common::Job;

use crate::error::{WorkerError, WorkerResult};

/// Competing-consumer job supply
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Bounded long-poll for the next job; `None` when nothing arrived within `wait`
    async fn claim(&self, worker_id: &str, wait: Duration) -> WorkerResult<Option<Job>>;

    /// Mark the job for `run_id` as done so it is not redelivered
    async fn ack(&self, run_id: &str) -> WorkerResult<()>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClaimBody<'a> {
    worker_id: &'a str,
    wait_ms: u64,
}

/// Job source backed by the server's `/api/jobs` endpoints
#[derive(Clone)]
pub struct HttpJobSource {
    client: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpJobSource {
    pub fn new(client: reqwest::Client, base_url: &str, request_timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            request_timeout,
        }
    }
}

/// Turn a non-success response into [`WorkerError::Server`]
pub(crate) async fn check_status(response: reqwest::Response) -> WorkerResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(WorkerError::Server {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl JobSource for HttpJobSource {
    async fn claim(&self, worker_id: &str, wait: Duration) -> WorkerResult<Option<Job>> {
        let response = self
            .client
            .post(format!("{}/api/jobs/claim", self.base_url))
            .timeout(wait + self.request_timeout)
            .json(&ClaimBody {
                worker_id,
                wait_ms: wait.as_millis() as u64,
            })
            .send()
            .await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let job: Job = check_status(response).await?.json().await?;
        debug!("Claimed run {} (attempt {})", job.run_id, job.attempt);
        Ok(Some(job))
    }

    async fn ack(&self, run_id: &str) -> WorkerResult<()> {
        let response = self
            .client
            .post(format!("{}/api/jobs/{}/ack", self.base_url, run_id))
            .timeout(self.request_timeout)
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}
