//! Runcast server HTTP client

use anyhow::{anyhow, bail, Context, Result};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use runcast_common::{now_millis, Run, Scenario, ViewerSession};

/// `GET /api/health` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Result of a submission
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submitted {
    pub run_id: String,
    pub run: Run,
    /// False when the run id already existed and the call was a no-op
    #[serde(default)]
    pub created: bool,
}

/// Client for the Runcast server API
#[derive(Clone)]
pub struct ServerClient {
    http: reqwest::Client,
    base_url: String,
}

impl ServerClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("runcast-cli/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn health(&self) -> Result<Health> {
        let response = self.http.get(self.url("/api/health")).send().await?;
        decode(response).await
    }

    /// Server counters, passed through as JSON
    pub async fn stats(&self) -> Result<serde_json::Value> {
        let response = self.http.get(self.url("/api/stats")).send().await?;
        decode(response).await
    }

    // Scenario operations

    /// Create or replace a scenario under its id
    pub async fn put_scenario(&self, scenario: &Scenario) -> Result<Scenario> {
        let response = self
            .http
            .put(self.url(&format!("/api/scenarios/{}", scenario.id)))
            .json(scenario)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn get_scenario(&self, id: &str) -> Result<Scenario> {
        let response = self
            .http
            .get(self.url(&format!("/api/scenarios/{}", id)))
            .send()
            .await?;
        decode(response).await
    }

    // Run operations

    /// Submit a run of `scenario_id`; a given `run_id` makes the call idempotent
    pub async fn submit_run(&self, scenario_id: &str, run_id: Option<&str>) -> Result<Submitted> {
        let mut body = serde_json::json!({ "scenarioId": scenario_id });
        if let Some(run_id) = run_id {
            body["runId"] = serde_json::Value::from(run_id);
        }
        let response = self
            .http
            .post(self.url("/api/runs"))
            .json(&body)
            .send()
            .await?;
        let created = response.status() == StatusCode::CREATED;
        let mut submitted: Submitted = decode(response).await?;
        submitted.created = created;
        Ok(submitted)
    }

    pub async fn get_run(&self, id: &str) -> Result<Run> {
        let response = self
            .http
            .get(self.url(&format!("/api/runs/{}", id)))
            .send()
            .await?;
        decode(response).await
    }

    /// Most recent runs first
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        let response = self
            .http
            .get(self.url("/api/runs"))
            .query(&[("limit", limit)])
            .send()
            .await?;
        decode(response).await
    }

    /// Poll the run snapshot until it is terminal or `timeout` passes.
    ///
    /// Snapshots are merged through a [`ViewerSession`], so a stale response
    /// never moves the view backwards. `on_update` sees every view that changed.
    pub async fn watch_run<F>(
        &self,
        id: &str,
        interval: Duration,
        timeout: Option<Duration>,
        mut on_update: F,
    ) -> Result<Run>
    where
        F: FnMut(&Run),
    {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let mut session = ViewerSession::new(id);

        loop {
            let snapshot = self.get_run(id).await?;
            if session.bootstrap(snapshot).is_changed() {
                if let Some(view) = session.view(now_millis()) {
                    on_update(&view);
                }
            }

            if session.reducer().is_terminal() {
                return session
                    .view(now_millis())
                    .ok_or_else(|| anyhow!("run {} has no state", id));
            }
            if deadline.map_or(false, |d| tokio::time::Instant::now() >= d) {
                bail!("timed out waiting for run {} to finish", id);
            }
            tokio::time::sleep(interval).await;
        }
    }
}

/// Decode a JSON body, turning error statuses into the server's message
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or(body);
        bail!("server returned {}: {}", status, message);
    }
    response
        .json()
        .await
        .with_context(|| format!("invalid response body ({})", status))
}
