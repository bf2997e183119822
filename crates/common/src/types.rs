//! Core types for Runcast
//!
//! These are the persisted shapes: a [`Run`] with its [`StepResult`]s is stored
//! as one JSON document keyed by run id, using camelCase field names.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Current time in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Statuses
// ============================================================================

/// Run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Passed,
    Failed,
    Error,
}

impl RunStatus {
    /// Terminal states are absorbing.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Passed | RunStatus::Failed | RunStatus::Error)
    }

    /// Aggregate per-step outcomes into a run outcome: ERROR > FAILED > PASSED.
    pub fn aggregate<I>(steps: I) -> RunStatus
    where
        I: IntoIterator<Item = StepStatus>,
    {
        let mut status = RunStatus::Passed;
        for step in steps {
            match step {
                StepStatus::Error => return RunStatus::Error,
                StepStatus::Failed => status = RunStatus::Failed,
                _ => {}
            }
        }
        status
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Passed => "PASSED",
            RunStatus::Failed => "FAILED",
            RunStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" | "QUEUED" => Ok(RunStatus::Pending),
            "RUNNING" => Ok(RunStatus::Running),
            "PASSED" | "SUCCESS" | "OK" => Ok(RunStatus::Passed),
            "FAILED" | "FAILURE" => Ok(RunStatus::Failed),
            "ERROR" => Ok(RunStatus::Error),
            other => Err(Error::InvalidEvent(format!("unknown run status: {}", other))),
        }
    }
}

impl<'de> Deserialize<'de> for RunStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Step state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Passed,
    Failed,
    Skipped,
    Error,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Passed | StepStatus::Failed | StepStatus::Skipped | StepStatus::Error
        )
    }

    /// Position in the PENDING -> RUNNING -> terminal order.
    fn rank(self) -> u8 {
        match self {
            StepStatus::Pending => 0,
            StepStatus::Running => 1,
            _ => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Running => "RUNNING",
            StepStatus::Passed => "PASSED",
            StepStatus::Failed => "FAILED",
            StepStatus::Skipped => "SKIPPED",
            StepStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(StepStatus::Pending),
            "RUNNING" => Ok(StepStatus::Running),
            "PASSED" | "SUCCESS" | "OK" => Ok(StepStatus::Passed),
            "FAILED" | "FAILURE" => Ok(StepStatus::Failed),
            "SKIPPED" | "SKIP" => Ok(StepStatus::Skipped),
            "ERROR" => Ok(StepStatus::Error),
            other => Err(Error::InvalidEvent(format!("unknown step status: {}", other))),
        }
    }
}

impl<'de> Deserialize<'de> for StepStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl From<RunStatus> for StepStatus {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Pending => StepStatus::Pending,
            RunStatus::Running => StepStatus::Running,
            RunStatus::Passed => StepStatus::Passed,
            RunStatus::Failed => StepStatus::Failed,
            RunStatus::Error => StepStatus::Error,
        }
    }
}

// ============================================================================
// Run results
// ============================================================================

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// One execution of a scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    #[serde(default)]
    pub scenario_id: String,
    pub status: RunStatus,
    pub start_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub step_results: Vec<StepResult>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub video_url: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub trace_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<RunSummary>,
}

impl Run {
    /// Initial PENDING run for a job, one PENDING result per step.
    pub fn pending(job: &Job, now: i64) -> Self {
        let step_results = job
            .steps
            .iter()
            .enumerate()
            .map(|(index, def)| StepResult {
                index: Some(index),
                name: Some(def.name.clone()),
                ..StepResult::new(&def.id)
            })
            .collect();

        Self {
            id: job.run_id.clone(),
            scenario_id: job.scenario_id.clone(),
            status: RunStatus::Pending,
            start_time: now,
            end_time: None,
            step_results,
            video_url: String::new(),
            trace_url: String::new(),
            summary: None,
        }
    }

    /// Bare run synthesized when events arrive before any snapshot.
    pub fn skeleton(run_id: &str, now: i64) -> Self {
        Self {
            id: run_id.to_string(),
            scenario_id: String::new(),
            status: RunStatus::Pending,
            start_time: now,
            end_time: None,
            step_results: Vec::new(),
            video_url: String::new(),
            trace_url: String::new(),
            summary: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut StepResult> {
        self.step_results.iter_mut().find(|s| s.step_id == step_id)
    }

    /// Returns the position of the step, creating a PENDING entry if absent.
    pub fn ensure_step(&mut self, step_id: &str) -> (usize, bool) {
        match self.step_results.iter().position(|s| s.step_id == step_id) {
            Some(pos) => (pos, false),
            None => {
                self.step_results.push(StepResult::new(step_id));
                (self.step_results.len() - 1, true)
            }
        }
    }

    /// Keep results ordered by scenario index; unknown indexes trail in arrival order.
    pub fn sort_steps(&mut self) {
        self.step_results
            .sort_by_key(|s| s.index.unwrap_or(usize::MAX));
    }

    /// True when there is at least one step and none is PENDING or RUNNING.
    pub fn all_steps_terminal(&self) -> bool {
        !self.step_results.is_empty() && self.step_results.iter().all(|s| s.status.is_terminal())
    }

    /// Aggregate status of the steps as they stand.
    pub fn aggregate_status(&self) -> RunStatus {
        RunStatus::aggregate(self.step_results.iter().map(|s| s.status))
    }

    /// Counts per step status plus wall-clock duration.
    pub fn summarize(&self, now: i64) -> RunSummary {
        let mut summary = RunSummary {
            total: self.step_results.len(),
            ..RunSummary::default()
        };
        for step in &self.step_results {
            match step.status {
                StepStatus::Pending => summary.pending += 1,
                StepStatus::Running => summary.running += 1,
                StepStatus::Passed => summary.passed += 1,
                StepStatus::Failed => summary.failed += 1,
                StepStatus::Skipped => summary.skipped += 1,
                StepStatus::Error => summary.error += 1,
            }
        }
        let end = self.end_time.unwrap_or(now);
        summary.duration_ms = (end - self.start_time).max(0) as u64;
        summary
    }

    /// Move the run into a terminal state.
    ///
    /// Returns false (and changes nothing) if the run already is terminal or
    /// `status` is not terminal.
    pub fn finish(&mut self, status: RunStatus, ts: i64) -> bool {
        if self.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.end_time = Some(ts);
        true
    }
}

/// Outcome of one step within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub screenshots: Vec<Screenshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

impl StepResult {
    pub fn new(step_id: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            index: None,
            name: None,
            status: StepStatus::Pending,
            start_time: None,
            end_time: None,
            logs: Vec::new(),
            screenshots: Vec::new(),
            error: None,
        }
    }

    /// Move forward along PENDING -> RUNNING -> terminal. Never regresses and
    /// never leaves a terminal status. Returns whether the status changed.
    pub fn advance(&mut self, to: StepStatus) -> bool {
        if to.rank() > self.status.rank() {
            self.status = to;
            true
        } else {
            false
        }
    }
}

/// Log line captured during a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub timestamp: i64,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Screenshot captured while a step ran
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Screenshot {
    pub id: String,
    pub step_id: String,
    pub timestamp: i64,
    pub path: String,
    pub url: String,
}

/// Engine failure attached to a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Per-status step counts and duration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub error: usize,
    pub pending: usize,
    pub running: usize,
    pub duration_ms: u64,
}

// ============================================================================
// Scenarios and jobs
// ============================================================================

/// A stored scenario: an ordered list of typed steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub steps: Vec<StepDefinition>,
}

impl Scenario {
    /// A scenario needs an id and at least one step, with unique step ids
    pub fn validate(&self) -> Result<(), Error> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidConfig("scenario id must not be empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "scenario {} has no steps",
                self.id
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "scenario {} has duplicate step id {}",
                    self.id, step.id
                )));
            }
        }
        Ok(())
    }
}

/// One step of a scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    pub id: String,
    pub name: String,
    pub action: StepAction,
}

/// "Execute scenario X as run Y"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub run_id: String,
    pub scenario_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub steps: Vec<StepDefinition>,
    /// Delivery attempt, 1 on first claim
    #[serde(default)]
    pub attempt: u32,
}

impl Job {
    pub fn for_scenario(run_id: impl Into<String>, scenario: &Scenario) -> Self {
        Self {
            run_id: run_id.into(),
            scenario_id: scenario.id.clone(),
            base_url: scenario.base_url.clone(),
            steps: scenario.steps.clone(),
            attempt: 0,
        }
    }
}

/// Browser action a step performs; opaque to the pipeline, interpreted by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    /// Navigate to a URL (relative to the scenario base URL)
    Navigate {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        wait_for_selector: Option<String>,
    },
    Click {
        selector: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    Fill {
        selector: String,
        value: String,
    },
    /// Type text with keyboard simulation
    Type {
        selector: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay_ms: Option<u64>,
    },
    Press {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
        key: String,
    },
    /// Wait for an element to reach a state
    Wait {
        selector: String,
        #[serde(default = "default_wait_timeout")]
        timeout_ms: u64,
        #[serde(default)]
        state: WaitState,
    },
    Sleep {
        ms: u64,
    },
    Assert {
        selector: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        visible: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text_contains: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<usize>,
    },
    Screenshot {
        #[serde(default)]
        full_page: bool,
    },
    Hover {
        selector: String,
    },
    Select {
        selector: String,
        value: String,
    },
    Check {
        selector: String,
    },
    Uncheck {
        selector: String,
    },
    Evaluate {
        script: String,
    },
}

fn default_wait_timeout() -> u64 {
    5000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WaitState {
    #[default]
    Visible,
    Hidden,
    Attached,
    Detached,
}

impl WaitState {
    pub fn as_str(self) -> &'static str {
        match self {
            WaitState::Visible => "visible",
            WaitState::Hidden => "hidden",
            WaitState::Attached => "attached",
            WaitState::Detached => "detached",
        }
    }
}

impl StepAction {
    /// Short human-readable label, e.g. `click:#submit`
    pub fn label(&self) -> String {
        match self {
            StepAction::Navigate { url, .. } => format!("navigate:{}", url),
            StepAction::Click { selector, .. } => format!("click:{}", selector),
            StepAction::Fill { selector, .. } => format!("fill:{}", selector),
            StepAction::Type { selector, .. } => format!("type:{}", selector),
            StepAction::Press { key, .. } => format!("press:{}", key),
            StepAction::Wait { selector, .. } => format!("wait:{}", selector),
            StepAction::Sleep { ms } => format!("sleep:{}ms", ms),
            StepAction::Assert { selector, .. } => format!("assert:{}", selector),
            StepAction::Screenshot { .. } => "screenshot".to_string(),
            StepAction::Hover { selector } => format!("hover:{}", selector),
            StepAction::Select { selector, .. } => format!("select:{}", selector),
            StepAction::Check { selector } => format!("check:{}", selector),
            StepAction::Uncheck { selector } => format!("uncheck:{}", selector),
            StepAction::Evaluate { .. } => "evaluate".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(steps: &[&str]) -> Job {
        Job {
            run_id: "run-1".into(),
            scenario_id: "scn-1".into(),
            base_url: None,
            steps: steps
                .iter()
                .map(|id| StepDefinition {
                    id: id.to_string(),
                    name: format!("step {}", id),
                    action: StepAction::Sleep { ms: 1 },
                })
                .collect(),
            attempt: 0,
        }
    }

    #[test]
    fn test_aggregate_precedence() {
        use StepStatus::*;
        assert_eq!(RunStatus::aggregate([Passed, Passed]), RunStatus::Passed);
        assert_eq!(RunStatus::aggregate([Passed, Failed, Skipped]), RunStatus::Failed);
        assert_eq!(RunStatus::aggregate([Failed, Error, Skipped]), RunStatus::Error);
        assert_eq!(RunStatus::aggregate([Error, Failed]), RunStatus::Error);
        assert_eq!(RunStatus::aggregate([Passed, Skipped]), RunStatus::Passed);
    }

    #[test]
    fn test_step_status_never_regresses() {
        let mut step = StepResult::new("a");
        assert!(step.advance(StepStatus::Running));
        assert!(!step.advance(StepStatus::Pending));
        assert!(step.advance(StepStatus::Failed));
        assert!(!step.advance(StepStatus::Passed));
        assert!(!step.advance(StepStatus::Running));
        assert_eq!(step.status, StepStatus::Failed);
    }

    #[test]
    fn test_status_aliases() {
        assert_eq!("success".parse::<StepStatus>().unwrap(), StepStatus::Passed);
        assert_eq!("skip".parse::<StepStatus>().unwrap(), StepStatus::Skipped);
        assert_eq!("Failed".parse::<RunStatus>().unwrap(), RunStatus::Failed);
        assert!("bogus".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_pending_run_seeds_steps() {
        let run = Run::pending(&job(&["a", "b", "c"]), 1_000);
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.step_results.len(), 3);
        assert_eq!(run.step_results[2].index, Some(2));
        assert!(run.step_results.iter().all(|s| s.status == StepStatus::Pending));
        assert!(!run.all_steps_terminal());
    }

    #[test]
    fn test_run_roundtrip_keeps_empty_urls() {
        let run = Run::pending(&job(&["a"]), 1_000);
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["videoUrl"], "");
        assert_eq!(json["traceUrl"], "");
        assert_eq!(json["stepResults"][0]["status"], "PENDING");

        let back: Run = serde_json::from_value(json).unwrap();
        assert_eq!(back, run);
    }

    #[test]
    fn test_null_urls_read_as_empty() {
        let run: Run = serde_json::from_str(
            r#"{"id":"r","status":"RUNNING","startTime":1,"videoUrl":null}"#,
        )
        .unwrap();
        assert_eq!(run.video_url, "");
        assert_eq!(run.trace_url, "");
    }

    #[test]
    fn test_finish_is_write_once() {
        let mut run = Run::pending(&job(&["a"]), 0);
        assert!(!run.finish(RunStatus::Running, 5));
        assert!(run.finish(RunStatus::Failed, 10));
        assert!(!run.finish(RunStatus::Passed, 20));
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.end_time, Some(10));
    }

    #[test]
    fn test_summary_counts() {
        let mut run = Run::pending(&job(&["a", "b", "c"]), 100);
        run.step_results[0].status = StepStatus::Passed;
        run.step_results[1].status = StepStatus::Failed;
        run.step_results[2].status = StepStatus::Skipped;
        run.finish(RunStatus::Failed, 350);
        let summary = run.summarize(999);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.duration_ms, 250);
    }

    #[test]
    fn test_step_action_tagging() {
        let def: StepDefinition = serde_json::from_str(
            r##"{"id":"s1","name":"Open","action":{"type":"wait","selector":"#app"}}"##,
        )
        .unwrap();
        match def.action {
            StepAction::Wait { timeout_ms, state, .. } => {
                assert_eq!(timeout_ms, 5000);
                assert_eq!(state, WaitState::Visible);
            }
            other => panic!("unexpected action: {:?}", other),
        }
    }
}
