//! Event-sourced reconstruction of a run
//!
//! A [`RunReducer`] folds [`RunEvent`]s, optionally on top of a persisted
//! snapshot, into a single [`Run`]. The fold is duplicate-safe and tolerant of
//! out-of-order delivery:
//!
//! - run status only moves PENDING -> RUNNING -> terminal, terminal is absorbing
//! - step status only moves PENDING -> RUNNING -> terminal, terminal is absorbing
//! - screenshots are only appended, an exact duplicate frame is recognized
//! - events for another run id are ignored
//!
//! The server uses the same fold to keep its live copy of each run, so the
//! transition rules exist in exactly one place.

use tracing::debug;

use crate::event::{RunEvent, StreamMessage};
use crate::types::{Run, RunStatus, Screenshot, StepError, StepResult, StepStatus};

/// Effect of feeding one input to a reducer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    Unchanged,
    /// Input belongs to a different run
    Ignored,
}

impl Applied {
    fn from_changed(changed: bool) -> Self {
        if changed {
            Applied::Changed
        } else {
            Applied::Unchanged
        }
    }

    pub fn is_changed(self) -> bool {
        self == Applied::Changed
    }
}

#[derive(Debug, Clone)]
pub struct RunReducer {
    run_id: String,
    run: Option<Run>,
}

impl RunReducer {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            run: None,
        }
    }

    pub fn with_snapshot(snapshot: Run) -> Self {
        Self {
            run_id: snapshot.id.clone(),
            run: Some(snapshot),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run(&self) -> Option<&Run> {
        self.run.as_ref()
    }

    pub fn into_run(self) -> Option<Run> {
        self.run
    }

    pub fn is_terminal(&self) -> bool {
        self.run.as_ref().map_or(false, Run::is_terminal)
    }

    /// Merge a snapshot into whatever has been folded so far. Nothing regresses.
    pub fn merge_snapshot(&mut self, snapshot: Run) -> Applied {
        if snapshot.id != self.run_id {
            return Applied::Ignored;
        }
        match self.run.as_mut() {
            None => {
                self.run = Some(snapshot);
                Applied::Changed
            }
            Some(current) => Applied::from_changed(merge_run(current, snapshot)),
        }
    }

    pub fn apply(&mut self, event: &RunEvent) -> Applied {
        if event.run_id() != self.run_id {
            debug!(
                "Ignoring {} for run {} (subscribed to {})",
                event.kind(),
                event.run_id(),
                self.run_id
            );
            return Applied::Ignored;
        }

        let run_id = &self.run_id;
        let mut created = false;
        let run = self.run.get_or_insert_with(|| {
            created = true;
            Run::skeleton(run_id, event.ts())
        });

        let mut changed = created;
        if event.ts() < run.start_time {
            run.start_time = event.ts();
            changed = true;
        }

        let folded = match event {
            RunEvent::StepStart { step_id, index, name, ts, .. } => {
                on_step_start(run, step_id, *index, name.as_deref(), *ts)
            }
            RunEvent::Frame { step_id, url, ts, .. } => on_frame(run, step_id, url, *ts),
            RunEvent::StepEnd { step_id, status, index, error, ts, .. } => {
                on_step_end(run, step_id, *status, *index, error.as_ref(), *ts)
            }
            RunEvent::RunFinished { status, video, trace, ts, .. } => {
                on_run_finished(run, *status, video.as_deref(), trace.as_deref(), *ts)
            }
        };

        Applied::from_changed(changed || folded)
    }

    /// Normalized view model of the current state
    pub fn view(&self, now: i64) -> Option<Run> {
        self.run.as_ref().map(|run| {
            let mut run = run.clone();
            normalize(&mut run, now);
            run
        })
    }
}

/// Fill what a viewer must never see missing: `endTime` on a terminal run and
/// a summary. URLs are already non-optional strings.
pub fn normalize(run: &mut Run, now: i64) {
    if run.is_terminal() && run.end_time.is_none() {
        run.end_time = Some(now.max(run.start_time));
    }
    if run.summary.is_none() {
        run.summary = Some(run.summarize(now));
    }
}

fn start_running(run: &mut Run) -> bool {
    if run.status == RunStatus::Pending {
        run.status = RunStatus::Running;
        true
    } else {
        false
    }
}

/// Record index/name the first time they are known. Returns whether the
/// index changed, which requires re-sorting.
fn fill_identity(step: &mut StepResult, index: Option<usize>, name: Option<&str>) -> (bool, bool) {
    let mut changed = false;
    let mut reorder = false;
    if let (None, Some(index)) = (step.index, index) {
        step.index = Some(index);
        changed = true;
        reorder = true;
    }
    if let (None, Some(name)) = (step.name.as_deref(), name) {
        step.name = Some(name.to_string());
        changed = true;
    }
    (changed, reorder)
}

fn on_step_start(
    run: &mut Run,
    step_id: &str,
    index: Option<usize>,
    name: Option<&str>,
    ts: i64,
) -> bool {
    let mut changed = start_running(run);
    let (pos, created) = run.ensure_step(step_id);
    changed |= created;

    let step = &mut run.step_results[pos];
    let (identity_changed, reorder) = fill_identity(step, index, name);
    changed |= identity_changed;

    if step.advance(StepStatus::Running) {
        changed = true;
    }
    // Earliest start wins regardless of arrival order
    if step.start_time.map_or(true, |start| ts < start) {
        step.start_time = Some(ts);
        changed = true;
    }

    if reorder || created {
        run.sort_steps();
    }
    changed
}

fn on_frame(run: &mut Run, step_id: &str, url: &str, ts: i64) -> bool {
    let mut changed = start_running(run);
    let (pos, created) = run.ensure_step(step_id);
    changed |= created;

    let step = &mut run.step_results[pos];
    changed |= step.advance(StepStatus::Running);

    changed |= insert_screenshot(
        step,
        Screenshot {
            id: screenshot_id(step_id, url, ts),
            step_id: step_id.to_string(),
            timestamp: ts,
            path: storage_path(url),
            url: url.to_string(),
        },
    );

    if created {
        run.sort_steps();
    }
    changed
}

fn on_step_end(
    run: &mut Run,
    step_id: &str,
    status: StepStatus,
    index: Option<usize>,
    error: Option<&StepError>,
    ts: i64,
) -> bool {
    let (pos, created) = run.ensure_step(step_id);
    let mut changed = created;

    let step = &mut run.step_results[pos];
    let (identity_changed, reorder) = fill_identity(step, index, None);
    changed |= identity_changed;

    if step.advance(status) {
        if status.is_terminal() {
            step.end_time = Some(ts);
            if let Some(error) = error {
                step.error = Some(error.clone());
            }
        }
        changed = true;
    } else if step.status.is_terminal() && step.status != status {
        debug!(
            "Step {} already {}, ignoring {}",
            step_id, step.status, status
        );
    }

    if reorder || created {
        run.sort_steps();
    }
    changed
}

fn on_run_finished(
    run: &mut Run,
    status: RunStatus,
    video: Option<&str>,
    trace: Option<&str>,
    ts: i64,
) -> bool {
    if run.is_terminal() {
        debug!("Run {} already {}, dropping duplicate finish", run.id, run.status);
        return false;
    }
    if !run.finish(status, ts) {
        return false;
    }
    run.video_url = video.unwrap_or_default().to_string();
    run.trace_url = trace.unwrap_or_default().to_string();
    true
}

fn merge_run(current: &mut Run, snapshot: Run) -> bool {
    let mut changed = false;

    if current.scenario_id.is_empty() && !snapshot.scenario_id.is_empty() {
        current.scenario_id = snapshot.scenario_id;
        changed = true;
    }
    if snapshot.start_time < current.start_time {
        current.start_time = snapshot.start_time;
        changed = true;
    }

    if !current.is_terminal() {
        if snapshot.status.is_terminal() {
            current.status = snapshot.status;
            current.end_time = snapshot.end_time;
            current.video_url = snapshot.video_url;
            current.trace_url = snapshot.trace_url;
            if snapshot.summary.is_some() {
                current.summary = snapshot.summary;
            }
            changed = true;
        } else if snapshot.status == RunStatus::Running {
            changed |= start_running(current);
        }
    }

    let mut reorder = false;
    for incoming in snapshot.step_results {
        match current.step_mut(&incoming.step_id) {
            None => {
                current.step_results.push(incoming);
                reorder = true;
                changed = true;
            }
            Some(step) => {
                let (identity_changed, index_changed) =
                    fill_identity(step, incoming.index, incoming.name.as_deref());
                changed |= identity_changed;
                reorder |= index_changed;
                changed |= merge_step(step, incoming);
            }
        }
    }
    if reorder {
        current.sort_steps();
    }
    changed
}

fn merge_step(step: &mut StepResult, incoming: StepResult) -> bool {
    let mut changed = false;

    if step.advance(incoming.status) {
        if incoming.status.is_terminal() {
            step.end_time = incoming.end_time;
            step.error = incoming.error;
        }
        changed = true;
    }
    if let Some(start) = incoming.start_time {
        if step.start_time.map_or(true, |current| start < current) {
            step.start_time = Some(start);
            changed = true;
        }
    }
    for shot in incoming.screenshots {
        changed |= insert_screenshot(step, shot);
    }
    for log in incoming.logs {
        if !step.logs.contains(&log) {
            step.logs.push(log);
            changed = true;
        }
    }
    changed
}

/// Add a screenshot unless the same frame is already recorded, keeping
/// capture order. Existing entries never move relative to each other.
fn insert_screenshot(step: &mut StepResult, shot: Screenshot) -> bool {
    let known = step
        .screenshots
        .iter()
        .any(|s| s.url == shot.url && s.timestamp == shot.timestamp);
    if known {
        return false;
    }
    let at = step
        .screenshots
        .partition_point(|s| (s.timestamp, s.url.as_str()) <= (shot.timestamp, shot.url.as_str()));
    step.screenshots.insert(at, shot);
    true
}

/// Same frame, same id, whether it arrived live or inside a snapshot.
fn screenshot_id(step_id: &str, url: &str, ts: i64) -> String {
    let file = url.rsplit('/').next().unwrap_or(url);
    format!("{}-{}-{}", step_id, ts, file)
}

/// Storage path of an artifact URL: everything after the authority.
fn storage_path(url: &str) -> String {
    match url.split_once("://") {
        Some((_, rest)) => match rest.find('/') {
            Some(slash) => rest[slash..].to_string(),
            None => "/".to_string(),
        },
        None => url.to_string(),
    }
}

/// Viewer-side composition of snapshot bootstrap and a live subscription
///
/// Snapshot fetch and stream consumption stay independent: a caller may only
/// poll (`bootstrap` repeatedly), only stream (`on_message`), or both.
#[derive(Debug, Clone)]
pub struct ViewerSession {
    reducer: RunReducer,
    connected: bool,
    ended: bool,
}

impl ViewerSession {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            reducer: RunReducer::new(run_id),
            connected: false,
            ended: false,
        }
    }

    pub fn bootstrap(&mut self, snapshot: Run) -> Applied {
        self.reducer.merge_snapshot(snapshot)
    }

    pub fn on_message(&mut self, message: &StreamMessage) -> Applied {
        if message.run_id() != self.reducer.run_id() {
            return Applied::Ignored;
        }
        match message {
            StreamMessage::Connected { .. } => {
                self.connected = true;
                self.ended = false;
                Applied::Unchanged
            }
            StreamMessage::Event(event) => self.reducer.apply(event),
            StreamMessage::End { .. } => {
                self.connected = false;
                self.ended = true;
                Applied::Unchanged
            }
        }
    }

    /// The subscription dropped without an end marker
    pub fn disconnected(&mut self) {
        self.connected = false;
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn reducer(&self) -> &RunReducer {
        &self.reducer
    }

    pub fn view(&self, now: i64) -> Option<Run> {
        self.reducer.view(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(step: &str, index: usize, ts: i64) -> RunEvent {
        RunEvent::StepStart {
            run_id: "r1".into(),
            step_id: step.into(),
            index: Some(index),
            name: Some(step.to_uppercase()),
            ts,
        }
    }

    fn end(step: &str, status: StepStatus, ts: i64) -> RunEvent {
        RunEvent::StepEnd {
            run_id: "r1".into(),
            step_id: step.into(),
            status,
            index: None,
            error: None,
            ts,
        }
    }

    fn finished(status: RunStatus, ts: i64) -> RunEvent {
        RunEvent::RunFinished {
            run_id: "r1".into(),
            status,
            video: Some("http://cdn/r1/video.webm".into()),
            trace: None,
            ts,
        }
    }

    #[test]
    fn test_first_event_synthesizes_skeleton() {
        let mut reducer = RunReducer::new("r1");
        assert_eq!(reducer.apply(&start("a", 0, 10)), Applied::Changed);

        let run = reducer.run().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.start_time, 10);
        assert_eq!(run.step("a").unwrap().status, StepStatus::Running);
        assert_eq!(run.step("a").unwrap().name.as_deref(), Some("A"));
    }

    #[test]
    fn test_other_run_ids_are_ignored() {
        let mut reducer = RunReducer::new("r2");
        assert_eq!(reducer.apply(&start("a", 0, 10)), Applied::Ignored);
        assert!(reducer.run().is_none());
    }

    #[test]
    fn test_terminal_step_is_absorbing() {
        let mut reducer = RunReducer::new("r1");
        reducer.apply(&start("a", 0, 10));
        reducer.apply(&end("a", StepStatus::Failed, 20));
        assert_eq!(reducer.apply(&end("a", StepStatus::Passed, 30)), Applied::Unchanged);
        assert_eq!(reducer.apply(&start("a", 0, 40)), Applied::Unchanged);

        let step = reducer.run().unwrap().step("a").unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.end_time, Some(20));
    }

    #[test]
    fn test_duplicate_finish_is_dropped() {
        let mut reducer = RunReducer::new("r1");
        reducer.apply(&start("a", 0, 10));
        assert!(reducer.apply(&finished(RunStatus::Passed, 50)).is_changed());
        assert_eq!(reducer.apply(&finished(RunStatus::Error, 60)), Applied::Unchanged);

        let run = reducer.run().unwrap();
        assert_eq!(run.status, RunStatus::Passed);
        assert_eq!(run.end_time, Some(50));
        assert_eq!(run.video_url, "http://cdn/r1/video.webm");
        assert_eq!(run.trace_url, "");
    }

    #[test]
    fn test_frame_before_start_creates_running_step() {
        let mut reducer = RunReducer::new("r1");
        reducer.apply(&RunEvent::Frame {
            run_id: "r1".into(),
            step_id: "ghost".into(),
            url: "http://cdn/r1/ghost-1.png".into(),
            ts: 5,
        });

        let step = reducer.run().unwrap().step("ghost").unwrap();
        assert_eq!(step.status, StepStatus::Running);
        assert_eq!(step.screenshots.len(), 1);
        assert_eq!(step.screenshots[0].path, "/r1/ghost-1.png");
        assert_eq!(step.screenshots[0].step_id, "ghost");
    }

    #[test]
    fn test_view_fills_missing_fields() {
        let mut run = Run::skeleton("r1", 100);
        run.status = RunStatus::Error;
        let reducer = RunReducer::with_snapshot(run);

        let view = reducer.view(500).unwrap();
        assert_eq!(view.end_time, Some(500));
        assert_eq!(view.video_url, "");
        let summary = view.summary.unwrap();
        assert_eq!(summary.total, 0);
        assert_eq!(summary.duration_ms, 400);
    }

    #[test]
    fn test_snapshot_merge_never_regresses() {
        let mut reducer = RunReducer::new("r1");
        reducer.apply(&start("a", 0, 10));
        reducer.apply(&end("a", StepStatus::Passed, 20));

        let mut stale = Run::skeleton("r1", 5);
        stale.status = RunStatus::Running;
        let mut a = StepResult::new("a");
        a.status = StepStatus::Running;
        a.index = Some(0);
        stale.step_results.push(a);
        let mut b = StepResult::new("b");
        b.index = Some(1);
        stale.step_results.push(b);

        assert!(reducer.merge_snapshot(stale).is_changed());
        let run = reducer.run().unwrap();
        assert_eq!(run.start_time, 5);
        assert_eq!(run.step("a").unwrap().status, StepStatus::Passed);
        assert_eq!(run.step_results[1].step_id, "b");
    }

    #[test]
    fn test_viewer_session_bookkeeping() {
        let mut session = ViewerSession::new("r1");
        session.on_message(&StreamMessage::Connected { run_id: "r1".into() });
        assert!(session.is_connected());
        session.on_message(&StreamMessage::Event(start("a", 0, 1)));
        session.on_message(&StreamMessage::End { run_id: "r1".into() });
        assert!(session.is_ended());
        assert!(!session.is_connected());
        assert_eq!(
            session.on_message(&StreamMessage::End { run_id: "other".into() }),
            Applied::Ignored
        );
    }

    #[test]
    fn test_storage_path() {
        assert_eq!(storage_path("https://host:8080/a/b.png"), "/a/b.png");
        assert_eq!(storage_path("https://host"), "/");
        assert_eq!(storage_path("/local/c.png"), "/local/c.png");
    }
}
