//! Runner loop against a scripted engine, an in-memory job source and a
//! recording transport
//!
//! Run with: cargo test --package runcast-worker --test worker_flow

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use runcast_common::{
    Job, Run, RunEvent, RunReducer, RunStatus, StepAction, StepDefinition, StepStatus,
};
use runcast_worker::worker::SHUTDOWN_MESSAGE;
use runcast_worker::{
    Artifacts, Emitter, EmitterConfig, Engine, EngineError, EventTransport, FrameSink, JobSource,
    StepOutcome, Worker, WorkerResult, WorkerStats,
};

#[derive(Clone)]
enum Plan {
    Pass,
    Frames(Vec<&'static str>),
    Fail(&'static str),
    Raise(&'static str),
    /// Pass, but request shutdown while running
    PassAndStop(CancellationToken),
}

#[derive(Default)]
struct EngineLog {
    started: Vec<String>,
    executed: Vec<String>,
    finished: usize,
    shutdowns: usize,
}

struct ScriptedEngine {
    plans: HashMap<String, Plan>,
    fail_start: bool,
    current: Option<String>,
    log: Arc<Mutex<EngineLog>>,
}

impl ScriptedEngine {
    fn new(plans: &[(&str, Plan)]) -> (Self, Arc<Mutex<EngineLog>>) {
        let log = Arc::new(Mutex::new(EngineLog::default()));
        let engine = Self {
            plans: plans
                .iter()
                .map(|(id, plan)| (id.to_string(), plan.clone()))
                .collect(),
            fail_start: false,
            current: None,
            log: log.clone(),
        };
        (engine, log)
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    async fn start(&mut self, job: &Job) -> Result<(), EngineError> {
        self.log.lock().started.push(job.run_id.clone());
        if self.fail_start {
            return Err(EngineError::DriverNotFound("node".into()));
        }
        self.current = Some(job.run_id.clone());
        Ok(())
    }

    async fn execute(
        &mut self,
        step: &StepDefinition,
        frames: &FrameSink,
    ) -> Result<StepOutcome, EngineError> {
        self.log.lock().executed.push(step.id.clone());
        let run_id = self.current.clone().unwrap_or_default();
        match self.plans.get(&step.id).cloned().unwrap_or(Plan::Pass) {
            Plan::Pass => Ok(StepOutcome::passed()),
            Plan::Frames(files) => {
                for file in files {
                    frames.frame(format!("http://a/{}/{}", run_id, file));
                }
                Ok(StepOutcome::passed())
            }
            Plan::Fail(message) => Ok(StepOutcome::failed(message, None)),
            Plan::Raise(message) => Err(EngineError::Script {
                message: message.into(),
                stack: Some(format!("at {} (driver.js:1)", step.id)),
            }),
            Plan::PassAndStop(token) => {
                token.cancel();
                Ok(StepOutcome::passed())
            }
        }
    }

    async fn finish(&mut self) -> Result<Artifacts, EngineError> {
        self.log.lock().finished += 1;
        Ok(match self.current.take() {
            Some(run_id) => Artifacts {
                video: Some(format!("http://a/{}/video.webm", run_id)),
                trace: None,
            },
            None => Artifacts::default(),
        })
    }

    async fn shutdown(&mut self) {
        self.log.lock().shutdowns += 1;
    }
}

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<RunEvent>>>,
}

#[async_trait]
impl EventTransport for Recorder {
    async fn send(&self, _run_id: &str, events: &[RunEvent]) -> WorkerResult<()> {
        self.events.lock().extend_from_slice(events);
        Ok(())
    }
}

/// Hands out queued jobs, then requests shutdown once it runs dry
struct QueueSource {
    jobs: Mutex<VecDeque<Job>>,
    acked: Arc<Mutex<Vec<String>>>,
    when_empty: CancellationToken,
}

#[async_trait]
impl JobSource for QueueSource {
    async fn claim(&self, _worker_id: &str, _wait: Duration) -> WorkerResult<Option<Job>> {
        let next = self.jobs.lock().pop_front();
        if next.is_none() {
            self.when_empty.cancel();
        }
        Ok(next)
    }

    async fn ack(&self, run_id: &str) -> WorkerResult<()> {
        self.acked.lock().push(run_id.to_string());
        Ok(())
    }
}

fn job(run_id: &str, steps: &[&str]) -> Job {
    Job {
        run_id: run_id.into(),
        scenario_id: "checkout".into(),
        base_url: None,
        steps: steps
            .iter()
            .map(|id| StepDefinition {
                id: id.to_string(),
                name: format!("Step {}", id),
                action: StepAction::Sleep { ms: 1 },
            })
            .collect(),
        attempt: 1,
    }
}

struct Harness {
    events: Arc<Mutex<Vec<RunEvent>>>,
    acked: Arc<Mutex<Vec<String>>>,
    engine: Arc<Mutex<EngineLog>>,
    stats: Arc<WorkerStats>,
}

/// Run a worker over `jobs` until the source runs dry
async fn run_worker(jobs: Vec<Job>, engine: ScriptedEngine, shutdown: CancellationToken) -> Harness {
    let engine_log = engine.log.clone();
    let recorder = Recorder::default();
    let events = recorder.events.clone();
    let (emitter, forwarder) = Emitter::spawn(recorder, EmitterConfig::default());

    let acked = Arc::new(Mutex::new(Vec::new()));
    let source = QueueSource {
        jobs: Mutex::new(jobs.into()),
        acked: acked.clone(),
        when_empty: shutdown.clone(),
    };

    let worker = Worker::new("test-worker", source, engine, emitter)
        .with_claim_wait(Duration::from_millis(10));
    let stats = worker.stats();
    worker.run(shutdown).await;
    forwarder.await.unwrap();

    Harness {
        events,
        acked,
        engine: engine_log,
        stats,
    }
}

fn kinds(events: &[RunEvent]) -> Vec<String> {
    events
        .iter()
        .map(|e| match e.step_id() {
            Some(step) => format!("{}:{}", e.kind(), step),
            None => e.kind().to_string(),
        })
        .collect()
}

fn finished(events: &[RunEvent]) -> (RunStatus, Option<String>) {
    let finishes: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::RunFinished { status, video, .. } => Some((*status, video.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(finishes.len(), 1, "exactly one run-finished per run");
    finishes[0].clone()
}

fn step_end(events: &[RunEvent], step: &str) -> (StepStatus, Option<String>) {
    events
        .iter()
        .find_map(|e| match e {
            RunEvent::StepEnd {
                step_id,
                status,
                error,
                ..
            } if step_id == step => Some((*status, error.as_ref().map(|e| e.message.clone()))),
            _ => None,
        })
        .unwrap_or_else(|| panic!("no step-end for {}", step))
}

#[tokio::test]
async fn passing_run_emits_events_in_step_order() {
    let (engine, _) = ScriptedEngine::new(&[("b", Plan::Frames(vec!["b-1.png", "b-2.png"]))]);
    let harness = run_worker(vec![job("r1", &["a", "b", "c"])], engine, CancellationToken::new()).await;
    let events = harness.events.lock().clone();

    assert_eq!(
        kinds(&events),
        vec![
            "step-start:a",
            "step-end:a",
            "step-start:b",
            "frame:b",
            "frame:b",
            "step-end:b",
            "step-start:c",
            "step-end:c",
            "run-finished",
        ]
    );
    let (status, video) = finished(&events);
    assert_eq!(status, RunStatus::Passed);
    assert_eq!(video.as_deref(), Some("http://a/r1/video.webm"));
    assert_eq!(*harness.acked.lock(), vec!["r1".to_string()]);

    let log = harness.engine.lock();
    assert_eq!(log.finished, 1);
    assert_eq!(log.shutdowns, 1);
}

#[tokio::test]
async fn failed_step_skips_the_rest() {
    let (engine, log) = ScriptedEngine::new(&[("b", Plan::Fail("expected #total to be visible"))]);
    let harness = run_worker(vec![job("r2", &["a", "b", "c"])], engine, CancellationToken::new()).await;
    let events = harness.events.lock().clone();

    assert_eq!(log.lock().executed, vec!["a", "b"]);
    assert!(!kinds(&events).contains(&"step-start:c".to_string()));
    assert_eq!(
        step_end(&events, "b"),
        (StepStatus::Failed, Some("expected #total to be visible".into()))
    );
    assert_eq!(step_end(&events, "c"), (StepStatus::Skipped, None));
    assert_eq!(finished(&events).0, RunStatus::Failed);

    let stats = harness.stats.snapshot();
    assert_eq!(stats.steps_passed, 1);
    assert_eq!(stats.steps_failed, 1);
    assert_eq!(stats.steps_skipped, 1);
    assert_eq!(stats.steps_executed, 2);
}

#[tokio::test]
async fn engine_exception_becomes_error_step() {
    let (engine, log) = ScriptedEngine::new(&[("a", Plan::Raise("Target page crashed"))]);
    let harness = run_worker(vec![job("r3", &["a", "b"])], engine, CancellationToken::new()).await;
    let events = harness.events.lock().clone();

    assert_eq!(log.lock().executed, vec!["a"]);
    let error = events.iter().find_map(|e| match e {
        RunEvent::StepEnd { step_id, error, .. } if step_id == "a" => error.clone(),
        _ => None,
    });
    let error = error.unwrap();
    assert_eq!(error.message, "Target page crashed");
    assert_eq!(error.stack.as_deref(), Some("at a (driver.js:1)"));
    assert_eq!(step_end(&events, "b").0, StepStatus::Skipped);
    assert_eq!(finished(&events).0, RunStatus::Error);
    assert_eq!(log.lock().finished, 1);
}

#[tokio::test]
async fn engine_that_cannot_start_errors_the_run() {
    let (mut engine, log) = ScriptedEngine::new(&[]);
    engine.fail_start = true;
    let harness = run_worker(vec![job("r4", &["a", "b"])], engine, CancellationToken::new()).await;
    let events = harness.events.lock().clone();

    assert!(log.lock().executed.is_empty());
    let (status, message) = step_end(&events, "a");
    assert_eq!(status, StepStatus::Error);
    assert!(message.unwrap().contains("node"));
    assert_eq!(step_end(&events, "b").0, StepStatus::Skipped);
    assert_eq!(finished(&events), (RunStatus::Error, None));
    // Released even though it never started
    assert_eq!(log.lock().finished, 1);
}

#[tokio::test]
async fn shutdown_finishes_current_step_then_errors_run() {
    let shutdown = CancellationToken::new();
    let (engine, log) = ScriptedEngine::new(&[("b", Plan::PassAndStop(shutdown.clone()))]);
    let harness = run_worker(
        vec![job("r5", &["a", "b", "c", "d"]), job("r6", &["a"])],
        engine,
        shutdown,
    )
    .await;
    let events = harness.events.lock().clone();

    assert_eq!(log.lock().executed, vec!["a", "b"]);
    assert_eq!(step_end(&events, "b").0, StepStatus::Passed);
    assert_eq!(
        step_end(&events, "c"),
        (StepStatus::Skipped, Some(SHUTDOWN_MESSAGE.to_string()))
    );
    assert_eq!(step_end(&events, "d").0, StepStatus::Skipped);
    assert_eq!(finished(&events).0, RunStatus::Error);

    // The interrupted run is still delivered and acked; the next one is never claimed
    assert_eq!(*harness.acked.lock(), vec!["r5".to_string()]);
    assert!(events.iter().all(|e| e.run_id() == "r5"));
    assert_eq!(log.lock().shutdowns, 1);
}

#[tokio::test]
async fn jobs_run_one_after_another() {
    let (engine, log) = ScriptedEngine::new(&[]);
    let harness = run_worker(
        vec![job("r7", &["a"]), job("r8", &["a", "b"])],
        engine,
        CancellationToken::new(),
    )
    .await;
    let events = harness.events.lock().clone();

    assert_eq!(*harness.acked.lock(), vec!["r7".to_string(), "r8".to_string()]);
    assert_eq!(log.lock().started, vec!["r7", "r8"]);
    let last_of_r7 = events.iter().rposition(|e| e.run_id() == "r7").unwrap();
    let first_of_r8 = events.iter().position(|e| e.run_id() == "r8").unwrap();
    assert!(last_of_r7 < first_of_r8);
}

#[tokio::test]
async fn emitted_events_fold_into_the_expected_run() {
    let (engine, _) = ScriptedEngine::new(&[
        ("a", Plan::Frames(vec!["a-1.png"])),
        ("b", Plan::Fail("wrong total")),
    ]);
    let scenario = job("r9", &["a", "b", "c"]);
    let harness = run_worker(vec![scenario.clone()], engine, CancellationToken::new()).await;
    let events = harness.events.lock().clone();

    let mut reducer = RunReducer::with_snapshot(Run::pending(&scenario, 0));
    for event in &events {
        reducer.apply(event);
    }
    let run = reducer.run().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.end_time.is_some());
    assert_eq!(run.video_url, "http://a/r9/video.webm");
    let statuses: Vec<_> = run.step_results.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![StepStatus::Passed, StepStatus::Failed, StepStatus::Skipped]
    );
    assert_eq!(run.step_results[0].screenshots.len(), 1);
}
