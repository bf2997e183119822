//! Web server implementation

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use uuid::Uuid;

use runcast_common::reducer::normalize;
use runcast_common::{
    now_millis, Database, Job, JobQueue, Run, RunEvent, RunStore, Scenario, ScenarioCatalog,
    SqliteRunStore,
};

use crate::config::{SocketConfig, StreamConfig, WebConfig, DEFAULT_CLAIM_WAIT};
use crate::error::{ApiError, ApiResult};
use crate::stream::{Published, StreamManager};
use crate::viewer;

/// Shared handler state
pub struct AppState {
    pub streams: Arc<StreamManager>,
    pub queue: JobQueue,
    pub catalog: ScenarioCatalog,
    pub socket: SocketConfig,
    pub claim_wait_max: Duration,
}

impl AppState {
    fn store(&self) -> &Arc<dyn RunStore> {
        self.streams.store()
    }
}

/// Web server
#[derive(Clone)]
pub struct WebServer {
    state: Arc<AppState>,
    artifacts: Option<PathBuf>,
}

impl WebServer {
    /// Open the database named by the config and wire everything onto it
    pub fn open(config: &WebConfig) -> anyhow::Result<Self> {
        let db = Database::open(config.db_path())?;
        let server = Self::with_database(
            db,
            config.stream(),
            config.socket(),
            config.job_lease(),
            config.claim_wait_max(),
        );
        Ok(server.with_artifacts(config.artifacts_path()))
    }

    pub fn with_database(
        db: Database,
        stream: StreamConfig,
        socket: SocketConfig,
        job_lease: Duration,
        claim_wait_max: Duration,
    ) -> Self {
        let store: Arc<dyn RunStore> = Arc::new(SqliteRunStore::new(db.clone()));
        let queue = JobQueue::new(db.clone(), job_lease);
        Self {
            state: Arc::new(AppState {
                streams: StreamManager::with_leases(store, queue.clone(), stream),
                queue,
                catalog: ScenarioCatalog::new(db),
                socket,
                claim_wait_max,
            }),
            artifacts: None,
        }
    }

    /// Serve screenshots, videos and traces recorded by workers under `/artifacts`
    pub fn with_artifacts(mut self, dir: PathBuf) -> Self {
        self.artifacts = Some(dir);
        self
    }

    pub fn streams(&self) -> Arc<StreamManager> {
        self.state.streams.clone()
    }

    /// Create router
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/api/health", get(health_handler))
            .route("/api/stats", get(stats_handler))
            // Scenarios
            .route(
                "/api/scenarios/:scenario_id",
                get(get_scenario_handler).put(put_scenario_handler),
            )
            // Runs
            .route("/api/runs", get(list_runs_handler).post(submit_run_handler))
            .route("/api/runs/:run_id", get(get_run_handler))
            .route("/api/runs/:run_id/stream", get(stream_handler))
            .route("/api/runs/:run_id/events", post(ingest_events_handler))
            // Worker dispatch
            .route("/api/jobs/claim", post(claim_job_handler))
            .route("/api/jobs/:run_id/ack", post(ack_job_handler));
        if let Some(dir) = &self.artifacts {
            router = router.nest_service("/artifacts", ServeDir::new(dir));
        }
        router
            .fallback(not_found_handler)
            .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Start the web server; returns after `shutdown` is cancelled
    pub async fn serve(self, addr: SocketAddr, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!("Runcast server starting on http://{}", addr);

        let flusher = tokio::spawn(self.streams().run_flusher(shutdown.clone()));

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let stop = shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await?;

        shutdown.cancel();
        flusher.await?;
        Ok(())
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "runcast-web",
        "version": runcast_common::VERSION,
    }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(serde_json::json!({
        "streams": state.streams.stats(),
        "queue": state.queue.depth()?,
    })))
}

async fn not_found_handler() -> ApiError {
    ApiError::NotFound("no such endpoint".to_string())
}

async fn put_scenario_handler(
    State(state): State<Arc<AppState>>,
    Path(scenario_id): Path<String>,
    Json(mut scenario): Json<Scenario>,
) -> ApiResult<Json<Scenario>> {
    scenario.id = scenario_id;
    state.catalog.put(&scenario)?;
    info!("Stored scenario {} ({} steps)", scenario.id, scenario.steps.len());
    Ok(Json(scenario))
}

async fn get_scenario_handler(
    State(state): State<Arc<AppState>>,
    Path(scenario_id): Path<String>,
) -> ApiResult<Json<Scenario>> {
    state
        .catalog
        .get(&scenario_id)?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("scenario {} not found", scenario_id)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub scenario_id: String,
    #[serde(default)]
    pub run_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub run_id: String,
    pub run: Run,
}

/// Job submission: create the PENDING run, then enqueue its job. Both steps
/// are idempotent on the run id.
async fn submit_run_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitRequest>,
) -> ApiResult<Response> {
    let scenario = state
        .catalog
        .get(&req.scenario_id)?
        .ok_or_else(|| ApiError::NotFound(format!("scenario {} not found", req.scenario_id)))?;

    let run_id = match req.run_id {
        Some(id) if id.trim().is_empty() => {
            return Err(ApiError::BadRequest("runId must not be empty".to_string()))
        }
        Some(id) => id,
        None => Uuid::new_v4().to_string(),
    };

    let job = Job::for_scenario(run_id.clone(), &scenario);
    let now = now_millis();
    let pending = Run::pending(&job, now);

    if state.store().create_if_absent(&pending)? {
        state.queue.enqueue(&job)?;
        info!("Submitted run {} of scenario {}", run_id, scenario.id);
        let mut run = pending;
        normalize(&mut run, now);
        return Ok((StatusCode::CREATED, Json(SubmitResponse { run_id, run })).into_response());
    }

    let mut existing = state
        .streams
        .snapshot(&run_id)?
        .ok_or_else(|| ApiError::Internal(format!("run {} vanished", run_id)))?;
    if existing.scenario_id != scenario.id {
        return Err(ApiError::Conflict(format!(
            "run {} belongs to scenario {}",
            run_id, existing.scenario_id
        )));
    }
    if !existing.is_terminal() {
        // Covers a crash between run creation and enqueue
        state.queue.enqueue(&job)?;
    }
    debug!("Run {} already submitted", run_id);
    normalize(&mut existing, now);
    Ok((StatusCode::OK, Json(SubmitResponse { run_id, run: existing })).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_list_limit")]
    pub limit: usize,
}

fn default_list_limit() -> usize {
    50
}

async fn list_runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Run>>> {
    let now = now_millis();
    let mut runs = state.store().list(query.limit.min(1000))?;
    for run in &mut runs {
        normalize(run, now);
    }
    Ok(Json(runs))
}

/// Snapshot endpoint
async fn get_run_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<Run>> {
    let mut run = state
        .streams
        .snapshot(&run_id)?
        .ok_or_else(|| ApiError::NotFound(format!("run {} not found", run_id)))?;
    normalize(&mut run, now_millis());
    Ok(Json(run))
}

/// Subscribe endpoint
async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    if state.streams.snapshot(&run_id)?.is_none() {
        return Err(ApiError::NotFound(format!("run {} not found", run_id)));
    }
    let streams = state.streams.clone();
    let socket = state.socket.clone();
    Ok(ws.on_upgrade(move |ws| viewer::serve_viewer(ws, streams, run_id, socket)))
}

#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub accepted: usize,
    pub duplicates: usize,
}

/// Worker ingest: one event or an array of events, published in order
async fn ingest_events_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<IngestResponse>> {
    let raw = match body {
        serde_json::Value::Array(items) => items,
        single => vec![single],
    };

    let mut events = Vec::with_capacity(raw.len());
    for value in raw {
        let event: RunEvent = serde_json::from_value(value)
            .map_err(|e| ApiError::BadRequest(format!("invalid event: {}", e)))?;
        if event.run_id() != run_id {
            return Err(ApiError::BadRequest(format!(
                "event for run {} posted to run {}",
                event.run_id(),
                run_id
            )));
        }
        events.push(event);
    }

    let mut response = IngestResponse::default();
    for event in events {
        match state.streams.publish(&run_id, event).await? {
            Published::Delivered { .. } => response.accepted += 1,
            Published::Duplicate => response.duplicates += 1,
        }
    }
    Ok(Json(response))
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub worker_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_ms: Option<u64>,
}

/// Bounded long-poll for the next job. Jobs whose run already finished are
/// acked and skipped.
async fn claim_job_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ClaimRequest>,
) -> ApiResult<Response> {
    let wait = req
        .wait_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_CLAIM_WAIT)
        .min(state.claim_wait_max);
    let deadline = Instant::now() + wait;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let Some(job) = state.queue.dequeue(&req.worker_id, remaining).await? else {
            return Ok(StatusCode::NO_CONTENT.into_response());
        };

        let finished = state
            .streams
            .snapshot(&job.run_id)?
            .map_or(false, |run| run.is_terminal());
        if finished {
            info!("Run {} already finished, acking redelivered job", job.run_id);
            state.queue.ack(&job.run_id)?;
            continue;
        }

        info!(
            "Dispatched run {} to {} (attempt {})",
            job.run_id, req.worker_id, job.attempt
        );
        return Ok(Json(job).into_response());
    }
}

async fn ack_job_handler(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.queue.ack(&run_id)? {
        return Err(ApiError::NotFound(format!("no job for run {}", run_id)));
    }
    debug!("Job for run {} acked", run_id);
    Ok(Json(serde_json::json!({ "acked": true })))
}
