use std::{sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    candidates::{CandidatePool, Sampling},
    config::{RunConfig, ScanMode},
    error::RunError,
    ranker::{self, RankOptions, RankedEntry},
    scheduler::{RunState, Scheduler},
    types::{AddressFamily, Progress, ScanReport},
};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<RwLock<ServerState>>,
    run: RunState,
    base: Arc<RunConfig>,
    pool: Arc<CandidatePool>,
}

#[derive(Debug, Default)]
struct ServerState {
    phase: Phase,
    report: Option<ScanReport>,
    /// Config of the most recent run, used to rank its report.
    config: Option<RunConfig>,
    error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Running,
    Done,
    Cancelled,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub completed: u64,
    pub total: u64,
    pub failures: u64,
    pub percent: u64,
    pub state: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-run overrides on top of the server's base configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ScanRequest {
    pub max_latency_ms: Option<u64>,
    pub max_candidates: Option<usize>,
    pub concurrency: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub ports: Vec<u16>,
    pub families: Vec<AddressFamily>,
    pub regions: Vec<String>,
    pub mode: Option<ScanMode>,
    pub shuffle: Option<bool>,
    pub seed: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ResultsResponse {
    pub started_at: String,
    pub finished_at: String,
    pub duration_ms: u64,
    pub cancelled: bool,
    pub progress: Progress,
    pub success_rate: f64,
    pub entries: Vec<RankedEntry>,
}

impl AppState {
    pub fn new(base: RunConfig, pool: CandidatePool, run: RunState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ServerState::default())),
            run,
            base: Arc::new(base),
            pool: Arc::new(pool),
        }
    }

    async fn status(&self) -> Status {
        let s = self.inner.read().await;
        let p = self.run.progress();
        Status {
            completed: p.completed,
            total: p.total,
            failures: p.failures,
            percent: p.percent(),
            state: s.phase,
            error: s.error.clone(),
        }
    }

    fn config_for(&self, req: ScanRequest) -> Result<RunConfig, RunError> {
        let mut cfg = (*self.base).clone();
        if let Some(v) = req.max_latency_ms {
            cfg.max_latency_ms = v;
        }
        if req.max_candidates.is_some() {
            cfg.max_candidates = req.max_candidates;
        }
        if let Some(v) = req.concurrency {
            cfg.concurrency = v;
        }
        if let Some(v) = req.timeout_ms {
            cfg.timeout = Duration::from_millis(v);
        }
        if !req.ports.is_empty() {
            cfg.ports = req.ports;
        }
        if !req.families.is_empty() {
            cfg.families = req.families;
        }
        if !req.regions.is_empty() {
            cfg.regions = req.regions;
        }
        if let Some(m) = req.mode {
            cfg.mode = m;
        }
        match (req.shuffle, req.seed) {
            (Some(false), _) => cfg.sampling = Sampling::Ordered,
            (Some(true), seed) | (None, seed @ Some(_)) => cfg.sampling = Sampling::Shuffled { seed },
            (None, None) => {}
        }
        cfg.validated()
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/scan", post(post_scan))
        .route("/cancel", post(post_cancel))
        .route("/results", get(get_results))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "status API listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(app.status().await))
}

async fn get_results(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    let (Some(report), Some(cfg)) = (s.report.as_ref(), s.config.as_ref()) else {
        return StatusCode::NO_CONTENT.into_response();
    };
    let options = RankOptions {
        families: cfg.families.clone(),
        regions: cfg.regions.clone(),
        region_cap: cfg.effective_region_cap(),
        ..RankOptions::default()
    };
    let out = ResultsResponse {
        started_at: report.started_at.clone(),
        finished_at: report.finished_at.clone(),
        duration_ms: report.duration_ms,
        cancelled: report.cancelled,
        progress: report.progress,
        success_rate: report.success_rate(),
        entries: ranker::rank(&report.results, &options, cfg.max_latency_ms as f64),
    };
    (StatusCode::OK, Json(out)).into_response()
}

async fn post_cancel(State(app): State<AppState>) -> impl IntoResponse {
    if !app.run.is_running() {
        return (StatusCode::CONFLICT, "no scan in progress").into_response();
    }
    app.run.cancel();
    info!("cancellation requested");
    (StatusCode::ACCEPTED, Json(app.status().await)).into_response()
}

async fn post_scan(State(app): State<AppState>, Json(req): Json<ScanRequest>) -> impl IntoResponse {
    if app.run.is_running() {
        return (StatusCode::CONFLICT, RunError::AlreadyRunning.to_string()).into_response();
    }
    let cfg = match app.config_for(req) {
        Ok(c) => c,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let candidates = match app.pool.select(&cfg.families, cfg.max_candidates, cfg.sampling) {
        Ok(c) => c,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let scheduler = match Scheduler::from_config(cfg.clone()) {
        Ok(s) => s,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response(),
    };

    // claimed before 202; the stored config belongs to this run only
    let total = candidates.len() as u64;
    let guard = match app.run.begin(total) {
        Ok(g) => g,
        Err(e) => return (StatusCode::CONFLICT, e.to_string()).into_response(),
    };

    {
        let mut s = app.inner.write().await;
        s.phase = Phase::Running;
        s.report = None;
        s.config = Some(cfg);
        s.error = None;
    }

    let app2 = app.clone();
    tokio::spawn(async move {
        let res = scheduler.run_claimed(candidates, &guard, None).await;
        let mut s = app2.inner.write().await;
        match res {
            Ok(report) => {
                s.phase = if report.cancelled { Phase::Cancelled } else { Phase::Done };
                s.report = Some(report);
            }
            Err(e) => {
                warn!("scan failed: {e}");
                s.phase = Phase::Error;
                s.error = Some(e.to_string());
            }
        }
        // release only once the report is in place
        drop(guard);
    });

    let accepted = Status {
        completed: 0,
        total,
        failures: 0,
        percent: 0,
        state: Phase::Running,
        error: None,
    };
    (StatusCode::ACCEPTED, Json(accepted)).into_response()
}
