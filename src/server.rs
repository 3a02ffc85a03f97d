use anyhow::{anyhow, Result};
use axum::{
    extract::{Path as RoutePath, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use crate::config::{ProjectSettings, RunnerConfig};
use crate::console::{ConsoleSink, MemoryConsole, TracingConsole};
use crate::core::{BuildKind, BuildRequest, Diagnostic};
use crate::diagnostics::ErrorParserRegistry;
use crate::execution::{Launcher, ProcessLauncher};
use crate::jobs::{BuildJob, JobManager, Operation};
use crate::detection;
use crate::orchestrator::{request_for, BuildOrchestrator};
use crate::project::{FsProjectContext, ProjectContext};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct BuildParams {
    project_root: PathBuf,
    board: Option<String>,
    #[serde(default)]
    kind: BuildKind,
    build_dir: Option<PathBuf>,
    #[serde(default)]
    environment: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct DiagnosticsQuery {
    project_root: PathBuf,
}

#[derive(Debug, Serialize)]
struct JobResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl JobResponse {
    fn error(status: StatusCode, message: String) -> (StatusCode, Json<JobResponse>) {
        (
            status,
            Json(JobResponse {
                status: "error".to_string(),
                job_id: None,
                error: Some(message),
            }),
        )
    }
}

type ApiResult = Result<(StatusCode, Json<JobResponse>), (StatusCode, Json<JobResponse>)>;

#[derive(Clone)]
pub struct AppState {
    config: Arc<RunnerConfig>,
    jobs: JobManager,
    launcher: Arc<dyn Launcher>,
    context: Arc<FsProjectContext>,
    parsers: Arc<ErrorParserRegistry>,
}

impl AppState {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config: Arc::new(config),
            jobs: JobManager::new(),
            launcher: Arc::new(ProcessLauncher::new()),
            context: Arc::new(FsProjectContext::new()),
            parsers: Arc::new(ErrorParserRegistry::default()),
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }
}

async fn validate_params(params: &BuildParams) -> Result<()> {
    if !params.project_root.is_absolute() {
        return Err(anyhow!("project_root must be an absolute path"));
    }

    let is_dir = tokio::fs::metadata(&params.project_root)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if !is_dir {
        return Err(anyhow!(
            "project_root {} is not a directory",
            params.project_root.display()
        ));
    }

    if params.board.as_deref().is_some_and(|b| b.trim().is_empty()) {
        return Err(anyhow!("board must not be empty"));
    }

    if params.build_dir.as_ref().is_some_and(|d| !d.is_absolute()) {
        return Err(anyhow!("build_dir must be an absolute path"));
    }

    Ok(())
}

// Canonical paths, so every spelling of a build directory shares one job lock.
async fn build_request(params: BuildParams, settings: &ProjectSettings) -> Result<BuildRequest> {
    let project_root = detection::canonicalize_lenient(&params.project_root).await;

    let request = match params.board {
        Some(board) => BuildRequest::new(project_root, board).kind(params.kind),
        None => request_for(project_root, settings, params.kind)?,
    };

    let build_dir = match params.build_dir {
        Some(build_dir) => detection::canonicalize_lenient(&build_dir).await,
        None => detection::canonicalize_lenient(request.build_directory()).await,
    };

    Ok(request.build_dir(build_dir).envs(params.environment))
}

async fn submit(state: &AppState, params: BuildParams, operation: Operation) -> ApiResult {
    if let Err(e) = validate_params(&params).await {
        return Err(JobResponse::error(
            StatusCode::BAD_REQUEST,
            format!("invalid request: {}", e),
        ));
    }

    let settings = ProjectSettings::load(&params.project_root)
        .await
        .map_err(|e| JobResponse::error(StatusCode::BAD_REQUEST, e.to_string()))?;
    let request = build_request(params, &settings)
        .await
        .map_err(|e| JobResponse::error(StatusCode::BAD_REQUEST, e.to_string()))?;

    info!(
        "{:?} request for {} (board {})",
        operation,
        request.project_root().display(),
        request.target_id()
    );

    let console = Arc::new(MemoryConsole::new());
    let sinks: Vec<Arc<dyn ConsoleSink>> =
        vec![console.clone() as Arc<dyn ConsoleSink>, Arc::new(TracingConsole)];
    let orchestrator = BuildOrchestrator::new(
        Arc::new(settings),
        state.context.clone(),
        state.launcher.clone(),
        Arc::new(sinks),
    )
    .with_settings(state.config.orchestrator_settings())
    .with_parsers(state.parsers.clone());

    let job_id = state
        .jobs
        .spawn_job(operation, request, Arc::new(orchestrator), console);

    Ok((
        StatusCode::ACCEPTED,
        Json(JobResponse {
            status: "accepted".to_string(),
            job_id: Some(job_id),
            error: None,
        }),
    ))
}

async fn build_handler(
    State(state): State<Arc<AppState>>,
    Json(params): Json<BuildParams>,
) -> ApiResult {
    submit(&state, params, Operation::Build).await
}

async fn clean_handler(
    State(state): State<Arc<AppState>>,
    Json(params): Json<BuildParams>,
) -> ApiResult {
    submit(&state, params, Operation::Clean).await
}

async fn list_jobs_handler(State(state): State<Arc<AppState>>) -> Json<Vec<BuildJob>> {
    Json(state.jobs.list_jobs())
}

async fn job_handler(
    State(state): State<Arc<AppState>>,
    RoutePath(job_id): RoutePath<Uuid>,
) -> Result<Json<BuildJob>, (StatusCode, Json<JobResponse>)> {
    state
        .jobs
        .get_job(&job_id)
        .map(Json)
        .ok_or_else(|| JobResponse::error(StatusCode::NOT_FOUND, format!("job {} not found", job_id)))
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    RoutePath(job_id): RoutePath<Uuid>,
) -> ApiResult {
    if state.jobs.get_job(&job_id).is_none() {
        return Err(JobResponse::error(
            StatusCode::NOT_FOUND,
            format!("job {} not found", job_id),
        ));
    }

    match state.jobs.cancel_job(&job_id) {
        Ok(()) => Ok((
            StatusCode::OK,
            Json(JobResponse {
                status: "cancelled".to_string(),
                job_id: Some(job_id),
                error: None,
            }),
        )),
        Err(e) => {
            error!("Cancel failed: {}", e);
            Err(JobResponse::error(StatusCode::CONFLICT, e.to_string()))
        }
    }
}

async fn diagnostics_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DiagnosticsQuery>,
) -> Json<Vec<Diagnostic>> {
    let project_root = detection::canonicalize_lenient(&query.project_root).await;
    Json(state.context.diagnostics(&project_root))
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "zephyr-runner",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/build", post(build_handler))
        .route("/clean", post(clean_handler))
        .route("/jobs", get(list_jobs_handler))
        .route("/jobs/:id", get(job_handler))
        .route("/jobs/:id/cancel", post(cancel_handler))
        .route("/diagnostics", get(diagnostics_handler))
        .route("/health", get(health_handler))
        .layer(
            ServiceBuilder::new()
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(Duration::from_secs(30)))
                .into_inner(),
        )
        .with_state(Arc::new(state))
}

pub async fn run_server(config: RunnerConfig) -> Result<()> {
    let port = config.port;
    let retention = config.job_retention_secs;
    let state = AppState::new(config);

    let jobs = state.jobs().clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            jobs.cleanup_completed_jobs(retention);
        }
    });

    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("Server running on http://0.0.0.0:{}", port);

    axum::serve(listener, app).await?;

    Ok(())
}
