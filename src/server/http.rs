//! HTTP server exposing the sandbox core.
//!
//! Thin translation layer: handlers parse requests, call into the core
//! components, and map the error taxonomy onto status codes. All state is
//! built once per server instance and injected through `Arc<AppState>`.

use anyhow::Result;
use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::error::SandboxError;
use crate::files::FileStore;
use crate::shell::{ExecOutcome, ProcessRegistry, ShellExecutor, StatusReport};
use crate::supervisor::{ServiceStatus, ServiceSupervisor};

pub struct Server {
    config: Config,
}

struct AppState {
    executor: ShellExecutor,
    files: FileStore,
    supervisor: ServiceSupervisor,
}

impl Server {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            config: config.clone(),
        })
    }

    pub async fn run(&self) -> Result<()> {
        let registry = ProcessRegistry::new();
        let state = Arc::new(AppState {
            executor: ShellExecutor::new(&self.config.sandbox, registry),
            files: FileStore::new(&self.config.sandbox.root)?,
            supervisor: ServiceSupervisor::new(
                &self.config.supervisor,
                self.config.sandbox.shell.clone(),
                Duration::from_secs(self.config.sandbox.kill_grace_secs),
            ),
        });

        let app = router(state);

        let addr: SocketAddr =
            format!("{}:{}", self.config.server.bind, self.config.server.port).parse()?;

        info!("starting sandbox API on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/shell/execute", post(execute_command))
        .route("/api/v1/shell/{process_id}/status", get(process_status))
        .route("/api/v1/shell/{process_id}/input", post(send_process_input))
        .route("/api/v1/shell/{process_id}", delete(kill_process))
        .route("/api/v1/file/read", post(read_file))
        .route("/api/v1/file/write", post(write_file))
        .route("/api/v1/file/search", post(search_files))
        .route("/api/v1/file/replace", post(replace_in_file))
        .route("/api/v1/supervisor/status", get(supervisor_status))
        .route("/api/v1/supervisor/{name}/start", post(start_service))
        .route("/api/v1/supervisor/{name}/stop", post(stop_service))
        .route("/api/v1/supervisor/{name}/restart", post(restart_service))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Error wrapper mapping the taxonomy onto HTTP status codes.
struct ApiError(SandboxError);

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SandboxError::PathViolation { .. } => StatusCode::FORBIDDEN,
            SandboxError::NotFound { .. }
            | SandboxError::ProcessNotFound { .. }
            | SandboxError::ServiceNotFound { .. } => StatusCode::NOT_FOUND,
            SandboxError::ProcessNotAcceptingInput { .. } => StatusCode::CONFLICT,
            SandboxError::InvalidPattern { .. } => StatusCode::BAD_REQUEST,
            SandboxError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            SandboxError::TerminationFailure { .. }
            | SandboxError::ServiceFailure { .. }
            | SandboxError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn health_check() -> &'static str {
    "OK"
}

// Shell endpoints

#[derive(Deserialize)]
struct CommandRequest {
    command: String,
    #[serde(default)]
    timeout: Option<u64>,
}

async fn execute_command(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CommandRequest>,
) -> Json<ExecOutcome> {
    Json(state.executor.execute(&request.command, request.timeout).await)
}

async fn process_status(
    State(state): State<Arc<AppState>>,
    Path(process_id): Path<String>,
) -> Json<StatusReport> {
    Json(state.executor.status(&process_id))
}

#[derive(Deserialize)]
struct InputRequest {
    data: String,
}

async fn send_process_input(
    State(state): State<Arc<AppState>>,
    Path(process_id): Path<String>,
    Json(request): Json<InputRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.executor.send_input(&process_id, &request.data).await?;
    Ok(Json(json!({ "status": "success" })))
}

/// Kill reports its outcome in the body rather than the status line, so
/// automated callers can branch on one field.
async fn kill_process(
    State(state): State<Arc<AppState>>,
    Path(process_id): Path<String>,
) -> Json<serde_json::Value> {
    match state.executor.kill(&process_id).await {
        Ok(()) => Json(json!({ "status": "killed" })),
        Err(SandboxError::ProcessNotFound { .. }) => Json(json!({ "status": "not_found" })),
        Err(e) => Json(json!({ "status": "error", "message": e.to_string() })),
    }
}

// File endpoints

#[derive(Deserialize)]
struct FilePathRequest {
    path: String,
}

#[derive(Deserialize)]
struct FileWriteRequest {
    path: String,
    content: String,
}

#[derive(Deserialize)]
struct FileSearchRequest {
    pattern: String,
}

#[derive(Deserialize)]
struct FileReplaceRequest {
    path: String,
    old_content: String,
    new_content: String,
}

async fn read_file(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FilePathRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let content = state.files.read(&request.path).await?;
    Ok(Json(json!({ "content": content })))
}

async fn write_file(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FileWriteRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.files.write(&request.path, &request.content).await?;
    Ok(Json(json!({ "status": "success" })))
}

async fn search_files(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FileSearchRequest>,
) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.files.search(&request.pattern).await?))
}

async fn replace_in_file(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FileReplaceRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let replacements = state
        .files
        .replace(&request.path, &request.old_content, &request.new_content)
        .await?;
    Ok(Json(json!({ "status": "success", "replacements": replacements })))
}

// Supervisor endpoints

async fn supervisor_status(State(state): State<Arc<AppState>>) -> Json<Vec<ServiceStatus>> {
    Json(state.supervisor.status_all().await)
}

async fn start_service(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.supervisor.start(&name).await?;
    Ok(Json(json!({ "status": "started" })))
}

async fn stop_service(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.supervisor.stop(&name).await?;
    Ok(Json(json!({ "status": "stopped" })))
}

async fn restart_service(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.supervisor.restart(&name).await?;
    Ok(Json(json!({ "status": "restarted" })))
}
