//! HTTP API for Tether: task producers and queries, the resume gateway,
//! permission inspection and reload, and a live event stream.
//!
//! Built with axum. Every handler works against the shared database handle
//! the scheduler uses, so the API can run in the same process as `tether run`.

mod sse;

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    routing::{get, post},
};
use redb::Database;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tether_core::TetherError;
use tether_core::checkpoint::{Checkpoint, ResumeValue};
use tether_core::permission::PolicySnapshot;
use tether_core::task::{Comment, Metadata, NewTask, Task, TaskId, TaskStatus, TaskUpdate};
use tether_db::checkpoint_store::CheckpointStore;
use tether_db::task_store::TaskStore;
use tether_runner::{EventBus, PermissionService, ResumeGateway};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Comment author used when a producer does not name one.
const DEFAULT_AUTHOR: &str = "producer";

/// Shared application state for API handlers.
///
/// Holds the database handle opened once at startup; redb is exclusive, so
/// `tether run --serve` hands the scheduler's handle in here.
pub struct ApiState {
    pub db: Arc<Database>,
    pub event_bus: EventBus,
    pub permissions: Arc<PermissionService>,
    gateway: ResumeGateway,
}

impl ApiState {
    pub fn new(db: Arc<Database>, event_bus: EventBus, permissions: Arc<PermissionService>) -> Self {
        Self {
            gateway: ResumeGateway::new(Arc::clone(&db), event_bus.clone()),
            db,
            event_bus,
            permissions,
        }
    }

    fn db(&self) -> &Database {
        &self.db
    }
}

/// Build the axum router with all API routes.
pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health_check))
        .route("/api/v1/status", get(status))
        .route("/api/v1/tasks", get(list_tasks).post(create_task))
        .route("/api/v1/tasks/{id}", get(get_task).patch(update_task))
        .route("/api/v1/tasks/{id}/checkpoint", get(get_checkpoint))
        .route("/api/v1/tasks/{id}/respond", post(respond))
        .route("/api/v1/permissions", get(permissions))
        .route("/api/v1/permissions/reload", post(reload_permissions))
        .route("/api/v1/events/stream", get(sse::event_stream))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the API server.
pub async fn serve(state: Arc<ApiState>, bind_addr: &str) -> anyhow::Result<()> {
    let app = api_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "starting API server");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Start the API server with a graceful shutdown signal.
///
/// When the token is cancelled the server stops accepting connections and
/// finishes in-flight requests. `tether run --serve` uses this so the API
/// stops together with the scheduler.
pub async fn serve_with_shutdown(
    state: Arc<ApiState>,
    bind_addr: &str,
    shutdown: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    let app = api_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "starting API server (with graceful shutdown)");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    tracing::info!("API server shut down gracefully");
    Ok(())
}

// ─── Error type ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    kind: &'static str,
    error: anyhow::Error,
}

impl AppError {
    fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "bad_request",
            error: anyhow::anyhow!(msg.into()),
        }
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        if self.status.is_server_error() {
            tracing::error!(error = %format!("{:#}", self.error), "request failed");
        }
        let body = serde_json::json!({
            "error": format!("{:#}", self.error),
            "kind": self.kind,
        });
        (self.status, Json(body)).into_response()
    }
}

/// Body rejections and domain rejections map to client errors; anything
/// else is a 500.
impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(e: E) -> Self {
        let error = e.into();
        if let Some(rejection) = error.downcast_ref::<JsonRejection>() {
            return Self::bad_request(rejection.body_text());
        }
        let (status, kind) = match TetherError::find(&error) {
            Some(e @ TetherError::NotFound { .. }) => (StatusCode::NOT_FOUND, e.kind()),
            Some(
                e @ (TetherError::InvalidResume { .. }
                | TetherError::InvalidTransition { .. }
                | TetherError::TerminalTask { .. }
                | TetherError::ClaimConflict { .. }
                | TetherError::SlotBusy { .. }),
            ) => (StatusCode::CONFLICT, e.kind()),
            Some(e @ TetherError::PermissionConfig(_)) => (StatusCode::UNPROCESSABLE_ENTITY, e.kind()),
            Some(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.kind()),
            None => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        Self {
            status,
            kind,
            error,
        }
    }
}

fn parse_id(raw: &str) -> Result<TaskId, AppError> {
    raw.parse::<TaskId>()
        .map_err(|_| AppError::bad_request(format!("invalid task id '{raw}'")))
}

fn parse_status(raw: &str) -> Result<TaskStatus, AppError> {
    raw.parse::<TaskStatus>().map_err(AppError::bad_request)
}

// ─── Health & Status ─────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
struct StatusResponse {
    healthy: bool,
    task_counts: BTreeMap<String, usize>,
    in_progress: Option<TaskId>,
    /// Tasks parked on a human, oldest first.
    waiting: Vec<TaskId>,
    permissions_version: u64,
    /// Set while the permission engine is failing closed.
    permissions_error: Option<String>,
}

async fn status(State(state): State<Arc<ApiState>>) -> Result<Json<StatusResponse>, AppError> {
    let store = TaskStore::new(state.db());
    let counts = store.status_counts()?;
    let in_progress = store.in_progress()?.map(|t| t.id);
    let mut waiting = store.list(Some(TaskStatus::NeedsReview))?;
    waiting.sort_by_key(|t| (t.updated_at, t.id));
    let snapshot = state.permissions.snapshot();

    Ok(Json(StatusResponse {
        healthy: snapshot.config_error.is_none(),
        task_counts: counts,
        in_progress,
        waiting: waiting.into_iter().map(|t| t.id).collect(),
        permissions_version: snapshot.version,
        permissions_error: snapshot.config_error.clone(),
    }))
}

// ─── Tasks ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TaskListQuery {
    status: Option<String>,
}

async fn list_tasks(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<Vec<Task>>, AppError> {
    let filter = query.status.as_deref().map(parse_status).transpose()?;
    let tasks = TaskStore::new(state.db()).list(filter)?;
    Ok(Json(tasks))
}

async fn get_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Task>, AppError> {
    let id = parse_id(&id)?;
    Ok(Json(TaskStore::new(state.db()).require(id)?))
}

#[derive(Deserialize)]
struct CreateTaskRequest {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    metadata: Metadata,
}

async fn create_task(
    State(state): State<Arc<ApiState>>,
    payload: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Task>), AppError> {
    let Json(req) = payload?;
    if req.title.trim().is_empty() {
        return Err(AppError::bad_request("title must not be empty"));
    }

    let new = NewTask {
        title: req.title,
        description: req.description,
        tags: req.tags,
        metadata: req.metadata,
    };
    let task = TaskStore::new(state.db()).create(new)?;
    tracing::info!(task_id = %task.id, "task created via API");
    Ok((StatusCode::CREATED, Json(task)))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CommentInput {
    Text(String),
    Authored {
        #[serde(default)]
        author: Option<String>,
        text: String,
    },
}

#[derive(Deserialize)]
struct UpdateTaskRequest {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    comment: Option<CommentInput>,
    #[serde(default)]
    metadata: Option<Metadata>,
}

async fn update_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    payload: Result<Json<UpdateTaskRequest>, JsonRejection>,
) -> Result<Json<Task>, AppError> {
    let id = parse_id(&id)?;
    let Json(req) = payload?;

    let update = TaskUpdate {
        status: req.status.as_deref().map(parse_status).transpose()?,
        comment: req.comment.map(|c| match c {
            CommentInput::Text(text) => Comment::new(DEFAULT_AUTHOR, text),
            CommentInput::Authored { author, text } => {
                Comment::new(author.unwrap_or_else(|| DEFAULT_AUTHOR.to_string()), text)
            }
        }),
        metadata: req.metadata,
    };
    if update.is_empty() {
        return Err(AppError::bad_request("update names no status, comment or metadata"));
    }

    let store = TaskStore::new(state.db());
    let before = store.require(id)?.status;
    let task = store.update(id, update)?;
    if task.status != before {
        state
            .event_bus
            .emit(tether_core::event::EventKind::TaskStateChange {
                task_id: id,
                from: before,
                to: task.status,
            });
    }
    Ok(Json(task))
}

async fn get_checkpoint(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Checkpoint>, AppError> {
    let id = parse_id(&id)?;
    let checkpoint = CheckpointStore::new(state.db())
        .get(id)?
        .ok_or_else(|| TetherError::not_found(format!("checkpoint for {id}")))?;
    Ok(Json(checkpoint))
}

// ─── Resume gateway ──────────────────────────────────────────────────────

/// `{"response": "yes"}` or `{"response": {"decision": "approve", "message": "..."}}`.
#[derive(Deserialize)]
struct RespondRequest {
    response: ResumeValue,
}

async fn respond(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    payload: Result<Json<RespondRequest>, JsonRejection>,
) -> Result<Json<Task>, AppError> {
    let id = parse_id(&id)?;
    let Json(req) = payload?;
    Ok(Json(state.gateway.respond(id, req.response)?))
}

// ─── Permissions ─────────────────────────────────────────────────────────

async fn permissions(State(state): State<Arc<ApiState>>) -> Json<PolicySnapshot> {
    Json(PolicySnapshot::clone(&state.permissions.snapshot()))
}

#[derive(Serialize)]
struct ReloadResponse {
    version: u64,
}

async fn reload_permissions(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<ReloadResponse>, AppError> {
    let version = state.permissions.reload()?;
    Ok(Json(ReloadResponse { version }))
}
