use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::db::{DbHandle, ToggleChange};
#[cfg(test)]
use super::db::PipelineDb;
use super::dispatch::TaskDispatcher;
use super::models::{ApprovalStatus, RunStatus};
use super::state::phase_definition;
use crate::errors::PipelineError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub dispatcher: TaskDispatcher,
}

impl AppState {
    pub fn new(dispatcher: TaskDispatcher) -> Self {
        Self {
            db: dispatcher.driver().db().clone(),
            dispatcher,
        }
    }
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreatePipelineRequest {
    pub subject: String,
    pub topic: Option<String>,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub auto_start: bool,
}

#[derive(Deserialize)]
pub struct ListPipelinesQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Deserialize)]
pub struct ResolveApprovalRequest {
    pub decision: String,
    pub notes: Option<String>,
    pub edited_output: Option<Value>,
}

#[derive(Deserialize)]
pub struct ToggleUpdate {
    pub phase_number: u32,
    pub requires_approval: Option<bool>,
    pub is_enabled: Option<bool>,
}

#[derive(Deserialize)]
pub struct LearningQuery {
    pub subject: Option<String>,
    pub phase: Option<u32>,
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct ScoreRequest {
    pub score: f64,
}

const DEFAULT_PAGE: i64 = 50;
const MAX_PAGE: i64 = 500;

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            PipelineError::InvalidArgument(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::Internal(format!("{:#}", err))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/pipelines", get(list_pipelines).post(create_pipeline))
        .route("/api/pipelines/stats", get(pipeline_stats))
        .route("/api/pipelines/{id}", get(get_pipeline))
        .route("/api/pipelines/{id}/tasks", get(list_pipeline_tasks))
        .route("/api/pipelines/{id}/start", post(start_pipeline))
        .route("/api/pipelines/{id}/stop", post(stop_pipeline))
        .route("/api/pipelines/{id}/restart", post(restart_pipeline))
        .route("/api/pipelines/{id}/phases/{phase}/retry", post(retry_phase))
        .route("/api/approvals/pending", get(list_pending_approvals))
        .route("/api/approvals/{id}", get(get_approval))
        .route("/api/approvals/{id}/resolve", post(resolve_approval))
        .route("/api/toggles", get(list_toggles).put(update_toggles))
        .route("/api/learning", get(list_learning))
        .route("/api/learning/{id}/score", put(score_learning_entry))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

fn page_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_pipelines(
    State(state): State<SharedState>,
    Query(query): Query<ListPipelinesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<RunStatus>)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let limit = page_limit(query.limit);
    let offset = query.offset.unwrap_or(0).max(0);
    let runs = state
        .db
        .call(move |db| db.list_runs(status, limit, offset))
        .await
        .map_err(internal)?;
    Ok(Json(runs))
}

async fn create_pipeline(
    State(state): State<SharedState>,
    Json(req): Json<CreatePipelineRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state
        .dispatcher
        .driver()
        .create_run(&req.subject, req.topic.as_deref(), req.config)
        .await?;
    let task = if req.auto_start {
        Some(state.dispatcher.enqueue_start(run.id).await?)
    } else {
        None
    };
    Ok((StatusCode::CREATED, Json(json!({"run": run, "task": task}))))
}

async fn pipeline_stats(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state
        .db
        .call(|db| db.run_stats())
        .await
        .map_err(internal)?;
    Ok(Json(stats))
}

async fn get_pipeline(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state
        .db
        .call(move |db| db.run_detail(id))
        .await
        .map_err(internal)?;
    match detail {
        Some(detail) => Ok(Json(detail)),
        None => Err(PipelineError::not_found("Run", id).into()),
    }
}

async fn list_pipeline_tasks(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let tasks = state
        .db
        .call(move |db| {
            if db.get_run(id)?.is_none() {
                return Ok(None);
            }
            db.list_tasks_for_run(id).map(Some)
        })
        .await
        .map_err(internal)?
        .ok_or_else(|| PipelineError::not_found("Run", id))?;
    Ok(Json(tasks))
}

async fn start_pipeline(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.dispatcher.driver().check_startable(id).await?;
    let task = state.dispatcher.enqueue_start(id).await?;
    Ok((StatusCode::ACCEPTED, Json(task)))
}

async fn stop_pipeline(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.dispatcher.driver().stop(id).await?;
    Ok(Json(run))
}

async fn restart_pipeline(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.dispatcher.driver().restart(id).await?;
    Ok(Json(run))
}

async fn retry_phase(
    State(state): State<SharedState>,
    Path((id, phase)): Path<(i64, u32)>,
) -> Result<impl IntoResponse, ApiError> {
    state.dispatcher.driver().check_retryable(id, phase).await?;
    let task = state.dispatcher.enqueue_retry(id, phase).await?;
    Ok((StatusCode::ACCEPTED, Json(task)))
}

async fn list_pending_approvals(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let details = state
        .db
        .call(|db| db.pending_approval_details())
        .await
        .map_err(internal)?;
    Ok(Json(details))
}

async fn get_approval(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state
        .db
        .call(move |db| {
            db.get_approval(id)?
                .map(|approval| db.approval_detail(approval))
                .transpose()
        })
        .await
        .map_err(internal)?
        .ok_or_else(|| PipelineError::not_found("Approval", id))?;
    Ok(Json(detail))
}

async fn resolve_approval(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<ResolveApprovalRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let approval = state
        .dispatcher
        .driver()
        .gate()
        .resolve(id, &req.decision, req.notes, req.edited_output)
        .await?;
    let task = if matches!(approval.status, ApprovalStatus::Approved | ApprovalStatus::Edited) {
        Some(
            state
                .dispatcher
                .enqueue_resume(approval.run_id, approval.phase_number)
                .await?,
        )
    } else {
        None
    };
    Ok(Json(json!({"approval": approval, "task": task})))
}

async fn list_toggles(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let toggles = state
        .db
        .call(|db| db.list_phase_toggles())
        .await
        .map_err(internal)?;
    Ok(Json(toggles))
}

async fn update_toggles(
    State(state): State<SharedState>,
    Json(updates): Json<Vec<ToggleUpdate>>,
) -> Result<impl IntoResponse, ApiError> {
    let mut changes = Vec::with_capacity(updates.len());
    for update in updates {
        let def = phase_definition(update.phase_number).ok_or_else(|| {
            ApiError::BadRequest(format!("unknown phase {}", update.phase_number))
        })?;
        changes.push(ToggleChange {
            phase_number: update.phase_number,
            phase_name: def.name.to_string(),
            requires_approval: update.requires_approval,
            is_enabled: update.is_enabled,
        });
    }
    let toggles = state
        .db
        .call(move |db| db.update_phase_toggles(&changes))
        .await
        .map_err(internal)?;
    Ok(Json(toggles))
}

async fn list_learning(
    State(state): State<SharedState>,
    Query(query): Query<LearningQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = page_limit(query.limit);
    let entries = state
        .db
        .call(move |db| db.list_learning_entries(query.subject.as_deref(), query.phase, limit))
        .await
        .map_err(internal)?;
    Ok(Json(entries))
}

async fn score_learning_entry(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<ScoreRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !req.score.is_finite() {
        return Err(ApiError::BadRequest("score must be a finite number".into()));
    }
    let entry = state
        .db
        .call(move |db| {
            if !db.set_learning_score(id, req.score)? {
                return Ok(None);
            }
            db.get_learning_entry(id)
        })
        .await
        .map_err(internal)?
        .ok_or_else(|| PipelineError::not_found("LearningLogEntry", id))?;
    Ok(Json(entry))
}

// ── Tests ─────────────────────────────────────────────────────────────
