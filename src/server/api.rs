use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::errors::{StoreError, TransitionError};
use crate::pipeline::Transitions;
use crate::store::{ArtifactStore, SecretStore, artifact_key};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub transitions: Transitions,
    pub secrets: Arc<dyn SecretStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateJobRequest {
    pub owner_id: String,
    pub title: String,
    #[serde(default)]
    pub brief: String,
}

#[derive(Deserialize)]
pub struct UpdateBriefRequest {
    pub brief: String,
}

#[derive(Deserialize)]
pub struct PutSecretRequest {
    pub value: String,
}

#[derive(Serialize)]
pub struct FileList {
    pub files: Vec<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<TransitionError> for ApiError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            TransitionError::InvalidState { .. } => ApiError::Conflict(err.to_string()),
            TransitionError::Invalid(_) => ApiError::BadRequest(err.to_string()),
            TransitionError::Enqueue(_) | TransitionError::Store(_) => {
                warn!(error = %err, "transition failed");
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            StoreError::InvalidKey(_) => ApiError::BadRequest(err.to_string()),
            _ => {
                warn!(error = %err, "store request failed");
                ApiError::Internal(err.to_string())
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/jobs", post(create_job))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/brief", patch(update_brief))
        .route("/api/jobs/{id}/start", post(start_job))
        .route("/api/jobs/{id}/approve", post(approve_job))
        .route("/api/jobs/{id}/revise", post(revise_job))
        .route("/api/jobs/{id}/retry", post(retry_job))
        .route("/api/jobs/{id}/files", get(list_files))
        .route("/api/jobs/{id}/files/{*path}", get(get_file))
        .route("/api/owners/{owner}/secrets/{name}", put(put_secret))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_job(
    State(state): State<SharedState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .transitions
        .create_job(&req.owner_id, &req.title, &req.brief)
        .await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.transitions.get(&id).await?))
}

async fn update_brief(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateBriefRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.transitions.update_brief(&id, &req.brief).await?))
}

async fn start_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.transitions.start(&id).await?))
}

async fn approve_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.transitions.approve(&id).await?))
}

async fn revise_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.transitions.revise(&id).await?))
}

async fn retry_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.transitions.retry(&id).await?))
}

async fn list_files(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.transitions.get(&id).await?;
    Ok(Json(FileList {
        files: job.generated_files,
    }))
}

async fn get_file(
    State(state): State<SharedState>,
    Path((id, path)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.transitions.get(&id).await?;
    // Only paths from the manifest; anything else is a 404 without touching storage.
    if !job.generated_files.iter().any(|p| p == &path) {
        return Err(ApiError::NotFound(format!("File not found: {path}")));
    }
    let bytes = state
        .artifacts
        .get(&artifact_key(&job.owner_id, &job.id, &path))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("File not found: {path}")))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        bytes,
    ))
}

async fn put_secret(
    State(state): State<SharedState>,
    Path((owner, name)): Path<(String, String)>,
    Json(req): Json<PutSecretRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.value.trim().is_empty() {
        return Err(ApiError::BadRequest("Secret value must not be empty".into()));
    }
    state.secrets.write_secret(&owner, &name, &req.value).await?;
    Ok(StatusCode::NO_CONTENT)
}
