use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::AppState;
use crate::error::OrchestratorError;
use crate::models::*;
use crate::orchestrator::ProcessingStarted;
use crate::snapshot::CancelOutcome;

type ApiResult<T> = Result<T, (StatusCode, String)>;

// ============================================================
// Error Handling
// ============================================================

/// Log an internal error and return a sanitized response to the client.
fn internal_error(e: impl std::fmt::Display) -> (StatusCode, String) {
    tracing::error!("Internal error: {}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal server error".to_string(),
    )
}

fn orchestrator_error(e: OrchestratorError) -> (StatusCode, String) {
    match e {
        OrchestratorError::StoryNotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
        OrchestratorError::AlreadyProcessing { .. } | OrchestratorError::AlreadyCompleted(_) => {
            tracing::warn!("Rejected request: {}", e);
            (StatusCode::CONFLICT, e.to_string())
        }
        other => internal_error(other),
    }
}

fn not_found(what: &str) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, format!("{} not found", what))
}

fn require_project(state: &AppState, id: Uuid) -> ApiResult<Project> {
    state
        .db
        .get_project(id)
        .map_err(internal_error)?
        .ok_or_else(|| not_found("Project"))
}

fn require_story(state: &AppState, id: Uuid) -> ApiResult<Story> {
    state
        .db
        .get_story(id)
        .map_err(internal_error)?
        .ok_or_else(|| not_found("Story"))
}

// ============================================================
// Health
// ============================================================

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

// ============================================================
// Projects
// ============================================================

pub async fn create_project(
    State(state): State<AppState>,
    Json(input): Json<CreateProjectInput>,
) -> ApiResult<(StatusCode, Json<Project>)> {
    state
        .db
        .create_project(input)
        .map(|p| (StatusCode::CREATED, Json(p)))
        .map_err(internal_error)
}

pub async fn get_project(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Project>> {
    require_project(&state, id).map(Json)
}

pub async fn list_files(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<Vec<ProjectFile>>> {
    require_project(&state, project_id)?;
    state
        .db
        .get_project_files(project_id)
        .map(Json)
        .map_err(internal_error)
}

pub async fn upsert_file(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(input): Json<UpsertFileInput>,
) -> ApiResult<Json<ProjectFile>> {
    require_project(&state, project_id)?;
    if input.path.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "File path is required".to_string()));
    }
    state
        .db
        .upsert_file(project_id, &input.path, &input.content)
        .map(Json)
        .map_err(internal_error)
}

// ============================================================
// Stories
// ============================================================

pub async fn create_story(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
    Json(input): Json<CreateStoryInput>,
) -> ApiResult<(StatusCode, Json<Story>)> {
    require_project(&state, project_id)?;
    state
        .db
        .create_story(project_id, input)
        .map(|s| (StatusCode::CREATED, Json(s)))
        .map_err(internal_error)
}

pub async fn list_stories(
    State(state): State<AppState>,
    Path(project_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Story>>> {
    require_project(&state, project_id)?;
    state
        .db
        .get_stories_by_project(project_id)
        .map(Json)
        .map_err(internal_error)
}

pub async fn get_story(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Story>> {
    require_story(&state, id).map(Json)
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Path(story_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Task>>> {
    require_story(&state, story_id)?;
    state
        .db
        .get_tasks_by_story(story_id)
        .map(Json)
        .map_err(internal_error)
}

pub async fn list_events(
    State(state): State<AppState>,
    Path(story_id): Path<Uuid>,
) -> ApiResult<Json<Vec<AgentLog>>> {
    let story = require_story(&state, story_id)?;
    state
        .db
        .get_agent_logs(story.project_id, Some(story_id))
        .map(Json)
        .map_err(internal_error)
}

pub async fn process_story(
    State(state): State<AppState>,
    Path(story_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<ProcessingStarted>)> {
    state
        .orchestrator
        .process_story(story_id)
        .await
        .map(|started| (StatusCode::ACCEPTED, Json(started)))
        .map_err(orchestrator_error)
}

#[derive(Debug, Deserialize)]
pub struct CancelInput {
    #[serde(default = "default_rollback")]
    pub rollback: bool,
}

fn default_rollback() -> bool {
    true
}

pub async fn cancel_story(
    State(state): State<AppState>,
    Path(story_id): Path<Uuid>,
    input: Option<Json<CancelInput>>,
) -> ApiResult<Json<CancelOutcome>> {
    // A bare POST cancels with rollback.
    let rollback = input.map_or_else(default_rollback, |Json(input)| input.rollback);
    state
        .orchestrator
        .cancel(story_id, rollback)
        .await
        .map(Json)
        .map_err(orchestrator_error)
}
