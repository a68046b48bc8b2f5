use std::path::PathBuf;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::health::HealthSample;
use crate::orchestrator::{OrchestratorStats, SessionParams};
use crate::session::{validate_session_id, CloseReason, ResumedSession, SessionInfo, SessionMode};
use crate::shell::ShellInfo;

use super::error::ApiError;
use super::{AppState, USER_HEADER};

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct StatsResponse {
    #[serde(flatten)]
    orchestrator: OrchestratorStats,
    connections: usize,
    health: Option<HealthSample>,
}

pub(super) async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        orchestrator: state.orchestrator.stats(),
        connections: state.shutdown.active_connections(),
        health: state.health.read().clone(),
    })
}

pub(super) async fn shells(State(state): State<AppState>) -> Result<Json<Vec<ShellInfo>>, ApiError> {
    let shells = state
        .orchestrator
        .shells()
        .available()
        .await
        .map_err(|e| ApiError::InternalError(e.to_string()))?;
    Ok(Json(shells.to_vec()))
}

pub(super) fn user_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn check_project(project: &str) -> Result<(), ApiError> {
    validate_session_id(project)
        .map_err(|_| ApiError::InvalidRequest(format!("invalid project id '{project}'")))
}

pub(super) async fn session_list(
    State(state): State<AppState>,
    Path(project): Path<String>,
) -> Result<Json<Vec<SessionInfo>>, ApiError> {
    check_project(&project)?;
    Ok(Json(state.orchestrator.list(Some(&project))))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateSessionRequest {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    mode: SessionMode,
    #[serde(default)]
    rows: Option<u16>,
    #[serde(default)]
    cols: Option<u16>,
    #[serde(default)]
    shell: Option<PathBuf>,
}

pub(super) async fn session_create(
    State(state): State<AppState>,
    Path(project): Path<String>,
    headers: HeaderMap,
    body: Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SessionInfo>), ApiError> {
    if state.shutdown.is_shutting_down() {
        return Err(ApiError::ShuttingDown);
    }
    check_project(&project)?;
    let req = match body {
        Ok(Json(req)) => req,
        Err(JsonRejection::MissingJsonContentType(_)) => CreateSessionRequest::default(),
        Err(e) => return Err(ApiError::InvalidRequest(e.body_text())),
    };

    let info = state
        .orchestrator
        .create(SessionParams {
            project_id: project,
            user_id: user_from_headers(&headers),
            path: req.path,
            mode: req.mode,
            rows: req.rows,
            cols: req.cols,
            shell: req.shell,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(info)))
}

pub(super) async fn session_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, ApiError> {
    state
        .orchestrator
        .get(&id)
        .map(Json)
        .ok_or(ApiError::SessionNotFound(id))
}

/// Close a session. Closing an already-closed session succeeds.
pub(super) async fn session_close(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.close(&id, CloseReason::Requested)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct FocusResponse {
    focused_session_ids: Vec<String>,
}

pub(super) async fn session_focus(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FocusResponse>, ApiError> {
    let focused_session_ids = state.orchestrator.focus(&id, true)?;
    Ok(Json(FocusResponse { focused_session_ids }))
}

pub(super) async fn session_blur(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FocusResponse>, ApiError> {
    let focused_session_ids = state.orchestrator.focus(&id, false)?;
    Ok(Json(FocusResponse { focused_session_ids }))
}

/// Raw request body is written to the session's terminal as-is.
pub(super) async fn session_input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.write(&id, body).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub(super) struct ResizeRequest {
    rows: u16,
    cols: u16,
}

pub(super) async fn session_resize(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<ResizeRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::InvalidRequest(e.body_text()))?;
    state.orchestrator.resize(&id, req.rows, req.cols)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
pub(super) struct SuspendResponse {
    suspended: Vec<String>,
}

pub(super) async fn project_suspend(
    State(state): State<AppState>,
    Path(project): Path<String>,
) -> Result<Json<SuspendResponse>, ApiError> {
    check_project(&project)?;
    let suspended = state.orchestrator.suspend_project(&project).await;
    Ok(Json(SuspendResponse { suspended }))
}

#[derive(Serialize)]
pub(super) struct ResumeResponse {
    resumed: Vec<String>,
    expired: Vec<String>,
    /// Per-session detail for `resumed`, in the same order.
    sessions: Vec<ResumedSession>,
}

pub(super) async fn project_resume(
    State(state): State<AppState>,
    Path(project): Path<String>,
) -> Result<Json<ResumeResponse>, ApiError> {
    check_project(&project)?;
    let report = state.orchestrator.resume_project(&project).await;
    Ok(Json(ResumeResponse {
        resumed: report.resumed_ids(),
        expired: report.expired,
        sessions: report.resumed,
    }))
}
