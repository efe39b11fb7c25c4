//! Runner protocol.
//!
//! Connect-style JSON over HTTP: every call is a `POST` to
//! `/api/actions/<package>.<Service>/<Method>` with a camelCase JSON body.
//! Apart from `Ping` and `Register`, calls carry the runner's credential in
//! the [`UUID_HEADER`] and [`TOKEN_HEADER`] headers.

use std::collections::BTreeMap;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::api::SharedState;
use super::models::{Runner, Status, TaskNeed};
use super::registry::{TOKEN_HEADER, UUID_HEADER};
use super::service::TaskAssignment;
use crate::errors::{ActionsError, find_actions_error};

// ── Messages ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskResult {
    #[default]
    ResultUnspecified,
    ResultSuccess,
    ResultFailure,
    ResultCancelled,
    ResultSkipped,
}

impl TaskResult {
    /// `None` while the task is still running.
    pub fn to_status(self) -> Option<Status> {
        match self {
            Self::ResultUnspecified => None,
            Self::ResultSuccess => Some(Status::Success),
            Self::ResultFailure => Some(Status::Failure),
            Self::ResultCancelled => Some(Status::Cancelled),
            Self::ResultSkipped => Some(Status::Skipped),
        }
    }

    pub fn from_status(status: Status) -> Self {
        match status {
            Status::Success => Self::ResultSuccess,
            Status::Failure => Self::ResultFailure,
            Status::Cancelled => Self::ResultCancelled,
            Status::Skipped => Self::ResultSkipped,
            _ => Self::ResultUnspecified,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PingRequest {
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PingResponse {
    pub data: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub name: String,
    pub token: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerMessage {
    pub id: i64,
    pub uuid: String,
    /// Only set in the `Register` response.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    pub name: String,
    pub version: String,
    pub labels: Vec<String>,
}

impl RunnerMessage {
    fn from_runner(runner: Runner, token: String) -> Self {
        Self {
            id: runner.id,
            uuid: runner.uuid,
            token,
            name: runner.name,
            version: runner.version,
            labels: runner.labels,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RunnerResponse {
    pub runner: RunnerMessage,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclareRequest {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchTaskRequest {
    #[serde(default)]
    pub tasks_version: i64,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub id: i64,
    pub token: String,
    pub workflow_payload: String,
    pub context: serde_json::Value,
    pub needs: BTreeMap<String, NeedMessage>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NeedMessage {
    pub result: TaskResult,
    pub outputs: BTreeMap<String, String>,
}

impl From<TaskNeed> for NeedMessage {
    fn from(need: TaskNeed) -> Self {
        Self {
            result: TaskResult::from_status(need.result),
            outputs: need.outputs,
        }
    }
}

impl From<TaskAssignment> for TaskMessage {
    fn from(task: TaskAssignment) -> Self {
        Self {
            id: task.id,
            token: task.token,
            workflow_payload: task.workflow_payload,
            context: task.context,
            needs: task
                .needs
                .into_iter()
                .map(|(k, v)| (k, NeedMessage::from(v)))
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchTaskResponse {
    pub task: Option<TaskMessage>,
    pub tasks_version: i64,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    pub id: i64,
    #[serde(default)]
    pub result: TaskResult,
    /// Unix seconds; defaults to the time the update arrives.
    #[serde(default)]
    pub stopped_at: Option<i64>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskRequest {
    pub state: TaskState,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskResponse {
    pub state: TaskState,
    pub sent_outputs: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LogRowMessage {
    pub time: i64,
    pub content: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateLogRequest {
    pub task_id: i64,
    pub index: i64,
    #[serde(default)]
    pub rows: Vec<LogRowMessage>,
    #[serde(default)]
    pub no_more: bool,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateLogResponse {
    pub ack_index: i64,
}

// ── Errors ────────────────────────────────────────────────────────────

/// Connect error body: `{"code": "...", "message": "..."}`.
#[derive(Debug)]
pub struct RpcError {
    pub code: &'static str,
    pub message: String,
}

impl RpcError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self.code {
            "unauthenticated" => StatusCode::UNAUTHORIZED,
            "not_found" => StatusCode::NOT_FOUND,
            "internal" => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(serde_json::json!({"code": self.code, "message": self.message})),
        )
            .into_response()
    }
}

impl From<anyhow::Error> for RpcError {
    fn from(err: anyhow::Error) -> Self {
        let message = err.to_string();
        let code = match find_actions_error(&err) {
            Some(ActionsError::Unauthenticated | ActionsError::InvalidRegistrationToken) => {
                "unauthenticated"
            }
            Some(
                ActionsError::TaskNotFound { .. }
                | ActionsError::RunnerNotFound { .. }
                | ActionsError::JobNotFound { .. }
                | ActionsError::RunNotFound { .. },
            ) => "not_found",
            Some(
                ActionsError::TaskRunnerMismatch { .. }
                | ActionsError::InvalidTransition { .. }
                | ActionsError::LogSealed { .. },
            ) => "failed_precondition",
            Some(ActionsError::LogIndexMismatch { .. }) => "out_of_range",
            Some(ActionsError::BadRequest(_)) => "invalid_argument",
            _ => {
                error!(error = %format!("{:#}", err), "runner call failed");
                "internal"
            }
        };
        Self::new(code, message)
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn runner_router() -> Router<SharedState> {
    Router::new()
        .route("/api/actions/ping.v1.PingService/Ping", post(ping))
        .route(
            "/api/actions/runner.v1.RunnerService/Register",
            post(register),
        )
        .route("/api/actions/runner.v1.RunnerService/Declare", post(declare))
        .route(
            "/api/actions/runner.v1.RunnerService/FetchTask",
            post(fetch_task),
        )
        .route(
            "/api/actions/runner.v1.RunnerService/UpdateTask",
            post(update_task),
        )
        .route(
            "/api/actions/runner.v1.RunnerService/UpdateLog",
            post(update_log),
        )
}

/// Resolve the calling runner from its credential headers.
async fn authenticated_runner(
    state: &SharedState,
    headers: &HeaderMap,
    active: bool,
) -> Result<Runner, RpcError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
    };
    let (Some(uuid), Some(token)) = (header(UUID_HEADER), header(TOKEN_HEADER)) else {
        return Err(RpcError::new("unauthenticated", "missing runner credentials"));
    };
    Ok(state.service.authenticate(uuid, token, active).await?)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn ping(Json(req): Json<PingRequest>) -> Json<PingResponse> {
    Json(PingResponse {
        data: format!("Hello, {}!", req.data),
    })
}

async fn register(
    State(state): State<SharedState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RunnerResponse>, RpcError> {
    if req.name.trim().is_empty() {
        return Err(RpcError::new("invalid_argument", "runner name is required"));
    }
    let (runner, token) = state
        .service
        .register_runner(&req.token, &req.name, &req.version, req.labels)
        .await?;
    Ok(Json(RunnerResponse {
        runner: RunnerMessage::from_runner(runner, token),
    }))
}

async fn declare(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<DeclareRequest>,
) -> Result<Json<RunnerResponse>, RpcError> {
    let runner = authenticated_runner(&state, &headers, false).await?;
    let runner = state
        .service
        .declare(&runner, &req.version, req.labels)
        .await?;
    Ok(Json(RunnerResponse {
        runner: RunnerMessage::from_runner(runner, String::new()),
    }))
}

async fn fetch_task(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<FetchTaskRequest>,
) -> Result<Json<FetchTaskResponse>, RpcError> {
    let runner = authenticated_runner(&state, &headers, false).await?;
    let fetched = state.service.fetch_task(&runner, req.tasks_version).await?;
    if fetched.task.is_none() {
        debug!(runner = %runner.name, tasks_version = fetched.tasks_version, "no task");
    }
    Ok(Json(FetchTaskResponse {
        task: fetched.task.map(TaskMessage::from),
        tasks_version: fetched.tasks_version,
    }))
}

async fn update_task(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<UpdateTaskRequest>,
) -> Result<Json<UpdateTaskResponse>, RpcError> {
    let runner = authenticated_runner(&state, &headers, true).await?;
    let update = state
        .service
        .update_task(
            &runner,
            req.state.id,
            req.state.result.to_status(),
            req.state.stopped_at,
            req.outputs,
        )
        .await?;
    Ok(Json(UpdateTaskResponse {
        state: TaskState {
            id: update.task.id,
            result: TaskResult::from_status(update.job.status),
            stopped_at: update.task.stopped,
        },
        sent_outputs: update.sent_outputs,
    }))
}

async fn update_log(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<UpdateLogRequest>,
) -> Result<Json<UpdateLogResponse>, RpcError> {
    let runner = authenticated_runner(&state, &headers, true).await?;
    let rows = req.rows.into_iter().map(|r| (r.time, r.content)).collect();
    let ack_index = state
        .service
        .update_log(&runner, req.task_id, req.index, rows, req.no_more)
        .await?;
    Ok(Json(UpdateLogResponse { ack_index }))
}

// ── Tests ─────────────────────────────────────────────────────────────
