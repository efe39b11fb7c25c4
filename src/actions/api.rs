use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::error;

use super::db::{JobSearch, NewAutoMerge};
use super::event::RepoEvent;
use super::models::{MergeStyle, Runner, RunnerScope, RunnerStatus, Status};
use super::service::{ActionsService, DispatchRequest, EventContext};
use super::workflow::WorkflowFile;
use crate::errors::{ActionsError, find_actions_error};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub service: ActionsService,
    pub ws_tx: broadcast::Sender<String>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct EventRequest {
    #[serde(default)]
    pub owner_id: i64,
    #[serde(default)]
    pub actor: String,
    pub event: RepoEvent,
    /// Workflow files present at the event's commit.
    #[serde(default)]
    pub workflows: Vec<WorkflowFile>,
}

#[derive(Deserialize)]
pub struct DispatchBody {
    #[serde(default)]
    pub owner_id: i64,
    pub actor: String,
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub sha: String,
    /// Workflow document at `sha`.
    pub content: String,
    #[serde(default)]
    pub inputs: HashMap<String, String>,
}

#[derive(Deserialize)]
pub struct StopQuery {
    pub result: Option<Status>,
}

#[derive(Deserialize, Default)]
pub struct JobsQuery {
    /// Comma-separated statuses.
    pub status: Option<String>,
    /// Comma-separated runner labels.
    pub labels: Option<String>,
    pub owner_id: Option<i64>,
    pub repo_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct RegistrationTokenRequest {
    pub owner_id: Option<i64>,
    pub repo_id: Option<i64>,
}

#[derive(Deserialize)]
pub struct PullRequestBody {
    pub head_sha: String,
    #[serde(default)]
    pub base_ref: String,
    #[serde(default)]
    pub required_contexts: Vec<String>,
}

#[derive(Deserialize)]
pub struct AutoMergeRequest {
    pub doer: String,
    pub merge_style: MergeStyle,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub delete_branch_after_merge: bool,
}

#[derive(Serialize)]
pub struct RunnerView {
    #[serde(flatten)]
    pub runner: Runner,
    pub status: RunnerStatus,
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

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let msg = err.to_string();
        match find_actions_error(&err) {
            Some(
                ActionsError::RunNotFound { .. }
                | ActionsError::JobNotFound { .. }
                | ActionsError::TaskNotFound { .. }
                | ActionsError::RunnerNotFound { .. }
                | ActionsError::WorkflowNotFound { .. }
                | ActionsError::PullRequestNotFound { .. },
            ) => ApiError::NotFound(msg),
            Some(ActionsError::AlreadyScheduled { .. } | ActionsError::InvalidTransition { .. }) => {
                ApiError::Conflict(msg)
            }
            Some(
                ActionsError::InputRequired { .. }
                | ActionsError::TooManyInputs { .. }
                | ActionsError::MalformedWorkflow { .. }
                | ActionsError::NotDispatchable { .. }
                | ActionsError::BadRequest(_)
                | ActionsError::LogIndexMismatch { .. }
                | ActionsError::LogSealed { .. }
                | ActionsError::InvalidRegistrationToken,
            ) => ApiError::BadRequest(msg),
            _ => {
                error!(error = %format!("{:#}", err), "request failed");
                ApiError::Internal(msg)
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/repos/{repo_id}/events", post(handle_event))
        .route(
            "/api/repos/{repo_id}/actions/workflows/{workflow_id}/dispatches",
            post(dispatch_workflow),
        )
        .route("/api/actions/runs/{id}", get(get_run))
        .route("/api/actions/runs/{id}/cancel", post(cancel_run))
        .route("/api/actions/tasks/{id}/stop", post(stop_task))
        .route("/api/actions/tasks/{id}/logs", get(get_task_log))
        .route("/api/actions/jobs", get(find_jobs))
        .route("/api/actions/runners", get(list_runners))
        .route(
            "/api/actions/registration-tokens",
            post(create_registration_token),
        )
        .route(
            "/api/repos/{repo_id}/commits/{sha}/statuses",
            get(get_commit_statuses),
        )
        .route("/api/repos/{repo_id}/pulls/{index}", put(upsert_pull_request))
        .route(
            "/api/repos/{repo_id}/pulls/{index}/automerge",
            post(schedule_auto_merge).delete(cancel_auto_merge),
        )
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

fn split_csv(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn handle_event(
    State(state): State<SharedState>,
    Path(repo_id): Path<i64>,
    Json(req): Json<EventRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = EventContext {
        repo_id,
        owner_id: req.owner_id,
        actor: req.actor,
    };
    let runs = state
        .service
        .handle_event(&ctx, &req.event, &req.workflows)
        .await?;
    Ok(Json(serde_json::json!({ "runs": runs })))
}

async fn dispatch_workflow(
    State(state): State<SharedState>,
    Path((repo_id, workflow_id)): Path<(i64, String)>,
    Json(body): Json<DispatchBody>,
) -> Result<impl IntoResponse, ApiError> {
    let req = DispatchRequest {
        repo_id,
        owner_id: body.owner_id,
        actor: body.actor,
        workflow: WorkflowFile {
            id: workflow_id,
            content: body.content,
        },
        ref_name: body.ref_name,
        commit_sha: body.sha,
    };
    let inputs = body.inputs;
    let (run, jobs) = state
        .service
        .dispatch(req, |key| inputs.get(key).cloned())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "run": run, "jobs": jobs })),
    ))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.get_run(id).await?))
}

async fn cancel_run(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let cancelled = state.service.cancel_run(id).await?;
    Ok(Json(serde_json::json!({ "cancelled_jobs": cancelled })))
}

async fn stop_task(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(query): Query<StopQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let result = query.result.unwrap_or(Status::Cancelled);
    if !result.is_done() {
        return Err(ApiError::BadRequest(format!(
            "stop result must be a done status, got {}",
            result
        )));
    }
    let transitions = state.service.stop_task(id, result).await?;
    Ok(Json(serde_json::json!({ "changed": transitions.len() })))
}

async fn get_task_log(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.task_log(id).await?))
}

async fn find_jobs(
    State(state): State<SharedState>,
    Query(query): Query<JobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let statuses = split_csv(query.status.as_deref())
        .iter()
        .map(|s| s.parse::<Status>().map_err(ApiError::BadRequest))
        .collect::<Result<Vec<_>, _>>()?;
    let search = JobSearch {
        statuses,
        labels: split_csv(query.labels.as_deref()),
        owner_id: query.owner_id,
        repo_id: query.repo_id,
    };
    Ok(Json(state.service.find_jobs(search).await?))
}

async fn list_runners(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let now = chrono::Utc::now().timestamp();
    let runners: Vec<RunnerView> = state
        .service
        .list_runners()
        .await?
        .into_iter()
        .map(|runner| RunnerView {
            status: runner.status_at(now),
            runner,
        })
        .collect();
    Ok(Json(runners))
}

async fn create_registration_token(
    State(state): State<SharedState>,
    Json(req): Json<RegistrationTokenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let scope = match (req.owner_id, req.repo_id) {
        (Some(_), Some(_)) => {
            return Err(ApiError::BadRequest(
                "a registration token is scoped to an owner or a repository, not both".into(),
            ));
        }
        (Some(owner), None) => RunnerScope::Owner(owner),
        (None, Some(repo)) => RunnerScope::Repo(repo),
        (None, None) => RunnerScope::Global,
    };
    let token = state.service.create_registration_token(scope).await?;
    Ok((StatusCode::CREATED, Json(token)))
}

async fn get_commit_statuses(
    State(state): State<SharedState>,
    Path((repo_id, sha)): Path<(i64, String)>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        state.service.latest_commit_statuses(repo_id, &sha).await?,
    ))
}

async fn upsert_pull_request(
    State(state): State<SharedState>,
    Path((repo_id, index)): Path<(i64, i64)>,
    Json(body): Json<PullRequestBody>,
) -> Result<impl IntoResponse, ApiError> {
    let pr = state
        .service
        .upsert_pull_request(
            repo_id,
            index,
            body.head_sha,
            body.base_ref,
            body.required_contexts,
        )
        .await?;
    Ok(Json(pr))
}

async fn schedule_auto_merge(
    State(state): State<SharedState>,
    Path((repo_id, index)): Path<(i64, i64)>,
    Json(req): Json<AutoMergeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let scheduled = state
        .service
        .schedule_auto_merge(NewAutoMerge {
            repo_id,
            pull_index: index,
            doer: req.doer,
            merge_style: req.merge_style,
            message: req.message,
            delete_branch_after_merge: req.delete_branch_after_merge,
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "scheduled": scheduled })),
    ))
}

async fn cancel_auto_merge(
    State(state): State<SharedState>,
    Path((repo_id, index)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    if state.service.cancel_auto_merge(repo_id, index).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!(
            "Pull request #{} has no auto-merge scheduled",
            index
        )))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
