use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Job / run status ──────────────────────────────────────────────────

/// Lifecycle state of a job, and by reduction of a run.
///
/// States only move forward: `blocked → waiting → running → done`, where
/// done is one of success, failure, cancelled or skipped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Blocked,
    Waiting,
    Running,
    Success,
    Failure,
    Cancelled,
    Skipped,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocked => "blocked",
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failure | Self::Cancelled | Self::Skipped
        )
    }

    /// Position in the forward-only ordering; all done states share a rank.
    fn rank(&self) -> u8 {
        match self {
            Self::Blocked => 0,
            Self::Waiting => 1,
            Self::Running => 2,
            _ => 3,
        }
    }

    /// Whether a job may move from `self` to `next`.
    pub fn can_transition_to(&self, next: Status) -> bool {
        !self.is_done() && next.rank() > self.rank()
    }

    /// Reduce job statuses to the status of their run.
    ///
    /// A run is done only once every job is done; until then it is `waiting`
    /// while nothing has started and `running` afterwards.
    pub fn aggregate(statuses: &[Status]) -> Status {
        if statuses.is_empty() {
            return Status::Waiting;
        }
        if statuses.iter().all(Status::is_done) {
            if statuses.contains(&Status::Failure) {
                Status::Failure
            } else if statuses.contains(&Status::Cancelled) {
                Status::Cancelled
            } else if statuses.iter().all(|s| *s == Status::Skipped) {
                Status::Skipped
            } else {
                Status::Success
            }
        } else if statuses
            .iter()
            .any(|s| *s == Status::Running || s.is_done())
        {
            Status::Running
        } else if statuses.contains(&Status::Waiting) {
            Status::Waiting
        } else {
            Status::Blocked
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blocked" => Ok(Self::Blocked),
            "waiting" => Ok(Self::Waiting),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "cancelled" => Ok(Self::Cancelled),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid status: {}", s)),
        }
    }
}

// ── Trigger events ────────────────────────────────────────────────────

/// Workflow trigger a run was created for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    Push,
    PullRequest,
    PullRequestTarget,
    Create,
    Delete,
    WorkflowDispatch,
}

impl TriggerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::PullRequest => "pull_request",
            Self::PullRequestTarget => "pull_request_target",
            Self::Create => "create",
            Self::Delete => "delete",
            Self::WorkflowDispatch => "workflow_dispatch",
        }
    }
}

impl fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(Self::Push),
            "pull_request" => Ok(Self::PullRequest),
            "pull_request_target" => Ok(Self::PullRequestTarget),
            "create" => Ok(Self::Create),
            "delete" => Ok(Self::Delete),
            "workflow_dispatch" => Ok(Self::WorkflowDispatch),
            _ => Err(format!("Invalid trigger event: {}", s)),
        }
    }
}

// ── Runs, jobs, tasks ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: i64,
    /// Per-repository run number.
    pub index: i64,
    pub repo_id: i64,
    pub owner_id: i64,
    pub workflow_id: String,
    pub title: String,
    pub trigger_user: String,
    pub event: TriggerEvent,
    /// Pull request action (`opened`, `synchronize`, ...) for PR triggers.
    pub event_action: Option<String>,
    pub event_payload: serde_json::Value,
    pub ref_name: String,
    pub commit_sha: String,
    pub status: Status,
    pub created: i64,
    pub started: Option<i64>,
    pub stopped: Option<i64>,
}

impl Run {
    /// Path of the run page inside its repository.
    pub fn link(&self) -> String {
        format!("/repos/{}/actions/runs/{}", self.repo_id, self.index)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: i64,
    pub run_id: i64,
    pub repo_id: i64,
    pub owner_id: i64,
    pub commit_sha: String,
    /// Position of the job inside its run.
    pub index: i64,
    /// Key of the job under `jobs:` in the workflow document.
    pub job_key: String,
    pub name: String,
    pub needs: Vec<String>,
    pub runs_on: Vec<String>,
    pub workflow_payload: String,
    pub status: Status,
    pub task_id: Option<i64>,
    pub runner_id: Option<i64>,
    pub started: Option<i64>,
    pub stopped: Option<i64>,
}

impl Job {
    /// Whether a runner advertising `labels` can run this job.
    pub fn labels_satisfied_by(&self, labels: &[String]) -> bool {
        self.runs_on.iter().all(|l| labels.contains(l))
    }

    pub fn duration_secs(&self) -> i64 {
        match (self.started, self.stopped) {
            (Some(start), Some(stop)) if stop > start => stop - start,
            _ => 0,
        }
    }
}

/// The lease binding one job to one runner for its execution window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: i64,
    pub job_id: i64,
    pub runner_id: i64,
    pub status: Status,
    /// Next expected log row index.
    pub log_length: i64,
    pub log_sealed: bool,
    pub started: i64,
    pub stopped: Option<i64>,
    #[serde(skip_serializing)]
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogRow {
    pub index: i64,
    pub time: i64,
    pub content: String,
}

/// Result and outputs of a job another job `needs`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskNeed {
    pub result: Status,
    pub outputs: BTreeMap<String, String>,
}

/// A job status change, recorded with its global state-change sequence.
///
/// `run` is the parent run as it stands after the operation that produced
/// this transition; `run_from` is its status before that operation.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobTransition {
    pub seq: i64,
    pub job: Job,
    pub from: Option<Status>,
    pub run: Run,
    pub run_from: Status,
}

impl JobTransition {
    pub fn run_now_done(&self) -> bool {
        !self.run_from.is_done() && self.run.status.is_done()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunWithJobs {
    #[serde(flatten)]
    pub run: Run,
    pub jobs: Vec<Job>,
}

// ── Runners ───────────────────────────────────────────────────────────

/// Where a runner (or registration token) is allowed to pick up jobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum RunnerScope {
    Global,
    Owner(i64),
    Repo(i64),
}

impl RunnerScope {
    pub fn from_ids(owner_id: i64, repo_id: i64) -> Self {
        if repo_id != 0 {
            Self::Repo(repo_id)
        } else if owner_id != 0 {
            Self::Owner(owner_id)
        } else {
            Self::Global
        }
    }

    /// `(owner_id, repo_id)` as stored; zero means unscoped.
    pub fn ids(&self) -> (i64, i64) {
        match self {
            Self::Global => (0, 0),
            Self::Owner(id) => (*id, 0),
            Self::Repo(id) => (0, *id),
        }
    }

    /// Whether a job owned by `(owner_id, repo_id)` is visible in this scope.
    pub fn covers(&self, owner_id: i64, repo_id: i64) -> bool {
        match self {
            Self::Global => true,
            Self::Owner(id) => *id == owner_id,
            Self::Repo(id) => *id == repo_id,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Offline,
    Idle,
    Active,
}

/// A runner is offline once it has not called in for this many seconds.
pub const RUNNER_OFFLINE_SECS: i64 = 60;
/// A runner is idle once it has not reported task progress for this long.
pub const RUNNER_IDLE_SECS: i64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Runner {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub scope: RunnerScope,
    pub version: String,
    pub labels: Vec<String>,
    pub last_online: Option<i64>,
    pub last_active: Option<i64>,
    pub created: i64,
}

impl Runner {
    pub fn status_at(&self, now: i64) -> RunnerStatus {
        match self.last_online {
            Some(t) if now - t <= RUNNER_OFFLINE_SECS => {}
            _ => return RunnerStatus::Offline,
        }
        match self.last_active {
            Some(t) if now - t <= RUNNER_IDLE_SECS => RunnerStatus::Active,
            _ => RunnerStatus::Idle,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistrationToken {
    pub id: i64,
    pub token: String,
    pub scope: RunnerScope,
    pub is_active: bool,
    pub created: i64,
}

// ── Commit statuses ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommitStatusState {
    Error,
    Failure,
    Pending,
    Success,
}

impl CommitStatusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Failure => "failure",
            Self::Pending => "pending",
            Self::Success => "success",
        }
    }

    fn severity(&self) -> u8 {
        match self {
            Self::Error => 0,
            Self::Failure => 1,
            Self::Pending => 2,
            Self::Success => 3,
        }
    }

    /// True when `self` is the same as or worse than `other`.
    pub fn no_better_than(&self, other: CommitStatusState) -> bool {
        self.severity() <= other.severity()
    }
}

impl fmt::Display for CommitStatusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommitStatusState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(Self::Error),
            "failure" => Ok(Self::Failure),
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            _ => Err(format!("Invalid commit status state: {}", s)),
        }
    }
}

impl From<Status> for CommitStatusState {
    fn from(status: Status) -> Self {
        match status {
            Status::Success | Status::Skipped => Self::Success,
            Status::Failure | Status::Cancelled => Self::Failure,
            Status::Blocked | Status::Waiting | Status::Running => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommitStatus {
    pub id: i64,
    pub repo_id: i64,
    pub sha: String,
    pub context: String,
    pub state: CommitStatusState,
    pub description: String,
    pub target_url: String,
    /// State-change sequence of the job transition that produced this row.
    pub seq: i64,
    pub created: i64,
}

// ── Pull requests and auto-merge ──────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStyle {
    Merge,
    Rebase,
    RebaseMerge,
    Squash,
    FastForwardOnly,
}

impl MergeStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Rebase => "rebase",
            Self::RebaseMerge => "rebase-merge",
            Self::Squash => "squash",
            Self::FastForwardOnly => "fast-forward-only",
        }
    }
}

impl FromStr for MergeStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "merge" => Ok(Self::Merge),
            "rebase" => Ok(Self::Rebase),
            "rebase-merge" => Ok(Self::RebaseMerge),
            "squash" => Ok(Self::Squash),
            "fast-forward-only" => Ok(Self::FastForwardOnly),
            _ => Err(format!("Invalid merge style: {}", s)),
        }
    }
}

/// Projection of a pull request from the forge's PR system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PullRequest {
    pub repo_id: i64,
    pub index: i64,
    pub head_sha: String,
    pub base_ref: String,
    /// Glob patterns of status contexts that must pass before merging.
    pub required_contexts: Vec<String>,
    pub merged: bool,
    pub merged_by: Option<String>,
    pub merge_style: Option<MergeStyle>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AutoMerge {
    pub id: i64,
    pub repo_id: i64,
    pub pull_index: i64,
    pub doer: String,
    pub merge_style: MergeStyle,
    pub message: String,
    pub delete_branch_after_merge: bool,
    pub created: i64,
}
