//! Typed error hierarchy for the actions engine.
//!
//! Storage and service code returns `anyhow::Result`; engine failures that a
//! caller must be able to tell apart are raised as [`ActionsError`] and
//! recovered with `downcast_ref` at the HTTP boundary.

use thiserror::Error;

use crate::actions::models::Status;

/// Errors from the run/job store, the runner registry and the task gateway.
#[derive(Debug, Error)]
pub enum ActionsError {
    #[error("Run {id} not found")]
    RunNotFound { id: i64 },

    #[error("Job {id} not found")]
    JobNotFound { id: i64 },

    #[error("Task {id} not found")]
    TaskNotFound { id: i64 },

    #[error("Runner {uuid} not found")]
    RunnerNotFound { uuid: String },

    #[error("Workflow {id} not found")]
    WorkflowNotFound { id: String },

    #[error("Pull request #{index} not found in repository {repo_id}")]
    PullRequestNotFound { repo_id: i64, index: i64 },

    #[error("Unauthenticated runner")]
    Unauthenticated,

    #[error("Runner registration token is invalid or inactive")]
    InvalidRegistrationToken,

    #[error("Task {task_id} is not assigned to this runner")]
    TaskRunnerMismatch { task_id: i64 },

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition { job_id: i64, from: Status, to: Status },

    #[error("Log index mismatch for task {task_id}: expected {expected}, got {got}")]
    LogIndexMismatch { task_id: i64, expected: i64, got: i64 },

    #[error("Log of task {task_id} is already sealed")]
    LogSealed { task_id: i64 },

    #[error("Required input '{name}' is missing")]
    InputRequired { name: String },

    #[error("Workflow declares {count} inputs, the limit is {limit}")]
    TooManyInputs { count: usize, limit: usize },

    #[error("Malformed workflow {workflow_id}: {message}")]
    MalformedWorkflow { workflow_id: String, message: String },

    #[error("Workflow {workflow_id} has no workflow_dispatch trigger")]
    NotDispatchable { workflow_id: String },

    #[error("Pull request #{index} is already scheduled for auto-merge")]
    AlreadyScheduled { index: i64 },

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for ActionsError {
    fn from(err: rusqlite::Error) -> Self {
        ActionsError::Database(anyhow::Error::new(err))
    }
}

/// Find the engine error inside an `anyhow` chain, if there is one.
pub fn find_actions_error(err: &anyhow::Error) -> Option<&ActionsError> {
    err.chain().find_map(|cause| cause.downcast_ref::<ActionsError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn invalid_transition_carries_both_states() {
        let err = ActionsError::InvalidTransition {
            job_id: 7,
            from: Status::Cancelled,
            to: Status::Success,
        };
        match &err {
            ActionsError::InvalidTransition { job_id, from, to } => {
                assert_eq!(*job_id, 7);
                assert_eq!(*from, Status::Cancelled);
                assert_eq!(*to, Status::Success);
            }
            _ => panic!("Expected InvalidTransition"),
        }
        assert_eq!(err.to_string(), "Job 7 cannot move from cancelled to success");
    }

    #[test]
    fn log_index_mismatch_reports_expected_index() {
        let err = ActionsError::LogIndexMismatch {
            task_id: 1,
            expected: 3,
            got: 5,
        };
        assert!(err.to_string().contains("expected 3"));
        assert!(err.to_string().contains("got 5"));
    }

    #[test]
    fn rusqlite_errors_map_to_database() {
        let err: ActionsError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, ActionsError::Database(_)));
    }

    #[test]
    fn find_actions_error_looks_through_context() {
        let err: anyhow::Error = Err::<(), _>(ActionsError::Unauthenticated)
            .context("FetchTask")
            .unwrap_err();
        assert!(matches!(
            find_actions_error(&err),
            Some(ActionsError::Unauthenticated)
        ));

        let plain = anyhow::anyhow!("disk full");
        assert!(find_actions_error(&plain).is_none());
    }

    #[test]
    fn all_variants_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ActionsError::LockPoisoned);
        assert_std_error(&ActionsError::LogSealed { task_id: 1 });
    }
}
