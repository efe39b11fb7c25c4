//! Status propagator: job transitions to commit statuses.

use glob::Pattern;
use tracing::{debug, error, warn};

use super::db::{DbHandle, NewCommitStatus};
use super::models::{CommitStatus, CommitStatusState, Job, JobTransition, Run, Status};

/// Status context of a job: `"<workflow> / <job name> (<event>)"`.
pub fn status_context(run: &Run, job: &Job) -> String {
    format!("{} / {} ({})", run.workflow_id, job.name, run.event)
}

pub fn target_url(run: &Run, job: &Job) -> String {
    format!("{}/jobs/{}", run.link(), job.index)
}

/// Human-readable description of a job's state.
pub fn describe(job: &Job) -> String {
    match job.status {
        Status::Success => format!("Successful in {}", format_duration(job.duration_secs())),
        Status::Failure => format!("Failing after {}", format_duration(job.duration_secs())),
        Status::Cancelled => "Has been cancelled".to_string(),
        Status::Skipped => "Has been skipped".to_string(),
        Status::Running => "Has started running".to_string(),
        Status::Waiting => "Waiting to run".to_string(),
        Status::Blocked => "Blocked by required conditions".to_string(),
    }
}

/// Format seconds as `1h2m3s`, dropping leading zero units.
pub fn format_duration(secs: i64) -> String {
    let secs = secs.max(0);
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h{}m{}s", h, m, s)
    } else if m > 0 {
        format!("{}m{}s", m, s)
    } else {
        format!("{}s", s)
    }
}

pub fn new_status_for(transition: &JobTransition) -> NewCommitStatus {
    let JobTransition { job, run, seq, .. } = transition;
    NewCommitStatus {
        repo_id: run.repo_id,
        sha: job.commit_sha.clone(),
        context: status_context(run, job),
        state: CommitStatusState::from(job.status),
        description: describe(job),
        target_url: target_url(run, job),
        seq: *seq,
    }
}

/// Write the commit status for a job transition.
///
/// Failures are logged and swallowed; the job transition already happened.
pub async fn create_commit_status(db: &DbHandle, transition: &JobTransition) {
    let new = new_status_for(transition);
    let context = new.context.clone();
    match db.call(move |db| db.insert_commit_status(&new)).await {
        Ok(Some(status)) => {
            debug!(
                job_id = transition.job.id,
                context = %status.context,
                state = %status.state,
                "commit status written"
            );
        }
        Ok(None) => {}
        Err(e) => {
            error!(job_id = transition.job.id, context = %context, error = %e, "failed to write commit status");
        }
    }
}

/// The worst state among `statuses`, or `None` when there are none.
pub fn combined_state(statuses: &[CommitStatus]) -> Option<CommitStatusState> {
    statuses.iter().map(|s| s.state).reduce(|worst, state| {
        if state.no_better_than(worst) {
            state
        } else {
            worst
        }
    })
}

/// Evaluate a commit's latest statuses against required context patterns.
///
/// A required pattern matched by no status makes the result pending and
/// stops the evaluation. When nothing matched, the combined state of all
/// statuses is returned.
pub fn merge_required_contexts(
    statuses: &[CommitStatus],
    required: &[String],
) -> Option<CommitStatusState> {
    let mut matched = 0;
    let mut result = CommitStatusState::Success;

    let patterns: Vec<Pattern> = required
        .iter()
        .filter_map(|r| match Pattern::new(r) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(pattern = %r, error = %e, "invalid required context pattern");
                None
            }
        })
        .collect();

    for pattern in &patterns {
        let Some(target) = statuses.iter().find(|s| pattern.matches(&s.context)) else {
            if CommitStatusState::Pending.no_better_than(result) {
                result = CommitStatusState::Pending;
            }
            break;
        };
        matched += 1;
        if target.state.no_better_than(result) {
            result = target.state;
        }
    }

    if matched == 0 && result == CommitStatusState::Success {
        return combined_state(statuses);
    }
    Some(result)
}
