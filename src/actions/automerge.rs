//! Auto-merge scheduler.
//!
//! A schedule is a standing intent to merge a pull request once the latest
//! statuses of its head commit satisfy its required contexts. It stays armed
//! through failures until it is cancelled or the merge happens.

use anyhow::Result;
use tracing::{debug, info, warn};

use super::commit_status::merge_required_contexts;
use super::db::{ActionsDb, DbHandle, NewAutoMerge};
use super::models::{CommitStatusState, PullRequest};
use crate::errors::ActionsError;

/// Schedule an auto-merge. Returns true when a new schedule was stored.
pub async fn schedule(db: &DbHandle, new: NewAutoMerge) -> Result<bool> {
    let (repo_id, index) = (new.repo_id, new.pull_index);
    db.call(move |db| {
        let pr = db
            .get_pull_request(new.repo_id, new.pull_index)?
            .ok_or(ActionsError::PullRequestNotFound {
                repo_id: new.repo_id,
                index: new.pull_index,
            })?;
        if pr.merged {
            return Err(ActionsError::BadRequest(format!(
                "pull request #{} is already merged",
                pr.index
            ))
            .into());
        }
        db.insert_auto_merge(&new)?;
        Ok(())
    })
    .await?;
    info!(repo_id, pull = index, "auto-merge scheduled");
    Ok(true)
}

/// Cancel a schedule. Returns false when nothing was scheduled.
pub async fn cancel(db: &DbHandle, repo_id: i64, index: i64) -> Result<bool> {
    let removed = db
        .call(move |db| db.delete_auto_merge(repo_id, index))
        .await?;
    if removed {
        info!(repo_id, pull = index, "auto-merge cancelled");
    }
    Ok(removed)
}

/// Merge one pull request if it has a schedule and its head passes.
pub async fn check_pull_request(
    db: &DbHandle,
    repo_id: i64,
    index: i64,
) -> Result<Option<PullRequest>> {
    db.call(move |db| {
        let Some(pr) = db.get_pull_request(repo_id, index)? else {
            return Ok(None);
        };
        try_merge(db, &pr)
    })
    .await
}

/// Check every open pull request whose head is `sha`. Returns those merged.
pub async fn check_by_sha(db: &DbHandle, repo_id: i64, sha: &str) -> Result<Vec<PullRequest>> {
    let sha = sha.to_string();
    db.call(move |db| {
        let mut merged = Vec::new();
        for pr in db.open_pull_requests_by_head(repo_id, &sha)? {
            if let Some(pr) = try_merge(db, &pr)? {
                merged.push(pr);
            }
        }
        Ok(merged)
    })
    .await
}

fn try_merge(db: &ActionsDb, pr: &PullRequest) -> Result<Option<PullRequest>> {
    if pr.merged {
        return Ok(None);
    }
    let Some(schedule) = db.get_auto_merge(pr.repo_id, pr.index)? else {
        return Ok(None);
    };
    let statuses = db.latest_commit_statuses(pr.repo_id, &pr.head_sha)?;
    match merge_required_contexts(&statuses, &pr.required_contexts) {
        Some(CommitStatusState::Success) => {
            let merged = db.complete_auto_merge(&schedule)?;
            info!(
                repo_id = pr.repo_id,
                pull = pr.index,
                sha = %pr.head_sha,
                style = schedule.merge_style.as_str(),
                "auto-merge triggered"
            );
            Ok(Some(merged))
        }
        Some(CommitStatusState::Failure | CommitStatusState::Error) => {
            warn!(repo_id = pr.repo_id, pull = pr.index, "auto-merge waiting: required checks failed");
            Ok(None)
        }
        other => {
            debug!(repo_id = pr.repo_id, pull = pr.index, state = ?other, "auto-merge not ready");
            Ok(None)
        }
    }
}
