//! End-to-end engine scenarios: events in, runners leasing and reporting,
//! commit statuses, auto-merge and run notifications out.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use forge_actions::actions::db::{ActionsDb, DbHandle, NewAutoMerge};
use forge_actions::actions::event::{PullRequestAction, RepoEvent};
use forge_actions::actions::models::{
    CommitStatusState, MergeStyle, Run, Runner, RunnerScope, Status,
};
use forge_actions::actions::notify::Notifier;
use forge_actions::actions::service::{ActionsService, EventContext};
use forge_actions::actions::workflow::WorkflowFile;
use forge_actions::config::ActionsSection;
use forge_actions::errors::{ActionsError, find_actions_error};

// =============================================================================
// Helpers
// =============================================================================

const CI: &str = "on: push\njobs:\n  build:\n    runs-on: linux\n";

fn service() -> Result<ActionsService> {
    service_with(ActionsSection::default())
}

fn service_with(settings: ActionsSection) -> Result<ActionsService> {
    let db = DbHandle::new(ActionsDb::new_in_memory()?);
    Ok(ActionsService::new(db, settings))
}

fn ctx() -> EventContext {
    EventContext {
        repo_id: 1,
        owner_id: 1,
        actor: "alice".into(),
    }
}

fn workflow(id: &str, content: &str) -> WorkflowFile {
    WorkflowFile {
        id: id.into(),
        content: content.into(),
    }
}

fn push(message: &str, sha: &str) -> RepoEvent {
    RepoEvent::Push {
        ref_name: "refs/heads/main".into(),
        before: String::new(),
        after: sha.into(),
        commit_message: message.into(),
        changed_files: vec![],
    }
}

fn pull_request(action: PullRequestAction, sha: &str) -> RepoEvent {
    RepoEvent::PullRequest {
        action,
        number: 5,
        title: "Add feature".into(),
        head_sha: sha.into(),
        base_ref: "main".into(),
        head_ref: "feature".into(),
        labels: vec![],
        changed_files: vec![],
        commit_message: String::new(),
    }
}

async fn runner(svc: &ActionsService, name: &str, labels: &[&str]) -> Result<Runner> {
    let reg = svc.create_registration_token(RunnerScope::Global).await?;
    let labels = labels.iter().map(|l| l.to_string()).collect();
    let (runner, _) = svc.register_runner(&reg.token, name, "v1", labels).await?;
    Ok(runner)
}

/// Lease the next job for `runner` and return its task id.
async fn lease(svc: &ActionsService, runner: &Runner) -> Result<i64> {
    let fetched = svc.fetch_task(runner, 0).await?;
    Ok(fetched.task.expect("a waiting job").id)
}

async fn finish(svc: &ActionsService, runner: &Runner, task_id: i64, result: Status) -> Result<()> {
    svc.update_task(runner, task_id, Some(result), None, BTreeMap::new())
        .await?;
    Ok(())
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(Status, Status, Option<Status>)>>,
}

#[async_trait]
impl Notifier for Recorder {
    async fn run_now_done(
        &self,
        run: &Run,
        prior_status: Status,
        last_run: Option<&Run>,
    ) -> Result<()> {
        self.seen
            .lock()
            .await
            .push((run.status, prior_status, last_run.map(|r| r.status)));
        Ok(())
    }
}

// =============================================================================
// Leasing
// =============================================================================

mod leasing {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exactly_one_of_many_pollers_gets_the_job() -> Result<()> {
        let svc = Arc::new(service()?);
        let mut runners = Vec::new();
        for i in 0..8 {
            let labels: &[&str] = if i % 2 == 0 {
                &["linux", "docker"]
            } else {
                &["linux"]
            };
            runners.push(runner(&svc, &format!("r{}", i), labels).await?);
        }
        svc.handle_event(&ctx(), &push("m", "abc"), &[workflow("ci.yml", CI)])
            .await?;

        let polls = runners.into_iter().map(|r| {
            let svc = svc.clone();
            tokio::spawn(async move { svc.fetch_task(&r, 0).await })
        });
        let mut leased = 0;
        for handle in futures::future::join_all(polls).await {
            if handle??.task.is_some() {
                leased += 1;
            }
        }
        assert_eq!(leased, 1);

        let jobs = svc.get_run(1).await?.jobs;
        assert_eq!(jobs[0].status, Status::Running);
        Ok(())
    }

    #[tokio::test]
    async fn test_jobs_lease_in_creation_order() -> Result<()> {
        let svc = service_with(ActionsSection {
            cancel_superseded_runs: false,
            ..ActionsSection::default()
        })?;
        let r = runner(&svc, "r1", &["linux"]).await?;
        let files = [workflow("ci.yml", CI)];
        svc.handle_event(&ctx(), &push("first", "aaa"), &files).await?;
        svc.handle_event(&ctx(), &push("second", "bbb"), &files).await?;

        let first = svc.fetch_task(&r, 0).await?.task.expect("task");
        assert_eq!(first.context["sha"], "aaa");
        let second = svc.fetch_task(&r, 0).await?.task.expect("task");
        assert_eq!(second.context["sha"], "bbb");
        assert!(svc.fetch_task(&r, 0).await?.task.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_runner_without_labels_gets_nothing() -> Result<()> {
        let svc = service()?;
        let r = runner(&svc, "win", &["windows"]).await?;
        svc.handle_event(&ctx(), &push("m", "abc"), &[workflow("ci.yml", CI)])
            .await?;
        assert!(svc.fetch_task(&r, 0).await?.task.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_repo_scoped_runner_only_sees_its_repo() -> Result<()> {
        let svc = service()?;
        let reg = svc.create_registration_token(RunnerScope::Repo(2)).await?;
        let (scoped, _) = svc
            .register_runner(&reg.token, "scoped", "v1", vec!["linux".into()])
            .await?;
        svc.handle_event(&ctx(), &push("m", "abc"), &[workflow("ci.yml", CI)])
            .await?;
        assert!(svc.fetch_task(&scoped, 0).await?.task.is_none());
        Ok(())
    }
}

// =============================================================================
// Job state machine
// =============================================================================

mod state_machine {
    use super::*;

    #[tokio::test]
    async fn test_terminal_status_never_changes() -> Result<()> {
        let svc = service()?;
        let r = runner(&svc, "r1", &["linux"]).await?;
        svc.handle_event(&ctx(), &push("m", "abc"), &[workflow("ci.yml", CI)])
            .await?;
        let task_id = lease(&svc, &r).await?;
        finish(&svc, &r, task_id, Status::Success).await?;

        // Same result again is a no-op.
        finish(&svc, &r, task_id, Status::Success).await?;

        // A different result is rejected.
        let err = finish(&svc, &r, task_id, Status::Failure).await.unwrap_err();
        assert!(matches!(
            find_actions_error(&err),
            Some(ActionsError::InvalidTransition { .. })
        ));

        // Stopping a finished task changes nothing.
        assert!(svc.stop_task(task_id, Status::Cancelled).await?.is_empty());

        let run = svc.get_run(1).await?;
        assert_eq!(run.run.status, Status::Success);
        assert_eq!(run.jobs[0].status, Status::Success);
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_races_runner_result() -> Result<()> {
        let svc = service()?;
        let r = runner(&svc, "r1", &["linux"]).await?;
        svc.handle_event(&ctx(), &push("m", "abc"), &[workflow("ci.yml", CI)])
            .await?;
        let task_id = lease(&svc, &r).await?;

        assert_eq!(svc.stop_task(task_id, Status::Cancelled).await?.len(), 1);
        let late = finish(&svc, &r, task_id, Status::Success).await;
        assert!(late.is_err());
        assert_eq!(svc.get_run(1).await?.run.status, Status::Cancelled);
        Ok(())
    }

    #[tokio::test]
    async fn test_needs_pass_outputs_to_dependents() -> Result<()> {
        let svc = service()?;
        let r = runner(&svc, "r1", &["linux"]).await?;
        let content = "on: push\njobs:\n  build:\n    runs-on: linux\n  deploy:\n    runs-on: linux\n    needs: build\n";
        svc.handle_event(&ctx(), &push("m", "abc"), &[workflow("ci.yml", content)])
            .await?;

        let build = lease(&svc, &r).await?;
        assert!(svc.fetch_task(&r, 0).await?.task.is_none());

        let mut outputs = BTreeMap::new();
        outputs.insert("image".to_string(), "app:1".to_string());
        svc.update_task(&r, build, Some(Status::Success), None, outputs)
            .await?;

        let deploy = svc.fetch_task(&r, 0).await?.task.expect("deploy unblocked");
        assert_eq!(deploy.context["job"], "deploy");
        assert_eq!(deploy.needs["build"].result, Status::Success);
        assert_eq!(deploy.needs["build"].outputs["image"], "app:1");
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_need_skips_dependents() -> Result<()> {
        let svc = service()?;
        let r = runner(&svc, "r1", &["linux"]).await?;
        let content = "on: push\njobs:\n  build:\n    runs-on: linux\n  deploy:\n    runs-on: linux\n    needs: [build]\n";
        svc.handle_event(&ctx(), &push("m", "abc"), &[workflow("ci.yml", content)])
            .await?;

        let build = lease(&svc, &r).await?;
        finish(&svc, &r, build, Status::Failure).await?;

        let run = svc.get_run(1).await?;
        assert_eq!(run.jobs[1].status, Status::Skipped);
        assert_eq!(run.run.status, Status::Failure);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_run_stops_every_job() -> Result<()> {
        let svc = service()?;
        let r = runner(&svc, "r1", &["linux"]).await?;
        let content = "on: push\njobs:\n  a:\n    runs-on: linux\n  b:\n    runs-on: linux\n";
        svc.handle_event(&ctx(), &push("m", "abc"), &[workflow("ci.yml", content)])
            .await?;
        lease(&svc, &r).await?;

        assert_eq!(svc.cancel_run(1).await?, 2);
        let run = svc.get_run(1).await?;
        assert!(run.jobs.iter().all(|j| j.status == Status::Cancelled));
        assert_eq!(run.run.status, Status::Cancelled);
        Ok(())
    }
}

// =============================================================================
// Logs
// =============================================================================

mod logs {
    use super::*;

    #[tokio::test]
    async fn test_sequential_log_delivery() -> Result<()> {
        let svc = service()?;
        let r = runner(&svc, "r1", &["linux"]).await?;
        svc.handle_event(&ctx(), &push("m", "abc"), &[workflow("ci.yml", CI)])
            .await?;
        let task_id = lease(&svc, &r).await?;

        let rows = |lines: &[&str]| -> Vec<(i64, String)> {
            lines.iter().map(|l| (100, l.to_string())).collect()
        };
        assert_eq!(svc.update_log(&r, task_id, 0, rows(&["a", "b"]), false).await?, 2);
        assert_eq!(svc.update_log(&r, task_id, 2, rows(&["c"]), false).await?, 3);

        // A resend of an earlier index is rejected, as is a gap.
        for index in [2, 7] {
            let err = svc
                .update_log(&r, task_id, index, rows(&["x"]), false)
                .await
                .unwrap_err();
            match find_actions_error(&err) {
                Some(ActionsError::LogIndexMismatch { expected, got, .. }) => {
                    assert_eq!(*expected, 3);
                    assert_eq!(*got, index);
                }
                other => panic!("expected LogIndexMismatch, got {other:?}"),
            }
        }

        assert_eq!(svc.update_log(&r, task_id, 3, rows(&["d"]), true).await?, 4);
        let err = svc
            .update_log(&r, task_id, 4, rows(&["late"]), false)
            .await
            .unwrap_err();
        assert!(matches!(
            find_actions_error(&err),
            Some(ActionsError::LogSealed { .. })
        ));

        let log = svc.task_log(task_id).await?;
        let lines: Vec<&str> = log.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(lines, vec!["a", "b", "c", "d"]);
        assert!(log.iter().enumerate().all(|(i, r)| r.index == i as i64));
        Ok(())
    }
}

// =============================================================================
// Notifications
// =============================================================================

mod notifications {
    use super::*;

    #[tokio::test]
    async fn test_notification_sequence() -> Result<()> {
        let svc = service()?;
        let recorder = Arc::new(Recorder::default());
        svc.notifiers().register(recorder.clone()).await;
        let r = runner(&svc, "r1", &["linux"]).await?;
        let files = [workflow("ci.yml", CI)];

        let outcomes = [
            Status::Success,
            Status::Failure,
            Status::Cancelled,
            Status::Success,
            Status::Success,
        ];
        for (i, outcome) in outcomes.iter().enumerate() {
            let sha = format!("sha{}", i);
            svc.handle_event(&ctx(), &push("m", &sha), &files).await?;
            let task_id = lease(&svc, &r).await?;
            if *outcome == Status::Cancelled {
                svc.stop_task(task_id, Status::Cancelled).await?;
            } else {
                finish(&svc, &r, task_id, *outcome).await?;
            }
        }

        let seen = recorder.seen.lock().await;
        assert_eq!(
            seen.as_slice(),
            &[
                (Status::Success, Status::Running, None),
                (Status::Failure, Status::Running, Some(Status::Success)),
                (Status::Cancelled, Status::Running, Some(Status::Failure)),
                (Status::Success, Status::Running, Some(Status::Cancelled)),
                (Status::Success, Status::Running, Some(Status::Success)),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_unregistered_observer_is_not_called() -> Result<()> {
        let svc = service()?;
        let recorder = Arc::new(Recorder::default());
        let handle = svc.notifiers().register(recorder.clone()).await;
        assert!(svc.notifiers().unregister(handle).await);

        let r = runner(&svc, "r1", &["linux"]).await?;
        svc.handle_event(&ctx(), &push("m", "abc"), &[workflow("ci.yml", CI)])
            .await?;
        let task_id = lease(&svc, &r).await?;
        finish(&svc, &r, task_id, Status::Success).await?;

        assert!(recorder.seen.lock().await.is_empty());
        Ok(())
    }
}

// =============================================================================
// Event matching
// =============================================================================

mod events {
    use super::*;

    #[tokio::test]
    async fn test_skip_ci_push_creates_no_run() -> Result<()> {
        let svc = service()?;
        let files = [workflow("ci.yml", CI)];

        let skipped = svc
            .handle_event(&ctx(), &push("docs only [skip ci]", "aaa"), &files)
            .await?;
        assert!(skipped.is_empty());

        let runs = svc
            .handle_event(&ctx(), &push("real change", "bbb"), &files)
            .await?;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].commit_sha, "bbb");
        Ok(())
    }

    #[tokio::test]
    async fn test_synchronize_after_opened_is_skipped() -> Result<()> {
        let svc = service()?;
        let files = [workflow(
            "pr.yml",
            "on: pull_request\njobs:\n  check:\n    runs-on: linux\n",
        )];

        let opened = svc
            .handle_event(&ctx(), &pull_request(PullRequestAction::Opened, "head1"), &files)
            .await?;
        assert_eq!(opened.len(), 1);

        let sync = pull_request(PullRequestAction::Synchronize, "head1");
        assert!(svc.skip_pull_request_event(&sync, 1, "head1").await?);
        assert!(svc.handle_event(&ctx(), &sync, &files).await?.is_empty());

        // A new head commit still runs.
        let moved = svc
            .handle_event(
                &ctx(),
                &pull_request(PullRequestAction::Synchronize, "head2"),
                &files,
            )
            .await?;
        assert_eq!(moved.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_commit_status_context_string() -> Result<()> {
        let svc = service()?;
        let files = [workflow(
            "labeled.yml",
            "on:\n  pull_request:\n    types: [labeled]\njobs:\n  labeled:\n    runs-on: linux\n",
        )];

        let ignored = svc
            .handle_event(&ctx(), &pull_request(PullRequestAction::Opened, "abc"), &files)
            .await?;
        assert!(ignored.is_empty());

        let runs = svc
            .handle_event(&ctx(), &pull_request(PullRequestAction::Labeled, "abc"), &files)
            .await?;
        assert_eq!(runs.len(), 1);

        let statuses = svc.latest_commit_statuses(1, "abc").await?;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].context, "labeled.yml / labeled (pull_request)");
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_workflow_reports_failure_status() -> Result<()> {
        let svc = service()?;
        let files = [workflow("ci.yml", CI), workflow("broken.yml", "on: push\njobs: {")];
        let runs = svc.handle_event(&ctx(), &push("m", "abc"), &files).await?;
        assert_eq!(runs.len(), 2);

        let statuses = svc.latest_commit_statuses(1, "abc").await?;
        let broken = statuses
            .iter()
            .find(|s| s.context.starts_with("broken.yml"))
            .expect("status for broken workflow");
        assert_eq!(broken.state, CommitStatusState::Failure);
        assert_eq!(broken.context, "broken.yml / m (push)");
        Ok(())
    }

    #[tokio::test]
    async fn test_skip_ci_in_synchronized_head_commit() -> Result<()> {
        let svc = service()?;
        let files = [workflow(
            "pr.yml",
            "on: pull_request\njobs:\n  check:\n    runs-on: linux\n",
        )];

        let mut sync = pull_request(PullRequestAction::Synchronize, "head1");
        if let RepoEvent::PullRequest { commit_message, .. } = &mut sync {
            *commit_message = "fixup [skip ci]".into();
        }
        assert!(svc.handle_event(&ctx(), &sync, &files).await?.is_empty());
        assert!(svc.latest_commit_statuses(1, "head1").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_circular_needs_fail_the_run() -> Result<()> {
        let svc = service()?;
        let r = runner(&svc, "r1", &["linux"]).await?;
        let content = "on: push\njobs:\n  a:\n    runs-on: linux\n    needs: b\n  b:\n    runs-on: linux\n    needs: a\n";
        let runs = svc
            .handle_event(&ctx(), &push("m", "abc"), &[workflow("loop.yml", content)])
            .await?;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, Status::Failure);

        let statuses = svc.latest_commit_statuses(1, "abc").await?;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].state, CommitStatusState::Failure);
        assert!(svc.fetch_task(&r, 0).await?.task.is_none());
        Ok(())
    }
}

// =============================================================================
// Superseded runs and sweeping
// =============================================================================

mod housekeeping {
    use super::*;

    #[tokio::test]
    async fn test_new_push_cancels_superseded_run() -> Result<()> {
        let svc = service()?;
        let recorder = Arc::new(Recorder::default());
        svc.notifiers().register(recorder.clone()).await;
        let r = runner(&svc, "r1", &["linux"]).await?;
        let files = [workflow("ci.yml", CI)];

        svc.handle_event(&ctx(), &push("first", "aaa"), &files).await?;
        let stale = lease(&svc, &r).await?;
        svc.handle_event(&ctx(), &push("second", "bbb"), &files).await?;

        assert_eq!(svc.get_run(1).await?.run.status, Status::Cancelled);
        assert_eq!(svc.get_run(2).await?.run.status, Status::Waiting);
        let old = svc.latest_commit_statuses(1, "aaa").await?;
        assert_eq!(old[0].state, CommitStatusState::Failure);

        // The runner's late report on the cancelled task is refused.
        assert!(finish(&svc, &r, stale, Status::Success).await.is_err());

        let next = svc.fetch_task(&r, 0).await?.task.expect("task");
        assert_eq!(next.context["sha"], "bbb");
        assert_eq!(
            recorder.seen.lock().await.as_slice(),
            &[(Status::Cancelled, Status::Running, None)]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_supersede_can_be_disabled() -> Result<()> {
        let svc = service_with(ActionsSection {
            cancel_superseded_runs: false,
            ..ActionsSection::default()
        })?;
        let files = [workflow("ci.yml", CI)];
        svc.handle_event(&ctx(), &push("first", "aaa"), &files).await?;
        svc.handle_event(&ctx(), &push("second", "bbb"), &files).await?;

        assert_eq!(svc.get_run(1).await?.run.status, Status::Waiting);
        assert_eq!(svc.get_run(2).await?.run.status, Status::Waiting);
        Ok(())
    }

    #[tokio::test]
    async fn test_pull_request_runs_are_not_superseded() -> Result<()> {
        let svc = service()?;
        let files = [workflow(
            "pr.yml",
            "on: pull_request\njobs:\n  check:\n    runs-on: linux\n",
        )];
        svc.handle_event(&ctx(), &pull_request(PullRequestAction::Opened, "head1"), &files)
            .await?;
        svc.handle_event(
            &ctx(),
            &pull_request(PullRequestAction::Synchronize, "head2"),
            &files,
        )
        .await?;
        assert_eq!(svc.get_run(1).await?.run.status, Status::Waiting);
        Ok(())
    }

    #[tokio::test]
    async fn test_sweep_fails_task_past_its_budget() -> Result<()> {
        let svc = service()?;
        let r = runner(&svc, "r1", &["linux"]).await?;
        svc.handle_event(&ctx(), &push("m", "abc"), &[workflow("ci.yml", CI)])
            .await?;
        let task_id = lease(&svc, &r).await?;

        let now = chrono::Utc::now().timestamp();
        let quiet = svc.sweep_at(now).await?;
        assert_eq!(quiet.failed_tasks, 0);

        let outcome = svc.sweep_at(now + 4 * 3600).await?;
        assert_eq!(outcome.failed_tasks, 1);
        assert_eq!(outcome.cancelled_jobs, 0);
        assert_eq!(outcome.removed_runners, 0);

        let run = svc.get_run(1).await?;
        assert_eq!(run.run.status, Status::Failure);
        assert_eq!(run.jobs[0].task_id, Some(task_id));
        let statuses = svc.latest_commit_statuses(1, "abc").await?;
        assert_eq!(statuses[0].state, CommitStatusState::Failure);
        Ok(())
    }

    #[tokio::test]
    async fn test_sweep_cancels_job_nobody_picks_up() -> Result<()> {
        let svc = service_with(ActionsSection {
            offline_runner_cleanup_secs: 3600,
            ..ActionsSection::default()
        })?;
        runner(&svc, "win", &["windows"]).await?;
        svc.handle_event(&ctx(), &push("m", "abc"), &[workflow("ci.yml", CI)])
            .await?;

        let outcome = svc
            .sweep_at(chrono::Utc::now().timestamp() + 25 * 3600)
            .await?;
        assert_eq!(outcome.cancelled_jobs, 1);
        assert_eq!(outcome.removed_runners, 1);
        assert_eq!(svc.get_run(1).await?.run.status, Status::Cancelled);
        assert!(svc.list_runners().await?.is_empty());
        Ok(())
    }
}

// =============================================================================
// Auto-merge
// =============================================================================

mod auto_merge {
    use super::*;

    const PR_CI: &str =
        "on: pull_request\njobs:\n  build:\n    runs-on: linux\n  test:\n    runs-on: linux\n";

    fn schedule() -> NewAutoMerge {
        NewAutoMerge {
            repo_id: 1,
            pull_index: 5,
            doer: "alice".into(),
            merge_style: MergeStyle::Squash,
            message: "Add feature".into(),
            delete_branch_after_merge: true,
        }
    }

    async fn merged(svc: &ActionsService) -> Result<bool> {
        let pr = svc
            .db()
            .call(|db| db.get_pull_request(1, 5))
            .await?
            .expect("pull request");
        Ok(pr.merged)
    }

    #[tokio::test]
    async fn test_green_checks_merge_scheduled_pull_request() -> Result<()> {
        let svc = service()?;
        let r = runner(&svc, "r1", &["linux"]).await?;
        svc.upsert_pull_request(1, 5, "head".into(), "main".into(), vec!["pr.yml / *".into()])
            .await?;
        svc.handle_event(
            &ctx(),
            &pull_request(PullRequestAction::Opened, "head"),
            &[workflow("pr.yml", PR_CI)],
        )
        .await?;

        assert!(svc.schedule_auto_merge(schedule()).await?);
        assert!(!merged(&svc).await?);

        let first = lease(&svc, &r).await?;
        finish(&svc, &r, first, Status::Success).await?;
        assert!(!merged(&svc).await?, "one required check still pending");

        let second = lease(&svc, &r).await?;
        finish(&svc, &r, second, Status::Success).await?;
        assert!(merged(&svc).await?);
        assert_eq!(svc.get_run(1).await?.run.status, Status::Success);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_check_keeps_schedule_armed() -> Result<()> {
        let svc = service()?;
        let r = runner(&svc, "r1", &["linux"]).await?;
        svc.upsert_pull_request(1, 5, "head".into(), "main".into(), vec![])
            .await?;
        svc.handle_event(
            &ctx(),
            &pull_request(PullRequestAction::Opened, "head"),
            &[workflow("pr.yml", PR_CI)],
        )
        .await?;
        svc.schedule_auto_merge(schedule()).await?;

        let first = lease(&svc, &r).await?;
        finish(&svc, &r, first, Status::Failure).await?;
        let second = lease(&svc, &r).await?;
        finish(&svc, &r, second, Status::Success).await?;

        assert!(!merged(&svc).await?);
        let armed = svc.db().call(|db| db.get_auto_merge(1, 5)).await?;
        assert!(armed.is_some());

        assert!(svc.cancel_auto_merge(1, 5).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_double_schedule_is_rejected() -> Result<()> {
        let svc = service()?;
        svc.upsert_pull_request(1, 5, "head".into(), "main".into(), vec![])
            .await?;
        svc.handle_event(
            &ctx(),
            &pull_request(PullRequestAction::Opened, "head"),
            &[workflow("pr.yml", PR_CI)],
        )
        .await?;
        svc.schedule_auto_merge(schedule()).await?;

        let err = svc.schedule_auto_merge(schedule()).await.unwrap_err();
        assert!(matches!(
            find_actions_error(&err),
            Some(ActionsError::AlreadyScheduled { .. })
        ));
        Ok(())
    }
}
