//! Engine façade used by the HTTP layers.
//!
//! Every operation that changes job state hands the resulting transitions to
//! [`ActionsService::propagate`], which writes commit statuses, re-checks
//! auto-merge schedules, publishes the run feed and notifies observers of
//! runs that just finished.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::automerge;
use super::commit_status;
use super::db::{
    CreatedRun, DbHandle, JobSearch, NewAutoMerge, NewJob, NewRun, SweepCutoffs, SweepOutcome,
    TaskUpdate,
};
use super::event::{PullRequestAction, RepoEvent};
use super::matcher::{MatchOutcome, match_workflows, should_skip_ci};
use super::models::*;
use super::notify::{self, NotifierRegistry};
use super::workflow::{Workflow, WorkflowFile, parse_workflow};
use super::ws::{FeedMessage, broadcast_message};
use crate::config::ActionsSection;
use crate::errors::ActionsError;

/// Who and where an event happened.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub repo_id: i64,
    pub owner_id: i64,
    pub actor: String,
}

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub repo_id: i64,
    pub owner_id: i64,
    pub actor: String,
    pub workflow: WorkflowFile,
    pub ref_name: String,
    pub commit_sha: String,
}

/// A leased job as handed to a runner.
#[derive(Debug, Clone, Serialize)]
pub struct TaskAssignment {
    pub id: i64,
    pub token: String,
    pub workflow_payload: String,
    pub context: serde_json::Value,
    pub needs: BTreeMap<String, TaskNeed>,
}

#[derive(Debug, Clone)]
pub struct FetchedTask {
    pub task: Option<TaskAssignment>,
    pub tasks_version: i64,
}

/// Keys of events currently being turned into runs.
type InflightSet = Arc<Mutex<HashSet<String>>>;

struct InflightClaim {
    set: InflightSet,
    key: String,
}

impl Drop for InflightClaim {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.key);
    }
}

fn inflight_key(repo_id: i64, class: &str, sha: &str) -> String {
    format!("{}:{}:{}", repo_id, class, sha)
}

fn event_class(event: &RepoEvent) -> String {
    match event.pull_request_action() {
        Some(action) => format!("pull_request:{}", action.as_str()),
        None => format!("{}:{}", event.primary_trigger(), event.ref_name()),
    }
}

pub struct ActionsService {
    db: DbHandle,
    notifiers: Arc<NotifierRegistry>,
    settings: ActionsSection,
    feed: Option<broadcast::Sender<String>>,
    inflight: InflightSet,
}

impl ActionsService {
    pub fn new(db: DbHandle, settings: ActionsSection) -> Self {
        Self {
            db,
            notifiers: Arc::new(NotifierRegistry::new()),
            settings,
            feed: None,
            inflight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Publish run and job changes on `tx`.
    pub fn with_feed(mut self, tx: broadcast::Sender<String>) -> Self {
        self.feed = Some(tx);
        self
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn notifiers(&self) -> &Arc<NotifierRegistry> {
        &self.notifiers
    }

    pub fn settings(&self) -> &ActionsSection {
        &self.settings
    }

    fn claim(&self, key: String) -> Option<InflightClaim> {
        let mut set = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(key.clone()) {
            return None;
        }
        Some(InflightClaim {
            set: self.inflight.clone(),
            key,
        })
    }

    fn is_claimed(&self, key: &str) -> bool {
        let set = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        set.contains(key)
    }

    // ── Events ────────────────────────────────────────────────────────

    /// Whether a pull request event must be dropped because its head commit
    /// already has (or is getting) a run from an `opened` event.
    pub async fn skip_pull_request_event(
        &self,
        event: &RepoEvent,
        repo_id: i64,
        sha: &str,
    ) -> Result<bool> {
        if event.pull_request_action() != Some(PullRequestAction::Synchronize) {
            return Ok(false);
        }
        if self.is_claimed(&inflight_key(repo_id, "pull_request:opened", sha)) {
            return Ok(true);
        }
        let sha = sha.to_string();
        self.db
            .call(move |db| db.has_opened_pull_request_run(repo_id, &sha))
            .await
    }

    /// Turn a repository event into runs for every workflow it fires.
    pub async fn handle_event(
        &self,
        ctx: &EventContext,
        event: &RepoEvent,
        files: &[WorkflowFile],
    ) -> Result<Vec<Run>> {
        let sha = event.commit_sha().to_string();
        if should_skip_ci(event, &self.settings.skip_workflow_strings) {
            info!(repo_id = ctx.repo_id, sha = %sha, "event skipped by skip-ci marker");
            return Ok(Vec::new());
        }

        let key = inflight_key(ctx.repo_id, &event_class(event), &sha);
        let Some(_claim) = self.claim(key) else {
            debug!(repo_id = ctx.repo_id, sha = %sha, "duplicate event suppressed");
            return Ok(Vec::new());
        };
        if self.skip_pull_request_event(event, ctx.repo_id, &sha).await? {
            debug!(repo_id = ctx.repo_id, sha = %sha, "synchronize after opened suppressed");
            return Ok(Vec::new());
        }

        let matched = match_workflows(event, files);
        if matched.is_empty() {
            return Ok(Vec::new());
        }

        let payload = serde_json::to_value(event).context("Failed to serialize event")?;
        let requests: Vec<(NewRun, Vec<NewJob>)> = matched
            .into_iter()
            .map(|m| {
                let (title, jobs) = match &m.outcome {
                    MatchOutcome::Ready(wf) => (
                        run_title(event.title(), wf, &m.workflow_id),
                        self.new_jobs(wf),
                    ),
                    MatchOutcome::Malformed(message) => {
                        let title = non_empty_or(event.title(), &m.workflow_id);
                        let job = malformed_job(&m.workflow_id, &title, message);
                        (title, vec![job])
                    }
                };
                let run = NewRun {
                    repo_id: ctx.repo_id,
                    owner_id: ctx.owner_id,
                    workflow_id: m.workflow_id,
                    title,
                    trigger_user: ctx.actor.clone(),
                    event: m.trigger,
                    event_action: event.pull_request_action().map(|a| a.as_str().to_string()),
                    event_payload: payload.clone(),
                    ref_name: event.ref_name(),
                    commit_sha: sha.clone(),
                };
                (run, jobs)
            })
            .collect();

        let is_synchronize = event.pull_request_action() == Some(PullRequestAction::Synchronize);
        let supersede = self.settings.cancel_superseded_runs
            && matches!(event, RepoEvent::Push { .. });
        let repo_id = ctx.repo_id;
        let sha_check = sha.clone();
        let (created, superseded): (Vec<CreatedRun>, Vec<JobTransition>) = self
            .db
            .call(move |db| {
                // Re-checked under the store lock so an opened run that landed
                // since the first check is seen.
                if is_synchronize && db.has_opened_pull_request_run(repo_id, &sha_check)? {
                    return Ok((Vec::new(), Vec::new()));
                }
                let mut created = Vec::with_capacity(requests.len());
                let mut superseded = Vec::new();
                for (run, jobs) in &requests {
                    let c = db.insert_run(run, jobs)?;
                    if supersede {
                        superseded.extend(db.cancel_superseded_runs(&c.run)?);
                    }
                    created.push(c);
                }
                Ok((created, superseded))
            })
            .await?;

        if !superseded.is_empty() {
            info!(repo_id, jobs = superseded.len(), "superseded runs cancelled");
            self.propagate(&superseded).await;
        }

        let mut runs = Vec::with_capacity(created.len());
        for c in created {
            info!(
                run_id = c.run.id,
                repo_id = c.run.repo_id,
                workflow = %c.run.workflow_id,
                event = %c.run.event,
                jobs = c.jobs.len(),
                "run created"
            );
            self.publish(&FeedMessage::RunCreated {
                run: c.run.clone(),
                job_names: c.jobs.iter().map(|j| j.name.clone()).collect(),
            });
            self.propagate(&c.transitions).await;
            runs.push(c.run);
        }
        Ok(runs)
    }

    /// Manually run a workflow that declares `workflow_dispatch`.
    ///
    /// Returns the created run and its job names.
    pub async fn dispatch<F>(&self, req: DispatchRequest, input: F) -> Result<(Run, Vec<String>)>
    where
        F: Fn(&str) -> Option<String>,
    {
        let wf = parse_workflow(&req.workflow.content).map_err(|e| {
            ActionsError::MalformedWorkflow {
                workflow_id: req.workflow.id.clone(),
                message: e.to_string(),
            }
        })?;
        let Some(decl) = wf.trigger(TriggerEvent::WorkflowDispatch.as_str()) else {
            return Err(ActionsError::NotDispatchable {
                workflow_id: req.workflow.id.clone(),
            }
            .into());
        };

        let mut inputs = BTreeMap::new();
        for declared in &decl.inputs {
            let given = input(&declared.key).filter(|v| !v.is_empty());
            let value = match given {
                Some(v) if declared.input_type.as_deref() == Some("boolean") => (v == "on").to_string(),
                Some(v) => v,
                None => match declared.default.clone().filter(|d| !d.is_empty()) {
                    Some(d) => d,
                    None if declared.required => {
                        let name = declared
                            .description
                            .clone()
                            .filter(|d| !d.is_empty())
                            .unwrap_or_else(|| declared.key.clone());
                        return Err(ActionsError::InputRequired { name }.into());
                    }
                    None => continue,
                },
            };
            inputs.insert(declared.key.clone(), value);
        }
        let limit = self.settings.limit_dispatch_inputs;
        if inputs.len() > limit {
            return Err(ActionsError::TooManyInputs {
                count: inputs.len(),
                limit,
            }
            .into());
        }

        let full_id = format!(".forge/workflows/{}", req.workflow.id);
        let title = wf
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| full_id.clone());
        let job_names: Vec<String> = wf.jobs.iter().map(|j| j.name.clone()).collect();
        let new_run = NewRun {
            repo_id: req.repo_id,
            owner_id: req.owner_id,
            workflow_id: req.workflow.id.clone(),
            title,
            trigger_user: req.actor.clone(),
            event: TriggerEvent::WorkflowDispatch,
            event_action: None,
            event_payload: serde_json::json!({
                "inputs": inputs,
                "ref": req.ref_name,
                "workflow": full_id,
                "sender": req.actor,
            }),
            ref_name: req.ref_name.clone(),
            commit_sha: req.commit_sha.clone(),
        };
        let jobs = self.new_jobs(&wf);

        let created = self
            .db
            .call(move |db| db.insert_run(&new_run, &jobs))
            .await?;
        info!(run_id = created.run.id, workflow = %created.run.workflow_id, actor = %req.actor, "workflow dispatched");
        self.publish(&FeedMessage::RunCreated {
            run: created.run.clone(),
            job_names: job_names.clone(),
        });
        self.propagate(&created.transitions).await;
        Ok((created.run, job_names))
    }

    fn new_jobs(&self, wf: &Workflow) -> Vec<NewJob> {
        wf.jobs
            .iter()
            .map(|j| NewJob {
                job_key: j.key.clone(),
                name: j.name.clone(),
                needs: j.needs.clone(),
                runs_on: if j.runs_on.is_empty() {
                    self.settings.default_runs_on.clone()
                } else {
                    j.runs_on.clone()
                },
                workflow_payload: j.payload.clone(),
                failed: false,
            })
            .collect()
    }

    // ── Runner protocol ───────────────────────────────────────────────

    pub async fn register_runner(
        &self,
        registration_token: &str,
        name: &str,
        version: &str,
        labels: Vec<String>,
    ) -> Result<(Runner, String)> {
        let (token, name_owned, version) = (
            registration_token.to_string(),
            name.to_string(),
            version.to_string(),
        );
        let (runner, credential) = self
            .db
            .call(move |db| db.register_runner(&token, &name_owned, &version, &labels))
            .await?;
        info!(runner = %runner.name, uuid = %runner.uuid, labels = ?runner.labels, "runner registered");
        Ok((runner, credential))
    }

    /// Check a runner's credential. `active` marks task progress.
    pub async fn authenticate(&self, uuid: &str, token: &str, active: bool) -> Result<Runner> {
        let (uuid, token) = (uuid.to_string(), token.to_string());
        self.db
            .call(move |db| db.authenticate_runner(&uuid, &token, active))
            .await
    }

    pub async fn declare(&self, runner: &Runner, version: &str, labels: Vec<String>) -> Result<Runner> {
        let (id, version) = (runner.id, version.to_string());
        self.db
            .call(move |db| db.declare_runner(id, &version, &labels))
            .await
    }

    /// Lease a job to `runner` unless the client already holds the latest
    /// tasks version of its scope.
    pub async fn fetch_task(&self, runner: &Runner, client_version: i64) -> Result<FetchedTask> {
        let leasing = runner.clone();
        let (lease, tasks_version, needs) = self
            .db
            .call(move |db| {
                let latest = db.get_tasks_version(leasing.scope)?;
                if client_version == latest {
                    return Ok((None, latest, BTreeMap::new()));
                }
                let lease = db.lease_job(&leasing)?;
                let needs = match &lease {
                    Some(l) => db.job_needs(&l.job)?,
                    None => BTreeMap::new(),
                };
                Ok((lease, latest, needs))
            })
            .await?;

        let Some(lease) = lease else {
            return Ok(FetchedTask {
                task: None,
                tasks_version,
            });
        };
        info!(
            run_id = lease.run.id,
            job_id = lease.job.id,
            task_id = lease.task.id,
            runner = %runner.name,
            "job leased"
        );
        self.propagate(std::slice::from_ref(&lease.transition)).await;

        Ok(FetchedTask {
            task: Some(TaskAssignment {
                id: lease.task.id,
                token: lease.task.token.clone(),
                workflow_payload: lease.job.workflow_payload.clone(),
                context: task_context(&lease.run, &lease.job),
                needs,
            }),
            tasks_version,
        })
    }

    pub async fn update_task(
        &self,
        runner: &Runner,
        task_id: i64,
        result: Option<Status>,
        stopped_at: Option<i64>,
        outputs: BTreeMap<String, String>,
    ) -> Result<TaskUpdate> {
        let runner_id = runner.id;
        let update = self
            .db
            .call(move |db| db.update_task(runner_id, task_id, result, stopped_at, &outputs))
            .await?;
        if !update.transitions.is_empty() {
            info!(task_id, job_id = update.job.id, result = %update.job.status, "job finished");
        }
        self.propagate(&update.transitions).await;
        Ok(update)
    }

    /// Append log rows; returns the acknowledged length.
    pub async fn update_log(
        &self,
        runner: &Runner,
        task_id: i64,
        index: i64,
        rows: Vec<(i64, String)>,
        no_more: bool,
    ) -> Result<i64> {
        let runner_id = runner.id;
        self.db
            .call(move |db| db.append_task_log(runner_id, task_id, index, &rows, no_more))
            .await
    }

    pub async fn task_log(&self, task_id: i64) -> Result<Vec<LogRow>> {
        self.db.call(move |db| db.get_task_log(task_id)).await
    }

    // ── Administration ────────────────────────────────────────────────

    /// Force a task's job into `result`; a no-op when the job is done.
    pub async fn stop_task(&self, task_id: i64, result: Status) -> Result<Vec<JobTransition>> {
        let transitions = self
            .db
            .call(move |db| {
                let task = db
                    .get_task(task_id)?
                    .ok_or(ActionsError::TaskNotFound { id: task_id })?;
                db.stop_job(task.job_id, result)
            })
            .await?;
        if !transitions.is_empty() {
            info!(task_id, result = %result, "task stopped");
        }
        self.propagate(&transitions).await;
        Ok(transitions)
    }

    /// Cancel every job of a run that is not done. Returns how many changed.
    pub async fn cancel_run(&self, run_id: i64) -> Result<usize> {
        let transitions = self.db.call(move |db| db.cancel_run(run_id)).await?;
        info!(run_id, jobs = transitions.len(), "run cancelled");
        self.propagate(&transitions).await;
        Ok(transitions.len())
    }

    pub async fn get_run(&self, run_id: i64) -> Result<RunWithJobs> {
        self.db
            .call(move |db| {
                db.get_run_with_jobs(run_id)?
                    .ok_or_else(|| ActionsError::RunNotFound { id: run_id }.into())
            })
            .await
    }

    pub async fn find_jobs(&self, search: JobSearch) -> Result<Vec<Job>> {
        self.db.call(move |db| db.find_jobs(&search)).await
    }

    pub async fn list_runners(&self) -> Result<Vec<Runner>> {
        self.db.call(|db| db.list_runners()).await
    }

    pub async fn create_registration_token(&self, scope: RunnerScope) -> Result<RegistrationToken> {
        self.db
            .call(move |db| db.create_registration_token(scope))
            .await
    }

    /// Fail stale tasks, cancel abandoned jobs and drop long-offline runners
    /// using the configured timeouts.
    pub async fn sweep(&self) -> Result<SweepOutcome> {
        self.sweep_at(chrono::Utc::now().timestamp()).await
    }

    /// [`Self::sweep`] as if the current time were `now`.
    pub async fn sweep_at(&self, now: i64) -> Result<SweepOutcome> {
        let cutoffs = sweep_cutoffs(&self.settings, now);
        let outcome = self.db.call(move |db| db.sweep(&cutoffs)).await?;
        if outcome.failed_tasks + outcome.cancelled_jobs + outcome.removed_runners > 0 {
            info!(
                failed_tasks = outcome.failed_tasks,
                cancelled_jobs = outcome.cancelled_jobs,
                removed_runners = outcome.removed_runners,
                "sweep finished"
            );
        }
        self.propagate(&outcome.transitions).await;
        Ok(outcome)
    }

    // ── Commit statuses & pull requests ───────────────────────────────

    pub async fn latest_commit_statuses(&self, repo_id: i64, sha: &str) -> Result<Vec<CommitStatus>> {
        let sha = sha.to_string();
        self.db
            .call(move |db| db.latest_commit_statuses(repo_id, &sha))
            .await
    }

    pub async fn upsert_pull_request(
        &self,
        repo_id: i64,
        index: i64,
        head_sha: String,
        base_ref: String,
        required_contexts: Vec<String>,
    ) -> Result<PullRequest> {
        self.db
            .call(move |db| {
                db.upsert_pull_request(repo_id, index, &head_sha, &base_ref, &required_contexts)
            })
            .await
    }

    /// Arm an auto-merge, then check right away in case the head already
    /// passes.
    pub async fn schedule_auto_merge(&self, new: NewAutoMerge) -> Result<bool> {
        let (repo_id, index) = (new.repo_id, new.pull_index);
        let scheduled = automerge::schedule(&self.db, new).await?;
        if let Err(e) = automerge::check_pull_request(&self.db, repo_id, index).await {
            error!(repo_id, pull = index, error = %e, "auto-merge check failed");
        }
        Ok(scheduled)
    }

    pub async fn cancel_auto_merge(&self, repo_id: i64, index: i64) -> Result<bool> {
        automerge::cancel(&self.db, repo_id, index).await
    }

    // ── Propagation ───────────────────────────────────────────────────

    fn publish(&self, msg: &FeedMessage) {
        if let Some(tx) = &self.feed {
            broadcast_message(tx, msg);
        }
    }

    /// Fan job transitions out to commit statuses, auto-merge, the run feed
    /// and run observers, in that order. Never fails: every step logs its
    /// own errors.
    pub async fn propagate(&self, transitions: &[JobTransition]) {
        let mut commits: Vec<(i64, String)> = Vec::new();
        let mut done_runs: Vec<(Run, Status)> = Vec::new();

        for t in transitions {
            commit_status::create_commit_status(&self.db, t).await;
            self.publish(&FeedMessage::JobUpdated {
                job: t.job.clone(),
                from: t.from,
                run_status: t.run.status,
            });
            let commit = (t.run.repo_id, t.job.commit_sha.clone());
            if t.job.status.is_done() && !commits.contains(&commit) {
                commits.push(commit);
            }
            if t.run_now_done() && !done_runs.iter().any(|(r, _)| r.id == t.run.id) {
                done_runs.push((t.run.clone(), t.run_from));
            }
        }

        for (repo_id, sha) in commits {
            match automerge::check_by_sha(&self.db, repo_id, &sha).await {
                Ok(merged) => {
                    for pr in merged {
                        info!(repo_id, pull = pr.index, sha = %sha, "pull request auto-merged");
                    }
                }
                Err(e) => error!(repo_id, sha = %sha, error = %e, "auto-merge check failed"),
            }
        }

        for (run, prior) in done_runs {
            if let Err(e) = notify::notify_run_done(&self.db, &self.notifiers, &run, prior).await {
                warn!(run_id = run.id, error = %e, "run notification failed");
            }
        }
    }
}

fn sweep_cutoffs(settings: &ActionsSection, now: i64) -> SweepCutoffs {
    let before = |secs: u64| now.saturating_sub(i64::try_from(secs).unwrap_or(i64::MAX));
    SweepCutoffs {
        zombie_before: before(settings.zombie_task_timeout_secs),
        endless_before: before(settings.endless_task_timeout_secs),
        abandoned_before: before(settings.abandoned_job_timeout_secs),
        offline_before: (settings.offline_runner_cleanup_secs > 0)
            .then(|| before(settings.offline_runner_cleanup_secs)),
    }
}

fn non_empty_or(value: String, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value
    }
}

fn run_title(event_title: String, wf: &Workflow, workflow_id: &str) -> String {
    let fallback = wf.name.as_deref().unwrap_or(workflow_id);
    non_empty_or(event_title, fallback)
}

/// The single failed job standing in for a workflow that could not be read.
/// It is named after the run so its status context reads like the run.
fn malformed_job(workflow_id: &str, run_title: &str, message: &str) -> NewJob {
    NewJob {
        job_key: workflow_id.to_string(),
        name: run_title.to_string(),
        needs: Vec::new(),
        runs_on: Vec::new(),
        workflow_payload: format!("# malformed workflow: {}\n", message.replace('\n', " ")),
        failed: true,
    }
}

/// Context map a runner needs to execute a leased job.
pub fn task_context(run: &Run, job: &Job) -> serde_json::Value {
    serde_json::json!({
        "event_name": run.event.as_str(),
        "event": run.event_payload,
        "ref": run.ref_name,
        "sha": run.commit_sha,
        "repository_id": run.repo_id,
        "run_id": run.id,
        "run_number": run.index,
        "workflow": run.workflow_id,
        "job": job.job_key,
        "actor": run.trigger_user,
        "inputs": run.event_payload.get("inputs").cloned().unwrap_or_else(|| serde_json::json!({})),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::db::ActionsDb;

    fn service() -> Result<ActionsService> {
        let db = DbHandle::new(ActionsDb::new_in_memory()?);
        Ok(ActionsService::new(db, ActionsSection::default()))
    }

    fn ctx() -> EventContext {
        EventContext {
            repo_id: 1,
            owner_id: 2,
            actor: "alice".into(),
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

    fn file(id: &str, content: &str) -> WorkflowFile {
        WorkflowFile {
            id: id.into(),
            content: content.into(),
        }
    }

    fn dispatch_request(content: &str) -> DispatchRequest {
        DispatchRequest {
            repo_id: 1,
            owner_id: 2,
            actor: "alice".into(),
            workflow: file("deploy.yml", content),
            ref_name: "refs/heads/main".into(),
            commit_sha: "abc".into(),
        }
    }

    const DEPLOY: &str = r#"
name: Deploy
on:
  workflow_dispatch:
    inputs:
      env:
        description: Target environment
        required: true
      debug:
        type: boolean
      region:
        default: eu
jobs:
  deploy:
    runs-on: linux
  verify:
    runs-on: linux
    needs: deploy
"#;

    #[tokio::test]
    async fn test_handle_event_creates_runs() -> Result<()> {
        let svc = service()?;
        let files = [file("ci.yml", "on: push\njobs:\n  build:\n    runs-on: linux\n")];
        let runs = svc.handle_event(&ctx(), &push("add feature\n\nbody", "abc"), &files).await?;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].title, "add feature");
        assert_eq!(runs[0].trigger_user, "alice");
        assert_eq!(runs[0].event, TriggerEvent::Push);

        let statuses = svc.latest_commit_statuses(1, "abc").await?;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].context, "ci.yml / build (push)");
        assert_eq!(statuses[0].state, CommitStatusState::Pending);
        assert_eq!(statuses[0].description, "Waiting to run");
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_workflow_yields_failed_run() -> Result<()> {
        let svc = service()?;
        let files = [file("broken.yml", "on: push\njobs: [")];
        let runs = svc.handle_event(&ctx(), &push("m", "abc"), &files).await?;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, Status::Failure);
        assert_eq!(runs[0].workflow_id, "broken.yml");
        assert_eq!(runs[0].commit_sha, "abc");

        let statuses = svc.latest_commit_statuses(1, "abc").await?;
        assert_eq!(statuses[0].state, CommitStatusState::Failure);
        assert_eq!(statuses[0].context, "broken.yml / m (push)");
        Ok(())
    }

    #[test]
    fn test_sweep_cutoffs() {
        let settings = ActionsSection::default();
        let cutoffs = sweep_cutoffs(&settings, 100_000);
        assert_eq!(cutoffs.zombie_before, 100_000 - 600);
        assert_eq!(cutoffs.endless_before, 100_000 - 3 * 3600);
        assert_eq!(cutoffs.abandoned_before, 100_000 - 24 * 3600);
        assert_eq!(cutoffs.offline_before, None);

        let settings = ActionsSection {
            offline_runner_cleanup_secs: 60,
            ..ActionsSection::default()
        };
        assert_eq!(sweep_cutoffs(&settings, 1_000).offline_before, Some(940));
    }

    #[tokio::test]
    async fn test_default_runs_on_applies_to_unlabeled_jobs() -> Result<()> {
        let db = DbHandle::new(ActionsDb::new_in_memory()?);
        let settings = ActionsSection {
            default_runs_on: vec!["docker".into()],
            ..ActionsSection::default()
        };
        let svc = ActionsService::new(db, settings);
        let files = [file("ci.yml", "on: push\njobs:\n  a:\n    steps: []\n")];
        let runs = svc.handle_event(&ctx(), &push("m", "abc"), &files).await?;
        let run = svc.get_run(runs[0].id).await?;
        assert_eq!(run.jobs[0].runs_on, vec!["docker".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_inflight_event_is_dropped() -> Result<()> {
        let svc = service()?;
        let event = push("m", "abc");
        let _held = svc
            .claim(inflight_key(1, &event_class(&event), "abc"))
            .expect("first claim");
        let files = [file("ci.yml", "on: push\njobs:\n  a:\n    runs-on: x\n")];
        assert!(svc.handle_event(&ctx(), &event, &files).await?.is_empty());
        drop(_held);
        assert_eq!(svc.handle_event(&ctx(), &event, &files).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_dispatch_resolves_inputs() -> Result<()> {
        let svc = service()?;
        let (run, jobs) = svc
            .dispatch(dispatch_request(DEPLOY), |key| match key {
                "env" => Some("prod".into()),
                "debug" => Some("on".into()),
                _ => None,
            })
            .await?;
        assert_eq!(jobs, vec!["deploy".to_string(), "verify".to_string()]);
        assert_eq!(run.title, "Deploy");
        assert_eq!(run.event, TriggerEvent::WorkflowDispatch);
        assert_eq!(run.event_payload["inputs"]["env"], "prod");
        assert_eq!(run.event_payload["inputs"]["debug"], "true");
        assert_eq!(run.event_payload["inputs"]["region"], "eu");
        Ok(())
    }

    #[tokio::test]
    async fn test_dispatch_boolean_not_on_is_false() -> Result<()> {
        let svc = service()?;
        let (run, _) = svc
            .dispatch(dispatch_request(DEPLOY), |key| match key {
                "env" => Some("dev".into()),
                "debug" => Some("yes".into()),
                _ => None,
            })
            .await?;
        assert_eq!(run.event_payload["inputs"]["debug"], "false");
        Ok(())
    }

    #[tokio::test]
    async fn test_dispatch_missing_required_input() -> Result<()> {
        let svc = service()?;
        let err = svc.dispatch(dispatch_request(DEPLOY), |_| None).await.unwrap_err();
        match crate::errors::find_actions_error(&err) {
            Some(ActionsError::InputRequired { name }) => assert_eq!(name, "Target environment"),
            other => panic!("expected InputRequired, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_dispatch_input_limit() -> Result<()> {
        let db = DbHandle::new(ActionsDb::new_in_memory()?);
        let settings = ActionsSection {
            limit_dispatch_inputs: 1,
            ..ActionsSection::default()
        };
        let svc = ActionsService::new(db, settings);
        let err = svc
            .dispatch(dispatch_request(DEPLOY), |_| Some("x".into()))
            .await
            .unwrap_err();
        assert!(matches!(
            crate::errors::find_actions_error(&err),
            Some(ActionsError::TooManyInputs { count: 3, limit: 1 })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_dispatch_requires_trigger() -> Result<()> {
        let svc = service()?;
        let err = svc
            .dispatch(dispatch_request("on: push\njobs:\n  a:\n    runs-on: x\n"), |_| None)
            .await
            .unwrap_err();
        assert!(matches!(
            crate::errors::find_actions_error(&err),
            Some(ActionsError::NotDispatchable { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_fetch_task_honours_tasks_version() -> Result<()> {
        let svc = service()?;
        let reg = svc.create_registration_token(RunnerScope::Global).await?;
        let (runner, _) = svc
            .register_runner(&reg.token, "r1", "v1", vec!["linux".into()])
            .await?;

        let empty = svc.fetch_task(&runner, 0).await?;
        assert!(empty.task.is_none());
        assert_eq!(empty.tasks_version, 0);

        let files = [file("ci.yml", "on: push\njobs:\n  build:\n    runs-on: linux\n")];
        svc.handle_event(&ctx(), &push("m", "abc"), &files).await?;

        // Client already at the latest version: nothing is leased.
        let unchanged = svc.fetch_task(&runner, 1).await?;
        assert!(unchanged.task.is_none());
        assert_eq!(unchanged.tasks_version, 1);

        let fetched = svc.fetch_task(&runner, 0).await?;
        assert_eq!(fetched.tasks_version, 1);
        let task = fetched.task.expect("task leased");
        assert_eq!(task.context["event_name"], "push");
        assert_eq!(task.context["sha"], "abc");
        assert_eq!(task.context["job"], "build");
        assert!(task.workflow_payload.contains("build"));
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_task_unknown() -> Result<()> {
        let svc = service()?;
        let err = svc.stop_task(99, Status::Cancelled).await.unwrap_err();
        assert!(matches!(
            crate::errors::find_actions_error(&err),
            Some(ActionsError::TaskNotFound { id: 99 })
        ));
        Ok(())
    }
}
