use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, error};

use super::models::*;
use super::registry::{self, Credential};
use crate::errors::ActionsError;

/// Async-safe handle to the actions database.
///
/// Wraps `ActionsDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`. Every closure runs with the
/// mutex held, so a closure is the unit of mutual exclusion for the store.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<ActionsDb>>,
}

impl DbHandle {
    pub fn new(db: ActionsDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&ActionsDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| ActionsError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Used for startup and tests;
    /// never call this from an async request path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, ActionsDb>> {
        self.inner
            .lock()
            .map_err(|_| ActionsError::LockPoisoned.into())
    }
}

pub struct ActionsDb {
    conn: Connection,
}

// ── Creation requests ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NewRun {
    pub repo_id: i64,
    pub owner_id: i64,
    pub workflow_id: String,
    pub title: String,
    pub trigger_user: String,
    pub event: TriggerEvent,
    pub event_action: Option<String>,
    pub event_payload: serde_json::Value,
    pub ref_name: String,
    pub commit_sha: String,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_key: String,
    pub name: String,
    pub needs: Vec<String>,
    pub runs_on: Vec<String>,
    pub workflow_payload: String,
    /// Start the job in `failure` without ever leasing it.
    pub failed: bool,
}

#[derive(Debug, Clone)]
pub struct CreatedRun {
    pub run: Run,
    pub jobs: Vec<Job>,
    pub transitions: Vec<JobTransition>,
}

/// A waiting job bound to a runner by `lease_job`.
#[derive(Debug, Clone)]
pub struct Lease {
    pub task: Task,
    pub job: Job,
    pub run: Run,
    pub transition: JobTransition,
}

#[derive(Debug, Clone)]
pub struct TaskUpdate {
    pub task: Task,
    pub job: Job,
    /// Every output key stored for the task so far.
    pub sent_outputs: Vec<String>,
    pub transitions: Vec<JobTransition>,
}

#[derive(Debug, Clone)]
pub struct NewCommitStatus {
    pub repo_id: i64,
    pub sha: String,
    pub context: String,
    pub state: CommitStatusState,
    pub description: String,
    pub target_url: String,
    pub seq: i64,
}

#[derive(Debug, Clone, Default)]
pub struct JobSearch {
    /// Defaults to waiting and running jobs.
    pub statuses: Vec<Status>,
    /// Only jobs a runner with these labels could run.
    pub labels: Vec<String>,
    pub owner_id: Option<i64>,
    pub repo_id: Option<i64>,
}

/// Timestamps before which the sweep treats rows as stale.
#[derive(Debug, Clone, Copy)]
pub struct SweepCutoffs {
    /// Running tasks last updated before this are failed.
    pub zombie_before: i64,
    /// Running tasks started before this are failed.
    pub endless_before: i64,
    /// Waiting or blocked jobs last updated before this are cancelled.
    pub abandoned_before: i64,
    /// Runners last seen before this are removed.
    pub offline_before: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct SweepOutcome {
    pub failed_tasks: usize,
    pub cancelled_jobs: usize,
    pub removed_runners: usize,
    pub transitions: Vec<JobTransition>,
}

#[derive(Debug, Clone)]
pub struct NewAutoMerge {
    pub repo_id: i64,
    pub pull_index: i64,
    pub doer: String,
    pub merge_style: MergeStyle,
    pub message: String,
    pub delete_branch_after_merge: bool,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Cut a run title to 255 bytes without splitting a character.
pub fn truncate_title(title: &str) -> String {
    const MAX: usize = 255;
    if title.len() <= MAX {
        return title.to_string();
    }
    let mut end = MAX;
    while !title.is_char_boundary(end) {
        end -= 1;
    }
    title[..end].to_string()
}

impl ActionsDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(ActionsError::from)
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_index INTEGER NOT NULL,
                    repo_id INTEGER NOT NULL,
                    owner_id INTEGER NOT NULL DEFAULT 0,
                    workflow_id TEXT NOT NULL,
                    title TEXT NOT NULL,
                    trigger_user TEXT NOT NULL DEFAULT '',
                    event TEXT NOT NULL,
                    event_action TEXT,
                    event_payload TEXT NOT NULL DEFAULT '{}',
                    ref_name TEXT NOT NULL,
                    commit_sha TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'waiting',
                    created INTEGER NOT NULL,
                    started INTEGER,
                    stopped INTEGER,
                    UNIQUE(repo_id, run_index)
                );

                CREATE TABLE IF NOT EXISTS run_indexes (
                    repo_id INTEGER PRIMARY KEY,
                    max_index INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS runners (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uuid TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    owner_id INTEGER NOT NULL DEFAULT 0,
                    repo_id INTEGER NOT NULL DEFAULT 0,
                    version TEXT NOT NULL DEFAULT '',
                    labels TEXT NOT NULL DEFAULT '[]',
                    token_hash TEXT NOT NULL,
                    token_salt TEXT NOT NULL,
                    last_online INTEGER,
                    last_active INTEGER,
                    created INTEGER NOT NULL,
                    deleted INTEGER
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                    repo_id INTEGER NOT NULL,
                    owner_id INTEGER NOT NULL DEFAULT 0,
                    commit_sha TEXT NOT NULL,
                    job_index INTEGER NOT NULL,
                    job_key TEXT NOT NULL,
                    name TEXT NOT NULL,
                    needs TEXT NOT NULL DEFAULT '[]',
                    runs_on TEXT NOT NULL DEFAULT '[]',
                    workflow_payload TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL,
                    task_id INTEGER,
                    runner_id INTEGER REFERENCES runners(id),
                    started INTEGER,
                    stopped INTEGER,
                    updated INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS tasks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    runner_id INTEGER NOT NULL REFERENCES runners(id),
                    token TEXT NOT NULL,
                    status TEXT NOT NULL,
                    log_length INTEGER NOT NULL DEFAULT 0,
                    log_sealed INTEGER NOT NULL DEFAULT 0,
                    started INTEGER NOT NULL,
                    stopped INTEGER,
                    updated INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS task_logs (
                    task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    line_index INTEGER NOT NULL,
                    time INTEGER NOT NULL,
                    content TEXT NOT NULL,
                    PRIMARY KEY (task_id, line_index)
                );

                CREATE TABLE IF NOT EXISTS task_outputs (
                    task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    output_key TEXT NOT NULL,
                    output_value TEXT NOT NULL,
                    PRIMARY KEY (task_id, output_key)
                );

                CREATE TABLE IF NOT EXISTS registration_tokens (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    token TEXT NOT NULL UNIQUE,
                    owner_id INTEGER NOT NULL DEFAULT 0,
                    repo_id INTEGER NOT NULL DEFAULT 0,
                    is_active INTEGER NOT NULL DEFAULT 1,
                    created INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS tasks_versions (
                    owner_id INTEGER NOT NULL,
                    repo_id INTEGER NOT NULL,
                    version INTEGER NOT NULL,
                    PRIMARY KEY (owner_id, repo_id)
                );

                CREATE TABLE IF NOT EXISTS commit_statuses (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repo_id INTEGER NOT NULL,
                    sha TEXT NOT NULL,
                    context TEXT NOT NULL,
                    state TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    target_url TEXT NOT NULL DEFAULT '',
                    seq INTEGER NOT NULL,
                    created INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS pull_requests (
                    repo_id INTEGER NOT NULL,
                    pull_index INTEGER NOT NULL,
                    head_sha TEXT NOT NULL,
                    base_ref TEXT NOT NULL DEFAULT '',
                    required_contexts TEXT NOT NULL DEFAULT '[]',
                    merged INTEGER NOT NULL DEFAULT 0,
                    merged_by TEXT,
                    merge_style TEXT,
                    PRIMARY KEY (repo_id, pull_index)
                );

                CREATE TABLE IF NOT EXISTS auto_merges (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repo_id INTEGER NOT NULL,
                    pull_index INTEGER NOT NULL,
                    doer TEXT NOT NULL,
                    merge_style TEXT NOT NULL,
                    message TEXT NOT NULL DEFAULT '',
                    delete_branch INTEGER NOT NULL DEFAULT 0,
                    created INTEGER NOT NULL,
                    UNIQUE(repo_id, pull_index)
                );

                CREATE TABLE IF NOT EXISTS sequences (
                    name TEXT PRIMARY KEY,
                    value INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_runs_workflow_ref
                    ON runs(repo_id, workflow_id, ref_name, created);
                CREATE INDEX IF NOT EXISTS idx_runs_commit ON runs(repo_id, commit_sha);
                CREATE INDEX IF NOT EXISTS idx_jobs_run ON jobs(run_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                CREATE INDEX IF NOT EXISTS idx_tasks_job ON tasks(job_id);
                CREATE INDEX IF NOT EXISTS idx_commit_statuses_context
                    ON commit_statuses(repo_id, sha, context, seq);
                CREATE INDEX IF NOT EXISTS idx_pull_requests_head
                    ON pull_requests(repo_id, head_sha);
                ",
            )
            .context("Failed to create tables")?;

        // Additive migrations for databases created before these columns
        // existed. Only "duplicate column" errors are ignored.
        for (table, column) in [
            ("jobs", "updated INTEGER NOT NULL DEFAULT 0"),
            ("tasks", "updated INTEGER NOT NULL DEFAULT 0"),
            ("runners", "deleted INTEGER"),
        ] {
            match self
                .conn
                .execute(&format!("ALTER TABLE {} ADD COLUMN {}", table, column), [])
            {
                Ok(_) => {}
                Err(e) if e.to_string().contains("duplicate column") => {}
                Err(e) => {
                    return Err(anyhow::anyhow!(
                        "Failed to add {} column to {}: {}",
                        column,
                        table,
                        e
                    ));
                }
            }
        }
        Ok(())
    }

    // ── Runs ──────────────────────────────────────────────────────────

    /// Create a run and all of its jobs atomically.
    ///
    /// Jobs start `waiting`, or `blocked` when they declare `needs`, or
    /// `failure` when `failed` is set.
    pub fn insert_run(&self, new: &NewRun, jobs: &[NewJob]) -> Result<CreatedRun> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let ts = now();

        tx.execute(
            "INSERT INTO run_indexes (repo_id, max_index) VALUES (?1, 1)
             ON CONFLICT(repo_id) DO UPDATE SET max_index = max_index + 1",
            params![new.repo_id],
        )
        .context("Failed to allocate run index")?;
        let index: i64 = tx.query_row(
            "SELECT max_index FROM run_indexes WHERE repo_id = ?1",
            params![new.repo_id],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO runs (run_index, repo_id, owner_id, workflow_id, title, trigger_user, event,
                               event_action, event_payload, ref_name, commit_sha, status, created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 'waiting', ?12)",
            params![
                index,
                new.repo_id,
                new.owner_id,
                new.workflow_id,
                truncate_title(&new.title),
                new.trigger_user,
                new.event.as_str(),
                new.event_action,
                new.event_payload.to_string(),
                new.ref_name,
                new.commit_sha,
                ts,
            ],
        )
        .context("Failed to insert run")?;
        let run_id = tx.last_insert_rowid();

        let mut has_waiting = false;
        for (i, job) in jobs.iter().enumerate() {
            let status = if job.failed {
                Status::Failure
            } else if !job.needs.is_empty() {
                Status::Blocked
            } else {
                has_waiting = true;
                Status::Waiting
            };
            let finished_at = job.failed.then_some(ts);
            tx.execute(
                "INSERT INTO jobs (run_id, repo_id, owner_id, commit_sha, job_index, job_key, name,
                                   needs, runs_on, workflow_payload, status, started, stopped,
                                   updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12, ?13)",
                params![
                    run_id,
                    new.repo_id,
                    new.owner_id,
                    new.commit_sha,
                    i as i64,
                    job.job_key,
                    job.name,
                    serde_json::to_string(&job.needs)?,
                    serde_json::to_string(&job.runs_on)?,
                    job.workflow_payload,
                    status.as_str(),
                    finished_at,
                    ts,
                ],
            )
            .context("Failed to insert job")?;
        }

        if has_waiting {
            bump_tasks_versions(&tx, new.owner_id, new.repo_id)?;
        }

        let (_, run) = refresh_run_status(&tx, run_id, ts)?;
        let created_jobs = load_run_jobs(&tx, run_id)?;
        let mut transitions = Vec::with_capacity(created_jobs.len());
        for job in &created_jobs {
            transitions.push(JobTransition {
                seq: next_seq(&tx, "job_state")?,
                job: job.clone(),
                from: None,
                run: run.clone(),
                run_from: Status::Waiting,
            });
        }

        tx.commit().context("Failed to commit run creation")?;
        Ok(CreatedRun {
            run,
            jobs: created_jobs,
            transitions,
        })
    }

    pub fn get_run(&self, id: i64) -> Result<Option<Run>> {
        load_run(&self.conn, id)
    }

    pub fn get_run_jobs(&self, run_id: i64) -> Result<Vec<Job>> {
        load_run_jobs(&self.conn, run_id)
    }

    pub fn get_run_with_jobs(&self, id: i64) -> Result<Option<RunWithJobs>> {
        let Some(run) = self.get_run(id)? else {
            return Ok(None);
        };
        let jobs = self.get_run_jobs(id)?;
        Ok(Some(RunWithJobs { run, jobs }))
    }

    /// The latest done run before `run` for the same repo, workflow and ref.
    ///
    /// Runs are ordered by creation time, ties broken by ascending id.
    pub fn previous_terminal_run(&self, run: &Run) -> Result<Option<Run>> {
        let mut runs = query_runs(
            &self.conn,
            &format!(
                "SELECT {} FROM runs
                 WHERE repo_id = ?1 AND workflow_id = ?2 AND ref_name = ?3
                   AND status IN ('success', 'failure', 'cancelled', 'skipped')
                   AND (created < ?4 OR (created = ?4 AND id < ?5))
                 ORDER BY created DESC, id DESC
                 LIMIT 1",
                RUN_COLUMNS
            ),
            params![run.repo_id, run.workflow_id, run.ref_name, run.created, run.id],
        )?;
        Ok(runs.pop())
    }

    /// Whether an `opened` pull request event already produced a run for `sha`.
    pub fn has_opened_pull_request_run(&self, repo_id: i64, sha: &str) -> Result<bool> {
        let exists: bool = self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM runs
             WHERE repo_id = ?1 AND commit_sha = ?2
               AND event IN ('pull_request', 'pull_request_target')
               AND event_action = 'opened'",
            params![repo_id, sha],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Stop every job of a run that is not done yet.
    pub fn cancel_run(&self, run_id: i64) -> Result<Vec<JobTransition>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        if load_run(&tx, run_id)?.is_none() {
            return Err(ActionsError::RunNotFound { id: run_id }.into());
        }
        let pending: Vec<(Job, Status)> = load_run_jobs(&tx, run_id)?
            .into_iter()
            .filter(|j| !j.status.is_done())
            .map(|j| (j, Status::Cancelled))
            .collect();
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        let transitions = finish_jobs(&tx, run_id, pending, now())?;
        tx.commit().context("Failed to commit run cancellation")?;
        Ok(transitions)
    }

    /// Cancel the unfinished runs that `run` supersedes: same repository,
    /// workflow, ref and trigger event, created before it.
    pub fn cancel_superseded_runs(&self, run: &Run) -> Result<Vec<JobTransition>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let older = query_runs(
            &tx,
            &format!(
                "SELECT {} FROM runs
                 WHERE repo_id = ?1 AND workflow_id = ?2 AND ref_name = ?3 AND event = ?4
                   AND status IN ('blocked', 'waiting', 'running')
                   AND id < ?5
                 ORDER BY id ASC",
                RUN_COLUMNS
            ),
            params![
                run.repo_id,
                run.workflow_id,
                run.ref_name,
                run.event.as_str(),
                run.id
            ],
        )?;

        let ts = now();
        let mut transitions = Vec::new();
        for old in older {
            let pending: Vec<(Job, Status)> = load_run_jobs(&tx, old.id)?
                .into_iter()
                .filter(|j| !j.status.is_done())
                .map(|j| (j, Status::Cancelled))
                .collect();
            if pending.is_empty() {
                continue;
            }
            debug!(run_id = old.id, superseded_by = run.id, "cancelling superseded run");
            transitions.extend(finish_jobs(&tx, old.id, pending, ts)?);
        }
        tx.commit().context("Failed to commit superseded run cancellation")?;
        Ok(transitions)
    }

    /// Fail stale running tasks, cancel abandoned jobs and remove runners
    /// that have been offline too long, in one transaction.
    pub fn sweep(&self, cutoffs: &SweepCutoffs) -> Result<SweepOutcome> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let ts = now();
        let mut outcome = SweepOutcome::default();

        let stale_job_ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT job_id FROM tasks
                 WHERE status = 'running' AND (updated < ?1 OR started < ?2)
                 ORDER BY id ASC",
            )?;
            let ids = stmt
                .query_map(params![cutoffs.zombie_before, cutoffs.endless_before], |row| {
                    row.get::<_, i64>(0)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };
        let mut by_run: BTreeMap<i64, Vec<(Job, Status)>> = BTreeMap::new();
        for job_id in stale_job_ids {
            let Some(job) = load_job(&tx, job_id)? else {
                continue;
            };
            if job.status == Status::Running {
                by_run.entry(job.run_id).or_default().push((job, Status::Failure));
            }
        }
        for (run_id, jobs) in by_run {
            outcome.failed_tasks += jobs.len();
            outcome.transitions.extend(finish_jobs(&tx, run_id, jobs, ts)?);
        }

        let abandoned = query_jobs(
            &tx,
            &format!(
                "SELECT {} FROM jobs
                 WHERE status IN ('waiting', 'blocked') AND updated < ?1
                 ORDER BY id ASC",
                JOB_COLUMNS
            ),
            params![cutoffs.abandoned_before],
        )?;
        let mut by_run: BTreeMap<i64, Vec<(Job, Status)>> = BTreeMap::new();
        for job in abandoned {
            by_run.entry(job.run_id).or_default().push((job, Status::Cancelled));
        }
        for (run_id, jobs) in by_run {
            outcome.cancelled_jobs += jobs.len();
            outcome.transitions.extend(finish_jobs(&tx, run_id, jobs, ts)?);
        }

        if let Some(before) = cutoffs.offline_before {
            outcome.removed_runners = tx
                .execute(
                    "UPDATE runners SET deleted = ?1
                     WHERE deleted IS NULL AND COALESCE(last_online, created) < ?2",
                    params![ts, before],
                )
                .context("Failed to remove offline runners")?;
        }

        tx.commit().context("Failed to commit sweep")?;
        Ok(outcome)
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    pub fn get_job(&self, id: i64) -> Result<Option<Job>> {
        load_job(&self.conn, id)
    }

    /// Read-only job search used by runner dashboards.
    pub fn find_jobs(&self, search: &JobSearch) -> Result<Vec<Job>> {
        let statuses = if search.statuses.is_empty() {
            vec![Status::Waiting, Status::Running]
        } else {
            search.statuses.clone()
        };
        let status_list = statuses
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let jobs = query_jobs(
            &self.conn,
            &format!(
                "SELECT {} FROM jobs
                 WHERE status IN ({})
                   AND (?1 IS NULL OR owner_id = ?1)
                   AND (?2 IS NULL OR repo_id = ?2)
                 ORDER BY id ASC",
                JOB_COLUMNS, status_list
            ),
            params![search.owner_id, search.repo_id],
        )?;
        Ok(jobs
            .into_iter()
            .filter(|j| search.labels.is_empty() || j.labels_satisfied_by(&search.labels))
            .collect())
    }

    /// Lease the oldest waiting job visible to `runner` whose `runs-on`
    /// labels the runner carries.
    ///
    /// The job row moves `waiting → running` with a compare-and-swap on its
    /// status, so a job is leased at most once whatever the interleaving.
    pub fn lease_job(&self, runner: &Runner) -> Result<Option<Lease>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let candidates = query_jobs(
            &tx,
            &format!(
                "SELECT {} FROM jobs WHERE status = 'waiting' ORDER BY id ASC",
                JOB_COLUMNS
            ),
            [],
        )?;
        let Some(job) = candidates.into_iter().find(|j| {
            runner.scope.covers(j.owner_id, j.repo_id) && j.labels_satisfied_by(&runner.labels)
        }) else {
            return Ok(None);
        };

        let ts = now();
        let changed = tx
            .execute(
                "UPDATE jobs SET status = 'running', runner_id = ?1, started = ?2, updated = ?2
                 WHERE id = ?3 AND status = 'waiting'",
                params![runner.id, ts, job.id],
            )
            .context("Failed to lease job")?;
        if changed != 1 {
            debug!(job_id = job.id, runner = %runner.name, "lease conflict");
            return Ok(None);
        }

        let token = uuid::Uuid::new_v4().simple().to_string();
        tx.execute(
            "INSERT INTO tasks (job_id, runner_id, token, status, started, updated)
             VALUES (?1, ?2, ?3, 'running', ?4, ?4)",
            params![job.id, runner.id, token, ts],
        )
        .context("Failed to insert task")?;
        let task_id = tx.last_insert_rowid();
        tx.execute(
            "UPDATE jobs SET task_id = ?1 WHERE id = ?2",
            params![task_id, job.id],
        )?;

        let (run_from, run) = refresh_run_status(&tx, job.run_id, ts)?;
        let job = load_job(&tx, job.id)?.context("Job vanished while leasing")?;
        let task = load_task(&tx, task_id)?.context("Task vanished while leasing")?;
        let transition = JobTransition {
            seq: next_seq(&tx, "job_state")?,
            job: job.clone(),
            from: Some(Status::Waiting),
            run: run.clone(),
            run_from,
        };

        tx.commit().context("Failed to commit lease")?;
        Ok(Some(Lease {
            task,
            job,
            run,
            transition,
        }))
    }

    /// Record the terminal result of a running job.
    ///
    /// Repeating the stored result is a no-op; any other write to a done job
    /// is an invalid transition.
    pub fn set_job_terminal(
        &self,
        job_id: i64,
        result: Status,
        stopped_at: Option<i64>,
    ) -> Result<Vec<JobTransition>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let transitions = set_terminal_tx(&tx, job_id, result, stopped_at.unwrap_or_else(now))?;
        tx.commit().context("Failed to commit job result")?;
        Ok(transitions)
    }

    /// Force a job that is not done yet into `result`. No-op on a done job.
    pub fn stop_job(&self, job_id: i64, result: Status) -> Result<Vec<JobTransition>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let job = load_job(&tx, job_id)?.ok_or(ActionsError::JobNotFound { id: job_id })?;
        if job.status.is_done() && result.is_done() {
            debug!(job_id, status = %job.status, "stop on a finished job ignored");
            return Ok(Vec::new());
        }
        if !result.is_done() || !job.status.can_transition_to(result) {
            return Err(ActionsError::InvalidTransition {
                job_id,
                from: job.status,
                to: result,
            }
            .into());
        }
        let run_id = job.run_id;
        let transitions = finish_jobs(&tx, run_id, vec![(job, result)], now())?;
        tx.commit().context("Failed to commit job stop")?;
        Ok(transitions)
    }

    /// Results and outputs of the jobs `job` needs, keyed by job key.
    pub fn job_needs(&self, job: &Job) -> Result<BTreeMap<String, TaskNeed>> {
        let mut needs = BTreeMap::new();
        if job.needs.is_empty() {
            return Ok(needs);
        }
        for other in load_run_jobs(&self.conn, job.run_id)? {
            if !job.needs.contains(&other.job_key) {
                continue;
            }
            let outputs = match other.task_id {
                Some(task_id) => self.get_task_outputs(task_id)?,
                None => BTreeMap::new(),
            };
            needs.insert(
                other.job_key.clone(),
                TaskNeed {
                    result: other.status,
                    outputs,
                },
            );
        }
        Ok(needs)
    }

    // ── Tasks ─────────────────────────────────────────────────────────

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        load_task(&self.conn, id)
    }

    /// Merge step outputs into a task and, with a result, finish its job.
    pub fn update_task(
        &self,
        runner_id: i64,
        task_id: i64,
        result: Option<Status>,
        stopped_at: Option<i64>,
        outputs: &BTreeMap<String, String>,
    ) -> Result<TaskUpdate> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let task = load_task(&tx, task_id)?.ok_or(ActionsError::TaskNotFound { id: task_id })?;
        if task.runner_id != runner_id {
            return Err(ActionsError::TaskRunnerMismatch { task_id }.into());
        }
        let job = load_job(&tx, task.job_id)?.ok_or(ActionsError::JobNotFound { id: task.job_id })?;

        // Outputs of a finished job are frozen.
        if !job.status.is_done() {
            for (key, value) in outputs {
                tx.execute(
                    "INSERT OR IGNORE INTO task_outputs (task_id, output_key, output_value)
                     VALUES (?1, ?2, ?3)",
                    params![task_id, key, value],
                )
                .context("Failed to store task output")?;
            }
            tx.execute(
                "UPDATE tasks SET updated = ?1 WHERE id = ?2",
                params![now(), task_id],
            )
            .context("Failed to touch task")?;
        }
        let sent_outputs = {
            let mut stmt = tx.prepare(
                "SELECT output_key FROM task_outputs WHERE task_id = ?1 ORDER BY output_key",
            )?;
            let keys = stmt
                .query_map(params![task_id], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            keys
        };

        let transitions = match result {
            Some(result) => {
                set_terminal_tx(&tx, task.job_id, result, stopped_at.unwrap_or_else(now))?
            }
            None => Vec::new(),
        };

        let task = load_task(&tx, task_id)?.context("Task vanished during update")?;
        let job = load_job(&tx, task.job_id)?.context("Job vanished during update")?;
        tx.commit().context("Failed to commit task update")?;
        Ok(TaskUpdate {
            task,
            job,
            sent_outputs,
            transitions,
        })
    }

    pub fn get_task_outputs(&self, task_id: i64) -> Result<BTreeMap<String, String>> {
        let mut stmt = self.conn.prepare(
            "SELECT output_key, output_value FROM task_outputs WHERE task_id = ?1",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut outputs = BTreeMap::new();
        for row in rows {
            let (k, v) = row?;
            outputs.insert(k, v);
        }
        Ok(outputs)
    }

    /// Append log rows at the server-side cursor and return the new length.
    ///
    /// `index` must equal the cursor; `no_more` seals the log.
    pub fn append_task_log(
        &self,
        runner_id: i64,
        task_id: i64,
        index: i64,
        rows: &[(i64, String)],
        no_more: bool,
    ) -> Result<i64> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let task = load_task(&tx, task_id)?.ok_or(ActionsError::TaskNotFound { id: task_id })?;
        if task.runner_id != runner_id {
            return Err(ActionsError::TaskRunnerMismatch { task_id }.into());
        }
        if task.log_sealed {
            if rows.is_empty() && index == task.log_length {
                return Ok(task.log_length);
            }
            return Err(ActionsError::LogSealed { task_id }.into());
        }
        if index != task.log_length {
            return Err(ActionsError::LogIndexMismatch {
                task_id,
                expected: task.log_length,
                got: index,
            }
            .into());
        }

        for (offset, (time, content)) in rows.iter().enumerate() {
            tx.execute(
                "INSERT INTO task_logs (task_id, line_index, time, content) VALUES (?1, ?2, ?3, ?4)",
                params![task_id, index + offset as i64, time, content],
            )
            .context("Failed to append log row")?;
        }
        let length = index + rows.len() as i64;
        tx.execute(
            "UPDATE tasks SET log_length = ?1, log_sealed = ?2, updated = ?3 WHERE id = ?4",
            params![length, no_more, now(), task_id],
        )?;
        tx.commit().context("Failed to commit log rows")?;
        Ok(length)
    }

    pub fn get_task_log(&self, task_id: i64) -> Result<Vec<LogRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT line_index, time, content FROM task_logs WHERE task_id = ?1 ORDER BY line_index",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok(LogRow {
                index: row.get(0)?,
                time: row.get(1)?,
                content: row.get(2)?,
            })
        })?;
        let mut log = Vec::new();
        for row in rows {
            log.push(row?);
        }
        Ok(log)
    }

    // ── Tasks version ─────────────────────────────────────────────────

    pub fn get_tasks_version(&self, scope: RunnerScope) -> Result<i64> {
        let (owner_id, repo_id) = scope.ids();
        let version = self
            .conn
            .query_row(
                "SELECT version FROM tasks_versions WHERE owner_id = ?1 AND repo_id = ?2",
                params![owner_id, repo_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.unwrap_or(0))
    }

    // ── Runners ───────────────────────────────────────────────────────

    /// Issue a registration token for `scope`, retiring the previous ones.
    pub fn create_registration_token(&self, scope: RunnerScope) -> Result<RegistrationToken> {
        let (owner_id, repo_id) = scope.ids();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "UPDATE registration_tokens SET is_active = 0 WHERE owner_id = ?1 AND repo_id = ?2",
            params![owner_id, repo_id],
        )?;
        let token = registry::new_registration_token();
        let ts = now();
        tx.execute(
            "INSERT INTO registration_tokens (token, owner_id, repo_id, is_active, created)
             VALUES (?1, ?2, ?3, 1, ?4)",
            params![token, owner_id, repo_id, ts],
        )
        .context("Failed to insert registration token")?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(RegistrationToken {
            id,
            token,
            scope,
            is_active: true,
            created: ts,
        })
    }

    fn get_active_registration_token(&self, token: &str) -> Result<Option<RegistrationToken>> {
        self.conn
            .query_row(
                "SELECT id, token, owner_id, repo_id, is_active, created
                 FROM registration_tokens WHERE token = ?1 AND is_active = 1",
                params![token],
                |row| {
                    Ok(RegistrationToken {
                        id: row.get(0)?,
                        token: row.get(1)?,
                        scope: RunnerScope::from_ids(row.get(2)?, row.get(3)?),
                        is_active: row.get(4)?,
                        created: row.get(5)?,
                    })
                },
            )
            .optional()
            .context("Failed to query registration token")
    }

    /// Register a runner with a registration token.
    ///
    /// A runner registering again under the same name and scope keeps its
    /// identity; its credential is rotated and its labels replaced.
    /// Returns the runner and its clear-text token.
    pub fn register_runner(
        &self,
        registration_token: &str,
        name: &str,
        version: &str,
        labels: &[String],
    ) -> Result<(Runner, String)> {
        let reg = self
            .get_active_registration_token(registration_token)?
            .ok_or(ActionsError::InvalidRegistrationToken)?;
        let (owner_id, repo_id) = reg.scope.ids();
        let cred = Credential::generate();
        let labels_json = serde_json::to_string(labels)?;
        let ts = now();

        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM runners
                 WHERE name = ?1 AND owner_id = ?2 AND repo_id = ?3 AND deleted IS NULL",
                params![name, owner_id, repo_id],
                |row| row.get(0),
            )
            .optional()?;

        let id = match existing {
            Some(id) => {
                self.conn
                    .execute(
                        "UPDATE runners SET version = ?1, labels = ?2, token_hash = ?3, token_salt = ?4
                         WHERE id = ?5",
                        params![version, labels_json, cred.hash, cred.salt, id],
                    )
                    .context("Failed to update runner")?;
                id
            }
            None => {
                self.conn
                    .execute(
                        "INSERT INTO runners (uuid, name, owner_id, repo_id, version, labels,
                                              token_hash, token_salt, created)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                        params![
                            uuid::Uuid::new_v4().to_string(),
                            name,
                            owner_id,
                            repo_id,
                            version,
                            labels_json,
                            cred.hash,
                            cred.salt,
                            ts,
                        ],
                    )
                    .context("Failed to insert runner")?;
                self.conn.last_insert_rowid()
            }
        };

        let runner = self.get_runner(id)?.context("Runner vanished after register")?;
        Ok((runner, cred.token))
    }

    pub fn get_runner(&self, id: i64) -> Result<Option<Runner>> {
        let mut runners = query_runners(
            &self.conn,
            &format!("SELECT {} FROM runners WHERE id = ?1", RUNNER_COLUMNS),
            params![id],
        )?;
        Ok(runners.pop())
    }

    pub fn list_runners(&self) -> Result<Vec<Runner>> {
        query_runners(
            &self.conn,
            &format!(
                "SELECT {} FROM runners WHERE deleted IS NULL ORDER BY id",
                RUNNER_COLUMNS
            ),
            [],
        )
    }

    /// Authenticate a runner call and record that the runner is online.
    /// With `active`, the runner is also marked as making progress.
    pub fn authenticate_runner(&self, uuid: &str, token: &str, active: bool) -> Result<Runner> {
        let stored: Option<(i64, String, String)> = self
            .conn
            .query_row(
                "SELECT id, token_hash, token_salt FROM runners
                 WHERE uuid = ?1 AND deleted IS NULL",
                params![uuid],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((id, hash, salt)) = stored else {
            return Err(ActionsError::Unauthenticated.into());
        };
        if !registry::verify_token(token, &salt, &hash) {
            return Err(ActionsError::Unauthenticated.into());
        }

        let ts = now();
        if active {
            self.conn.execute(
                "UPDATE runners SET last_online = ?1, last_active = ?1 WHERE id = ?2",
                params![ts, id],
            )?;
        } else {
            self.conn.execute(
                "UPDATE runners SET last_online = ?1 WHERE id = ?2",
                params![ts, id],
            )?;
        }
        self.get_runner(id)?.context("Runner vanished during auth")
    }

    /// Update the version and labels a runner advertises.
    pub fn declare_runner(&self, id: i64, version: &str, labels: &[String]) -> Result<Runner> {
        self.conn
            .execute(
                "UPDATE runners SET version = ?1, labels = ?2 WHERE id = ?3",
                params![version, serde_json::to_string(labels)?, id],
            )
            .context("Failed to declare runner")?;
        self.get_runner(id)?.context("Runner vanished during declare")
    }

    // ── Commit statuses ───────────────────────────────────────────────

    /// Append a commit status unless it is stale or repeats the current state.
    ///
    /// A row is stale when its sequence is not newer than the latest row for
    /// the same (repo, sha, context). Returns the inserted row, if any.
    pub fn insert_commit_status(&self, new: &NewCommitStatus) -> Result<Option<CommitStatus>> {
        let latest: Option<(String, i64)> = self
            .conn
            .query_row(
                "SELECT state, seq FROM commit_statuses
                 WHERE repo_id = ?1 AND sha = ?2 AND context = ?3
                 ORDER BY seq DESC, id DESC LIMIT 1",
                params![new.repo_id, new.sha, new.context],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((state, seq)) = latest {
            if seq >= new.seq {
                debug!(context = %new.context, seq = new.seq, latest = seq, "stale commit status dropped");
                return Ok(None);
            }
            if state == new.state.as_str() {
                return Ok(None);
            }
        }

        let ts = now();
        self.conn
            .execute(
                "INSERT INTO commit_statuses (repo_id, sha, context, state, description, target_url, seq, created)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    new.repo_id,
                    new.sha,
                    new.context,
                    new.state.as_str(),
                    new.description,
                    new.target_url,
                    new.seq,
                    ts,
                ],
            )
            .context("Failed to insert commit status")?;
        Ok(Some(CommitStatus {
            id: self.conn.last_insert_rowid(),
            repo_id: new.repo_id,
            sha: new.sha.clone(),
            context: new.context.clone(),
            state: new.state,
            description: new.description.clone(),
            target_url: new.target_url.clone(),
            seq: new.seq,
            created: ts,
        }))
    }

    /// The latest status of every context for a commit, ordered by context.
    pub fn latest_commit_statuses(&self, repo_id: i64, sha: &str) -> Result<Vec<CommitStatus>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, repo_id, sha, context, state, description, target_url, seq, created
             FROM commit_statuses c
             WHERE repo_id = ?1 AND sha = ?2
               AND id = (SELECT c2.id FROM commit_statuses c2
                         WHERE c2.repo_id = c.repo_id AND c2.sha = c.sha AND c2.context = c.context
                         ORDER BY c2.seq DESC, c2.id DESC LIMIT 1)
             ORDER BY context",
        )?;
        let rows = stmt.query_map(params![repo_id, sha], |row| {
            Ok((
                CommitStatus {
                    id: row.get(0)?,
                    repo_id: row.get(1)?,
                    sha: row.get(2)?,
                    context: row.get(3)?,
                    state: CommitStatusState::Pending,
                    description: row.get(5)?,
                    target_url: row.get(6)?,
                    seq: row.get(7)?,
                    created: row.get(8)?,
                },
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut statuses = Vec::new();
        for row in rows {
            let (mut status, state) = row?;
            status.state = CommitStatusState::from_str(&state)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Failed to parse commit status state")?;
            statuses.push(status);
        }
        Ok(statuses)
    }

    // ── Pull requests & auto-merge ────────────────────────────────────

    pub fn upsert_pull_request(
        &self,
        repo_id: i64,
        index: i64,
        head_sha: &str,
        base_ref: &str,
        required_contexts: &[String],
    ) -> Result<PullRequest> {
        self.conn
            .execute(
                "INSERT INTO pull_requests (repo_id, pull_index, head_sha, base_ref, required_contexts)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(repo_id, pull_index) DO UPDATE SET
                    head_sha = excluded.head_sha,
                    base_ref = excluded.base_ref,
                    required_contexts = excluded.required_contexts",
                params![
                    repo_id,
                    index,
                    head_sha,
                    base_ref,
                    serde_json::to_string(required_contexts)?
                ],
            )
            .context("Failed to upsert pull request")?;
        self.get_pull_request(repo_id, index)?
            .context("Pull request vanished after upsert")
    }

    pub fn get_pull_request(&self, repo_id: i64, index: i64) -> Result<Option<PullRequest>> {
        let mut prs = query_pull_requests(
            &self.conn,
            &format!(
                "SELECT {} FROM pull_requests WHERE repo_id = ?1 AND pull_index = ?2",
                PULL_REQUEST_COLUMNS
            ),
            params![repo_id, index],
        )?;
        Ok(prs.pop())
    }

    /// Unmerged pull requests whose head is `sha`.
    pub fn open_pull_requests_by_head(&self, repo_id: i64, sha: &str) -> Result<Vec<PullRequest>> {
        query_pull_requests(
            &self.conn,
            &format!(
                "SELECT {} FROM pull_requests
                 WHERE repo_id = ?1 AND head_sha = ?2 AND merged = 0
                 ORDER BY pull_index",
                PULL_REQUEST_COLUMNS
            ),
            params![repo_id, sha],
        )
    }

    pub fn insert_auto_merge(&self, new: &NewAutoMerge) -> Result<AutoMerge> {
        if self.get_auto_merge(new.repo_id, new.pull_index)?.is_some() {
            return Err(ActionsError::AlreadyScheduled {
                index: new.pull_index,
            }
            .into());
        }
        self.conn
            .execute(
                "INSERT INTO auto_merges (repo_id, pull_index, doer, merge_style, message, delete_branch, created)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    new.repo_id,
                    new.pull_index,
                    new.doer,
                    new.merge_style.as_str(),
                    new.message,
                    new.delete_branch_after_merge,
                    now(),
                ],
            )
            .context("Failed to schedule auto-merge")?;
        self.get_auto_merge(new.repo_id, new.pull_index)?
            .context("Auto-merge vanished after insert")
    }

    pub fn get_auto_merge(&self, repo_id: i64, index: i64) -> Result<Option<AutoMerge>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, repo_id, pull_index, doer, merge_style, message, delete_branch, created
                 FROM auto_merges WHERE repo_id = ?1 AND pull_index = ?2",
                params![repo_id, index],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, bool>(6)?,
                        row.get::<_, i64>(7)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, repo_id, pull_index, doer, style, message, delete_branch, created)) = row
        else {
            return Ok(None);
        };
        let merge_style = MergeStyle::from_str(&style)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse merge style")?;
        Ok(Some(AutoMerge {
            id,
            repo_id,
            pull_index,
            doer,
            merge_style,
            message,
            delete_branch_after_merge: delete_branch,
            created,
        }))
    }

    pub fn delete_auto_merge(&self, repo_id: i64, index: i64) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "DELETE FROM auto_merges WHERE repo_id = ?1 AND pull_index = ?2",
                params![repo_id, index],
            )
            .context("Failed to delete auto-merge")?;
        Ok(count > 0)
    }

    /// Mark a pull request merged and consume its auto-merge schedule.
    pub fn complete_auto_merge(&self, schedule: &AutoMerge) -> Result<PullRequest> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "UPDATE pull_requests SET merged = 1, merged_by = ?1, merge_style = ?2
             WHERE repo_id = ?3 AND pull_index = ?4",
            params![
                schedule.doer,
                schedule.merge_style.as_str(),
                schedule.repo_id,
                schedule.pull_index
            ],
        )?;
        tx.execute("DELETE FROM auto_merges WHERE id = ?1", params![schedule.id])?;
        tx.commit().context("Failed to commit merge")?;
        self.get_pull_request(schedule.repo_id, schedule.pull_index)?
            .context("Pull request vanished after merge")
    }
}

// ── Transaction helpers ───────────────────────────────────────────────

fn next_seq(conn: &Connection, name: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO sequences (name, value) VALUES (?1, 1)
         ON CONFLICT(name) DO UPDATE SET value = value + 1",
        params![name],
    )
    .context("Failed to bump sequence")?;
    let value = conn.query_row(
        "SELECT value FROM sequences WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(value)
}

/// Bump the global, owner and repo task versions after a job became waiting.
fn bump_tasks_versions(conn: &Connection, owner_id: i64, repo_id: i64) -> Result<()> {
    let mut scopes = vec![(0, 0)];
    if owner_id != 0 {
        scopes.push((owner_id, 0));
    }
    if repo_id != 0 {
        scopes.push((0, repo_id));
    }
    for (o, r) in scopes {
        conn.execute(
            "INSERT INTO tasks_versions (owner_id, repo_id, version) VALUES (?1, ?2, 1)
             ON CONFLICT(owner_id, repo_id) DO UPDATE SET version = version + 1",
            params![o, r],
        )
        .context("Failed to bump tasks version")?;
    }
    Ok(())
}

/// Recompute a run's status from its jobs. Returns the previous status and
/// the updated run.
fn refresh_run_status(conn: &Connection, run_id: i64, ts: i64) -> Result<(Status, Run)> {
    let prior = load_run(conn, run_id)?.ok_or(ActionsError::RunNotFound { id: run_id })?;
    let statuses: Vec<Status> = load_run_jobs(conn, run_id)?
        .iter()
        .map(|j| j.status)
        .collect();
    let status = Status::aggregate(&statuses);
    let started = prior
        .started
        .or_else(|| (status == Status::Running || status.is_done()).then_some(ts));
    let stopped = if status.is_done() {
        prior.stopped.or(Some(ts))
    } else {
        None
    };
    conn.execute(
        "UPDATE runs SET status = ?1, started = ?2, stopped = ?3 WHERE id = ?4",
        params![status.as_str(), started, stopped, run_id],
    )
    .context("Failed to update run status")?;
    let run = load_run(conn, run_id)?.ok_or(ActionsError::RunNotFound { id: run_id })?;
    Ok((prior.status, run))
}

fn set_terminal_tx(
    conn: &Connection,
    job_id: i64,
    result: Status,
    ts: i64,
) -> Result<Vec<JobTransition>> {
    let job = load_job(conn, job_id)?.ok_or(ActionsError::JobNotFound { id: job_id })?;
    if job.status.is_done() && job.status == result {
        return Ok(Vec::new());
    }
    if job.status != Status::Running || !job.status.can_transition_to(result) {
        error!(job_id, from = %job.status, to = %result, "invalid job transition rejected");
        return Err(ActionsError::InvalidTransition {
            job_id,
            from: job.status,
            to: result,
        }
        .into());
    }
    let run_id = job.run_id;
    finish_jobs(conn, run_id, vec![(job, result)], ts)
}

/// Move the given jobs of one run to their done states, then settle blocked
/// dependents and the run status. Each changed job yields one transition.
fn finish_jobs(
    conn: &Connection,
    run_id: i64,
    finished: Vec<(Job, Status)>,
    ts: i64,
) -> Result<Vec<JobTransition>> {
    let mut changed: Vec<(i64, Status)> = Vec::new();
    for (job, to) in finished {
        let rows = conn
            .execute(
                "UPDATE jobs SET status = ?1, stopped = ?2, started = COALESCE(started, ?2),
                                 updated = ?2
                 WHERE id = ?3 AND status = ?4",
                params![to.as_str(), ts, job.id, job.status.as_str()],
            )
            .context("Failed to update job status")?;
        if rows != 1 {
            return Err(ActionsError::InvalidTransition {
                job_id: job.id,
                from: job.status,
                to,
            }
            .into());
        }
        if let Some(task_id) = job.task_id {
            conn.execute(
                "UPDATE tasks SET status = ?1, stopped = ?2, updated = ?2 WHERE id = ?3",
                params![to.as_str(), ts, task_id],
            )
            .context("Failed to update task status")?;
        }
        changed.push((job.id, job.status));
    }

    changed.extend(resolve_blocked(conn, run_id, ts)?);

    let (run_from, run) = refresh_run_status(conn, run_id, ts)?;
    let mut transitions = Vec::with_capacity(changed.len());
    for (job_id, from) in changed {
        let job = load_job(conn, job_id)?.ok_or(ActionsError::JobNotFound { id: job_id })?;
        transitions.push(JobTransition {
            seq: next_seq(conn, "job_state")?,
            job,
            from: Some(from),
            run: run.clone(),
            run_from,
        });
    }
    Ok(transitions)
}

/// Release blocked jobs whose needs are all done: to `waiting` when every
/// need succeeded or was skipped, to `skipped` otherwise.
fn resolve_blocked(conn: &Connection, run_id: i64, ts: i64) -> Result<Vec<(i64, Status)>> {
    let mut changed = Vec::new();
    loop {
        let jobs = load_run_jobs(conn, run_id)?;
        let by_key: HashMap<&str, Status> =
            jobs.iter().map(|j| (j.job_key.as_str(), j.status)).collect();
        let mut progressed = false;

        for job in jobs.iter().filter(|j| j.status == Status::Blocked) {
            let needs: Vec<Status> = job
                .needs
                .iter()
                .filter_map(|n| by_key.get(n.as_str()).copied())
                .collect();
            if !needs.iter().all(Status::is_done) {
                continue;
            }
            let to = if needs
                .iter()
                .all(|s| matches!(s, Status::Success | Status::Skipped))
            {
                Status::Waiting
            } else {
                Status::Skipped
            };
            let stopped = (to == Status::Skipped).then_some(ts);
            conn.execute(
                "UPDATE jobs SET status = ?1, stopped = ?2, updated = ?3
                 WHERE id = ?4 AND status = 'blocked'",
                params![to.as_str(), stopped, ts, job.id],
            )
            .context("Failed to release blocked job")?;
            if to == Status::Waiting {
                bump_tasks_versions(conn, job.owner_id, job.repo_id)?;
            }
            changed.push((job.id, Status::Blocked));
            progressed = true;
        }

        if !progressed {
            return Ok(changed);
        }
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

const RUN_COLUMNS: &str = "id, run_index, repo_id, owner_id, workflow_id, title, trigger_user, \
     event, event_action, event_payload, ref_name, commit_sha, status, created, started, stopped";

const JOB_COLUMNS: &str = "id, run_id, repo_id, owner_id, commit_sha, job_index, job_key, name, \
     needs, runs_on, workflow_payload, status, task_id, runner_id, started, stopped";

const TASK_COLUMNS: &str =
    "id, job_id, runner_id, token, status, log_length, log_sealed, started, stopped";

const RUNNER_COLUMNS: &str =
    "id, uuid, name, owner_id, repo_id, version, labels, last_online, last_active, created";

const PULL_REQUEST_COLUMNS: &str =
    "repo_id, pull_index, head_sha, base_ref, required_contexts, merged, merged_by, merge_style";

fn parse_enum<T: FromStr<Err = String>>(value: &str, what: &str) -> Result<T> {
    T::from_str(value)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Failed to parse {}", what))
}

/// Intermediate row struct for runs before converting enum and JSON columns.
struct RunRow {
    id: i64,
    index: i64,
    repo_id: i64,
    owner_id: i64,
    workflow_id: String,
    title: String,
    trigger_user: String,
    event: String,
    event_action: Option<String>,
    event_payload: String,
    ref_name: String,
    commit_sha: String,
    status: String,
    created: i64,
    started: Option<i64>,
    stopped: Option<i64>,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            index: row.get(1)?,
            repo_id: row.get(2)?,
            owner_id: row.get(3)?,
            workflow_id: row.get(4)?,
            title: row.get(5)?,
            trigger_user: row.get(6)?,
            event: row.get(7)?,
            event_action: row.get(8)?,
            event_payload: row.get(9)?,
            ref_name: row.get(10)?,
            commit_sha: row.get(11)?,
            status: row.get(12)?,
            created: row.get(13)?,
            started: row.get(14)?,
            stopped: row.get(15)?,
        })
    }

    fn into_run(self) -> Result<Run> {
        Ok(Run {
            id: self.id,
            index: self.index,
            repo_id: self.repo_id,
            owner_id: self.owner_id,
            workflow_id: self.workflow_id,
            title: self.title,
            trigger_user: self.trigger_user,
            event: parse_enum(&self.event, "run event")?,
            event_action: self.event_action,
            event_payload: serde_json::from_str(&self.event_payload)
                .context("Failed to parse run event payload")?,
            ref_name: self.ref_name,
            commit_sha: self.commit_sha,
            status: parse_enum(&self.status, "run status")?,
            created: self.created,
            started: self.started,
            stopped: self.stopped,
        })
    }
}

/// Intermediate row struct for jobs.
struct JobRow {
    id: i64,
    run_id: i64,
    repo_id: i64,
    owner_id: i64,
    commit_sha: String,
    index: i64,
    job_key: String,
    name: String,
    needs: String,
    runs_on: String,
    workflow_payload: String,
    status: String,
    task_id: Option<i64>,
    runner_id: Option<i64>,
    started: Option<i64>,
    stopped: Option<i64>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            repo_id: row.get(2)?,
            owner_id: row.get(3)?,
            commit_sha: row.get(4)?,
            index: row.get(5)?,
            job_key: row.get(6)?,
            name: row.get(7)?,
            needs: row.get(8)?,
            runs_on: row.get(9)?,
            workflow_payload: row.get(10)?,
            status: row.get(11)?,
            task_id: row.get(12)?,
            runner_id: row.get(13)?,
            started: row.get(14)?,
            stopped: row.get(15)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: self.id,
            run_id: self.run_id,
            repo_id: self.repo_id,
            owner_id: self.owner_id,
            commit_sha: self.commit_sha,
            index: self.index,
            job_key: self.job_key,
            name: self.name,
            needs: serde_json::from_str(&self.needs).context("Failed to parse job needs")?,
            runs_on: serde_json::from_str(&self.runs_on).context("Failed to parse job runs-on")?,
            workflow_payload: self.workflow_payload,
            status: parse_enum(&self.status, "job status")?,
            task_id: self.task_id,
            runner_id: self.runner_id,
            started: self.started,
            stopped: self.stopped,
        })
    }
}

fn query_runs<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Run>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, RunRow::from_row)?;
    let mut runs = Vec::new();
    for row in rows {
        runs.push(row?.into_run()?);
    }
    Ok(runs)
}

fn query_jobs<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Job>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, JobRow::from_row)?;
    let mut jobs = Vec::new();
    for row in rows {
        jobs.push(row?.into_job()?);
    }
    Ok(jobs)
}

fn query_runners<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<Runner>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, i64>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, String>(6)?,
            row.get::<_, Option<i64>>(7)?,
            row.get::<_, Option<i64>>(8)?,
            row.get::<_, i64>(9)?,
        ))
    })?;
    let mut runners = Vec::new();
    for row in rows {
        let (id, uuid, name, owner_id, repo_id, version, labels, last_online, last_active, created) =
            row?;
        runners.push(Runner {
            id,
            uuid,
            name,
            scope: RunnerScope::from_ids(owner_id, repo_id),
            version,
            labels: serde_json::from_str(&labels).context("Failed to parse runner labels")?,
            last_online,
            last_active,
            created,
        });
    }
    Ok(runners)
}

fn query_pull_requests<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<PullRequest>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, bool>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, Option<String>>(7)?,
        ))
    })?;
    let mut prs = Vec::new();
    for row in rows {
        let (repo_id, index, head_sha, base_ref, required, merged, merged_by, style) = row?;
        let merge_style = match style {
            Some(s) => Some(parse_enum(&s, "merge style")?),
            None => None,
        };
        prs.push(PullRequest {
            repo_id,
            index,
            head_sha,
            base_ref,
            required_contexts: serde_json::from_str(&required)
                .context("Failed to parse required contexts")?,
            merged,
            merged_by,
            merge_style,
        });
    }
    Ok(prs)
}

fn load_run(conn: &Connection, id: i64) -> Result<Option<Run>> {
    let mut runs = query_runs(
        conn,
        &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
        params![id],
    )?;
    Ok(runs.pop())
}

fn load_job(conn: &Connection, id: i64) -> Result<Option<Job>> {
    let mut jobs = query_jobs(
        conn,
        &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
        params![id],
    )?;
    Ok(jobs.pop())
}

fn load_run_jobs(conn: &Connection, run_id: i64) -> Result<Vec<Job>> {
    query_jobs(
        conn,
        &format!(
            "SELECT {} FROM jobs WHERE run_id = ?1 ORDER BY job_index",
            JOB_COLUMNS
        ),
        params![run_id],
    )
}

fn load_task(conn: &Connection, id: i64) -> Result<Option<Task>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
            params![id],
            |row| {
                Ok((
                    Task {
                        id: row.get(0)?,
                        job_id: row.get(1)?,
                        runner_id: row.get(2)?,
                        token: row.get(3)?,
                        status: Status::Running,
                        log_length: row.get(5)?,
                        log_sealed: row.get(6)?,
                        started: row.get(7)?,
                        stopped: row.get(8)?,
                    },
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;
    match row {
        Some((mut task, status)) => {
            task.status = parse_enum(&status, "task status")?;
            Ok(Some(task))
        }
        None => Ok(None),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
