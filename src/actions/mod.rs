//! Forge Actions: the CI/CD engine of the forge.
//!
//! ## Overview
//!
//! Repository events (pushes, pull requests, ref creation and deletion) are
//! matched against the workflow files at the event's commit. Every workflow
//! that fires becomes a run of jobs stored in SQLite. Runners poll over the
//! runner protocol, lease waiting jobs as tasks, stream logs back and report
//! results. Job state changes fan out to commit statuses, auto-merge
//! schedules, the `/ws` run feed and run-completion observers.
//!
//! ## Module Map
//!
//! ```text
//! ┌────────┐  HTTP   ┌───────────────────────────────────────────────────┐
//! │ Forge  │ ──────> │  server.rs  (axum Router, ServerConfig)           │
//! └────────┘         │    ├─ api.rs        (forge API, AppState)          │
//! ┌────────┐  RPC    │    ├─ runner_api.rs (runner protocol)              │
//! │ Runner │ ──────> │    └─ ws.rs         (run feed)                     │
//! └────────┘         │         │                                         │
//!                    │         v                                         │
//!                    │  service.rs  (ActionsService)                     │
//!                    │    ├─ matcher.rs  ── workflow.rs, event.rs         │
//!                    │    ├─ db.rs       (runs, jobs, tasks, runners)     │
//!                    │    └─ propagate ─┬─ commit_status.rs               │
//!                    │                  ├─ automerge.rs                   │
//!                    │                  └─ notify.rs                      │
//!                    └───────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                          |
//! |------------|---------------------------------------------------------|
//! | `models`   | Shared types: `Run`, `Job`, `Task`, `Runner`, `Status`  |
//! | `registry` | Runner credential hashing and registration tokens      |
//!
//! ## Typical Flow (push → green check)
//!
//! 1. `POST /api/repos/{repo_id}/events` → `ActionsService::handle_event`
//! 2. `matcher::match_workflows` picks the workflows whose `on:` fires.
//! 3. `ActionsDb::insert_run` stores the run and its jobs; a pending commit
//!    status is written per job.
//! 4. A runner calls `FetchTask`; `ActionsDb::lease_job` moves one waiting
//!    job to running and creates its task.
//! 5. `UpdateLog` appends log rows; `UpdateTask` with a result finishes the
//!    job, unblocks dependents, updates the commit status, re-checks
//!    auto-merge and, once the run is done, notifies observers.

pub mod api;
pub mod automerge;
pub mod commit_status;
pub mod db;
pub mod event;
pub mod matcher;
pub mod models;
pub mod notify;
pub mod registry;
pub mod runner_api;
pub mod server;
pub mod service;
pub mod workflow;
pub mod ws;
