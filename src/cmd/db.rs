//! Database commands: `forge-actions init-db`, `registration-token` and `sweep`.

use std::path::Path;

use anyhow::{Context, Result};

use forge_actions::actions::db::{ActionsDb, DbHandle};
use forge_actions::actions::models::RunnerScope;
use forge_actions::actions::service::ActionsService;
use forge_actions::config::ActionsConfig;

fn open_db(path: &Path) -> Result<ActionsDb> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    ActionsDb::new(path)
}

pub fn cmd_init_db(config: &ActionsConfig) -> Result<()> {
    let db_path = config.db_path();
    open_db(&db_path)?;
    println!("Actions database initialized at {}", db_path.display());
    Ok(())
}

pub fn cmd_registration_token(
    config: &ActionsConfig,
    owner_id: Option<i64>,
    repo_id: Option<i64>,
) -> Result<()> {
    let scope = match (owner_id, repo_id) {
        (_, Some(repo)) => RunnerScope::Repo(repo),
        (Some(owner), None) => RunnerScope::Owner(owner),
        (None, None) => RunnerScope::Global,
    };
    let db = open_db(&config.db_path())?;
    let token = db.create_registration_token(scope)?;
    tracing::info!(scope = ?token.scope, "registration token issued");
    println!("{}", token.token);
    Ok(())
}

/// One sweep pass with the configured timeouts, for deployments that run
/// it from cron instead of the server's own timer.
pub async fn cmd_sweep(config: &ActionsConfig) -> Result<()> {
    let db = open_db(&config.db_path())?;
    let service = ActionsService::new(DbHandle::new(db), config.settings());
    let outcome = service.sweep().await?;
    println!(
        "Failed {} stale tasks, cancelled {} abandoned jobs, removed {} offline runners",
        outcome.failed_tasks, outcome.cancelled_jobs, outcome.removed_runners
    );
    Ok(())
}
