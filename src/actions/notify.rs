//! Notification diff engine.
//!
//! When a run reaches a done status, every registered [`Notifier`] receives
//! the run, the status it held just before, and the previous done run of the
//! same repository, workflow and ref.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::db::DbHandle;
use super::models::{Run, Status};

/// Observer of run completion.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// `last_run` is `None` only for the first run of its workflow and ref.
    async fn run_now_done(&self, run: &Run, prior_status: Status, last_run: Option<&Run>)
    -> Result<()>;
}

/// Returned by [`NotifierRegistry::register`]; pass it back to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifierHandle(u64);

/// Explicit list of observers, owned by the service that fans out to them.
#[derive(Default)]
pub struct NotifierRegistry {
    notifiers: RwLock<Vec<(u64, Arc<dyn Notifier>)>>,
    next_id: AtomicU64,
}

impl NotifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, notifier: Arc<dyn Notifier>) -> NotifierHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.notifiers.write().await.push((id, notifier));
        NotifierHandle(id)
    }

    /// Returns false when the handle was not registered.
    pub async fn unregister(&self, handle: NotifierHandle) -> bool {
        let mut notifiers = self.notifiers.write().await;
        let before = notifiers.len();
        notifiers.retain(|(id, _)| *id != handle.0);
        notifiers.len() != before
    }

    pub async fn len(&self) -> usize {
        self.notifiers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Call every notifier in registration order. A failing notifier is
    /// logged and does not stop the others.
    pub async fn fan_out(&self, run: &Run, prior_status: Status, last_run: Option<&Run>) {
        let notifiers: Vec<Arc<dyn Notifier>> = self
            .notifiers
            .read()
            .await
            .iter()
            .map(|(_, n)| n.clone())
            .collect();
        for notifier in notifiers {
            if let Err(e) = notifier.run_now_done(run, prior_status, last_run).await {
                warn!(run_id = run.id, error = %e, "notifier failed");
            }
        }
    }
}

/// Look up the previous done run and notify every observer.
pub async fn notify_run_done(
    db: &DbHandle,
    registry: &NotifierRegistry,
    run: &Run,
    prior_status: Status,
) -> Result<()> {
    let current = run.clone();
    let last_run = db
        .call(move |db| db.previous_terminal_run(&current))
        .await?;
    info!(
        run_id = run.id,
        workflow = %run.workflow_id,
        status = %run.status,
        prior = %prior_status,
        last = last_run.as_ref().map(|r| r.status.as_str()).unwrap_or("none"),
        "run done"
    );
    registry.fan_out(run, prior_status, last_run.as_ref()).await;
    Ok(())
}
