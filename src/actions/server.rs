use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::api::{self, AppState};
use super::db::{ActionsDb, DbHandle};
use super::runner_api;
use super::service::ActionsService;
use super::ws::{self, RunFeed};
use crate::config::ActionsSection;

/// Configuration for the actions server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    pub settings: ActionsSection,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3142,
            db_path: PathBuf::from(".forge/actions.db"),
            dev_mode: false,
            settings: ActionsSection::default(),
        }
    }
}

/// Build the full application router: forge API, runner protocol and the
/// run feed.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .merge(runner_api::runner_router())
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Open the store, wire the run feed as an observer and build the state.
pub async fn build_state(db: ActionsDb, settings: ActionsSection) -> Arc<AppState> {
    let (ws_tx, _rx) = broadcast::channel::<String>(256);
    let service = ActionsService::new(DbHandle::new(db), settings).with_feed(ws_tx.clone());
    service
        .notifiers()
        .register(Arc::new(RunFeed::new(ws_tx.clone())))
        .await;
    Arc::new(AppState { service, ws_tx })
}

/// Start the actions server and run until Ctrl+C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    if let Some(parent) = config.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = ActionsDb::new(&config.db_path).context("Failed to initialize actions database")?;
    let sweep_interval = config.settings.sweep_interval_secs;
    let state = build_state(db, config.settings).await;
    let sweeper = (sweep_interval > 0)
        .then(|| spawn_sweeper(state.clone(), Duration::from_secs(sweep_interval)));

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, db = %config.db_path.display(), "forge actions listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    info!("server shut down gracefully");
    Ok(())
}

/// Run the stale task and job sweep every `every` until aborted.
pub fn spawn_sweeper(state: Arc<AppState>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = state.service.sweep().await {
                warn!(error = %e, "sweep failed");
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl+C; shutting down");
        return;
    }
    info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn test_router() -> Router {
        let db = ActionsDb::new_in_memory().unwrap();
        build_router(build_state(db, ActionsSection::default()).await)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = test_router().await;
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_runner_routes_mounted() {
        let app = test_router().await;
        let req = Request::builder()
            .method("POST")
            .uri("/api/actions/ping.v1.PingService/Ping")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"data":"x"}"#))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["data"], "Hello, x!");
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = test_router().await;
        let req = Request::builder()
            .uri("/some/unknown/route")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_run_feed_registered_as_notifier() {
        let db = ActionsDb::new_in_memory().unwrap();
        let state = build_state(db, ActionsSection::default()).await;
        assert_eq!(state.service.notifiers().len().await, 1);
    }

    #[tokio::test]
    async fn test_sweeper_runs_until_aborted() {
        let db = ActionsDb::new_in_memory().unwrap();
        let state = build_state(db, ActionsSection::default()).await;
        let sweeper = spawn_sweeper(state.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!sweeper.is_finished());

        sweeper.abort();
        let err = sweeper.await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(state.service.list_runners().await.unwrap().is_empty());
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3142);
        assert_eq!(config.host, "127.0.0.1");
        assert!(!config.dev_mode);
    }
}
