use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::api::SharedState;
use super::models::{Job, Run, Status};
use super::notify::Notifier;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── Run feed message types ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum FeedMessage {
    RunCreated {
        run: Run,
        job_names: Vec<String>,
    },
    JobUpdated {
        job: Job,
        from: Option<Status>,
        run_status: Status,
    },
    RunDone {
        run: Run,
        prior_status: Status,
        last_run_id: Option<i64>,
        last_status: Option<Status>,
    },
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    let rx = state.ws_tx.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx))
}

async fn handle_socket(socket: WebSocket, rx: broadcast::Receiver<String>) {
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, rx).await;
}

/// Forward feed messages to one client until it goes away.
///
/// A Ping goes out every [`PING_INTERVAL`]; a client that has not answered
/// within [`PONG_TIMEOUT`] is dropped.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<String>,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    debug!("run feed client timed out");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                match result {
                    Ok(msg) => {
                        if sender.send(Message::Text(msg.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "run feed client lagging");
                        continue;
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Serialize and broadcast a feed message. Having no subscribers is fine.
pub fn broadcast_message(tx: &broadcast::Sender<String>, msg: &FeedMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(json);
        }
        Err(e) => {
            warn!(error = %e, "failed to serialize feed message");
        }
    }
}

/// Notifier that publishes run completion on the feed.
pub struct RunFeed {
    tx: broadcast::Sender<String>,
}

impl RunFeed {
    pub fn new(tx: broadcast::Sender<String>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl Notifier for RunFeed {
    async fn run_now_done(
        &self,
        run: &Run,
        prior_status: Status,
        last_run: Option<&Run>,
    ) -> Result<()> {
        broadcast_message(
            &self.tx,
            &FeedMessage::RunDone {
                run: run.clone(),
                prior_status,
                last_run_id: last_run.map(|r| r.id),
                last_status: last_run.map(|r| r.status),
            },
        );
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────
