//! Event streaming server.
//!
//! `GET /ws?workflow=<id>[,<id>...]&replay=true` streams events as JSON text
//! frames. With `replay` the recorded history is sent first, then live
//! events continue without gaps or duplicates. Small read-only JSON routes
//! expose the workflow list and per-workflow history.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{Event, EventBus, EventLog, Subscription, SubscriptionFilter};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub log: Arc<dyn EventLog>,
    pub bus: EventBus,
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamParams {
    /// Comma-separated workflow ids; all workflows when absent
    pub workflow: Option<String>,
    #[serde(default)]
    pub replay: bool,
}

impl StreamParams {
    fn filter(&self) -> SubscriptionFilter {
        match &self.workflow {
            Some(ids) => SubscriptionFilter::workflows(
                ids.split(',').map(str::trim).filter(|s| !s.is_empty()),
            ),
            None => SubscriptionFilter::all(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    #[serde(default)]
    pub from: Option<u64>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/workflows", get(list_workflows))
        .route("/api/workflows/{id}/events", get(workflow_events))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_workflows(State(state): State<AppState>) -> impl IntoResponse {
    match state.log.workflows().await {
        Ok(records) => Json(records).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn workflow_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> impl IntoResponse {
    match state.log.workflow(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return (StatusCode::NOT_FOUND, format!("workflow {} not found", id)).into_response(),
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
    match state.log.read(&id, params.from.unwrap_or(1)).await {
        Ok(events) => Json(events).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

async fn handle_socket(socket: WebSocket, state: AppState, params: StreamParams) {
    let (mut sender, receiver) = socket.split();
    let filter = params.filter();
    // Attach before reading history so nothing falls between the two.
    let subscription = state.bus.subscribe(filter.clone());
    let mut cursor = StreamCursor::default();

    if params.replay {
        match history(&state.log, &filter).await {
            Ok(events) => {
                for event in events {
                    if !send_event(&mut sender, &mut cursor, &event).await {
                        return;
                    }
                }
            }
            Err(e) => warn!(error = %e, "replay failed"),
        }
    }

    run_socket_loop(sender, receiver, subscription, cursor).await;
}

async fn history(log: &Arc<dyn EventLog>, filter: &SubscriptionFilter) -> Result<Vec<Event>> {
    let ids: Vec<String> = match filter.ids() {
        Some(ids) => {
            let mut ids: Vec<String> = ids.iter().cloned().collect();
            ids.sort();
            ids
        }
        None => log.workflows().await?.into_iter().map(|r| r.id).collect(),
    };
    let mut events = Vec::new();
    for id in ids {
        events.extend(log.read(&id, 1).await?);
    }
    Ok(events)
}

/// Highest seq sent per workflow on one connection.
#[derive(Debug, Default)]
pub(crate) struct StreamCursor {
    sent: HashMap<String, u64>,
}

impl StreamCursor {
    /// Whether `event` is newer than everything already sent for its
    /// workflow. Marks it sent when it is.
    pub(crate) fn advance(&mut self, event: &Event) -> bool {
        let last = self.sent.entry(event.workflow_id.clone()).or_insert(0);
        if event.seq <= *last {
            return false;
        }
        *last = event.seq;
        true
    }
}

/// Send one event unless already sent. False when the client is gone.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    cursor: &mut StreamCursor,
    event: &Event,
) -> bool {
    if !cursor.advance(event) {
        return true;
    }
    match serde_json::to_string(event) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to serialise event");
            true
        }
    }
}

/// Forward live events with ping/pong keepalive.
///
/// If no Pong arrives within [`PONG_TIMEOUT`] after a Ping, the connection
/// is considered dead and the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut subscription: Subscription,
    mut cursor: StreamCursor,
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
                    debug!("websocket client stopped answering pings");
                    break;
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }
            event = subscription.recv() => {
                let Some(event) = event else { break };
                if !send_event(&mut sender, &mut cursor, &event).await {
                    break;
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

    if subscription.dropped() > 0 {
        warn!(dropped = subscription.dropped(), "websocket client lagged");
    }
    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

/// Serve until `shutdown` fires.
pub async fn serve(host: &str, port: u16, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "event stream listening");
    println!("Streaming events at ws://{}/ws", local_addr);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Server error")?;

    info!("event stream shut down");
    Ok(())
}
