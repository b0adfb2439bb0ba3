// Activity endpoints - Recent events, plus the live queue over SSE and WebSocket
//
// Both live transports start the same way: replay `since(cursor)`, then
// forward broadcast items with `seq` above the replayed high-water mark. The
// queue takes the snapshot and the subscription under one lock, so nothing is
// lost or repeated between the two phases.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::QueryRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::Response;
use axum::{extract::Query, extract::State, Json};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use super::{ApiError, AppState};
use crate::model::Event;
use crate::queue::QueueItem;
use crate::storage::EventFilter;

/// SSE comment interval that keeps idle connections open
pub const KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Debug, Serialize)]
pub struct ActivityResponse {
    pub count: usize,
    /// Most recent first
    pub events: Vec<Event>,
}

/// GET /api/activity - Returns recent events
///
/// Query params:
///   - since: RFC 3339 timestamp lower bound
///   - limit: Max events to return (default: 100)
///   - workspace: Workspace path (matches nested paths too)
pub async fn get_activity(
    State(state): State<AppState>,
    query: Result<Query<EventFilter>, QueryRejection>,
) -> Result<Json<ActivityResponse>, ApiError> {
    let Query(filter) = query?;
    let events = state
        .blocking(move |s| s.store().get_recent_events(&filter))
        .await?;
    Ok(Json(ActivityResponse {
        count: events.len(),
        events,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// Replay from this cursor first (default: live items only)
    pub since: Option<u64>,
}

fn sse_item(item: &QueueItem) -> Option<SseEvent> {
    match SseEvent::default().id(item.seq.to_string()).json_data(item) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(seq = item.seq, error = %e, "queue item not encodable");
            None
        }
    }
}

fn resync_event(missed: u64, cursor: u64) -> SseEvent {
    SseEvent::default()
        .event("resync")
        .data(serde_json::json!({ "missed": missed, "cursor": cursor }).to_string())
}

/// GET /api/activity/stream - Server-sent events carrying new queue items
///
/// A subscriber that falls behind the broadcast buffer receives an
/// `event: resync` with the last replayed cursor and should re-poll `/queue`.
pub async fn activity_stream(
    State(state): State<AppState>,
    query: Result<Query<StreamQuery>, QueryRejection>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let Query(query) = query?;
    let queue = state.queue();
    let cursor = query.since.unwrap_or_else(|| queue.latest());
    let (snapshot, rx) = queue.subscribe_since(cursor);
    let high_water = snapshot.cursor;
    tracing::debug!(cursor, replay = snapshot.len(), "activity stream subscriber");

    let replay = stream::iter(snapshot.in_order()).filter_map(|item| async move { sse_item(&item) });
    let live = BroadcastStream::new(rx).filter_map(move |received| async move {
        match received {
            Ok(item) if item.seq > high_water => sse_item(&item),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                tracing::warn!(missed, "activity stream subscriber lagged");
                Some(resync_event(missed, high_water))
            }
        }
    });
    let events = replay
        .chain(live)
        .take_until(state.shutdown.clone().cancelled_owned())
        .map(Ok);

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE)))
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ReplayRequest {
    since: u64,
}

/// GET /ws - WebSocket variant of the activity stream
///
/// Clients may send `{"since": <int>}` at any time to replay from a cursor.
pub async fn activity_ws(
    State(state): State<AppState>,
    query: Result<Query<StreamQuery>, QueryRejection>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let Query(query) = query?;
    Ok(ws.on_upgrade(move |socket| forward(socket, state, query.since)))
}

async fn send_item(socket: &mut WebSocket, item: &QueueItem) -> bool {
    match serde_json::to_string(item) {
        Ok(text) => socket.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            tracing::warn!(seq = item.seq, error = %e, "queue item not encodable");
            true
        }
    }
}

/// Send `since(cursor)` and return the new high-water mark, or `None` once
/// the client is gone
async fn replay(socket: &mut WebSocket, state: &AppState, cursor: u64, sent: u64) -> Option<u64> {
    let snapshot = state.queue().since(cursor);
    for item in snapshot.in_order() {
        if !send_item(socket, &item).await {
            return None;
        }
    }
    Some(sent.max(snapshot.cursor))
}

async fn forward(mut socket: WebSocket, state: AppState, since: Option<u64>) {
    let queue = Arc::clone(state.queue());
    let cursor = since.unwrap_or_else(|| queue.latest());
    let (snapshot, mut rx) = queue.subscribe_since(cursor);
    let mut sent = snapshot.cursor;
    for item in snapshot.in_order() {
        if !send_item(&mut socket, &item).await {
            return;
        }
    }

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let Ok(request) = serde_json::from_str::<ReplayRequest>(&text) else {
                        tracing::debug!("ignoring websocket message");
                        continue;
                    };
                    match replay(&mut socket, &state, request.since, sent).await {
                        Some(high_water) => sent = high_water,
                        None => break,
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
            received = rx.recv() => match received {
                Ok(item) if item.seq > sent => {
                    if !send_item(&mut socket, &item).await {
                        break;
                    }
                    sent = item.seq;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "websocket subscriber lagged");
                    let notice = serde_json::json!({ "type": "resync", "missed": missed, "cursor": sent });
                    if socket.send(Message::Text(notice.to_string())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    tracing::debug!(sent, "websocket subscriber closed");
}
