// Cursor queue endpoints - Replay since a cursor, acknowledge, joined entries

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::{extract::Query, extract::State, Json};
use serde::{Deserialize, Serialize};

use super::{ApiError, AppState};
use crate::model::EntryWithPrompt;
use crate::queue::Snapshot;

#[derive(Debug, Default, Deserialize)]
pub struct QueueQuery {
    /// Last `seq` the consumer has seen (default: 0, everything)
    #[serde(default)]
    pub since: u64,
}

/// GET /queue - Returns every queued item with `seq > since`
///
/// Response: `{entries: [...], events: [...], cursor}` where `cursor` is the
/// high-water mark at the time of the call.
pub async fn get_queue(
    State(state): State<AppState>,
    query: Result<Query<QueueQuery>, QueryRejection>,
) -> Result<Json<Snapshot>, ApiError> {
    let Query(query) = query?;
    Ok(Json(state.queue().since(query.since)))
}

#[derive(Debug, Deserialize)]
pub struct AckRequest {
    pub cursor: u64,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub status: &'static str,
    pub cursor: u64,
    pub pruned: usize,
}

/// POST /ack - Acknowledge everything up to `cursor`
///
/// A cursor ahead of the current sequence is clamped to it.
pub async fn post_ack(
    State(state): State<AppState>,
    body: Result<Json<AckRequest>, JsonRejection>,
) -> Result<Json<AckResponse>, ApiError> {
    let Json(request) = body?;
    let outcome = state.queue().ack(request.cursor);
    tracing::debug!(cursor = outcome.cursor, pruned = outcome.pruned, "queue acknowledged");
    Ok(Json(AckResponse {
        status: "acknowledged",
        cursor: outcome.cursor,
        pruned: outcome.pruned,
    }))
}

#[derive(Debug, Deserialize)]
pub struct EntriesQuery {
    /// Maximum number of entries to return (default: 100)
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

#[derive(Debug, Serialize)]
pub struct EntriesResponse {
    pub count: usize,
    /// Most recent first, each with its linked prompt
    pub entries: Vec<EntryWithPrompt>,
}

/// GET /entries - Returns recent entries joined with their prompts
pub async fn get_entries(
    State(state): State<AppState>,
    query: Result<Query<EntriesQuery>, QueryRejection>,
) -> Result<Json<EntriesResponse>, ApiError> {
    let Query(query) = query?;
    let entries = state
        .blocking(move |s| s.store().query_with_joins(Some(query.limit)))
        .await?;
    Ok(Json(EntriesResponse {
        count: entries.len(),
        entries,
    }))
}
