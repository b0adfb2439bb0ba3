// Health and stats endpoints

use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{ApiError, AppState};
use crate::capture::clipboard::ClipboardStats;
use crate::correlate::CacheStats;
use crate::model::json;
use crate::storage::StoreStats;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(with = "json::timestamp")]
    pub timestamp: DateTime<Utc>,
    /// Current high-water mark; a consumer holding a larger cursor has
    /// seen a restart
    pub sequence: u64,
    pub entries: i64,
    pub prompts: i64,
    pub queue_length: usize,
    pub clipboard_stats: ClipboardStats,
}

/// GET /health - Liveness plus headline counts
pub async fn get_health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let (entries, prompts) = state
        .blocking(|s| Ok((s.store().count("entries")?, s.store().count("prompts")?)))
        .await?;
    let queue = state.queue();
    Ok(Json(HealthResponse {
        status: "running",
        timestamp: json::now(),
        sequence: queue.latest(),
        entries,
        prompts,
        queue_length: queue.len(),
        clipboard_stats: state.clipboard.stats(),
    }))
}

#[derive(Debug, Serialize)]
pub struct QueueStats {
    pub sequence: u64,
    pub length: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub store: StoreStats,
    pub queue: QueueStats,
    pub correlation_cache: CacheStats,
}

/// GET /api/stats - Returns persistence, queue and cache statistics
pub async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let store = state.blocking(|s| s.store().get_stats()).await?;
    Ok(Json(StatsResponse {
        store,
        queue: QueueStats {
            sequence: state.queue().latest(),
            length: state.queue().len(),
        },
        correlation_cache: state.correlator.cache().stats(),
    }))
}

#[cfg(test)]
mod tests {
    use super::super::testing::{call, state};
    use crate::model::Prompt;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_health_reports_counts_and_sequence() {
        let (_db, state) = state();
        state.recorder.record_prompt(Prompt::pending("hi there", "api")).unwrap();

        let (status, body) = call(&state, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "running");
        assert_eq!(body["sequence"], 1);
        assert_eq!(body["prompts"], 1);
        assert_eq!(body["entries"], 0);
        assert_eq!(body["queue_length"], 1);
        assert_eq!(body["clipboard_stats"]["enabled"], false);
    }

    #[tokio::test]
    async fn test_stats() {
        let (_db, state) = state();
        let (status, body) = call(&state, "GET", "/api/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["store"]["backend"], "sqlite");
        assert_eq!(body["queue"]["sequence"], 0);
    }
}
