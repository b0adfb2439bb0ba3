// HTTP API module - Loopback interface over the queue, the store and the correlator
//
// Consumers poll `/queue` with a cursor and acknowledge with `/ack`; editor
// integrations push prompts, turns, MCP logs and terminal hooks; dashboards
// read activity, analytics and correlation results, or subscribe to the live
// stream over SSE or WebSocket.
//
// All endpoints return JSON. Errors render as `{success: false, error}` with
// a status code matching the error kind.
// Security: binds to 127.0.0.1 (localhost only).

mod activity;
mod analytics;
mod correlate;
mod database;
mod health;
mod mcp;
mod prompts;
mod queue;
mod server;
mod terminal;
mod turns;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::analytics::Analytics;
use crate::capture::clipboard::ClipboardMonitor;
use crate::capture::Recorder;
use crate::correlate::Correlator;
use crate::error::Error;
use crate::labeling::Labeler;
use crate::queue::SequenceQueue;
use crate::storage::Store;
use crate::turns::TurnStore;

// Re-export endpoint handlers
pub use activity::{activity_stream, activity_ws, get_activity};
pub use analytics::{get_context_analytics, get_error_analytics, get_productivity_analytics};
pub use correlate::{get_file_graph, get_related_events, get_related_prompts};
pub use database::{export_database, import_database};
pub use health::{get_health, get_stats};
pub use mcp::{log_code_change, log_prompt_response};
pub use prompts::{create_labels, create_prompt};
pub use queue::{get_entries, get_queue, post_ack};
pub use server::{bind, start_server};
pub use terminal::{get_terminal_history, post_terminal_command};
pub use turns::{
    capture_assistant_turn, capture_user_turn, get_conversation, get_conversation_turns,
    update_turn,
};

/// Default request deadline
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

/// Shared state for the HTTP server
#[derive(Clone)]
pub struct AppState {
    /// Write path for every source (store + queue + cache invalidation)
    pub recorder: Recorder,
    pub turns: Arc<TurnStore>,
    /// Read-only correlation engine
    pub correlator: Correlator,
    pub analytics: Analytics,
    /// Counters reported by `/health`
    pub clipboard: ClipboardMonitor,
    pub labeler: Labeler,
    /// Deadline for work handed to the blocking pool
    pub request_timeout: Duration,
    /// Ends long-lived streams on shutdown
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn store(&self) -> &Store {
        self.recorder.store()
    }

    pub fn queue(&self) -> &Arc<SequenceQueue> {
        self.recorder.queue()
    }

    /// Run blocking store work under the request deadline
    pub(crate) async fn blocking<T, F>(&self, f: F) -> Result<T, ApiError>
    where
        T: Send + 'static,
        F: FnOnce(AppState) -> crate::error::Result<T> + Send + 'static,
    {
        let state = self.clone();
        let deadline = self.request_timeout;
        match tokio::time::timeout(deadline, tokio::task::spawn_blocking(move || f(state))).await {
            Ok(joined) => Ok(joined.map_err(Error::from)??),
            Err(_) => Err(Error::Timeout(deadline).into()),
        }
    }
}

/// Every route, wired to `state`
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health and stats
        .route("/health", get(get_health))
        .route("/api/stats", get(get_stats))
        // Cursor queue
        .route("/queue", get(get_queue))
        .route("/ack", post(post_ack))
        .route("/entries", get(get_entries))
        // MCP ingestion
        .route("/mcp/log-prompt-response", post(log_prompt_response))
        .route("/mcp/log-code-change", post(log_code_change))
        // Activity and live streams
        .route("/api/activity", get(get_activity))
        .route("/api/activity/stream", get(activity_stream))
        .route("/ws", get(activity_ws))
        // Analytics
        .route("/api/analytics/context", get(get_context_analytics))
        .route("/api/analytics/errors", get(get_error_analytics))
        .route("/api/analytics/productivity", get(get_productivity_analytics))
        // Terminal
        .route("/api/terminal/history", get(get_terminal_history))
        .route("/api/terminal/commands", post(post_terminal_command))
        // Export / import
        .route("/api/export/database", get(export_database))
        .route("/api/import/database", post(import_database))
        // Prompts and labels
        .route("/api/prompts", post(create_prompt))
        .route("/api/labels", post(create_labels))
        // Conversation turns
        .route(
            "/api/conversations/:id/turns/user",
            post(capture_user_turn),
        )
        .route(
            "/api/conversations/:id/turns/assistant",
            post(capture_assistant_turn),
        )
        .route("/api/conversations/:id/turns", get(get_conversation_turns))
        .route("/api/conversations/:id", get(get_conversation))
        .route("/api/turns/:id", patch(update_turn))
        // Correlation
        .route("/api/prompts/:id/related-events", get(get_related_events))
        .route("/api/events/:id/related-prompts", get(get_related_prompts))
        .route("/api/file-graph", get(get_file_graph))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Responses
// ─────────────────────────────────────────────────────────────────────────────

/// `{success: true, ...body}`
#[derive(Debug, Serialize)]
pub struct Success<T> {
    pub success: bool,
    #[serde(flatten)]
    pub body: T,
}

pub(crate) fn success<T: Serialize>(body: T) -> Json<Success<T>> {
    Json(Success {
        success: true,
        body,
    })
}

/// API error responses
/// Converted to HTTP status codes via IntoResponse
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Timeout(String),
    Internal(String),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let msg = e.to_string();
        match e {
            Error::InvalidInput(_) => ApiError::BadRequest(msg),
            Error::NotFound(_) => ApiError::NotFound(msg),
            Error::ConstraintViolation(_) => ApiError::Conflict(msg),
            Error::BackendNotReady(_) | Error::BackpressureExceeded { .. } | Error::TransientIO(_) => {
                ApiError::Unavailable(msg)
            }
            Error::Timeout(_) => ApiError::Timeout(msg),
            Error::Internal(_) => ApiError::Internal(msg),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        if status.is_server_error() {
            tracing::error!("API error: {} - {}", status, message);
        } else {
            tracing::warn!("API error: {} - {}", status, message);
        }

        let body = serde_json::json!({ "success": false, "error": message });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::capture::testing;
    use crate::correlate::CorrelationCache;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    pub fn state() -> (TempDir, AppState) {
        let (db, recorder) = testing::recorder();
        let store = recorder.store().clone();
        let state = AppState {
            turns: Arc::new(TurnStore::new(store.clone())),
            correlator: Correlator::new(store.clone(), Arc::new(CorrelationCache::default())),
            analytics: Analytics::new(store),
            clipboard: ClipboardMonitor::new(false),
            labeler: Labeler::offline(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown: CancellationToken::new(),
            recorder,
        };
        (db, state)
    }

    /// Send one request through the router and decode the JSON body
    pub async fn call(
        state: &AppState,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = router(state.clone())
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, value)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{call, state};
    use super::*;

    #[test]
    fn test_error_kinds_map_to_status() {
        let cases = [
            (Error::invalid("x"), StatusCode::BAD_REQUEST),
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (Error::ConstraintViolation("x".into()), StatusCode::CONFLICT),
            (Error::BackendNotReady("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (Error::Timeout(Duration::from_secs(1)), StatusCode::GATEWAY_TIMEOUT),
            (Error::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, expected) in cases {
            let response = ApiError::from(error).into_response();
            assert_eq!(response.status(), expected);
        }
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let (_db, state) = state();
        let (status, body) = call(&state, "GET", "/api/events/missing/related-prompts", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let (_db, state) = state();
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/ack")
            .header("content-type", "application/json")
            .body(axum::body::Body::from("{not json"))
            .unwrap();
        let response = tower::ServiceExt::oneshot(router(state), request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
