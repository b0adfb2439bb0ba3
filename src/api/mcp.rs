// MCP ingestion endpoints - Prompt/response pairs and code changes pushed by tools

use axum::extract::rejection::JsonRejection;
use axum::{extract::State, Json};

use super::{success, ApiError, AppState, Success};
use crate::capture::ingest::{self, CodeChangeInput, PromptResponseInput, Receipt};

/// POST /mcp/log-prompt-response - Store a prompt and its response
///
/// Body: `{session_id?, workspace_path?, file_path, prompt, response}`
pub async fn log_prompt_response(
    State(state): State<AppState>,
    body: Result<Json<PromptResponseInput>, JsonRejection>,
) -> Result<Json<Success<Receipt>>, ApiError> {
    let Json(input) = body?;
    let receipt = state
        .blocking(move |s| ingest::log_prompt_response(&s.recorder, input))
        .await?;
    Ok(success(receipt))
}

/// POST /mcp/log-code-change - Store a before/after pair as a code change
///
/// The entry goes through prompt attribution like a watched file change.
pub async fn log_code_change(
    State(state): State<AppState>,
    body: Result<Json<CodeChangeInput>, JsonRejection>,
) -> Result<Json<Success<Receipt>>, ApiError> {
    let Json(input) = body?;
    let receipt = state
        .blocking(move |s| ingest::log_code_change(&s.recorder, input))
        .await?;
    Ok(success(receipt))
}

#[cfg(test)]
mod tests {
    use super::super::testing::{call, state};
    use crate::model::Prompt;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_log_prompt_response() {
        let (_db, state) = state();
        let (status, body) = call(
            &state,
            "POST",
            "/mcp/log-prompt-response",
            Some(json!({"file_path": "/w/a.py", "prompt": "why?", "response": "because"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        let entry_id = body["entry_id"].as_str().unwrap();
        assert!(state.store().get_entry(entry_id).is_ok());
        assert_eq!(state.queue().latest(), 2);
    }

    #[tokio::test]
    async fn test_log_code_change_links_pending_prompt() {
        let (_db, state) = state();
        let (prompt, _) = state.recorder.record_prompt(Prompt::pending("refactor", "api")).unwrap();
        let (status, body) = call(
            &state,
            "POST",
            "/mcp/log-code-change",
            Some(json!({
                "file_path": "/w/b.py",
                "before_code": "a = 1\n",
                "after_code": "a = 1\nb = 2\nc = 3\n"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["prompt_id"], prompt.id.unwrap());
    }

    #[tokio::test]
    async fn test_missing_file_path_is_bad_request() {
        let (_db, state) = state();
        let (status, _) = call(
            &state,
            "POST",
            "/mcp/log-code-change",
            Some(json!({"before_code": "", "after_code": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
