// Prompt capture and labeling endpoints

use axum::extract::rejection::JsonRejection;
use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use super::{success, ApiError, AppState, Success};
use crate::capture::prompts::{self, PromptInput};
use crate::labeling::Label;
use crate::model::Prompt;

#[derive(Debug, Serialize)]
pub struct CreatedPrompt {
    pub prompt: Prompt,
    pub seq: u64,
}

/// POST /api/prompts - Capture a prompt as `pending`
///
/// The prompt waits for the next code change to claim it, or is marked
/// `captured` once the attribution window passes.
pub async fn create_prompt(
    State(state): State<AppState>,
    body: Result<Json<PromptInput>, JsonRejection>,
) -> Result<Json<Success<CreatedPrompt>>, ApiError> {
    let Json(input) = body?;
    let (prompt, seq) = state
        .blocking(move |s| prompts::capture_prompt(&s.recorder, input))
        .await?;
    Ok(success(CreatedPrompt { prompt, seq }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LabelsRequest {
    pub texts: Vec<String>,
    /// Stored prompts whose text joins `texts`
    pub prompt_ids: Vec<i64>,
}

/// POST /api/labels - Short label for a group of prompts
///
/// Response: `{label, source}` where `source` is `remote` or `rules`.
pub async fn create_labels(
    State(state): State<AppState>,
    body: Result<Json<LabelsRequest>, JsonRejection>,
) -> Result<Json<Label>, ApiError> {
    let Json(request) = body?;
    let mut texts = request.texts;
    if !request.prompt_ids.is_empty() {
        let ids = request.prompt_ids;
        let stored = state
            .blocking(move |s| {
                ids.iter()
                    .map(|id| s.store().get_prompt(*id).map(|p| p.text))
                    .collect::<crate::error::Result<Vec<_>>>()
            })
            .await?;
        texts.extend(stored);
    }
    Ok(Json(state.labeler.label(&texts).await?))
}

#[cfg(test)]
mod tests {
    use super::super::testing::{call, state};
    use crate::model::PromptStatus;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_prompt_is_pending_and_queued() {
        let (_db, state) = state();
        let (status, body) = call(
            &state,
            "POST",
            "/api/prompts",
            Some(json!({
                "text": "add retry to the uploader",
                "workspace_path": "/w",
                "context_usage": 35.5,
                "context_files": ["/w/upload.rs"]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["prompt"]["status"], "pending");
        assert_eq!(body["seq"], 1);
        let id = body["prompt"]["id"].as_i64().unwrap();
        let stored = state.store().get_prompt(id).unwrap();
        assert_eq!(stored.status, PromptStatus::Pending);
        assert_eq!(stored.context_file_count, Some(1));
    }

    #[tokio::test]
    async fn test_invalid_prompts_are_rejected() {
        let (_db, state) = state();
        for body in [
            json!({"text": ""}),
            json!({"text": "x", "context_usage": 140.0}),
            json!({"text": "x", "prompt_tokens": -1}),
            json!({"text": "x", "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 99}),
        ] {
            let (status, _) = call(&state, "POST", "/api/prompts", Some(body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }
        assert_eq!(state.queue().latest(), 0);
    }

    #[tokio::test]
    async fn test_labels_from_texts_and_prompt_ids() {
        let (_db, state) = state();
        let (_, created) = call(
            &state,
            "POST",
            "/api/prompts",
            Some(json!({"text": "tokenizer panics on emoji"})),
        )
        .await;
        let id = created["prompt"]["id"].as_i64().unwrap();

        let (status, body) = call(
            &state,
            "POST",
            "/api/labels",
            Some(json!({"texts": ["tokenizer handles emoji"], "prompt_ids": [id]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["source"], "rules");
        assert_eq!(body["label"], "tokenizer emoji handles");

        let (status, _) = call(&state, "POST", "/api/labels", Some(json!({"prompt_ids": [999]}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
