// Conversation turn endpoints - Capture, amend and read role-tagged turns

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::{extract::Path, extract::State, Json};
use serde::Serialize;

use super::{success, ApiError, AppState, Success};
use crate::model::{ConversationStats, ConversationTurn};
use crate::turns::{AssistantTurnInput, CapturedTurn, TurnUpdate, UserTurnInput};

#[derive(Debug, Serialize)]
pub struct TurnResponse {
    pub turn: ConversationTurn,
    pub conversation: ConversationStats,
}

impl From<CapturedTurn> for TurnResponse {
    fn from(captured: CapturedTurn) -> Self {
        Self {
            turn: captured.turn,
            conversation: captured.conversation,
        }
    }
}

/// POST /api/conversations/:id/turns/user - Capture a user turn
pub async fn capture_user_turn(
    State(state): State<AppState>,
    id: Result<Path<String>, PathRejection>,
    body: Result<Json<UserTurnInput>, JsonRejection>,
) -> Result<Json<Success<TurnResponse>>, ApiError> {
    let Path(conversation_id) = id?;
    let Json(input) = body?;
    let captured = state
        .blocking(move |s| s.turns.capture_user_turn(&conversation_id, input))
        .await?;
    Ok(success(captured.into()))
}

/// POST /api/conversations/:id/turns/assistant - Capture an assistant turn
///
/// Duration and time-to-first-token are derived from the reported timing.
pub async fn capture_assistant_turn(
    State(state): State<AppState>,
    id: Result<Path<String>, PathRejection>,
    body: Result<Json<AssistantTurnInput>, JsonRejection>,
) -> Result<Json<Success<TurnResponse>>, ApiError> {
    let Path(conversation_id) = id?;
    let Json(input) = body?;
    let captured = state
        .blocking(move |s| s.turns.capture_assistant_turn(&conversation_id, input))
        .await?;
    Ok(success(captured.into()))
}

/// PATCH /api/turns/:id - Amend a captured turn (content, tokens, timing)
pub async fn update_turn(
    State(state): State<AppState>,
    id: Result<Path<String>, PathRejection>,
    body: Result<Json<TurnUpdate>, JsonRejection>,
) -> Result<Json<Success<ConversationTurn>>, ApiError> {
    let Path(turn_id) = id?;
    let Json(update) = body?;
    let turn = state
        .blocking(move |s| s.turns.update_turn(&turn_id, update))
        .await?;
    Ok(success(turn))
}

#[derive(Debug, Serialize)]
pub struct TurnsResponse {
    pub conversation_id: String,
    pub count: usize,
    /// In `turn_index` order
    pub turns: Vec<ConversationTurn>,
}

/// GET /api/conversations/:id/turns - Returns every turn of a conversation
pub async fn get_conversation_turns(
    State(state): State<AppState>,
    id: Result<Path<String>, PathRejection>,
) -> Result<Json<TurnsResponse>, ApiError> {
    let Path(conversation_id) = id?;
    let lookup = conversation_id.clone();
    let turns = state.blocking(move |s| s.turns.turns(&lookup)).await?;
    Ok(Json(TurnsResponse {
        conversation_id,
        count: turns.len(),
        turns,
    }))
}

#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub conversation: ConversationStats,
    pub turns: Vec<ConversationTurn>,
}

/// GET /api/conversations/:id - Returns the conversation rollup with its turns
pub async fn get_conversation(
    State(state): State<AppState>,
    id: Result<Path<String>, PathRejection>,
) -> Result<Json<ConversationResponse>, ApiError> {
    let Path(conversation_id) = id?;
    let (conversation, turns) = state
        .blocking(move |s| {
            let conversation = s.turns.conversation(&conversation_id)?;
            Ok((conversation, s.turns.turns(&conversation_id)?))
        })
        .await?;
    Ok(Json(ConversationResponse {
        conversation,
        turns,
    }))
}

#[cfg(test)]
mod tests {
    use super::super::testing::{call, state};
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_turn_capture_timing() {
        let (_db, state) = state();
        let (status, body) = call(
            &state,
            "POST",
            "/api/conversations/c1/turns/user",
            Some(json!({"content": "hi"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["turn"]["turn_index"], 0);

        let (status, body) = call(
            &state,
            "POST",
            "/api/conversations/c1/turns/assistant",
            Some(json!({
                "content": "hello",
                "timing": {
                    "request_start_time": "2026-01-01T00:00:00.100Z",
                    "first_token_time": "2026-01-01T00:00:00.300Z",
                    "request_end_time": "2026-01-01T00:00:00.900Z"
                },
                "tokens": {"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["turn"]["turn_index"], 1);
        assert_eq!(body["turn"]["request_duration_ms"], 800);
        assert_eq!(body["turn"]["time_to_first_token_ms"], 200);
        assert_eq!(body["conversation"]["turn_count"], 2);

        let turn_id = body["turn"]["id"].as_str().unwrap().to_string();
        let (status, body) = call(
            &state,
            "PATCH",
            &format!("/api/turns/{turn_id}"),
            Some(json!({"content": "hello there"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["content"], "hello there");

        let (_, body) = call(&state, "GET", "/api/conversations/c1/turns", None).await;
        assert_eq!(body["count"], 2);
        let (_, body) = call(&state, "GET", "/api/conversations/c1", None).await;
        assert_eq!(body["conversation"]["total_tokens"], 7);
        assert_eq!(body["turns"][1]["content"], "hello there");
    }

    #[tokio::test]
    async fn test_turn_errors() {
        let (_db, state) = state();
        let (status, _) = call(
            &state,
            "POST",
            "/api/conversations/c1/turns/user",
            Some(json!({"content": "   "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&state, "GET", "/api/conversations/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &state,
            "PATCH",
            "/api/turns/missing",
            Some(json!({"content": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
