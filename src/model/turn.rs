//! Conversation turns and the per-conversation rollup

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::json;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    #[default]
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "assistant" {
            Self::Assistant
        } else {
            Self::User
        }
    }
}

/// One role-tagged message inside a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationTurn {
    pub id: String,
    pub conversation_id: String,
    /// Dense from 0 within the conversation
    pub turn_index: i64,
    pub role: TurnRole,
    pub content: String,
    pub model_name: Option<String>,
    pub model_provider: Option<String>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    #[serde(with = "json::timestamp_opt")]
    pub request_start_time: Option<DateTime<Utc>>,
    #[serde(with = "json::timestamp_opt")]
    pub request_end_time: Option<DateTime<Utc>>,
    pub request_duration_ms: Option<i64>,
    #[serde(with = "json::timestamp_opt")]
    pub first_token_time: Option<DateTime<Utc>>,
    pub time_to_first_token_ms: Option<i64>,
    pub thinking_time_seconds: Option<f64>,
    #[serde(deserialize_with = "json::flag")]
    pub streaming: bool,
    #[serde(deserialize_with = "json::container")]
    pub context_files: Vec<String>,
    #[serde(deserialize_with = "json::container")]
    pub referenced_files: Vec<String>,
    #[serde(deserialize_with = "json::container")]
    pub code_blocks: Vec<Value>,
    #[serde(deserialize_with = "json::container")]
    pub metadata: Map<String, Value>,
    #[serde(with = "json::timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Default for ConversationTurn {
    fn default() -> Self {
        Self {
            id: String::new(),
            conversation_id: String::new(),
            turn_index: 0,
            role: TurnRole::User,
            content: String::new(),
            model_name: None,
            model_provider: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            request_start_time: None,
            request_end_time: None,
            request_duration_ms: None,
            first_token_time: None,
            time_to_first_token_ms: None,
            thinking_time_seconds: None,
            streaming: false,
            context_files: Vec::new(),
            referenced_files: Vec::new(),
            code_blocks: Vec::new(),
            metadata: Map::new(),
            created_at: json::now(),
        }
    }
}

/// Rollup row maintained after every turn insert
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationStats {
    pub conversation_id: String,
    pub turn_count: i64,
    pub user_turns: i64,
    pub assistant_turns: i64,
    pub total_prompt_tokens: i64,
    pub total_completion_tokens: i64,
    pub total_tokens: i64,
    pub total_duration_ms: i64,
    #[serde(with = "json::timestamp_opt")]
    pub first_turn_at: Option<DateTime<Utc>>,
    #[serde(with = "json::timestamp_opt")]
    pub last_turn_at: Option<DateTime<Utc>>,
    #[serde(with = "json::timestamp_opt")]
    pub updated_at: Option<DateTime<Utc>>,
}
