//! Conversation turn capture
//!
//! Turns are appended per conversation with a dense `turn_index` starting at
//! 0. Captures against one conversation are serialized by a per-conversation
//! lock; a writer that still loses the index race (another process on the
//! networked backend) re-reads the count and retries.
//!
//! All methods block on the store. Async callers use `spawn_blocking`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::model::{json, ConversationStats, ConversationTurn, TurnRole};
use crate::storage::Store;

/// Attempts at claiming a `turn_index` before giving up
const MAX_APPEND_ATTEMPTS: usize = 5;

// ─────────────────────────────────────────────────────────────────────────────
// Inputs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UserTurnInput {
    pub content: String,
    pub context_files: Vec<String>,
    pub referenced_files: Vec<String>,
    pub metadata: Map<String, Value>,
}

/// Request timing reported by the editor integration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TurnTiming {
    #[serde(with = "json::timestamp_opt")]
    pub request_start_time: Option<DateTime<Utc>>,
    #[serde(with = "json::timestamp_opt")]
    pub request_end_time: Option<DateTime<Utc>>,
    #[serde(with = "json::timestamp_opt")]
    pub first_token_time: Option<DateTime<Utc>>,
    #[serde(alias = "thinking_time")]
    pub thinking_time_seconds: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TokenUsage {
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AssistantTurnInput {
    pub content: String,
    pub timing: TurnTiming,
    pub tokens: TokenUsage,
    pub model_name: Option<String>,
    pub model_provider: Option<String>,
    pub streaming: bool,
    pub code_blocks: Vec<Value>,
    pub context_files: Vec<String>,
    pub referenced_files: Vec<String>,
    pub metadata: Map<String, Value>,
}

/// The closed set of fields a turn may change after capture. Anything else in
/// the request lands in `ignored` and is logged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TurnUpdate {
    pub content: Option<String>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    #[serde(with = "json::timestamp_opt")]
    pub request_end_time: Option<DateTime<Utc>>,
    #[serde(with = "json::timestamp_opt")]
    pub first_token_time: Option<DateTime<Utc>>,
    #[serde(alias = "thinking_time")]
    pub thinking_time_seconds: Option<f64>,
    pub code_blocks: Option<Vec<Value>>,
    pub metadata: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub ignored: Map<String, Value>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation helpers
// ─────────────────────────────────────────────────────────────────────────────

fn non_negative(name: &str, value: Option<i64>) -> Result<()> {
    match value {
        Some(v) if v < 0 => Err(Error::invalid(format!("{name} must not be negative"))),
        _ => Ok(()),
    }
}

fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_milliseconds()
}

/// Derive duration and time-to-first-token, checking their ordering
fn timing_tails(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    first_token: Option<DateTime<Utc>>,
) -> Result<(Option<i64>, Option<i64>)> {
    let Some(start) = start else {
        return Ok((None, None));
    };
    let duration = match end {
        Some(end) if end < start => {
            return Err(Error::invalid("request_end_time is before request_start_time"))
        }
        Some(end) => Some(millis_between(start, end)),
        None => None,
    };
    let ttft = match first_token {
        Some(t) if t < start => {
            return Err(Error::invalid("first_token_time is before request_start_time"))
        }
        Some(t) => Some(millis_between(start, t)),
        None => None,
    };
    if let (Some(d), Some(t)) = (duration, ttft) {
        if t > d {
            return Err(Error::invalid("first_token_time is after request_end_time"));
        }
    }
    Ok((duration, ttft))
}

// ─────────────────────────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────────────────────────

/// Captured turn plus the refreshed conversation rollup
#[derive(Debug, Clone)]
pub struct CapturedTurn {
    pub turn: ConversationTurn,
    pub conversation: ConversationStats,
}

pub struct TurnStore {
    store: Store,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TurnStore {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn conversation_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop the conversation's lock once nobody but the map and `lock` hold it
    fn release_lock(&self, conversation_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(&lock) == 2 {
            locks.remove(conversation_id);
        }
    }

    #[cfg(test)]
    fn held_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Insert at the current turn count, serialized per conversation
    fn append(&self, turn: ConversationTurn) -> Result<CapturedTurn> {
        if turn.conversation_id.trim().is_empty() {
            return Err(Error::invalid("conversation_id is required"));
        }
        let conversation_id = turn.conversation_id.clone();
        let lock = self.conversation_lock(&conversation_id);
        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.append_locked(turn)
        };
        self.release_lock(&conversation_id, lock);
        result
    }

    /// Retry while another writer keeps taking the index
    fn append_locked(&self, turn: ConversationTurn) -> Result<CapturedTurn> {
        let mut attempt = 0;
        loop {
            match self.store.append_turn(turn.clone()) {
                Ok((turn, conversation)) => {
                    tracing::debug!(
                        conversation = %turn.conversation_id,
                        turn_index = turn.turn_index,
                        role = turn.role.as_str(),
                        "turn captured"
                    );
                    return Ok(CapturedTurn { turn, conversation });
                }
                Err(Error::ConstraintViolation(msg)) if attempt + 1 < MAX_APPEND_ATTEMPTS => {
                    attempt += 1;
                    tracing::debug!(attempt, %msg, "turn_index taken, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn capture_user_turn(
        &self,
        conversation_id: &str,
        input: UserTurnInput,
    ) -> Result<CapturedTurn> {
        if input.content.trim().is_empty() {
            return Err(Error::invalid("user turn content is empty"));
        }
        let turn = ConversationTurn {
            conversation_id: conversation_id.to_string(),
            role: TurnRole::User,
            content: input.content,
            request_start_time: Some(json::now()),
            context_files: input.context_files,
            referenced_files: input.referenced_files,
            metadata: input.metadata,
            ..Default::default()
        };
        self.append(turn)
    }

    pub fn capture_assistant_turn(
        &self,
        conversation_id: &str,
        input: AssistantTurnInput,
    ) -> Result<CapturedTurn> {
        let timing = input.timing;
        let start = timing
            .request_start_time
            .ok_or_else(|| Error::invalid("timing.request_start_time is required"))?;
        let end = timing
            .request_end_time
            .ok_or_else(|| Error::invalid("timing.request_end_time is required"))?;
        let (duration, ttft) = timing_tails(Some(start), Some(end), timing.first_token_time)?;

        let tokens = input.tokens;
        non_negative("prompt_tokens", tokens.prompt_tokens)?;
        non_negative("completion_tokens", tokens.completion_tokens)?;
        non_negative("total_tokens", tokens.total_tokens)?;
        let prompt_tokens = tokens.prompt_tokens.unwrap_or(0);
        let completion_tokens = tokens.completion_tokens.unwrap_or(0);
        let total_tokens = tokens
            .total_tokens
            .unwrap_or(prompt_tokens + completion_tokens);
        if tokens.total_tokens.is_some() && total_tokens != prompt_tokens + completion_tokens {
            tracing::warn!(
                conversation = conversation_id,
                prompt_tokens,
                completion_tokens,
                total_tokens,
                "reported total_tokens differs from prompt + completion"
            );
        }

        let turn = ConversationTurn {
            conversation_id: conversation_id.to_string(),
            role: TurnRole::Assistant,
            content: input.content,
            model_name: input.model_name,
            model_provider: input.model_provider,
            prompt_tokens,
            completion_tokens,
            total_tokens,
            request_start_time: Some(start),
            request_end_time: Some(end),
            request_duration_ms: duration,
            first_token_time: timing.first_token_time,
            time_to_first_token_ms: ttft,
            thinking_time_seconds: timing.thinking_time_seconds,
            streaming: input.streaming,
            context_files: input.context_files,
            referenced_files: input.referenced_files,
            code_blocks: input.code_blocks,
            metadata: input.metadata,
            ..Default::default()
        };
        self.append(turn)
    }

    /// Apply the mutable fields of `update`. Token counts only move up.
    pub fn update_turn(&self, turn_id: &str, update: TurnUpdate) -> Result<ConversationTurn> {
        if !update.ignored.is_empty() {
            let fields: Vec<&str> = update.ignored.keys().map(String::as_str).collect();
            tracing::warn!(turn = turn_id, ?fields, "ignoring immutable turn fields");
        }
        non_negative("prompt_tokens", update.prompt_tokens)?;
        non_negative("completion_tokens", update.completion_tokens)?;
        non_negative("total_tokens", update.total_tokens)?;

        let current = self.store.get_turn(turn_id)?;
        let lock = self.conversation_lock(&current.conversation_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        // Re-read under the lock
        let mut turn = self.store.get_turn(turn_id)?;

        if let Some(content) = update.content {
            turn.content = content;
        }
        turn.prompt_tokens = turn.prompt_tokens.max(update.prompt_tokens.unwrap_or(0));
        turn.completion_tokens = turn
            .completion_tokens
            .max(update.completion_tokens.unwrap_or(0));
        let summed = turn.prompt_tokens + turn.completion_tokens;
        turn.total_tokens = turn
            .total_tokens
            .max(update.total_tokens.unwrap_or(summed))
            .max(summed);

        if update.request_end_time.is_some() {
            turn.request_end_time = update.request_end_time;
        }
        if update.first_token_time.is_some() {
            turn.first_token_time = update.first_token_time;
        }
        let (duration, ttft) = timing_tails(
            turn.request_start_time,
            turn.request_end_time,
            turn.first_token_time,
        )?;
        turn.request_duration_ms = duration.or(turn.request_duration_ms);
        turn.time_to_first_token_ms = ttft.or(turn.time_to_first_token_ms);

        if let Some(thinking) = update.thinking_time_seconds {
            turn.thinking_time_seconds = Some(thinking);
        }
        if let Some(blocks) = update.code_blocks {
            turn.code_blocks = blocks;
        }
        if let Some(metadata) = update.metadata {
            turn.metadata = metadata;
        }

        self.store.update_turn(&turn)?;
        self.store.rollup_conversation(&turn.conversation_id)?;
        Ok(turn)
    }

    pub fn turns(&self, conversation_id: &str) -> Result<Vec<ConversationTurn>> {
        self.store.get_turns(conversation_id)
    }

    pub fn conversation(&self, conversation_id: &str) -> Result<ConversationStats> {
        self.store
            .get_conversation(conversation_id)?
            .ok_or_else(|| Error::NotFound(format!("conversation {conversation_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as TimeDelta;
    use tempfile::TempDir;

    fn turn_store() -> (TempDir, TurnStore) {
        let dir = TempDir::new().unwrap();
        let store = Store::open_sqlite(dir.path().join("turns.db")).unwrap();
        (dir, TurnStore::new(store))
    }

    fn user(content: &str) -> UserTurnInput {
        UserTurnInput {
            content: content.into(),
            ..Default::default()
        }
    }

    fn assistant_at(t0: DateTime<Utc>) -> AssistantTurnInput {
        AssistantTurnInput {
            content: "hello".into(),
            timing: TurnTiming {
                request_start_time: Some(t0 + TimeDelta::milliseconds(100)),
                request_end_time: Some(t0 + TimeDelta::milliseconds(900)),
                first_token_time: Some(t0 + TimeDelta::milliseconds(300)),
                thinking_time_seconds: None,
            },
            tokens: TokenUsage {
                prompt_tokens: Some(12),
                completion_tokens: Some(30),
                total_tokens: None,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_turn_timing_scenario() {
        let (_dir, turns) = turn_store();
        let t0 = json::now();

        let first = turns.capture_user_turn("conv", user("hi")).unwrap();
        assert_eq!(first.turn.turn_index, 0);
        assert_eq!(first.turn.prompt_tokens, 0);
        assert!(first.turn.request_start_time.is_some());
        assert_eq!(first.conversation.turn_count, 1);

        let second = turns.capture_assistant_turn("conv", assistant_at(t0)).unwrap();
        assert_eq!(second.turn.turn_index, 1);
        assert_eq!(second.turn.request_duration_ms, Some(800));
        assert_eq!(second.turn.time_to_first_token_ms, Some(200));
        assert_eq!(second.turn.total_tokens, 42);
        assert_eq!(second.conversation.turn_count, 2);
        assert_eq!(second.conversation.total_tokens, 42);
    }

    #[test]
    fn test_empty_user_content_rejected() {
        let (_dir, turns) = turn_store();
        let err = turns.capture_user_turn("conv", user("  ")).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(turns.turns("conv").unwrap().is_empty());
    }

    #[test]
    fn test_assistant_turn_requires_timing() {
        let (_dir, turns) = turn_store();
        let mut input = assistant_at(json::now());
        input.timing.request_end_time = None;
        assert!(matches!(
            turns.capture_assistant_turn("conv", input),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_first_token_at_start_is_zero() {
        let (_dir, turns) = turn_store();
        let mut input = assistant_at(json::now());
        input.timing.first_token_time = input.timing.request_start_time;
        let captured = turns.capture_assistant_turn("conv", input).unwrap();
        assert_eq!(captured.turn.time_to_first_token_ms, Some(0));
    }

    #[test]
    fn test_end_before_start_rejected() {
        let (_dir, turns) = turn_store();
        let t0 = json::now();
        let mut input = assistant_at(t0);
        input.timing.request_end_time = Some(t0);
        assert!(turns.capture_assistant_turn("conv", input).is_err());
    }

    #[test]
    fn test_update_keeps_closed_set_and_token_floor() {
        let (_dir, turns) = turn_store();
        let captured = turns
            .capture_assistant_turn("conv", assistant_at(json::now()))
            .unwrap();

        let update: TurnUpdate = serde_json::from_value(serde_json::json!({
            "content": "edited",
            "completion_tokens": 5,
            "turn_index": 9,
            "role": "user"
        }))
        .unwrap();
        assert!(update.ignored.contains_key("turn_index"));

        let updated = turns.update_turn(&captured.turn.id, update).unwrap();
        assert_eq!(updated.content, "edited");
        assert_eq!(updated.completion_tokens, 30);
        assert_eq!(updated.turn_index, 0);
        assert_eq!(updated.role, TurnRole::Assistant);

        let stored = turns.turns("conv").unwrap();
        assert_eq!(stored[0].content, "edited");
    }

    #[test]
    fn test_update_extends_timing() {
        let (_dir, turns) = turn_store();
        let t0 = json::now();
        let captured = turns.capture_assistant_turn("conv", assistant_at(t0)).unwrap();
        let update = TurnUpdate {
            request_end_time: Some(t0 + TimeDelta::milliseconds(1100)),
            completion_tokens: Some(50),
            ..Default::default()
        };
        let updated = turns.update_turn(&captured.turn.id, update).unwrap();
        assert_eq!(updated.request_duration_ms, Some(1000));
        assert_eq!(updated.total_tokens, 62);
        assert_eq!(turns.conversation("conv").unwrap().total_tokens, 62);
    }

    #[test]
    fn test_update_missing_turn() {
        let (_dir, turns) = turn_store();
        assert!(matches!(
            turns.update_turn("nope", TurnUpdate::default()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_concurrent_captures_stay_dense() {
        let (_dir, turns) = turn_store();
        let turns = Arc::new(turns);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let turns = turns.clone();
                std::thread::spawn(move || {
                    turns
                        .capture_user_turn("busy", user(&format!("msg {i}")))
                        .unwrap()
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let indexes: Vec<i64> = turns
            .turns("busy")
            .unwrap()
            .iter()
            .map(|t| t.turn_index)
            .collect();
        assert_eq!(indexes, (0..8).collect::<Vec<_>>());
        assert_eq!(turns.conversation("busy").unwrap().turn_count, 8);
        assert_eq!(turns.held_locks(), 0);
    }

    #[test]
    fn test_idle_conversation_locks_are_released() {
        let (_dir, turns) = turn_store();
        for i in 0..20 {
            turns
                .capture_user_turn(&format!("conv-{i}"), user("hi"))
                .unwrap();
        }
        assert_eq!(turns.held_locks(), 0);

        // A lock in use survives the release of another holder
        let held = turns.conversation_lock("open");
        turns.capture_user_turn("open", user("hi")).unwrap();
        assert_eq!(turns.held_locks(), 1);
        turns.release_lock("open", held);
        assert_eq!(turns.held_locks(), 0);
    }

    #[test]
    fn test_single_turn_conversation_rollup() {
        let (_dir, turns) = turn_store();
        turns.capture_user_turn("solo", user("only")).unwrap();
        let stats = turns.conversation("solo").unwrap();
        assert_eq!(stats.turn_count, 1);
        assert_eq!(stats.first_turn_at, stats.last_turn_at);
    }
}
