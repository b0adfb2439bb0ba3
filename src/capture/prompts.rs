//! Prompt intake and the attribution-window sweeper
//!
//! A prompt enters as `pending`. The next significant file change claims it
//! (see [`Recorder::record_change`]); if none arrives within the attribution
//! window the sweeper moves it to `captured`.

use std::time::Duration;

use chrono::TimeDelta;
use serde::Deserialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::Recorder;
use crate::error::Result;
use crate::model::{json, Prompt, PromptStatus};

/// Request body for a new prompt. Unknown keys are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PromptInput {
    pub text: String,
    /// Older clients send the text as `prompt`
    pub prompt: Option<String>,
    pub source: Option<String>,
    pub workspace_path: Option<String>,
    pub workspace_id: Option<String>,
    pub workspace_name: Option<String>,
    pub mode: Option<String>,
    pub message_role: Option<String>,
    pub model_type: Option<String>,
    pub model_name: Option<String>,
    pub context_usage: Option<f64>,
    pub context_file_count: Option<i64>,
    pub conversation_id: Option<String>,
    pub parent_conversation_id: Option<String>,
    pub composer_id: Option<String>,
    pub lines_added: Option<i64>,
    pub lines_removed: Option<i64>,
    #[serde(alias = "thinking_time")]
    pub thinking_time_seconds: Option<f64>,
    pub prompt_tokens: Option<i64>,
    pub completion_tokens: Option<i64>,
    pub total_tokens: Option<i64>,
    pub context_window_size: Option<i64>,
    #[serde(deserialize_with = "json::container")]
    pub context_files: Vec<String>,
    #[serde(deserialize_with = "json::container")]
    pub terminal_blocks: Vec<Value>,
    pub attachment_count: Option<i64>,
    pub image_count: Option<i64>,
}

impl PromptInput {
    /// Always a fresh `pending` prompt; ids and status are never taken from input
    pub fn into_prompt(self) -> Prompt {
        let text = if self.text.is_empty() {
            self.prompt.unwrap_or_default()
        } else {
            self.text
        };
        let context_file_count = self
            .context_file_count
            .or_else(|| (!self.context_files.is_empty()).then(|| self.context_files.len() as i64));
        Prompt {
            text,
            source: self.source.unwrap_or_else(|| "api".to_string()),
            workspace_path: self.workspace_path,
            workspace_id: self.workspace_id,
            workspace_name: self.workspace_name,
            mode: self.mode,
            message_role: self.message_role,
            model_type: self.model_type,
            model_name: self.model_name,
            context_usage: self.context_usage,
            context_file_count,
            conversation_id: self.conversation_id,
            parent_conversation_id: self.parent_conversation_id,
            composer_id: self.composer_id,
            lines_added: self.lines_added,
            lines_removed: self.lines_removed,
            thinking_time_seconds: self.thinking_time_seconds,
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
            context_window_size: self.context_window_size,
            context_files: self.context_files,
            terminal_blocks: self.terminal_blocks,
            attachment_count: self.attachment_count,
            image_count: self.image_count,
            status: PromptStatus::Pending,
            ..Prompt::default()
        }
    }
}

/// Validate, persist and enqueue a new pending prompt
pub fn capture_prompt(recorder: &Recorder, input: PromptInput) -> Result<(Prompt, u64)> {
    let prompt = input.into_prompt();
    match recorder.record_prompt(prompt) {
        Ok(recorded) => {
            tracing::debug!(prompt = recorded.0.id.unwrap_or_default(), seq = recorded.1, "prompt captured");
            Ok(recorded)
        }
        Err(e) => {
            tracing::warn!(error = %e, "prompt rejected");
            Err(e)
        }
    }
}

/// Move prompts pending longer than `window` to `captured`
pub fn sweep_once(recorder: &Recorder, window: Duration) -> Result<u64> {
    let window = TimeDelta::from_std(window).unwrap_or_else(|_| TimeDelta::days(365));
    let cutoff = json::now() - window;
    let moved = recorder.store().capture_stale_prompts(cutoff)?;
    if moved > 0 {
        tracing::info!(moved, "pending prompts captured after attribution window");
    }
    Ok(moved)
}

/// Run the sweeper until cancelled. Checks every `window / 4`, at least once a second.
pub fn spawn_sweeper(recorder: Recorder, window: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    let every = (window / 4).max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let rec = recorder.clone();
                    match tokio::task::spawn_blocking(move || sweep_once(&rec, window)).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => tracing::warn!(error = %e, "prompt sweep failed"),
                        Err(e) => tracing::error!(error = %e, "prompt sweep task panicked"),
                    }
                }
            }
        }
        tracing::debug!("prompt sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing;
    use crate::error::Error;

    fn input(text: &str) -> PromptInput {
        PromptInput {
            text: text.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_capture_assigns_id_and_enqueues() {
        let (_db, rec) = testing::recorder();
        let (prompt, seq) = capture_prompt(&rec, input("rename the handler")).unwrap();
        assert!(prompt.id.is_some());
        assert_eq!(prompt.status, PromptStatus::Pending);
        assert_eq!(seq, 1);
        assert_eq!(rec.queue().since(0).entries[0].item_type, "prompt");
    }

    #[test]
    fn test_prompt_alias_and_file_count() {
        let body = serde_json::json!({
            "prompt": "from an older client",
            "context_files": "[\"a.rs\",\"b.rs\"]",
            "status": "linked",
            "id": 99
        });
        let parsed: PromptInput = serde_json::from_value(body).unwrap();
        let prompt = parsed.into_prompt();
        assert_eq!(prompt.text, "from an older client");
        assert_eq!(prompt.context_file_count, Some(2));
        assert_eq!(prompt.status, PromptStatus::Pending);
        assert_eq!(prompt.id, None);
    }

    #[test]
    fn test_token_mismatch_is_rejected() {
        let (_db, rec) = testing::recorder();
        let mut bad = input("x");
        bad.prompt_tokens = Some(3);
        bad.completion_tokens = Some(4);
        bad.total_tokens = Some(8);
        assert!(matches!(capture_prompt(&rec, bad), Err(Error::InvalidInput(_))));
        assert_eq!(rec.queue().latest(), 0);
    }

    #[test]
    fn test_sweep_captures_only_old_prompts() {
        let (_db, rec) = testing::recorder();
        let mut old = Prompt::pending("old", "api");
        old.timestamp = json::now() - TimeDelta::minutes(10);
        let (old, _) = rec.record_prompt(old).unwrap();
        let (fresh, _) = rec.record_prompt(Prompt::pending("fresh", "api")).unwrap();

        assert_eq!(sweep_once(&rec, Duration::from_secs(300)).unwrap(), 1);
        let store = rec.store();
        assert_eq!(store.get_prompt(old.id.unwrap()).unwrap().status, PromptStatus::Captured);
        assert_eq!(store.get_prompt(fresh.id.unwrap()).unwrap().status, PromptStatus::Pending);
    }
}
