//! Prompts and their attribution lifecycle
//!
//! ```text
//!            attribution
//!   pending ─────────────→ linked   (terminal)
//!      │
//!      └───────────────→ captured   (terminal, window elapsed)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::json;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptStatus {
    #[default]
    Pending,
    Linked,
    Captured,
}

impl PromptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Linked => "linked",
            Self::Captured => "captured",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "linked" => Self::Linked,
            "captured" => Self::Captured,
            _ => Self::Pending,
        }
    }

    /// Only `pending` may move, and never back to itself
    pub fn can_transition_to(&self, next: PromptStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Linked) | (Self::Pending, Self::Captured)
        )
    }
}

/// One user or assistant message with its context and token statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Prompt {
    /// Assigned by the database when absent
    #[serde(deserialize_with = "json::int_opt")]
    pub id: Option<i64>,
    #[serde(with = "json::timestamp")]
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub workspace_path: Option<String>,
    pub workspace_id: Option<String>,
    pub workspace_name: Option<String>,
    pub source: String,
    pub status: PromptStatus,
    /// Editor mode (chat, agent, edit)
    pub mode: Option<String>,
    /// `user` or `assistant`
    pub message_role: Option<String>,
    pub model_type: Option<String>,
    pub model_name: Option<String>,
    /// Percentage of the context window in use, 0–100
    pub context_usage: Option<f64>,
    pub context_file_count: Option<i64>,
    pub conversation_id: Option<String>,
    pub parent_conversation_id: Option<String>,
    pub composer_id: Option<String>,
    pub lines_added: Option<i64>,
    pub lines_removed: Option<i64>,
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
    /// Entry this prompt was attributed to, once linked
    pub linked_entry_id: Option<String>,
}

impl Default for Prompt {
    fn default() -> Self {
        Self {
            id: None,
            timestamp: json::now(),
            text: String::new(),
            workspace_path: None,
            workspace_id: None,
            workspace_name: None,
            source: "api".to_string(),
            status: PromptStatus::Pending,
            mode: None,
            message_role: None,
            model_type: None,
            model_name: None,
            context_usage: None,
            context_file_count: None,
            conversation_id: None,
            parent_conversation_id: None,
            composer_id: None,
            lines_added: None,
            lines_removed: None,
            thinking_time_seconds: None,
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
            context_window_size: None,
            context_files: Vec::new(),
            terminal_blocks: Vec::new(),
            attachment_count: None,
            image_count: None,
            linked_entry_id: None,
        }
    }
}

impl Prompt {
    pub fn pending(text: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source: source.into(),
            ..Self::default()
        }
    }

    /// Check the caller-facing contract before a prompt is accepted
    pub fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() {
            return Err(Error::invalid("prompt text is empty"));
        }
        if let Some(usage) = self.context_usage {
            if !(0.0..=100.0).contains(&usage) || usage.is_nan() {
                return Err(Error::invalid(format!(
                    "context_usage {} outside 0-100",
                    usage
                )));
            }
        }
        for (name, value) in [
            ("prompt_tokens", self.prompt_tokens),
            ("completion_tokens", self.completion_tokens),
            ("total_tokens", self.total_tokens),
            ("context_file_count", self.context_file_count),
        ] {
            if value.is_some_and(|v| v < 0) {
                return Err(Error::invalid(format!("{} is negative", name)));
            }
        }
        if let (Some(p), Some(c), Some(t)) =
            (self.prompt_tokens, self.completion_tokens, self.total_tokens)
        {
            if p + c != t {
                return Err(Error::invalid(format!(
                    "token sum mismatch: {} + {} != {}",
                    p, c, t
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        assert!(PromptStatus::Pending.can_transition_to(PromptStatus::Linked));
        assert!(PromptStatus::Pending.can_transition_to(PromptStatus::Captured));
        assert!(!PromptStatus::Linked.can_transition_to(PromptStatus::Pending));
        assert!(!PromptStatus::Linked.can_transition_to(PromptStatus::Captured));
        assert!(!PromptStatus::Captured.can_transition_to(PromptStatus::Linked));
    }

    #[test]
    fn test_validate_rejects_empty_text() {
        let p = Prompt::pending("   ", "api");
        assert!(matches!(p.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_validate_token_sum() {
        let mut p = Prompt::pending("refactor this", "api");
        p.prompt_tokens = Some(10);
        p.completion_tokens = Some(5);
        p.total_tokens = Some(16);
        assert!(p.validate().is_err());
        p.total_tokens = Some(15);
        assert!(p.validate().is_ok());
        // Partial sets are not checked
        p.total_tokens = None;
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_validate_context_usage_bounds() {
        let mut p = Prompt::pending("x", "api");
        p.context_usage = Some(100.0);
        assert!(p.validate().is_ok());
        p.context_usage = Some(100.5);
        assert!(p.validate().is_err());
        p.context_usage = Some(-1.0);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_validate_negative_tokens() {
        let mut p = Prompt::pending("x", "api");
        p.completion_tokens = Some(-3);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_string_id_from_old_export() {
        let p: Prompt = serde_json::from_str(r#"{"id": "7", "text": "hi"}"#).unwrap();
        assert_eq!(p.id, Some(7));
        assert_eq!(p.status, PromptStatus::Pending);
    }
}
