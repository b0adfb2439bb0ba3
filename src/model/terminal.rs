//! Shell activity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::json;
use crate::util::truncate_in_place;

/// Output and error text are capped at this many bytes
pub const MAX_OUTPUT_BYTES: usize = 10 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalCommand {
    pub id: String,
    #[serde(with = "json::timestamp")]
    pub timestamp: DateTime<Utc>,
    pub command: String,
    pub workspace: Option<String>,
    pub shell: Option<String>,
    /// `history`, `hook`, or `import`
    pub source: String,
    #[serde(deserialize_with = "json::int_opt")]
    pub exit_code: Option<i64>,
    #[serde(deserialize_with = "json::int_opt")]
    pub duration_ms: Option<i64>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub session_id: Option<String>,
    pub linked_entry_id: Option<String>,
    #[serde(deserialize_with = "json::int_opt")]
    pub linked_prompt_id: Option<i64>,
}

impl Default for TerminalCommand {
    fn default() -> Self {
        Self {
            id: String::new(),
            timestamp: json::now(),
            command: String::new(),
            workspace: None,
            shell: None,
            source: "hook".to_string(),
            exit_code: None,
            duration_ms: None,
            output: None,
            error: None,
            session_id: None,
            linked_entry_id: None,
            linked_prompt_id: None,
        }
    }
}

impl TerminalCommand {
    pub fn new(command: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            source: source.into(),
            ..Self::default()
        }
    }

    /// Cap output and error at `MAX_OUTPUT_BYTES` on a character boundary
    pub fn truncate_streams(&mut self) {
        for stream in [&mut self.output, &mut self.error] {
            if let Some(text) = stream {
                truncate_in_place(text, MAX_OUTPUT_BYTES);
            }
        }
    }

    pub fn failed(&self) -> bool {
        self.exit_code.is_some_and(|c| c != 0)
    }
}
