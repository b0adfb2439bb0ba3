//! Capture source configuration: terminal history tail and clipboard polling

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::capture::clipboard::ClipboardSettings;

// ─────────────────────────────────────────────────────────────────────────────
// Terminal
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TerminalConfig {
    /// Shell history file to tail; `None` picks `$HISTFILE`, then zsh, then bash
    pub history_file: Option<PathBuf>,
    pub poll_interval: Duration,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            history_file: None,
            poll_interval: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FileTerminal {
    pub history_file: Option<String>,
    pub poll_interval_ms: Option<u64>,
}

impl TerminalConfig {
    pub fn from_file(file: Option<FileTerminal>) -> Self {
        let file = file.unwrap_or_default();
        let defaults = Self::default();
        Self {
            history_file: file
                .history_file
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
            poll_interval: file
                .poll_interval_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
        }
    }

    /// The configured file, or the shell default when none is set
    pub fn resolve_history_file(&self) -> Option<PathBuf> {
        self.history_file
            .clone()
            .or_else(crate::capture::terminal::default_history_file)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Clipboard
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Default)]
pub struct FileClipboard {
    pub poll_interval_ms: Option<u64>,
    pub min_length: Option<usize>,
}

impl FileClipboard {
    pub fn apply(file: Option<Self>, defaults: ClipboardSettings) -> ClipboardSettings {
        let file = file.unwrap_or_default();
        ClipboardSettings {
            poll_interval: file
                .poll_interval_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            min_length: file.min_length.unwrap_or(defaults.min_length),
        }
    }
}
