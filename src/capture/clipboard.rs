//! Clipboard capture: copied text becomes a pending prompt
//!
//! Polls the system clipboard on a dedicated blocking thread. A new text value
//! of at least `min_length` characters is recorded with `source = "clipboard"`.
//! The hash of the last value is remembered so a clipboard that never changes
//! is only captured once.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::Recorder;
use crate::model::{json, Prompt};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClipboardStats {
    pub enabled: bool,
    pub captured: u64,
    pub skipped: u64,
    pub errors: u64,
    #[serde(with = "json::timestamp_opt")]
    pub last_capture: Option<DateTime<Utc>>,
}

/// Shared counters; the HTTP health endpoint reads them
#[derive(Clone, Default)]
pub struct ClipboardMonitor {
    stats: Arc<Mutex<ClipboardStats>>,
}

impl ClipboardMonitor {
    pub fn new(enabled: bool) -> Self {
        Self {
            stats: Arc::new(Mutex::new(ClipboardStats {
                enabled,
                ..Default::default()
            })),
        }
    }

    pub fn stats(&self) -> ClipboardStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update(&self, f: impl FnOnce(&mut ClipboardStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

#[derive(Debug, Clone)]
pub struct ClipboardSettings {
    pub poll_interval: Duration,
    pub min_length: usize,
}

impl Default for ClipboardSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            min_length: 10,
        }
    }
}

/// Decides what to do with one clipboard read; kept apart from the OS
/// clipboard so it can be tested
struct Dedup {
    last: Option<[u8; 32]>,
    min_length: usize,
}

#[derive(Debug, PartialEq)]
enum Seen {
    Same,
    TooShort,
    New,
}

impl Dedup {
    fn check(&mut self, text: &str) -> Seen {
        let hash: [u8; 32] = Sha256::digest(text.as_bytes()).into();
        if self.last == Some(hash) {
            return Seen::Same;
        }
        self.last = Some(hash);
        if text.trim().chars().count() < self.min_length {
            Seen::TooShort
        } else {
            Seen::New
        }
    }
}

fn handle_text(recorder: &Recorder, monitor: &ClipboardMonitor, dedup: &mut Dedup, text: &str) {
    match dedup.check(text) {
        Seen::Same => {}
        Seen::TooShort => monitor.update(|s| s.skipped += 1),
        Seen::New => match recorder.record_prompt(Prompt::pending(text, "clipboard")) {
            Ok(_) => monitor.update(|s| {
                s.captured += 1;
                s.last_capture = Some(json::now());
            }),
            Err(e) => {
                tracing::warn!(error = %e, "clipboard prompt not recorded");
                monitor.update(|s| s.errors += 1);
            }
        },
    }
}

/// Start polling. Returns `None` when no clipboard is reachable (headless hosts).
pub fn spawn(
    recorder: Recorder,
    monitor: ClipboardMonitor,
    settings: ClipboardSettings,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    let mut clipboard = match arboard::Clipboard::new() {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "clipboard unavailable, capture disabled");
            monitor.update(|s| s.enabled = false);
            return None;
        }
    };
    tracing::info!(min_length = settings.min_length, "clipboard capture started");
    Some(tokio::task::spawn_blocking(move || {
        let mut dedup = Dedup {
            last: None,
            min_length: settings.min_length,
        };
        // Whatever is on the clipboard at boot was not copied during this session
        if let Ok(text) = clipboard.get_text() {
            dedup.check(&text);
        }
        while !cancel.is_cancelled() {
            std::thread::sleep(settings.poll_interval);
            match clipboard.get_text() {
                Ok(text) => handle_text(&recorder, &monitor, &mut dedup, &text),
                // Non-text content
                Err(arboard::Error::ContentNotAvailable) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "clipboard read failed");
                    monitor.update(|s| s.errors += 1);
                }
            }
        }
        tracing::debug!("clipboard capture stopped");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing;

    #[test]
    fn test_dedup() {
        let mut d = Dedup {
            last: None,
            min_length: 5,
        };
        assert_eq!(d.check("hi"), Seen::TooShort);
        assert_eq!(d.check("hi"), Seen::Same);
        assert_eq!(d.check("explain this function"), Seen::New);
        assert_eq!(d.check("explain this function"), Seen::Same);
    }

    #[test]
    fn test_handle_text_records_and_counts() {
        let (_db, rec) = testing::recorder();
        let monitor = ClipboardMonitor::new(true);
        let mut dedup = Dedup {
            last: None,
            min_length: 10,
        };
        handle_text(&rec, &monitor, &mut dedup, "short");
        handle_text(&rec, &monitor, &mut dedup, "please add error handling here");
        handle_text(&rec, &monitor, &mut dedup, "please add error handling here");

        let stats = monitor.stats();
        assert!(stats.enabled);
        assert_eq!(stats.captured, 1);
        assert_eq!(stats.skipped, 1);
        assert!(stats.last_capture.is_some());

        let prompt = rec.store().latest_pending_prompt().unwrap().unwrap();
        assert_eq!(prompt.source, "clipboard");
    }
}
