//! Sources: everything that turns outside activity into rows and queue items
//!
//! ```text
//! file watcher ─┐
//! prompts/clip ─┤                 ┌─→ Store (durable)
//! terminal     ─┼──→ Recorder ────┤
//! mcp / import ─┘                 └─→ SequenceQueue (ordered, replayable)
//!                        │
//!                        └─→ CorrelationCache::invalidate
//! ```
//!
//! Every source writes through [`Recorder`], which persists first and then
//! enqueues. A failed write still enqueues the item (the queue is not the
//! durability layer) and the error goes back to the caller. The correlation
//! cache is invalidated only once a write has landed, so a reader cannot
//! re-cache a result computed before it.

pub mod clipboard;
pub mod detector;
pub mod import;
pub mod ingest;
pub mod prompts;
pub mod terminal;
pub mod watcher;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::correlate::CorrelationCache;
use crate::error::Result;
use crate::model::{new_id, ContextSnapshot, Entry, Event, Prompt, TerminalCommand, Workspace};
use crate::queue::{Payload, SequenceQueue};
use crate::storage::Store;

/// A change entry and its event after recording
#[derive(Debug, Clone)]
pub struct RecordedChange {
    pub entry: Entry,
    pub event: Event,
    /// Prompt the change was attributed to
    pub prompt: Option<Prompt>,
    pub entry_seq: u64,
    pub event_seq: u64,
}

/// Shared write path for all sources. Blocking; clone freely.
#[derive(Clone)]
pub struct Recorder {
    store: Store,
    queue: Arc<SequenceQueue>,
    cache: Arc<CorrelationCache>,
}

impl Recorder {
    pub fn new(store: Store, queue: Arc<SequenceQueue>, cache: Arc<CorrelationCache>) -> Self {
        Self {
            store,
            queue,
            cache,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn queue(&self) -> &Arc<SequenceQueue> {
        &self.queue
    }

    /// Persist with `save`, then enqueue whatever is best known about the item.
    /// `at` is the row's timestamp, used to invalidate cached correlations.
    fn record<T: Clone>(
        &self,
        value: T,
        at: DateTime<Utc>,
        save: impl FnOnce(T) -> Result<T>,
        wrap: fn(T) -> Payload,
    ) -> Result<(T, u64)> {
        let fallback = value.clone();
        match save(value) {
            Ok(saved) => {
                self.cache.invalidate(at);
                let seq = self.queue.enqueue(wrap(saved.clone()))?;
                Ok((saved, seq))
            }
            Err(e) => {
                tracing::warn!(error = %e, "persist failed, item enqueued unsaved");
                self.queue.enqueue(wrap(fallback))?;
                Err(e)
            }
        }
    }

    pub fn record_entry(&self, mut entry: Entry) -> Result<(Entry, u64)> {
        if entry.id.is_empty() {
            entry.id = new_id();
        }
        self.touch_workspace(entry.workspace_path.as_deref(), 1, 0);
        let at = entry.timestamp;
        self.record(entry, at, |e| self.store.save_entry(e), Payload::Entry)
    }

    pub fn record_event(&self, mut event: Event) -> Result<(Event, u64)> {
        if event.id.is_empty() {
            event.id = new_id();
        }
        let at = event.timestamp;
        self.record(event, at, |e| self.store.save_event(e), Payload::Event)
    }

    pub fn record_prompt(&self, prompt: Prompt) -> Result<(Prompt, u64)> {
        prompt.validate()?;
        self.touch_workspace(prompt.workspace_path.as_deref(), 0, 1);
        let at = prompt.timestamp;
        self.record(prompt, at, |p| self.store.save_prompt(p), Payload::Prompt)
    }

    pub fn record_terminal(&self, mut command: TerminalCommand) -> Result<(TerminalCommand, u64)> {
        if command.id.is_empty() {
            command.id = new_id();
        }
        command.truncate_streams();
        let at = command.timestamp;
        self.record(
            command,
            at,
            |c| self.store.save_terminal_command(c),
            Payload::TerminalCommand,
        )
    }

    pub fn record_snapshot(&self, mut snapshot: ContextSnapshot) -> Result<(ContextSnapshot, u64)> {
        if snapshot.id.is_empty() {
            snapshot.id = new_id();
        }
        let at = snapshot.timestamp;
        self.record(
            snapshot,
            at,
            |s| self.store.save_context_snapshot(s),
            Payload::ContextSnapshot,
        )
    }

    /// Record a code change with its event, attributing the entry to the
    /// latest pending prompt in the same transaction as the entry write.
    pub fn record_change(&self, mut entry: Entry, mut event: Event) -> Result<RecordedChange> {
        if entry.id.is_empty() {
            entry.id = new_id();
        }
        self.touch_workspace(entry.workspace_path.as_deref(), 1, 0);

        let (entry, prompt) = match self.store.save_entry_with_attribution(entry.clone()) {
            Ok(saved) => saved,
            Err(e) => {
                tracing::warn!(error = %e, "change not persisted, enqueued unsaved");
                self.queue.enqueue(Payload::Entry(entry))?;
                return Err(e);
            }
        };
        self.cache.invalidate(entry.timestamp);
        if let Some(prompt) = &prompt {
            self.cache.invalidate(prompt.timestamp);
        }
        let entry_seq = self.queue.enqueue(Payload::Entry(entry.clone()))?;
        if let Some(prompt) = &prompt {
            tracing::info!(
                entry = %entry.id,
                prompt = prompt.id.unwrap_or_default(),
                "change attributed to prompt"
            );
        }

        event.set_link(&entry.id, entry.prompt_id);
        let (event, event_seq) = self.record_event(event)?;
        Ok(RecordedChange {
            entry,
            event,
            prompt,
            entry_seq,
            event_seq,
        })
    }

    /// Bump the workspace row; failures only log
    fn touch_workspace(&self, path: Option<&str>, entries: i64, prompts: i64) {
        let Some(path) = path.filter(|p| !p.is_empty()) else {
            return;
        };
        let result = self
            .store
            .get::<Workspace>(path)
            .and_then(|existing| {
                let mut ws = existing.unwrap_or_else(|| Workspace::for_path(path));
                ws.last_seen = crate::model::json::now();
                ws.entry_count += entries;
                ws.prompt_count += prompts;
                self.store.save_workspace(&ws)
            });
        if let Err(e) = result {
            tracing::debug!(workspace = path, error = %e, "workspace bookkeeping failed");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tempfile::TempDir;

    /// Recorder over a throwaway embedded store
    pub fn recorder() -> (TempDir, Recorder) {
        let dir = TempDir::new().unwrap();
        let store = Store::open_sqlite(dir.path().join("capture.db")).unwrap();
        let recorder = Recorder::new(
            store,
            Arc::new(SequenceQueue::default()),
            Arc::new(CorrelationCache::default()),
        );
        (dir, recorder)
    }
}
