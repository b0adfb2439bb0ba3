//! Correlation engine: read-only relationships derived from the store
//!
//! ```text
//!                    ┌──────────────┐
//!   Store ──read──→  │  Correlator  │ ──→ related prompts / events (scoring)
//!                    │              │ ──→ file graph (graph)
//!                    └──────┬───────┘
//!                           │ get / put
//!                    CorrelationCache  ←── invalidate(ts) from the Recorder
//! ```
//!
//! Nothing here writes rows. Results are cached for five minutes or until a
//! write lands close enough to the anchor to change them.

pub mod cache;
pub mod graph;
pub mod scoring;

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};

pub use cache::{CacheStats, CorrelationCache};
pub use graph::{EdgeType, FileGraph, FileGraphEdge};
pub use scoring::{Mode, Scored};

use cache::{CacheKey, Cached};
use crate::error::{Error, Result};
use crate::model::{Event, Prompt};
use crate::storage::Store;

/// Rows this far either side of an anchor are loaded for sequence ranking
const SEQUENCE_SPAN_HOURS: i64 = 24;

#[derive(Clone)]
pub struct Correlator {
    store: Store,
    cache: Arc<CorrelationCache>,
}

impl Correlator {
    pub fn new(store: Store, cache: Arc<CorrelationCache>) -> Self {
        Self { store, cache }
    }

    pub fn cache(&self) -> &Arc<CorrelationCache> {
        &self.cache
    }

    fn span(mode: Mode) -> TimeDelta {
        match mode {
            Mode::Time => TimeDelta::seconds(scoring::TIME_WINDOW_SECS),
            Mode::Sequence => TimeDelta::hours(SEQUENCE_SPAN_HOURS),
        }
    }

    fn mode_name(mode: Mode) -> &'static str {
        match mode {
            Mode::Time => "time",
            Mode::Sequence => "sequence",
        }
    }

    /// Prompts that plausibly led to the event. Blocking.
    pub fn related_prompts(&self, event_id: &str, mode: Mode) -> Result<Arc<Vec<Scored<Prompt>>>> {
        let key = CacheKey::PromptsForEvent {
            event_id: event_id.to_string(),
            mode: Self::mode_name(mode),
        };
        if let Some(Cached::Prompts(hit)) = self.cache.get(&key) {
            return Ok(hit);
        }
        let event = self.store.get_event(event_id)?;
        let span = Self::span(mode);
        let (since, until) = (event.timestamp - span, event.timestamp + span);
        let prompts = self.store.prompts_between(Some(since), Some(until))?;
        let ranked = match mode {
            Mode::Time => scoring::prompts_for_event_by_time(&event, &prompts),
            Mode::Sequence => {
                let events = self.store.events_between(Some(since), Some(until))?;
                scoring::prompts_for_event_by_sequence(event_id, &prompts, &events)
            }
        };
        let ranked = Arc::new(ranked);
        self.cache
            .put(key, Cached::Prompts(ranked.clone()), Some(event.timestamp), span);
        Ok(ranked)
    }

    /// Events that followed the prompt. Blocking.
    pub fn related_events(&self, prompt_id: i64, mode: Mode) -> Result<Arc<Vec<Scored<Event>>>> {
        let key = CacheKey::EventsForPrompt {
            prompt_id,
            mode: Self::mode_name(mode),
        };
        if let Some(Cached::Events(hit)) = self.cache.get(&key) {
            return Ok(hit);
        }
        let prompt = self.store.get_prompt(prompt_id)?;
        let span = Self::span(mode);
        let (since, until) = (prompt.timestamp - span, prompt.timestamp + span);
        let events = self.store.events_between(Some(prompt.timestamp), Some(until))?;
        let ranked = match mode {
            Mode::Time => scoring::events_for_prompt_by_time(&prompt, &events),
            Mode::Sequence => {
                let prompts = self.store.prompts_between(Some(since), Some(until))?;
                let events = self.store.events_between(Some(since), Some(until))?;
                scoring::events_for_prompt_by_sequence(prompt_id, &prompts, &events)
            }
        };
        let ranked = Arc::new(ranked);
        self.cache
            .put(key, Cached::Events(ranked.clone()), Some(prompt.timestamp), span);
        Ok(ranked)
    }

    /// File graph over rows since `since` (all time when `None`). Blocking.
    pub fn file_graph(&self, workspace: Option<&str>, since: Option<DateTime<Utc>>) -> Result<Arc<FileGraph>> {
        let key = CacheKey::Graph {
            workspace: workspace.map(str::to_string),
            since: since.map(|s| s.timestamp_millis()),
        };
        if let Some(Cached::Graph(hit)) = self.cache.get(&key) {
            return Ok(hit);
        }
        let entries = self.store.entries_between(since, None, workspace)?;
        let prompts: Vec<Prompt> = self
            .store
            .prompts_between(since, None)?
            .into_iter()
            .filter(|p| p.linked_entry_id.is_some() && !p.context_files.is_empty())
            .collect();
        let snapshots = self.store.snapshots_between(since, workspace)?;
        let commands = self.store.terminal_between(since, workspace)?;
        let graph = Arc::new(graph::build(graph::GraphInput {
            entries: &entries,
            prompts: &prompts,
            snapshots: &snapshots,
            commands: &commands,
        }));
        tracing::debug!(
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            "file graph built"
        );
        // Any write can add an edge
        self.cache
            .put(key, Cached::Graph(graph.clone()), None, TimeDelta::zero());
        Ok(graph)
    }

    /// Startup probe: cache round trip plus one cheap read
    pub fn probe(&self) -> Result<()> {
        if !self.cache.probe() {
            return Err(Error::BackendNotReady("correlation cache".into()));
        }
        self.store.ping()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing;
    use crate::model::{ChangeStats, Entry, EntrySource, EventDetails, EventType};

    #[test]
    fn test_related_prompts_and_cache_invalidation() {
        let (_db, rec) = testing::recorder();
        let correlator = Correlator::new(rec.store().clone(), Arc::new(CorrelationCache::default()));
        let (prompt, _) = rec.record_prompt(Prompt::pending("update /w/a.py", "api")).unwrap();

        let entry = Entry::code_change("/w/a.py", "", "x".repeat(40), EntrySource::Filewatcher);
        let event = Event::new(
            EventType::CodeChange,
            EventDetails::CodeChange(ChangeStats {
                file_path: "/w/a.py".into(),
                ..Default::default()
            }),
        );
        let change = rec.record_change(entry, event).unwrap();

        let related = correlator.related_prompts(&change.event.id, Mode::Time).unwrap();
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].item.id, prompt.id);

        let back = correlator.related_events(prompt.id.unwrap(), Mode::Sequence).unwrap();
        assert!(back.iter().any(|s| s.item.id == change.event.id));

        // Second call is served from the cache
        correlator.related_prompts(&change.event.id, Mode::Time).unwrap();
        assert!(correlator.cache().stats().hits >= 1);
    }

    #[test]
    fn test_missing_anchor_is_not_found() {
        let (_db, rec) = testing::recorder();
        let correlator = Correlator::new(rec.store().clone(), Arc::default());
        assert!(matches!(
            correlator.related_prompts("nope", Mode::Time),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            correlator.related_events(404, Mode::Sequence),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_file_graph_through_store() {
        let (_db, rec) = testing::recorder();
        let correlator = Correlator::new(rec.store().clone(), Arc::default());
        for path in ["/w/a.py", "/w/b.py"] {
            let mut e = Entry::code_change(path, "", "y", EntrySource::Filewatcher);
            e.workspace_path = Some("/w".into());
            rec.record_entry(e).unwrap();
        }
        let graph = correlator.file_graph(Some("/w"), None).unwrap();
        assert_eq!(graph.edges_of(EdgeType::EditSequence).count(), 1);
        assert!(correlator.probe().is_ok());
    }
}
