//! TTL cache for correlator results
//!
//! Entries are keyed by what was asked (kind, anchor id, mode or window) and
//! remember the anchor timestamp plus how far their inputs reach. A write at
//! time `ts` purges every entry whose reach covers `ts`; everything else
//! expires after the TTL. Expired slots are swept on every `put`, so the map
//! never holds more than one TTL's worth of distinct keys.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};

use super::graph::FileGraph;
use super::scoring::Scored;
use crate::model::{Event, Prompt};

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    PromptsForEvent { event_id: String, mode: &'static str },
    EventsForPrompt { prompt_id: i64, mode: &'static str },
    Graph { workspace: Option<String>, since: Option<i64> },
}

#[derive(Debug, Clone)]
pub enum Cached {
    Prompts(Arc<Vec<Scored<Prompt>>>),
    Events(Arc<Vec<Scored<Event>>>),
    Graph(Arc<FileGraph>),
}

struct Slot {
    value: Cached,
    stored: Instant,
    /// `None`: any write invalidates it
    anchor: Option<DateTime<Utc>>,
    reach: TimeDelta,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub purged: u64,
}

pub struct CorrelationCache {
    ttl: Duration,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<CacheKey, Slot>,
    hits: u64,
    misses: u64,
    purged: u64,
}

impl Default for CorrelationCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl CorrelationCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &CacheKey) -> Option<Cached> {
        let mut inner = self.lock();
        let fresh = match inner.slots.get(key) {
            Some(slot) if slot.stored.elapsed() < self.ttl => Some(slot.value.clone()),
            Some(_) => {
                inner.slots.remove(key);
                None
            }
            None => None,
        };
        match fresh {
            Some(_) => inner.hits += 1,
            None => inner.misses += 1,
        }
        fresh
    }

    /// Store a result computed from rows within `reach` of `anchor`
    pub fn put(&self, key: CacheKey, value: Cached, anchor: Option<DateTime<Utc>>, reach: TimeDelta) {
        let mut inner = self.lock();
        let ttl = self.ttl;
        inner.slots.retain(|_, slot| slot.stored.elapsed() < ttl);
        inner.slots.insert(
            key,
            Slot {
                value,
                stored: Instant::now(),
                anchor,
                reach,
            },
        );
    }

    /// A row timestamped `ts` was written: drop results it could change
    pub fn invalidate(&self, ts: DateTime<Utc>) {
        let mut inner = self.lock();
        let before = inner.slots.len();
        inner.slots.retain(|_, slot| match slot.anchor {
            Some(anchor) => (anchor - ts).abs() > slot.reach,
            None => false,
        });
        let purged = (before - inner.slots.len()) as u64;
        inner.purged += purged;
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.purged += inner.slots.len() as u64;
        inner.slots.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.slots.len(),
            hits: inner.hits,
            misses: inner.misses,
            purged: inner.purged,
        }
    }

    /// Startup probe: a put must be readable back
    pub fn probe(&self) -> bool {
        let key = CacheKey::Graph {
            workspace: Some("\0probe".into()),
            since: None,
        };
        self.put(key.clone(), Cached::Graph(Arc::default()), None, TimeDelta::zero());
        let ok = self.get(&key).is_some();
        self.lock().slots.remove(&key);
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> CacheKey {
        CacheKey::PromptsForEvent {
            event_id: id.into(),
            mode: "time",
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_invalidate_purges_only_nearby_anchors() {
        let cache = CorrelationCache::default();
        let reach = TimeDelta::minutes(15);
        cache.put(key("near"), Cached::Prompts(Arc::default()), Some(at(0)), reach);
        cache.put(key("far"), Cached::Prompts(Arc::default()), Some(at(7200)), reach);
        cache.put(
            CacheKey::Graph { workspace: None, since: None },
            Cached::Graph(Arc::default()),
            None,
            reach,
        );

        cache.invalidate(at(60));
        assert!(cache.get(&key("near")).is_none());
        assert!(cache.get(&key("far")).is_some());
        assert!(cache.get(&CacheKey::Graph { workspace: None, since: None }).is_none());
        assert_eq!(cache.stats().purged, 2);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = CorrelationCache::new(Duration::ZERO);
        cache.put(key("a"), Cached::Prompts(Arc::default()), Some(at(0)), TimeDelta::zero());
        assert!(cache.get(&key("a")).is_none());
    }

    #[test]
    fn test_put_sweeps_expired_slots() {
        let cache = CorrelationCache::new(Duration::from_millis(20));
        for id in ["a", "b", "c"] {
            cache.put(key(id), Cached::Prompts(Arc::default()), Some(at(0)), TimeDelta::zero());
        }
        assert_eq!(cache.stats().entries, 3);

        std::thread::sleep(Duration::from_millis(40));
        cache.put(key("d"), Cached::Prompts(Arc::default()), Some(at(0)), TimeDelta::zero());
        assert_eq!(cache.stats().entries, 1);
        assert!(cache.get(&key("d")).is_some());
    }

    #[test]
    fn test_probe() {
        let cache = CorrelationCache::default();
        assert!(cache.probe());
        assert_eq!(cache.stats().entries, 0);
    }
}
