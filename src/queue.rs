//! Monotonic sequence queue with cursor replay
//!
//! Every captured item gets a `seq` from a single counter and lands in an
//! in-memory replay window. Consumers poll with the last `seq` they saw and
//! acknowledge by cursor; live subscribers get the same envelopes pushed over
//! a broadcast channel in `seq` order.
//!
//! ```text
//! sources ──enqueue──→ ┌───────────────────────────────┐ ──since(c)──→ /queue
//!                      │ counter │ window (VecDeque)   │
//!                      └───────────────────────────────┘
//!                               │ broadcast (seq order)
//!                               └──────────────→ SSE / WebSocket subscribers
//! ```
//!
//! The counter is not persisted. A restart begins again at 1, and consumers
//! detect that through `cursor > latest()`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration as TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::model::{json, ContextSnapshot, Entry, Event, Prompt, TerminalCommand};

/// Items younger than this survive an acknowledgement
pub const RETENTION_FLOOR_SECS: i64 = 3600;

/// Default cap on the replay window
pub const DEFAULT_CAP: usize = 50_000;

const BROADCAST_CAPACITY: usize = 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// Which backward-compatible view an item appears in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    Entry,
    Event,
}

/// Anything a source can hand to the queue
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Entry(Entry),
    Prompt(Prompt),
    Event(Event),
    TerminalCommand(TerminalCommand),
    ContextSnapshot(ContextSnapshot),
}

impl Payload {
    pub fn partition(&self) -> Partition {
        match self {
            Payload::Entry(_) | Payload::Prompt(_) => Partition::Entry,
            Payload::Event(_) | Payload::TerminalCommand(_) | Payload::ContextSnapshot(_) => {
                Partition::Event
            }
        }
    }

    pub fn item_type(&self) -> &'static str {
        match self {
            Payload::Entry(_) => "entry",
            Payload::Prompt(_) => "prompt",
            Payload::Event(_) => "event",
            Payload::TerminalCommand(_) => "terminal_command",
            Payload::ContextSnapshot(_) => "context_snapshot",
        }
    }
}

/// One slot of the queue
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueItem {
    pub seq: u64,
    pub kind: Partition,
    pub item_type: &'static str,
    #[serde(with = "json::timestamp")]
    pub enqueued_at: DateTime<Utc>,
    pub payload: Payload,
}

/// Result of `since`: a stable snapshot split by partition
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub entries: Vec<Arc<QueueItem>>,
    pub events: Vec<Arc<QueueItem>>,
    /// High-water mark at the time of the call
    pub cursor: u64,
}

impl Snapshot {
    /// Both partitions merged back into `seq` order
    pub fn in_order(&self) -> Vec<Arc<QueueItem>> {
        let mut all: Vec<_> = self.entries.iter().chain(&self.events).cloned().collect();
        all.sort_by_key(|i| i.seq);
        all
    }

    pub fn len(&self) -> usize {
        self.entries.len() + self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What an acknowledgement did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AckOutcome {
    /// Cursor after clamping to the current high-water mark
    pub cursor: u64,
    pub pruned: usize,
}

// ─────────────────────────────────────────────────────────────────────────────
// Queue
// ─────────────────────────────────────────────────────────────────────────────

struct Window {
    counter: u64,
    items: VecDeque<Arc<QueueItem>>,
}

pub struct SequenceQueue {
    window: Mutex<Window>,
    live: broadcast::Sender<Arc<QueueItem>>,
    cap: usize,
    retention: TimeDelta,
}

impl SequenceQueue {
    pub fn new(cap: usize) -> Self {
        Self::with_retention(cap, TimeDelta::seconds(RETENTION_FLOOR_SECS))
    }

    pub fn with_retention(cap: usize, retention: TimeDelta) -> Self {
        let (live, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            window: Mutex::new(Window {
                counter: 0,
                items: VecDeque::new(),
            }),
            live,
            cap: cap.max(1),
            retention,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assign the next `seq` and append. Either the item is fully enqueued
    /// (and broadcast) or nothing changes.
    pub fn enqueue(&self, payload: Payload) -> Result<u64> {
        self.enqueue_at(payload, json::now())
    }

    pub fn enqueue_at(&self, payload: Payload, now: DateTime<Utc>) -> Result<u64> {
        let mut window = self.lock();
        if window.items.len() >= self.cap {
            return Err(Error::BackpressureExceeded {
                len: window.items.len(),
                cap: self.cap,
            });
        }
        window.counter += 1;
        let item = Arc::new(QueueItem {
            seq: window.counter,
            kind: payload.partition(),
            item_type: payload.item_type(),
            enqueued_at: now,
            payload,
        });
        window.items.push_back(item.clone());
        // Sent under the lock so subscribers observe seq order
        let _ = self.live.send(item);
        tracing::trace!(seq = window.counter, "enqueued");
        Ok(window.counter)
    }

    /// Every retained item with `seq > cursor`, plus the high-water mark
    pub fn since(&self, cursor: u64) -> Snapshot {
        snapshot(&self.lock(), cursor)
    }

    /// Drop items at or below `cursor` that are older than the retention floor
    pub fn ack(&self, cursor: u64) -> AckOutcome {
        self.ack_at(cursor, Utc::now())
    }

    pub fn ack_at(&self, cursor: u64, now: DateTime<Utc>) -> AckOutcome {
        let mut window = self.lock();
        let cursor = cursor.min(window.counter);
        let floor = now - self.retention;
        let before = window.items.len();
        window
            .items
            .retain(|i| i.seq > cursor || i.enqueued_at >= floor);
        let pruned = before - window.items.len();
        if pruned > 0 {
            tracing::debug!(cursor, pruned, remaining = window.items.len(), "queue pruned");
        }
        AckOutcome { cursor, pruned }
    }

    /// Current high-water mark
    pub fn latest(&self) -> u64 {
        self.lock().counter
    }

    /// Items currently held in the replay window
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live feed of envelopes enqueued after this call
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<QueueItem>> {
        self.live.subscribe()
    }

    /// Replay from `cursor` and a receiver for what follows, without a gap
    /// between the two.
    pub fn subscribe_since(&self, cursor: u64) -> (Snapshot, broadcast::Receiver<Arc<QueueItem>>) {
        // Holding the window lock blocks enqueue, so nothing slips between
        // the snapshot and the subscription.
        let window = self.lock();
        let rx = self.live.subscribe();
        (snapshot(&window, cursor), rx)
    }
}

fn snapshot(window: &Window, cursor: u64) -> Snapshot {
    let start = window.items.partition_point(|i| i.seq <= cursor);
    let mut snapshot = Snapshot {
        cursor: window.counter,
        ..Default::default()
    };
    for item in window.items.range(start..) {
        match item.kind {
            Partition::Entry => snapshot.entries.push(item.clone()),
            Partition::Event => snapshot.events.push(item.clone()),
        }
    }
    snapshot
}

impl Default for SequenceQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntrySource, EventDetails, EventType};

    fn entry() -> Payload {
        Payload::Entry(Entry::code_change("/w/a.py", "a", "b", EntrySource::Filewatcher))
    }

    fn event() -> Payload {
        Payload::Event(Event::new(EventType::Activity, EventDetails::default()))
    }

    #[test]
    fn test_cursor_replay() {
        let q = SequenceQueue::default();
        for _ in 0..5 {
            q.enqueue(entry()).unwrap();
        }
        let first = q.since(0);
        assert_eq!(first.cursor, 5);
        assert_eq!(
            first.entries.iter().map(|i| i.seq).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );

        q.enqueue(entry()).unwrap();
        q.enqueue(entry()).unwrap();
        let next = q.since(first.cursor);
        assert_eq!(next.entries.iter().map(|i| i.seq).collect::<Vec<_>>(), vec![6, 7]);
        assert_eq!(next.cursor, 7);
    }

    #[test]
    fn test_partitions() {
        let q = SequenceQueue::default();
        q.enqueue(entry()).unwrap();
        q.enqueue(event()).unwrap();
        q.enqueue(Payload::Prompt(Prompt::pending("p", "api"))).unwrap();
        q.enqueue(Payload::TerminalCommand(TerminalCommand::new("ls", "hook")))
            .unwrap();

        let snap = q.since(0);
        assert_eq!(snap.entries.iter().map(|i| i.seq).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(snap.events.iter().map(|i| i.seq).collect::<Vec<_>>(), vec![2, 4]);
        assert_eq!(snap.in_order().iter().map(|i| i.seq).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(snap.entries[1].item_type, "prompt");
    }

    #[test]
    fn test_backpressure_leaves_counter_untouched() {
        let q = SequenceQueue::new(2);
        q.enqueue(entry()).unwrap();
        q.enqueue(entry()).unwrap();
        let err = q.enqueue(entry()).unwrap_err();
        assert!(matches!(err, Error::BackpressureExceeded { len: 2, cap: 2 }));
        assert_eq!(q.latest(), 2);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_ack_keeps_young_items() {
        let q = SequenceQueue::default();
        let now = Utc::now();
        q.enqueue_at(entry(), now - TimeDelta::hours(3)).unwrap();
        q.enqueue_at(entry(), now - TimeDelta::hours(2)).unwrap();
        q.enqueue_at(entry(), now - TimeDelta::minutes(10)).unwrap();

        let outcome = q.ack_at(3, now);
        assert_eq!(outcome, AckOutcome { cursor: 3, pruned: 2 });
        assert_eq!(q.since(2).entries.len(), 1);
        assert_eq!(q.latest(), 3);
    }

    #[test]
    fn test_ack_ahead_of_sequence_is_clamped() {
        let q = SequenceQueue::default();
        let old = Utc::now() - TimeDelta::hours(2);
        q.enqueue_at(entry(), old).unwrap();
        let outcome = q.ack_at(99, Utc::now());
        assert_eq!(outcome.cursor, 1);
        assert_eq!(outcome.pruned, 1);

        // Later items are untouched by the earlier over-ack
        q.enqueue_at(entry(), old).unwrap();
        assert_eq!(q.since(1).entries.len(), 1);
    }

    #[test]
    fn test_ack_only_prunes_at_or_below_cursor() {
        let q = SequenceQueue::default();
        let old = Utc::now() - TimeDelta::hours(2);
        for _ in 0..4 {
            q.enqueue_at(entry(), old).unwrap();
        }
        assert_eq!(q.ack_at(2, Utc::now()).pruned, 2);
        assert_eq!(
            q.since(0).entries.iter().map(|i| i.seq).collect::<Vec<_>>(),
            vec![3, 4]
        );
    }

    #[tokio::test]
    async fn test_subscribers_see_seq_order() {
        let q = Arc::new(SequenceQueue::default());
        q.enqueue(entry()).unwrap();
        let (replay, mut rx) = q.subscribe_since(0);
        assert_eq!(replay.cursor, 1);

        let writer = {
            let q = q.clone();
            tokio::task::spawn_blocking(move || {
                for _ in 0..20 {
                    q.enqueue(event()).unwrap();
                }
            })
        };
        writer.await.unwrap();

        let mut last = replay.cursor;
        for _ in 0..20 {
            let item = rx.recv().await.unwrap();
            assert_eq!(item.seq, last + 1);
            last = item.seq;
        }
    }

    #[test]
    fn test_envelope_json_shape() {
        let q = SequenceQueue::default();
        q.enqueue(entry()).unwrap();
        let value = serde_json::to_value(q.since(0)).unwrap();
        assert_eq!(value["cursor"], 1);
        assert_eq!(value["entries"][0]["seq"], 1);
        assert_eq!(value["entries"][0]["kind"], "entry");
        assert_eq!(value["entries"][0]["payload"]["file_path"], "/w/a.py");
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn enqueue_is_strictly_monotonic(kinds in proptest::collection::vec(any::<bool>(), 1..200)) {
                let q = SequenceQueue::default();
                let mut last = 0;
                for is_entry in kinds {
                    let seq = q.enqueue(if is_entry { entry() } else { event() }).unwrap();
                    prop_assert!(seq > last);
                    last = seq;
                }
            }

            #[test]
            fn since_returns_each_newer_item_once(n in 1u64..150, cursor in 0u64..200) {
                let q = SequenceQueue::default();
                for i in 0..n {
                    q.enqueue(if i % 3 == 0 { event() } else { entry() }).unwrap();
                }
                let seqs: Vec<u64> = q.since(cursor).in_order().iter().map(|i| i.seq).collect();
                let expected: Vec<u64> = (cursor + 1..=n).collect();
                prop_assert_eq!(seqs, expected);
            }

            #[test]
            fn ack_never_drops_recent_items(
                ages_min in proptest::collection::vec(0i64..180, 1..100),
                cursor in 0u64..120,
            ) {
                let q = SequenceQueue::default();
                let now = Utc::now();
                for age in &ages_min {
                    q.enqueue_at(entry(), now - TimeDelta::minutes(*age)).unwrap();
                }
                q.ack_at(cursor, now);
                let kept: Vec<u64> = q.since(cursor.saturating_sub(1)).in_order().iter().map(|i| i.seq).collect();
                for (i, age) in ages_min.iter().enumerate() {
                    let seq = i as u64 + 1;
                    if *age < 60 && seq > cursor.saturating_sub(1) {
                        prop_assert!(kept.contains(&seq));
                    }
                }
            }
        }
    }
}
