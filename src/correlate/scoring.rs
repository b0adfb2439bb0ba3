//! Relevance scores between prompts and events
//!
//! Two rankings share the same workspace and content signals:
//!
//! ```text
//! time-based      0.5 × temporal  + 0.3 × workspace + 0.2 × content
//! sequence-based  0.5 × proximity + 0.3 × workspace + 0.2 × content
//! ```
//!
//! `temporal` falls linearly from 1 to 0 across a 15-minute window;
//! `proximity` falls linearly with the number of timeline items between the
//! two rows. Both inputs are pure slices; loading is the caller's job.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::model::{Event, Prompt};

/// Time-based candidates must fall inside this window
pub const TIME_WINDOW_SECS: i64 = 15 * 60;
/// Prompts this close to the event skip the score floor
pub const CLOSE_SECS: i64 = 2 * 60;
pub const MIN_SCORE: f64 = 0.3;
pub const TIME_TOP_N: usize = 10;

/// Timeline items considered before / after an event (sequence-based)
pub const SEQ_BEFORE: usize = 20;
pub const SEQ_AFTER: usize = 5;

const W_TIME: f64 = 0.5;
const W_WORKSPACE: f64 = 0.3;
const W_CONTENT: f64 = 0.2;

/// Highest content signal; content is normalised against it
const CONTENT_FULL_PATH: f64 = 0.3;
const CONTENT_FILE_NAME: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Time,
    Sequence,
}

impl Mode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "time" => Some(Self::Time),
            "sequence" | "seq" => Some(Self::Sequence),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScoreParts {
    /// Temporal score or sequence proximity, by mode
    pub proximity: f64,
    pub workspace: f64,
    pub content: f64,
}

impl ScoreParts {
    pub fn total(&self) -> f64 {
        W_TIME * self.proximity
            + W_WORKSPACE * self.workspace
            + W_CONTENT * (self.content / CONTENT_FULL_PATH)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Signals
// ─────────────────────────────────────────────────────────────────────────────

/// Inverse distance inside the window; 0 outside it
pub fn temporal_score(a: DateTime<Utc>, b: DateTime<Utc>) -> f64 {
    let window = TIME_WINDOW_SECS as f64 * 1000.0;
    let gap = (a - b).num_milliseconds().unsigned_abs() as f64;
    if gap > window {
        0.0
    } else {
        1.0 - gap / window
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split(['/', '\\']).filter(|s| !s.is_empty()).collect()
}

/// How strongly two workspace paths suggest the same project
///
/// | relation                                         | score     |
/// |--------------------------------------------------|-----------|
/// | either side missing                              | 0.3       |
/// | identical                                        | 1.0       |
/// | same project name, leading segments shared       | 0.7 – 0.9 |
/// | one contains the other                           | 0.6       |
/// | anything else                                    | 0.2       |
pub fn workspace_score(a: Option<&str>, b: Option<&str>) -> f64 {
    let (Some(a), Some(b)) = (a.filter(|s| !s.is_empty()), b.filter(|s| !s.is_empty())) else {
        return 0.3;
    };
    let a = a.trim_end_matches('/');
    let b = b.trim_end_matches('/');
    if a == b {
        return 1.0;
    }
    let sa = segments(a);
    let sb = segments(b);
    if let (Some(la), Some(lb)) = (sa.last(), sb.last()) {
        if la == lb {
            let shared = sa.iter().zip(&sb).take_while(|(x, y)| x == y).count();
            let longest = sa.len().max(sb.len()).max(1);
            return 0.7 + 0.2 * shared as f64 / longest as f64;
        }
    }
    if a.contains(b) || b.contains(a) {
        return 0.6;
    }
    0.2
}

/// Whether the prompt mentions the event's file: full path 0.3, bare file
/// name 0.2, otherwise 0. Context files count as a full mention.
pub fn content_score(prompt: &Prompt, file_path: Option<&str>) -> f64 {
    let Some(path) = file_path.filter(|p| !p.is_empty()) else {
        return 0.0;
    };
    if prompt.text.contains(path) || prompt.context_files.iter().any(|f| f == path || path.ends_with(f.as_str())) {
        return CONTENT_FULL_PATH;
    }
    let name = path.rsplit(['/', '\\']).next().unwrap_or(path);
    if !name.is_empty() && prompt.text.contains(name) {
        return CONTENT_FILE_NAME;
    }
    0.0
}

fn parts(prompt: &Prompt, event: &Event, proximity: f64) -> ScoreParts {
    ScoreParts {
        proximity,
        workspace: workspace_score(prompt.workspace_path.as_deref(), event.workspace_path.as_deref()),
        content: content_score(prompt, event.path()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rankings
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scored<T> {
    pub item: T,
    pub score: f64,
    pub parts: ScoreParts,
    /// Signed milliseconds from the anchor to this item
    pub offset_ms: i64,
}

fn sort_scored<T>(items: &mut [Scored<T>]) {
    items.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.offset_ms.unsigned_abs().cmp(&b.offset_ms.unsigned_abs()))
    });
}

fn time_keep(parts: &ScoreParts, gap: TimeDelta) -> bool {
    gap.num_seconds().abs() <= CLOSE_SECS || parts.total() >= MIN_SCORE
}

/// Prompts at or before `event` within the time window, top 10.
///
/// Prompts after the event are never candidates: a prompt cannot have caused
/// an earlier change. This keeps the relation the mirror image of
/// [`events_for_prompt_by_time`], so any pair one side returns the other side
/// returns too, as long as neither list is cut at ten.
pub fn prompts_for_event_by_time(event: &Event, prompts: &[Prompt]) -> Vec<Scored<Prompt>> {
    let window = TimeDelta::seconds(TIME_WINDOW_SECS);
    let mut out: Vec<_> = prompts
        .iter()
        .filter(|p| p.timestamp <= event.timestamp && event.timestamp - p.timestamp <= window)
        .filter_map(|p| {
            let parts = parts(p, event, temporal_score(p.timestamp, event.timestamp));
            let gap = p.timestamp - event.timestamp;
            time_keep(&parts, gap).then(|| Scored {
                item: p.clone(),
                score: parts.total(),
                parts,
                offset_ms: gap.num_milliseconds(),
            })
        })
        .collect();
    sort_scored(&mut out);
    out.truncate(TIME_TOP_N);
    out
}

/// Events at or after `prompt` within the time window, top 10
pub fn events_for_prompt_by_time(prompt: &Prompt, events: &[Event]) -> Vec<Scored<Event>> {
    let window = TimeDelta::seconds(TIME_WINDOW_SECS);
    let mut out: Vec<_> = events
        .iter()
        .filter(|e| e.timestamp >= prompt.timestamp && e.timestamp - prompt.timestamp <= window)
        .filter_map(|e| {
            let parts = parts(prompt, e, temporal_score(prompt.timestamp, e.timestamp));
            let gap = e.timestamp - prompt.timestamp;
            time_keep(&parts, gap).then(|| Scored {
                item: e.clone(),
                score: parts.total(),
                parts,
                offset_ms: gap.num_milliseconds(),
            })
        })
        .collect();
    sort_scored(&mut out);
    out.truncate(TIME_TOP_N);
    out
}

/// One position in the merged prompt/event timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Prompt(usize),
    Event(usize),
}

/// Merge prompts and events into one order: timestamp, then prompts before
/// events at the same instant, then id. Indices point into the inputs.
pub fn timeline(prompts: &[Prompt], events: &[Event]) -> Vec<Slot> {
    let mut slots: Vec<Slot> = (0..prompts.len())
        .map(Slot::Prompt)
        .chain((0..events.len()).map(Slot::Event))
        .collect();
    slots.sort_by(|a, b| {
        let key = |s: &Slot| match *s {
            Slot::Prompt(i) => (prompts[i].timestamp, 0u8, prompts[i].id.unwrap_or_default().to_string()),
            Slot::Event(i) => (events[i].timestamp, 1u8, events[i].id.clone()),
        };
        key(a).cmp(&key(b))
    });
    slots
}

fn proximity(distance: usize) -> f64 {
    1.0 - (distance.saturating_sub(1)) as f64 / SEQ_BEFORE as f64
}

/// Prompts among the 20 timeline items before and 5 after the event. Not truncated.
pub fn prompts_for_event_by_sequence(
    event_id: &str,
    prompts: &[Prompt],
    events: &[Event],
) -> Vec<Scored<Prompt>> {
    let slots = timeline(prompts, events);
    let Some(pos) = slots
        .iter()
        .position(|s| matches!(*s, Slot::Event(i) if events[i].id == event_id))
    else {
        return Vec::new();
    };
    let event = match slots[pos] {
        Slot::Event(i) => &events[i],
        Slot::Prompt(_) => return Vec::new(),
    };
    let lo = pos.saturating_sub(SEQ_BEFORE);
    let hi = (pos + SEQ_AFTER).min(slots.len() - 1);
    let mut out = Vec::new();
    for (idx, slot) in slots.iter().enumerate().take(hi + 1).skip(lo) {
        let Slot::Prompt(i) = *slot else { continue };
        let prompt = &prompts[i];
        let distance = idx.abs_diff(pos);
        let parts = parts(prompt, event, proximity(distance));
        out.push(Scored {
            item: prompt.clone(),
            score: parts.total(),
            parts,
            offset_ms: (prompt.timestamp - event.timestamp).num_milliseconds(),
        });
    }
    sort_scored(&mut out);
    out
}

/// Events among the 20 timeline items after the prompt. Not truncated.
///
/// The window mirrors [`prompts_for_event_by_sequence`] restricted to the
/// causal direction, so an event listed here always lists the prompt back.
pub fn events_for_prompt_by_sequence(
    prompt_id: i64,
    prompts: &[Prompt],
    events: &[Event],
) -> Vec<Scored<Event>> {
    let slots = timeline(prompts, events);
    let Some(pos) = slots
        .iter()
        .position(|s| matches!(*s, Slot::Prompt(i) if prompts[i].id == Some(prompt_id)))
    else {
        return Vec::new();
    };
    let prompt = match slots[pos] {
        Slot::Prompt(i) => &prompts[i],
        Slot::Event(_) => return Vec::new(),
    };
    let hi = (pos + SEQ_BEFORE).min(slots.len() - 1);
    let mut out = Vec::new();
    for (idx, slot) in slots.iter().enumerate().take(hi + 1).skip(pos + 1) {
        let Slot::Event(i) = *slot else { continue };
        let event = &events[i];
        let parts = parts(prompt, event, proximity(idx - pos));
        out.push(Scored {
            item: event.clone(),
            score: parts.total(),
            parts,
            offset_ms: (event.timestamp - prompt.timestamp).num_milliseconds(),
        });
    }
    sort_scored(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeStats, EventDetails, EventType};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn prompt(id: i64, secs: i64, text: &str) -> Prompt {
        let mut p = Prompt::pending(text, "api");
        p.id = Some(id);
        p.timestamp = at(secs);
        p.workspace_path = Some("/w".into());
        p
    }

    fn event(id: &str, secs: i64, file: &str) -> Event {
        let mut e = Event::new(
            EventType::CodeChange,
            EventDetails::CodeChange(ChangeStats {
                file_path: file.into(),
                ..Default::default()
            }),
        );
        e.id = id.into();
        e.timestamp = at(secs);
        e.workspace_path = Some("/w".into());
        e
    }

    #[test]
    fn test_workspace_score_table() {
        assert_eq!(workspace_score(None, Some("/w")), 0.3);
        assert_eq!(workspace_score(Some("/w/app"), Some("/w/app/")), 1.0);
        let renamed = workspace_score(Some("/home/a/src/app"), Some("/home/b/src/app"));
        assert!((0.7..=0.9).contains(&renamed));
        assert_eq!(workspace_score(Some("/w/app"), Some("/w/app/sub")), 0.6);
        assert_eq!(workspace_score(Some("/x/one"), Some("/y/two")), 0.2);
    }

    #[test]
    fn test_content_score() {
        let p = prompt(1, 0, "fix the bug in /w/src/main.rs please");
        assert_eq!(content_score(&p, Some("/w/src/main.rs")), 0.3);
        let p = prompt(1, 0, "fix main.rs");
        assert_eq!(content_score(&p, Some("/w/src/main.rs")), 0.2);
        assert_eq!(content_score(&p, Some("/w/src/lib.rs")), 0.0);
    }

    #[test]
    fn test_temporal_score_bounds() {
        assert_eq!(temporal_score(at(0), at(0)), 1.0);
        assert_eq!(temporal_score(at(0), at(TIME_WINDOW_SECS + 1)), 0.0);
        assert!((temporal_score(at(0), at(TIME_WINDOW_SECS / 2)) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_time_based_prompts_are_causal_and_ranked() {
        let e = event("e1", 600, "/w/a.py");
        let prompts = vec![
            prompt(1, 590, "edit a.py"),
            prompt(2, 100, "unrelated"),
            prompt(3, 700, "after the event"),
            prompt(4, -2000, "outside the window"),
        ];
        let ranked = prompts_for_event_by_time(&e, &prompts);
        let ids: Vec<_> = ranked.iter().map(|s| s.item.id.unwrap()).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(ranked[0].score > ranked[1].score);
    }

    #[test]
    fn test_close_prompt_passes_floor() {
        let mut p = prompt(1, 0, "nothing relevant");
        p.workspace_path = Some("/elsewhere".into());
        let mut e = event("e1", 110, "/w/a.py");
        e.workspace_path = Some("/other".into());
        let ranked = prompts_for_event_by_time(&e, &[p]);
        assert_eq!(ranked.len(), 1);
    }

    #[test]
    fn test_time_based_truncates_to_ten() {
        let e = event("e1", 900, "/w/a.py");
        let prompts: Vec<_> = (0..15).map(|i| prompt(i, 880 - i, "x")).collect();
        assert_eq!(prompts_for_event_by_time(&e, &prompts).len(), TIME_TOP_N);
    }

    #[test]
    fn test_events_for_prompt_are_after_it() {
        let p = prompt(1, 100, "x");
        let events = vec![event("before", 50, "/w/a"), event("after", 160, "/w/a")];
        let ranked = events_for_prompt_by_time(&p, &events);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].item.id, "after");
    }

    #[test]
    fn test_sequence_window_sizes() {
        // p0 e0 e1 ... e24, with the prompt first
        let prompts = vec![prompt(1, 0, "x")];
        let events: Vec<_> = (0..25).map(|i| event(&format!("e{i:02}"), 10 + i, "/w/a")).collect();
        let related = events_for_prompt_by_sequence(1, &prompts, &events);
        assert_eq!(related.len(), SEQ_BEFORE);
        assert!(prompts_for_event_by_sequence("e19", &prompts, &events).len() == 1);
        assert!(prompts_for_event_by_sequence("e20", &prompts, &events).is_empty());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn sequence_relation_is_symmetric(
                prompt_times in proptest::collection::vec(0i64..500, 1..8),
                event_times in proptest::collection::vec(0i64..500, 1..30),
            ) {
                let prompts: Vec<_> = prompt_times.iter().enumerate()
                    .map(|(i, t)| prompt(i as i64 + 1, *t, "x")).collect();
                let events: Vec<_> = event_times.iter().enumerate()
                    .map(|(i, t)| event(&format!("e{i:03}"), *t, "/w/a")).collect();
                for p in &prompts {
                    let pid = p.id.unwrap();
                    for related in events_for_prompt_by_sequence(pid, &prompts, &events) {
                        prop_assert!(related.item.timestamp >= p.timestamp);
                        let back = prompts_for_event_by_sequence(&related.item.id, &prompts, &events);
                        prop_assert!(back.iter().any(|s| s.item.id == Some(pid)));
                    }
                }
            }

            #[test]
            fn time_relation_is_symmetric_and_causal(
                prompt_times in proptest::collection::vec(-400i64..400, 1..TIME_TOP_N),
                event_times in proptest::collection::vec(-400i64..400, 1..TIME_TOP_N),
                workspaces in proptest::collection::vec(prop_oneof![Just("/w"), Just("/x/y")], TIME_TOP_N),
            ) {
                let prompts: Vec<_> = prompt_times.iter().enumerate()
                    .map(|(i, t)| {
                        let mut p = prompt(i as i64 + 1, *t, "touch a");
                        p.workspace_path = Some(workspaces[i].to_string());
                        p
                    })
                    .collect();
                let events: Vec<_> = event_times.iter().enumerate()
                    .map(|(i, t)| event(&format!("e{i:03}"), *t, "/w/a")).collect();
                for p in &prompts {
                    for related in events_for_prompt_by_time(p, &events) {
                        prop_assert!(related.item.timestamp >= p.timestamp);
                        let back = prompts_for_event_by_time(&related.item, &prompts);
                        let mirrored = back.iter().find(|s| s.item.id == p.id);
                        prop_assert!(mirrored.is_some());
                        prop_assert_eq!(mirrored.map(|s| s.score), Some(related.score));
                    }
                }
                for e in &events {
                    for related in prompts_for_event_by_time(e, &prompts) {
                        prop_assert!(related.item.timestamp <= e.timestamp);
                        let forward = events_for_prompt_by_time(&related.item, &events);
                        prop_assert!(forward.iter().any(|s| s.item.id == e.id));
                    }
                }
            }
        }
    }
}
