//! Per-file snapshots and significant-diff detection
//!
//! The detector owns the last-seen content of every watched file. A change is
//! significant when the content length moved by at least `threshold`
//! characters; smaller edits accumulate against the last emitted snapshot
//! until they cross it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use similar::{ChangeTag, TextDiff};

use crate::model::ChangeStats;

type Fingerprint = [u8; 32];

fn fingerprint(bytes: &[u8]) -> Fingerprint {
    Sha256::digest(bytes).into()
}

/// Line and character counts between two versions
pub fn diff_stats(file_path: &str, before: &str, after: &str) -> ChangeStats {
    let mut lines_added = 0;
    let mut lines_removed = 0;
    for change in TextDiff::from_lines(before, after).iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => lines_added += 1,
            ChangeTag::Delete => lines_removed += 1,
            ChangeTag::Equal => {}
        }
    }
    let delta = after.chars().count() as i64 - before.chars().count() as i64;
    ChangeStats {
        file_path: file_path.to_string(),
        chars_added: delta.max(0),
        chars_removed: (-delta).max(0),
        lines_added,
        lines_removed,
        diff_size: delta.abs(),
        entry_id: None,
        prompt_id: None,
    }
}

/// A change large enough to record
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedChange {
    pub path: PathBuf,
    pub before: String,
    pub after: String,
    pub stats: ChangeStats,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// Same bytes as last time
    Unchanged,
    /// Below threshold; the snapshot keeps the last emitted version
    Minor(ChangeStats),
    Significant(DetectedChange),
    /// Not UTF-8 text
    Binary,
}

struct Snapshot {
    /// Content as of the last emitted change (or priming)
    content: String,
    /// Fingerprint of the most recently observed bytes
    seen: Fingerprint,
}

pub struct ChangeDetector {
    threshold: i64,
    snapshots: HashMap<PathBuf, Snapshot>,
}

impl ChangeDetector {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold as i64,
            snapshots: HashMap::new(),
        }
    }

    pub fn threshold(&self) -> i64 {
        self.threshold
    }

    /// Record current content without emitting. Returns false for binary files.
    pub fn prime(&mut self, path: &Path, bytes: &[u8]) -> bool {
        let Ok(content) = std::str::from_utf8(bytes) else {
            return false;
        };
        self.snapshots.insert(
            path.to_path_buf(),
            Snapshot {
                content: content.to_string(),
                seen: fingerprint(bytes),
            },
        );
        true
    }

    /// Compare `bytes` with the snapshot for `path`. A path never seen before
    /// is diffed against empty content.
    pub fn observe(&mut self, path: &Path, bytes: &[u8]) -> Observation {
        let seen = fingerprint(bytes);
        if self.snapshots.get(path).is_some_and(|s| s.seen == seen) {
            return Observation::Unchanged;
        }
        let Ok(after) = std::str::from_utf8(bytes) else {
            return Observation::Binary;
        };

        let snapshot = self
            .snapshots
            .entry(path.to_path_buf())
            .or_insert_with(|| Snapshot {
                content: String::new(),
                seen: fingerprint(b""),
            });
        snapshot.seen = seen;
        if snapshot.content == after {
            return Observation::Unchanged;
        }

        let stats = diff_stats(&path.to_string_lossy(), &snapshot.content, after);
        if stats.diff_size < self.threshold {
            return Observation::Minor(stats);
        }
        let before = std::mem::replace(&mut snapshot.content, after.to_string());
        Observation::Significant(DetectedChange {
            path: path.to_path_buf(),
            before,
            after: after.to_string(),
            stats,
        })
    }

    /// Drop the snapshot (delete, or the old side of a rename)
    pub fn forget(&mut self, path: &Path) -> bool {
        self.snapshots.remove(path).is_some()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    #[test]
    fn test_diff_stats_counts() {
        let stats = diff_stats("a.py", "one\ntwo\n", "one\nthree\nfour\n");
        assert_eq!(stats.lines_added, 2);
        assert_eq!(stats.lines_removed, 1);
        assert_eq!(stats.chars_added, 7);
        assert_eq!(stats.chars_removed, 0);
        assert_eq!(stats.diff_size, 7);
    }

    #[test]
    fn test_threshold_exactly_met_is_significant() {
        let mut d = ChangeDetector::new(12);
        d.prime(&p("/w/a.py"), b"");
        match d.observe(&p("/w/a.py"), "x".repeat(12).as_bytes()) {
            Observation::Significant(change) => assert_eq!(change.stats.diff_size, 12),
            other => panic!("expected significant, got {other:?}"),
        }
    }

    #[test]
    fn test_below_threshold_accumulates() {
        let mut d = ChangeDetector::new(12);
        d.prime(&p("/w/a.py"), b"base");
        assert!(matches!(
            d.observe(&p("/w/a.py"), b"base123456"),
            Observation::Minor(_)
        ));
        match d.observe(&p("/w/a.py"), b"base1234567890abc") {
            Observation::Significant(change) => {
                assert_eq!(change.before, "base");
                assert_eq!(change.stats.diff_size, 13);
            }
            other => panic!("expected significant, got {other:?}"),
        }
    }

    #[test]
    fn test_identical_content_is_unchanged() {
        let mut d = ChangeDetector::new(0);
        d.prime(&p("/w/a.py"), b"same");
        assert_eq!(d.observe(&p("/w/a.py"), b"same"), Observation::Unchanged);
    }

    #[test]
    fn test_binary_is_skipped() {
        let mut d = ChangeDetector::new(1);
        assert_eq!(d.observe(&p("/w/img.png"), &[0xff, 0xfe, 0x00]), Observation::Binary);
        assert!(!d.prime(&p("/w/img.png"), &[0xff, 0xfe]));
    }

    #[test]
    fn test_new_file_diffs_against_empty() {
        let mut d = ChangeDetector::new(5);
        match d.observe(&p("/w/new.rs"), b"fn main() {}") {
            Observation::Significant(change) => assert_eq!(change.before, ""),
            other => panic!("expected significant, got {other:?}"),
        }
    }

    #[test]
    fn test_rename_starts_fresh() {
        let mut d = ChangeDetector::new(5);
        d.prime(&p("/w/old.rs"), b"fn main() {}");
        assert!(d.forget(&p("/w/old.rs")));
        match d.observe(&p("/w/new.rs"), b"fn main() {}") {
            Observation::Significant(change) => assert_eq!(change.before, ""),
            other => panic!("expected significant, got {other:?}"),
        }
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn never_significant_below_threshold(
                before in "[a-z\n]{0,80}",
                after in "[a-z\n]{0,80}",
                threshold in 1usize..60,
            ) {
                let mut d = ChangeDetector::new(threshold);
                d.prime(&p("/w/f.txt"), before.as_bytes());
                let delta = (after.chars().count() as i64 - before.chars().count() as i64).abs();
                if let Observation::Significant(change) = d.observe(&p("/w/f.txt"), after.as_bytes()) {
                    prop_assert!(delta >= threshold as i64);
                    prop_assert_eq!(change.stats.diff_size, delta);
                }
            }
        }
    }
}
