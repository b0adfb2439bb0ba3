//! File watcher: notify events → coalesced ticks → change detector → recorder
//!
//! ```text
//! notify callback ──blocking_send──→ mpsc ──→ tick loop (50 ms)
//!                                              │ drain pending paths
//!                                              ▼
//!                                   spawn_blocking(process batch)
//!                                     read file, ChangeDetector::observe,
//!                                     Recorder::record_change
//! ```
//!
//! The detector is moved into each blocking batch and handed back, so the
//! snapshot map has exactly one owner at a time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use globset::{Glob, GlobSet, GlobSetBuilder};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::detector::{ChangeDetector, Observation};
use super::Recorder;
use crate::error::{Error, Result};
use crate::model::{
    Entry, EntrySource, Event, EventDetails, EventType, FileChange, FileChangeKind,
};

pub const DEFAULT_IGNORE: &[&str] = &[
    "**/.git/**",
    "**/node_modules/**",
    "**/target/**",
    "**/dist/**",
    "**/build/**",
    "**/__pycache__/**",
    "**/.venv/**",
    "**/*.db",
    "**/*.db-*",
    "**/*.log",
];

/// Reads slower than the budget are retried this many times before the
/// content is used anyway
const MAX_SLOW_RETRIES: u8 = 3;

#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub root: PathBuf,
    pub ignore: Vec<String>,
    pub diff_threshold: usize,
    pub emit_deletes: bool,
    pub tick: Duration,
    pub read_budget: Duration,
    pub max_file_bytes: u64,
}

impl WatchSettings {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ignore: DEFAULT_IGNORE.iter().map(|s| s.to_string()).collect(),
            diff_threshold: 12,
            emit_deletes: false,
            tick: Duration::from_millis(50),
            read_budget: Duration::from_millis(500),
            max_file_bytes: 2 * 1024 * 1024,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Ignore rules
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct IgnoreSet {
    root: PathBuf,
    globs: GlobSet,
}

impl IgnoreSet {
    pub fn new(root: &Path, patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = Glob::new(pattern)
                .map_err(|e| Error::invalid(format!("ignore pattern '{pattern}': {e}")))?;
            builder.add(glob);
        }
        let globs = builder
            .build()
            .map_err(|e| Error::invalid(format!("ignore patterns: {e}")))?;
        Ok(Self {
            root: root.to_path_buf(),
            globs,
        })
    }

    /// Matches against the path relative to the root and the full path
    pub fn is_ignored(&self, path: &Path) -> bool {
        if self.globs.is_match(path) {
            return true;
        }
        path.strip_prefix(&self.root)
            .map(|rel| self.globs.is_match(rel))
            .unwrap_or(false)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Batch processing (blocking)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathChange {
    Written,
    Removed,
}

/// Pending work for one tick: latest change per path, plus slow-read retries
#[derive(Default)]
struct Batch {
    paths: HashMap<PathBuf, PathChange>,
    slow: HashMap<PathBuf, u8>,
}

/// What one processed path led to; used for logging and tests
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Recorded { entry_id: String, prompt_id: Option<i64> },
    Minor,
    Unchanged,
    Skipped(&'static str),
    Forgotten,
    Retry,
    Failed(String),
}

/// Owns the snapshot map while a batch runs
pub struct BatchProcessor {
    settings: WatchSettings,
    detector: ChangeDetector,
    recorder: Recorder,
}

impl BatchProcessor {
    pub fn new(settings: WatchSettings, recorder: Recorder) -> Self {
        let detector = ChangeDetector::new(settings.diff_threshold);
        Self {
            settings,
            detector,
            recorder,
        }
    }

    /// Walk the root and snapshot existing files without emitting
    pub fn prime(&mut self, ignore: &IgnoreSet) -> usize {
        let mut primed = 0;
        let walker = WalkDir::new(&self.settings.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !ignore.is_ignored(e.path()));
        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let too_big = entry
                .metadata()
                .map(|m| m.len() > self.settings.max_file_bytes)
                .unwrap_or(true);
            if too_big {
                continue;
            }
            if let Ok(bytes) = std::fs::read(entry.path()) {
                if self.detector.prime(entry.path(), &bytes) {
                    primed += 1;
                }
            }
        }
        primed
    }

    /// Handle one path. Blocking.
    fn process(&mut self, path: &Path, change: PathChange, slow_attempts: u8) -> Outcome {
        if change == PathChange::Removed {
            let known = self.detector.forget(path);
            if known && self.settings.emit_deletes {
                self.record_delete(path);
            }
            return Outcome::Forgotten;
        }

        let meta = match std::fs::metadata(path) {
            Ok(m) => m,
            // Gone between the event and the read: same as a delete
            Err(_) => {
                self.detector.forget(path);
                return Outcome::Forgotten;
            }
        };
        if !meta.is_file() {
            return Outcome::Skipped("not a file");
        }
        if meta.len() > self.settings.max_file_bytes {
            tracing::debug!(path = %path.display(), size = meta.len(), "skipping large file");
            return Outcome::Skipped("too large");
        }

        let started = Instant::now();
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) => return Outcome::Failed(e.to_string()),
        };
        let elapsed = started.elapsed();
        if elapsed > self.settings.read_budget && slow_attempts < MAX_SLOW_RETRIES {
            tracing::warn!(
                path = %path.display(),
                elapsed_ms = elapsed.as_millis() as u64,
                "file read over budget, retrying next tick"
            );
            return Outcome::Retry;
        }

        match self.detector.observe(path, &bytes) {
            Observation::Unchanged => Outcome::Unchanged,
            Observation::Minor(_) => Outcome::Minor,
            Observation::Binary => {
                tracing::debug!(path = %path.display(), "skipping non-UTF-8 file");
                Outcome::Skipped("binary")
            }
            Observation::Significant(change) => {
                let file_path = change.path.to_string_lossy().to_string();
                let mut entry = Entry::code_change(
                    file_path,
                    change.before,
                    change.after,
                    EntrySource::Filewatcher,
                );
                entry.workspace_path = Some(self.workspace());
                let mut event = Event::new(EventType::CodeChange, EventDetails::CodeChange(change.stats));
                event.workspace_path = entry.workspace_path.clone();
                event.source = Some(EntrySource::Filewatcher.as_str().to_string());

                match self.recorder.record_change(entry, event) {
                    Ok(recorded) => Outcome::Recorded {
                        entry_id: recorded.entry.id,
                        prompt_id: recorded.entry.prompt_id,
                    },
                    Err(Error::InvalidInput(msg)) => {
                        tracing::warn!(path = %path.display(), %msg, "change dropped");
                        Outcome::Failed(msg)
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "change not recorded");
                        Outcome::Failed(e.to_string())
                    }
                }
            }
        }
    }

    fn record_delete(&self, path: &Path) {
        let mut event = Event::new(
            EventType::FileChange,
            EventDetails::FileChange(FileChange {
                file_path: path.to_string_lossy().to_string(),
                change: FileChangeKind::Unlink,
            }),
        );
        event.workspace_path = Some(self.workspace());
        event.source = Some(EntrySource::Filewatcher.as_str().to_string());
        if let Err(e) = self.recorder.record_event(event) {
            tracing::warn!(path = %path.display(), error = %e, "delete event not recorded");
        }
    }

    fn workspace(&self) -> String {
        self.settings.root.to_string_lossy().to_string()
    }

    /// Process a drained batch; returns the paths to retry next tick
    fn run_batch(&mut self, batch: Batch) -> Batch {
        let mut retry = Batch::default();
        for (path, change) in batch.paths {
            let attempts = batch.slow.get(&path).copied().unwrap_or(0);
            match self.process(&path, change, attempts) {
                Outcome::Retry => {
                    retry.slow.insert(path.clone(), attempts + 1);
                    retry.paths.insert(path, change);
                }
                Outcome::Recorded { entry_id, prompt_id } => {
                    tracing::debug!(path = %path.display(), entry = %entry_id, ?prompt_id, "change recorded");
                }
                _ => {}
            }
        }
        retry
    }
}

/// Fold one notify event into the pending set
fn collect(event: NotifyEvent, ignore: &IgnoreSet, pending: &mut Batch) {
    let mut mark = |path: &Path, change: PathChange| {
        if !ignore.is_ignored(path) {
            pending.paths.insert(path.to_path_buf(), change);
        }
    };
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
            for p in &event.paths {
                mark(p, PathChange::Written);
            }
        }
        EventKind::Remove(_) => {
            for p in &event.paths {
                mark(p, PathChange::Removed);
            }
        }
        // No rename tracking: the old path is dropped, the new one starts fresh
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for p in &event.paths {
                mark(p, PathChange::Removed);
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for p in &event.paths {
                mark(p, PathChange::Written);
            }
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            if let [from, to, ..] = event.paths.as_slice() {
                mark(from, PathChange::Removed);
                mark(to, PathChange::Written);
            }
        }
        _ => {}
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Async driver
// ─────────────────────────────────────────────────────────────────────────────

/// Running watcher; dropping it stops the notify backend
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    pub task: JoinHandle<()>,
    pub primed: usize,
}

pub async fn spawn(
    settings: WatchSettings,
    recorder: Recorder,
    cancel: CancellationToken,
) -> Result<FileWatcher> {
    if !settings.root.is_dir() {
        return Err(Error::invalid(format!(
            "watch root {} is not a directory",
            settings.root.display()
        )));
    }
    let ignore = Arc::new(IgnoreSet::new(&settings.root, &settings.ignore)?);
    let tick = settings.tick;
    let root = settings.root.clone();

    let (tx, mut rx) = mpsc::channel::<NotifyEvent>(1024);
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<NotifyEvent>| match res {
            Ok(event) => {
                let _ = tx.blocking_send(event);
            }
            Err(e) => tracing::warn!(error = %e, "watch error"),
        },
        NotifyConfig::default(),
    )
    .map_err(|e| Error::Internal(format!("watcher: {e}")))?;
    watcher
        .watch(&root, RecursiveMode::Recursive)
        .map_err(|e| Error::Internal(format!("watch {}: {e}", root.display())))?;

    let prime_ignore = ignore.clone();
    let (processor, primed) = tokio::task::spawn_blocking(move || {
        let mut processor = BatchProcessor::new(settings, recorder);
        let primed = processor.prime(&prime_ignore);
        (processor, primed)
    })
    .await?;
    tracing::info!(root = %root.display(), primed, "file watcher started");

    let task = tokio::spawn(async move {
        let mut processor = Some(processor);
        let mut pending = Batch::default();
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => collect(event, &ignore, &mut pending),
                    None => break,
                },
                _ = ticker.tick() => {
                    if pending.paths.is_empty() {
                        continue;
                    }
                    let Some(mut owned) = processor.take() else { break };
                    let batch = std::mem::take(&mut pending);
                    match tokio::task::spawn_blocking(move || {
                        let retry = owned.run_batch(batch);
                        (owned, retry)
                    })
                    .await
                    {
                        Ok((owned, retry)) => {
                            processor = Some(owned);
                            for (path, change) in retry.paths {
                                pending.paths.entry(path).or_insert(change);
                            }
                            pending.slow.extend(retry.slow);
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "watcher batch panicked, stopping watcher");
                            break;
                        }
                    }
                }
            }
        }
        tracing::debug!("file watcher stopped");
    });

    Ok(FileWatcher {
        _watcher: watcher,
        task,
        primed,
    })
}
