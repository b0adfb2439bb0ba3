//! Database export and scheduled JSON backups
//!
//! ```text
//! GET /api/export/database ──→ export() ──→ Export { metadata, entries, …, stats }
//!
//! backup task ──every interval──→ write_backup() ──→ backup_<ts>.json
//!                                  prune()        ──→ drop files older than retention
//! ```
//!
//! Backup files use the `{metadata, data:{…}, stats}` shape, which the
//! importer accepts next to the flat export shape.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::model::{json, ContextSnapshot, Entry, Event, Prompt, TerminalCommand, Workspace};
use crate::storage::{Store, StoreStats};

const FILE_PREFIX: &str = "backup_";
const FILE_SUFFIX: &str = ".json";

#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub enabled: bool,
    pub interval: Duration,
    /// 0 keeps every file
    pub retention_days: u32,
    pub dir: PathBuf,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(24 * 3600),
            retention_days: 30,
            dir: PathBuf::from("./data/backups"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Export
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ExportMetadata {
    #[serde(with = "json::timestamp")]
    pub exported_at: DateTime<Utc>,
    pub version: &'static str,
    pub schema_version: i64,
    pub backend: &'static str,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExportData {
    pub entries: Vec<Entry>,
    pub prompts: Vec<Prompt>,
    pub events: Vec<Event>,
    pub terminal_commands: Vec<TerminalCommand>,
    pub context_snapshots: Vec<ContextSnapshot>,
    pub workspaces: Vec<Workspace>,
}

/// Flat export: tables sit next to `metadata`
#[derive(Debug, Clone, Serialize)]
pub struct Export {
    pub metadata: ExportMetadata,
    #[serde(flatten)]
    pub data: ExportData,
    pub stats: StoreStats,
}

/// Backup file: tables nested under `data`
#[derive(Debug, Clone, Serialize)]
pub struct BackupFile {
    pub metadata: ExportMetadata,
    pub data: ExportData,
    pub stats: StoreStats,
}

impl From<Export> for BackupFile {
    fn from(export: Export) -> Self {
        Self {
            metadata: export.metadata,
            data: export.data,
            stats: export.stats,
        }
    }
}

/// Snapshot every exported table. Blocking.
pub fn export(store: &Store) -> Result<Export> {
    let stats = store.get_stats()?;
    let data = ExportData {
        entries: store.all()?,
        prompts: store.all()?,
        events: store.all()?,
        terminal_commands: store.all()?,
        context_snapshots: store.all()?,
        workspaces: store.all()?,
    };
    Ok(Export {
        metadata: ExportMetadata {
            exported_at: json::now(),
            version: env!("CARGO_PKG_VERSION"),
            schema_version: stats.schema_version,
            backend: stats.backend,
        },
        data,
        stats,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Backup files
// ─────────────────────────────────────────────────────────────────────────────

/// `backup_<RFC 3339>.json` with `:` replaced so the name is portable
pub fn file_name(at: &DateTime<Utc>) -> String {
    format!("{FILE_PREFIX}{}{FILE_SUFFIX}", json::format_ts(at).replace(':', "-"))
}

/// Inverse of `file_name`; `None` for anything else
fn stamp_of(name: &str) -> Option<DateTime<Utc>> {
    let stamp = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    let (date, time) = stamp.split_once('T')?;
    json::parse_ts(&format!("{date}T{}", time.replace('-', ":")))
}

/// Write one backup into `dir`, creating it if needed. Blocking.
pub fn write_backup(store: &Store, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let file: BackupFile = export(store)?.into();
    let path = dir.join(file_name(&file.metadata.exported_at));
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
    std::fs::rename(&tmp, &path)?;
    Ok(path)
}

/// Delete backup files older than `retention_days` relative to `now`
pub fn prune(dir: &Path, retention_days: u32, now: DateTime<Utc>) -> Result<usize> {
    if retention_days == 0 || !dir.exists() {
        return Ok(0);
    }
    let cutoff = now - TimeDelta::days(i64::from(retention_days));
    let mut removed = 0;
    for dirent in std::fs::read_dir(dir)? {
        let path = dirent?.path();
        let Some(stamp) = path.file_name().and_then(|n| n.to_str()).and_then(stamp_of) else {
            continue;
        };
        if stamp < cutoff {
            std::fs::remove_file(&path)?;
            tracing::debug!(path = %path.display(), "expired backup removed");
            removed += 1;
        }
    }
    Ok(removed)
}

/// One scheduled run: write, then prune. Blocking.
pub fn run_once(store: &Store, settings: &BackupSettings) -> Result<PathBuf> {
    let path = write_backup(store, &settings.dir)?;
    let removed = prune(&settings.dir, settings.retention_days, json::now())?;
    tracing::info!(path = %path.display(), removed, "backup written");
    Ok(path)
}

/// Periodic backup task; `None` when backups are disabled. The first run
/// happens one interval after boot. A failed run logs and waits for the next.
pub fn spawn(store: Store, settings: BackupSettings, cancel: CancellationToken) -> Option<JoinHandle<()>> {
    if !settings.enabled {
        tracing::debug!("backups disabled");
        return None;
    }
    if settings.interval.is_zero() {
        tracing::warn!("backup interval is zero, backups disabled");
        return None;
    }
    Some(tokio::spawn(async move {
        let start = tokio::time::Instant::now() + settings.interval;
        let mut ticker = tokio::time::interval_at(start, settings.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let (store, settings) = (store.clone(), settings.clone());
                    let outcome = tokio::task::spawn_blocking(move || run_once(&store, &settings))
                        .await
                        .map_err(Error::from)
                        .and_then(|r| r);
                    if let Err(e) = outcome {
                        tracing::error!(error = %e, "scheduled backup failed");
                    }
                }
            }
        }
        tracing::debug!("backup task stopped");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing;

    fn at(text: &str) -> DateTime<Utc> {
        json::parse_ts(text).unwrap()
    }

    #[test]
    fn test_file_name_round_trip() {
        let ts = at("2026-03-01T12:30:45.123Z");
        let name = file_name(&ts);
        assert_eq!(name, "backup_2026-03-01T12-30-45.123Z.json");
        assert!(!name.contains(':'));
        assert_eq!(stamp_of(&name), Some(ts));
        assert_eq!(stamp_of("notes.json"), None);
    }

    #[test]
    fn test_export_shapes() {
        let (_db, rec) = testing::recorder();
        rec.record_prompt(Prompt::pending("hello", "api")).unwrap();
        rec.record_entry(Entry::code_change("/w/a.py", "", "x", crate::model::EntrySource::Manual))
            .unwrap();

        let flat = serde_json::to_value(export(rec.store()).unwrap()).unwrap();
        assert_eq!(flat["entries"].as_array().unwrap().len(), 1);
        assert_eq!(flat["prompts"].as_array().unwrap().len(), 1);
        assert!(flat["metadata"]["exported_at"].is_string());
        assert_eq!(flat["stats"]["entries"], 1);

        let nested = serde_json::to_value(BackupFile::from(export(rec.store()).unwrap())).unwrap();
        assert_eq!(nested["data"]["prompts"].as_array().unwrap().len(), 1);
        assert!(nested.get("entries").is_none());
    }

    #[test]
    fn test_write_and_prune() {
        let (_db, rec) = testing::recorder();
        let dir = tempfile::tempdir().unwrap();

        let written = write_backup(rec.store(), dir.path()).unwrap();
        let text = std::fs::read_to_string(&written).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(value["data"]["entries"].is_array());

        let old = dir.path().join(file_name(&at("2020-01-01T00:00:00.000Z")));
        std::fs::write(&old, "{}").unwrap();
        let unrelated = dir.path().join("keep.json");
        std::fs::write(&unrelated, "{}").unwrap();

        let removed = prune(dir.path(), 30, json::now()).unwrap();
        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(written.exists());
        assert!(unrelated.exists());
        assert_eq!(prune(dir.path(), 0, json::now()).unwrap(), 0);
    }

    #[test]
    fn test_backup_imports_back() {
        use crate::capture::import::{self, Dataset, ImportOptions};

        let (_src_db, src) = testing::recorder();
        src.record_entry(Entry::code_change("/w/a.py", "", "x", crate::model::EntrySource::Manual))
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_backup(src.store(), dir.path()).unwrap();

        let (_dst_db, dst) = testing::recorder();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        let dataset = Dataset::from_value(value).unwrap();
        let report = import::import(dst.store(), None, &dataset, &ImportOptions::default()).unwrap();
        assert_eq!(report.stats["entries"].imported, 1);
    }
}
