//! Background service configuration: scheduled backups and the labeling endpoint

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::backup::BackupSettings;
use crate::labeling::MAX_TIMEOUT;

// ─────────────────────────────────────────────────────────────────────────────
// Backups
// ─────────────────────────────────────────────────────────────────────────────

/// `[backup]` as loaded from the config file
#[derive(Debug, Deserialize, Default)]
pub struct FileBackup {
    pub enabled: Option<bool>,
    pub interval_hours: Option<u64>,
    pub retention_days: Option<u32>,
    pub dir: Option<String>,
}

impl FileBackup {
    pub fn apply(file: Option<Self>, defaults: BackupSettings) -> BackupSettings {
        let file = file.unwrap_or_default();
        BackupSettings {
            enabled: file.enabled.unwrap_or(defaults.enabled),
            interval: file
                .interval_hours
                .map(|h| Duration::from_secs(h * 3600))
                .unwrap_or(defaults.interval),
            retention_days: file.retention_days.unwrap_or(defaults.retention_days),
            dir: file.dir.map(PathBuf::from).unwrap_or(defaults.dir),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Labeling
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LabelingConfig {
    /// Completion endpoint; rule-based labels only when unset
    pub endpoint: Option<String>,
    /// Capped at two seconds
    pub timeout: Duration,
}

impl Default for LabelingConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout: MAX_TIMEOUT,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct FileLabeling {
    pub endpoint: Option<String>,
    pub timeout_ms: Option<u64>,
}

impl LabelingConfig {
    pub fn from_file(file: Option<FileLabeling>) -> Self {
        let file = file.unwrap_or_default();
        Self {
            endpoint: file.endpoint.filter(|e| !e.trim().is_empty()),
            timeout: file
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(MAX_TIMEOUT)
                .min(MAX_TIMEOUT),
        }
    }
}
