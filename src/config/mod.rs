//! Configuration for the companion service
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (`--config`, `$COMPANION_CONFIG`, or ~/.config/companion/config.toml)
//! 3. Built-in defaults (lowest priority)
//!
//! A `.json` config file is read as JSON, anything else as TOML. A file that
//! exists but does not parse stops the boot.

use anyhow::{bail, Context};
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::backup::BackupSettings;
use crate::capture::clipboard::ClipboardSettings;
use crate::capture::watcher::{WatchSettings, DEFAULT_IGNORE};
use crate::storage::DatabaseTarget;

// ─────────────────────────────────────────────────────────────────────────────
// Submodules
// ─────────────────────────────────────────────────────────────────────────────

mod capture;
mod observability;
mod serialization;
mod services;
mod startup;

#[cfg(test)]
mod tests;

pub use capture::{FileClipboard, FileTerminal, TerminalConfig};
pub use observability::{FileLogging, LogRotation, LoggingConfig};
pub use services::{FileBackup, FileLabeling, LabelingConfig};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_PORT: u16 = 43917;

// ─────────────────────────────────────────────────────────────────────────────
// Application Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory tree the file watcher observes
    pub root_dir: PathBuf,
    /// Glob patterns skipped by the watcher and the boot walk
    pub ignore: Vec<String>,
    /// Minimum changed characters before a write becomes an entry
    pub diff_threshold: usize,
    pub enable_clipboard: bool,
    /// Loopback port for the HTTP interface
    pub port: u16,
    /// Embedded database file, used when `database_url` is unset
    pub db_path: PathBuf,
    /// `postgres://` URL selecting the networked backend
    pub database_url: Option<String>,
    /// Emit an entry when a watched file is deleted
    pub emit_deletes: bool,
    /// How long a pending prompt may wait for a code change
    pub attribution_window_secs: u64,
    /// Queue capacity before writers see backpressure
    pub queue_cap: usize,
    /// Per-request deadline for blocking work behind the HTTP interface
    pub request_timeout_secs: u64,
    /// Runtime flag: start the file watcher (cleared by `--no-watch`)
    pub watch: bool,
    pub backup: BackupSettings,
    pub logging: LoggingConfig,
    pub terminal: TerminalConfig,
    pub labeling: LabelingConfig,
    pub clipboard: ClipboardSettings,
    /// Config file the values were read from, if any
    pub source: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            ignore: DEFAULT_IGNORE.iter().map(|s| s.to_string()).collect(),
            diff_threshold: 12,
            enable_clipboard: false,
            port: DEFAULT_PORT,
            db_path: PathBuf::from("./data/companion.db"),
            database_url: None,
            emit_deletes: false,
            attribution_window_secs: 300,
            queue_cap: crate::queue::DEFAULT_CAP,
            request_timeout_secs: 30,
            watch: true,
            backup: BackupSettings::default(),
            logging: LoggingConfig::default(),
            terminal: TerminalConfig::default(),
            labeling: LabelingConfig::default(),
            clipboard: ClipboardSettings::default(),
            source: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File Configuration (deserialization layer)
// ─────────────────────────────────────────────────────────────────────────────

/// Config as read from disk; every key optional
#[derive(Debug, Deserialize, Default)]
pub struct FileConfig {
    pub root_dir: Option<String>,
    pub ignore: Option<Vec<String>>,
    pub diff_threshold: Option<usize>,
    pub enable_clipboard: Option<bool>,
    pub port: Option<u16>,
    pub db_path: Option<String>,
    pub database_url: Option<String>,
    pub emit_deletes: Option<bool>,
    pub attribution_window_secs: Option<u64>,
    pub queue_cap: Option<usize>,
    pub request_timeout_secs: Option<u64>,
    pub backup: Option<FileBackup>,
    pub logging: Option<FileLogging>,
    pub terminal: Option<FileTerminal>,
    pub labeling: Option<FileLabeling>,
    pub clipboard: Option<FileClipboard>,
}

impl FileConfig {
    /// Parse by extension: `.json` as JSON, everything else as TOML
    pub fn parse(path: &Path, contents: &str) -> anyhow::Result<Self> {
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            serde_json::from_str(contents)
                .with_context(|| format!("invalid JSON in config file {}", path.display()))
        } else {
            toml::from_str(contents)
                .with_context(|| format!("invalid TOML in config file {}", path.display()))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

/// Read an environment variable as `T`; a present but malformed value is an error
fn env_parse<T>(env: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{key}={raw:?}: {e}")),
    }
}

fn env_flag(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    env(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

impl Config {
    /// Default config file path: ~/.config/companion/config.toml
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("companion").join("config.toml"))
    }

    /// `--config` flag, then `$COMPANION_CONFIG`, then the default path
    pub fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
        explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("COMPANION_CONFIG").map(PathBuf::from))
            .or_else(Self::config_path)
    }

    /// Load configuration: defaults, then the config file, then the process environment.
    ///
    /// A missing default file is fine; a missing file named with `--config` is not.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let path = Self::resolve_path(explicit);
        let file = match &path {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(contents) => Some(FileConfig::parse(path, &contents)?),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && explicit.is_none() => None,
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("cannot read config file {}", path.display()))
                }
            },
            None => None,
        };
        let source = file.as_ref().and(path);
        let mut config = Self::from_layers(file.unwrap_or_default(), |key| std::env::var(key).ok())?;
        config.source = source;
        Ok(config)
    }

    /// Merge a parsed file over the defaults, then apply environment overrides
    pub fn from_layers(
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let root_dir = env("COMPANION_ROOT")
            .or(file.root_dir)
            .map(PathBuf::from)
            .unwrap_or(defaults.root_dir);

        let port = env_parse(&env, "PORT")?
            .or(file.port)
            .unwrap_or(defaults.port);

        let db_path = env("COMPANION_DB_PATH")
            .or(file.db_path)
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        // An empty DATABASE_URL means "no networked backend"
        let database_url = env("DATABASE_URL")
            .or(file.database_url)
            .filter(|url| !url.trim().is_empty());

        let diff_threshold = file.diff_threshold.unwrap_or(defaults.diff_threshold);
        let queue_cap = file.queue_cap.unwrap_or(defaults.queue_cap);
        if queue_cap == 0 {
            bail!("queue_cap must be at least 1");
        }
        let request_timeout_secs = file
            .request_timeout_secs
            .unwrap_or(defaults.request_timeout_secs);
        if request_timeout_secs == 0 {
            bail!("request_timeout_secs must be at least 1");
        }

        let mut backup = FileBackup::apply(file.backup, defaults.backup);
        if let Some(enabled) = env_flag(&env, "BACKUP_ENABLED") {
            backup.enabled = enabled;
        }
        if let Some(hours) = env_parse::<u64>(&env, "BACKUP_INTERVAL")? {
            backup.interval = Duration::from_secs(hours * 3600);
        }
        if let Some(days) = env_parse(&env, "BACKUP_RETENTION_DAYS")? {
            backup.retention_days = days;
        }
        if let Some(dir) = env("BACKUP_DIR").filter(|d| !d.is_empty()) {
            backup.dir = PathBuf::from(dir);
        }

        Ok(Self {
            root_dir,
            ignore: file.ignore.unwrap_or(defaults.ignore),
            diff_threshold,
            enable_clipboard: file.enable_clipboard.unwrap_or(defaults.enable_clipboard),
            port,
            db_path,
            database_url,
            emit_deletes: file.emit_deletes.unwrap_or(defaults.emit_deletes),
            attribution_window_secs: file
                .attribution_window_secs
                .unwrap_or(defaults.attribution_window_secs),
            queue_cap,
            request_timeout_secs,
            watch: defaults.watch,
            backup,
            logging: LoggingConfig::from_file(file.logging),
            terminal: TerminalConfig::from_file(file.terminal),
            labeling: LabelingConfig::from_file(file.labeling),
            clipboard: FileClipboard::apply(file.clipboard, defaults.clipboard),
            source: None,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Derived settings
    // ─────────────────────────────────────────────────────────────────────────

    /// The HTTP interface only listens on loopback
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))
    }

    pub fn database_target(&self) -> DatabaseTarget {
        match &self.database_url {
            Some(url) => DatabaseTarget::Networked(url.clone()),
            None => DatabaseTarget::Embedded(self.db_path.clone()),
        }
    }

    pub fn watch_settings(&self) -> WatchSettings {
        let mut settings = WatchSettings::new(&self.root_dir);
        settings.ignore = self.ignore.clone();
        settings.diff_threshold = self.diff_threshold;
        settings.emit_deletes = self.emit_deletes;
        settings
    }

    pub fn attribution_window(&self) -> Duration {
        Duration::from_secs(self.attribution_window_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
