//! Configuration tests
//!
//! The round-trip test guards `to_toml`: a field added to `Config` but left
//! out of the template, or written with the wrong syntax, fails here.

use super::*;
use std::collections::HashMap;

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

fn no_env() -> impl Fn(&str) -> Option<String> {
    env(&[])
}

// ─────────────────────────────────────────────────────────────────────────────
// Round-trip tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_config_roundtrip_default() {
    let config = Config::default();
    let toml_str = config.to_toml();

    let parsed: FileConfig = toml::from_str(&toml_str)
        .unwrap_or_else(|e| panic!("default config should round-trip\n{toml_str}\n{e}"));
    let reloaded = Config::from_layers(parsed, no_env()).unwrap();

    assert_eq!(reloaded.port, DEFAULT_PORT);
    assert_eq!(reloaded.ignore, config.ignore);
    assert_eq!(reloaded.db_path, config.db_path);
    assert_eq!(reloaded.database_url, None);
    assert_eq!(reloaded.backup.interval, config.backup.interval);
    assert_eq!(reloaded.logging.file_rotation, LogRotation::Daily);
    assert_eq!(reloaded.labeling.timeout, config.labeling.timeout);
    assert_eq!(reloaded.clipboard.min_length, config.clipboard.min_length);
}

#[test]
fn test_config_roundtrip_customized() {
    let mut config = Config::default();
    config.database_url = Some("postgres://u:p@db/companion".into());
    config.root_dir = PathBuf::from("/src/project \"quoted\"");
    config.backup.enabled = true;
    config.backup.interval = Duration::from_secs(6 * 3600);
    config.logging.file_rotation = LogRotation::Hourly;
    config.labeling.endpoint = Some("http://127.0.0.1:9/label".into());
    config.terminal.history_file = Some(PathBuf::from("/home/me/.zsh_history"));

    let parsed: FileConfig = toml::from_str(&config.to_toml()).unwrap();
    let reloaded = Config::from_layers(parsed, no_env()).unwrap();

    assert_eq!(reloaded.database_url, config.database_url);
    assert_eq!(reloaded.root_dir, config.root_dir);
    assert!(reloaded.backup.enabled);
    assert_eq!(reloaded.backup.interval, Duration::from_secs(6 * 3600));
    assert_eq!(reloaded.logging.file_rotation, LogRotation::Hourly);
    assert_eq!(reloaded.labeling.endpoint, config.labeling.endpoint);
    assert_eq!(reloaded.terminal.history_file, config.terminal.history_file);
}

// ─────────────────────────────────────────────────────────────────────────────
// Layering
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_env_overrides_file() {
    let file: FileConfig = toml::from_str(
        r#"
        port = 5000
        db_path = "/tmp/file.db"
        [backup]
        enabled = false
        interval_hours = 12
        retention_days = 7
        "#,
    )
    .unwrap();
    let config = Config::from_layers(
        file,
        env(&[
            ("PORT", "6000"),
            ("BACKUP_ENABLED", "true"),
            ("BACKUP_INTERVAL", "2"),
            ("BACKUP_DIR", "/var/backups/companion"),
        ]),
    )
    .unwrap();

    assert_eq!(config.port, 6000);
    assert_eq!(config.db_path, PathBuf::from("/tmp/file.db"));
    assert!(config.backup.enabled);
    assert_eq!(config.backup.interval, Duration::from_secs(2 * 3600));
    assert_eq!(config.backup.retention_days, 7);
    assert_eq!(config.backup.dir, PathBuf::from("/var/backups/companion"));
}

#[test]
fn test_database_url_selects_backend() {
    let embedded = Config::from_layers(FileConfig::default(), no_env()).unwrap();
    assert_eq!(
        embedded.database_target(),
        DatabaseTarget::Embedded(PathBuf::from("./data/companion.db"))
    );

    let networked = Config::from_layers(
        FileConfig::default(),
        env(&[("DATABASE_URL", "postgres://localhost/c")]),
    )
    .unwrap();
    assert_eq!(
        networked.database_target(),
        DatabaseTarget::Networked("postgres://localhost/c".into())
    );

    let blank = Config::from_layers(FileConfig::default(), env(&[("DATABASE_URL", " ")])).unwrap();
    assert!(blank.database_url.is_none());
}

#[test]
fn test_malformed_env_is_an_error() {
    let err = Config::from_layers(FileConfig::default(), env(&[("PORT", "http")])).unwrap_err();
    assert!(err.to_string().contains("PORT"));
    assert!(Config::from_layers(FileConfig::default(), env(&[("BACKUP_INTERVAL", "-1")])).is_err());
}

#[test]
fn test_labeling_timeout_is_capped() {
    let file: FileConfig = toml::from_str("[labeling]\ntimeout_ms = 10000\n").unwrap();
    let config = Config::from_layers(file, no_env()).unwrap();
    assert_eq!(config.labeling.timeout, Duration::from_secs(2));
}

#[test]
fn test_zero_queue_cap_rejected() {
    let file: FileConfig = toml::from_str("queue_cap = 0").unwrap();
    assert!(Config::from_layers(file, no_env()).is_err());
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading from disk
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_json_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("companion.json");
    std::fs::write(
        &path,
        r#"{"root_dir": "/w", "diff_threshold": 40, "ignore": ["**/*.tmp"], "logging": {"level": "debug"}}"#,
    )
    .unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.source.as_deref(), Some(path.as_path()));
    assert_eq!(config.diff_threshold, 40);
    assert_eq!(config.ignore, vec!["**/*.tmp".to_string()]);
    assert_eq!(config.logging.level, "debug");
}

#[test]
fn test_broken_config_file_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "port = \"not a number\"\n[backup\n").unwrap();
    let err = Config::load(Some(&path)).unwrap_err();
    assert!(format!("{err:#}").contains("config.toml"));
}

#[test]
fn test_missing_explicit_config_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Config::load(Some(&dir.path().join("absent.toml"))).is_err());
}

// ─────────────────────────────────────────────────────────────────────────────
// Feature definitions
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_feature_definitions_follow_config() {
    let mut config = Config::default();
    config.watch = false;
    config.backup.enabled = true;
    let features = config.feature_definitions();

    let ids: Vec<_> = features.iter().map(|f| f.id).collect();
    assert_eq!(
        ids,
        ["store", "queue", "turns", "watcher", "clipboard", "terminal", "sweeper", "api", "labeling", "backup"]
    );
    let find = |id: &str| features.iter().find(|f| f.id == id).unwrap();
    assert!(!find("watcher").is_enabled());
    assert!(!find("clipboard").is_enabled());
    assert!(find("backup").is_enabled());
    assert!(find("store").is_enabled());
}
