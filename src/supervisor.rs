//! Supervisor: boots every component in dependency order and owns shutdown
//!
//! ```text
//!   store ──▶ queue + cache ──▶ turns ──▶ sources ──▶ api ──▶ backup
//!   (C)          (B)             (D)        (A)        (E)      (F)
//!                                   │
//!                                   └─ watcher, clipboard, terminal tail,
//!                                      pending-prompt sweeper
//! ```
//!
//! Any failing step aborts the boot: the caller exits non-zero. After the
//! interface is bound, a health probe touches the store, the queue and the
//! correlation engine before the banner is printed. Ctrl-C cancels a shared
//! token that every background task and the HTTP server watch.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::analytics::Analytics;
use crate::api::{self, AppState};
use crate::capture::clipboard::{self, ClipboardMonitor};
use crate::capture::watcher::{self, FileWatcher};
use crate::capture::{prompts, terminal, Recorder};
use crate::config::Config;
use crate::correlate::{CorrelationCache, Correlator};
use crate::labeling::Labeler;
use crate::queue::SequenceQueue;
use crate::startup::{self, StartupRegistry};
use crate::storage::{DatabaseTarget, PoolSettings, Store};
use crate::turns::TurnStore;

/// How long each background task gets to stop after cancellation
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Everything `boot` started
pub struct Running {
    pub state: AppState,
    listener: TcpListener,
    /// Dropping this stops the notify backend
    watcher: Option<FileWatcher>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

/// Record a failed step in the registry before propagating it
fn step<T>(registry: &mut StartupRegistry, id: &str, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        registry.fail(id, format!("{e:#}"));
    }
    result
}

async fn open_store(target: DatabaseTarget) -> Result<Store> {
    let label = match &target {
        DatabaseTarget::Embedded(path) => path.display().to_string(),
        DatabaseTarget::Networked(_) => "networked database".to_string(),
    };
    tokio::task::spawn_blocking(move || Store::open(&target, &PoolSettings::default()))
        .await
        .context("store open task")?
        .with_context(|| format!("opening {label}"))
}

/// Store ping, an empty queue read at the head, and a correlation cache round trip
pub async fn health_probe(state: &AppState) -> Result<()> {
    let state = state.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        state.store().ping().context("store ping")?;
        let queue = state.queue();
        let head = queue.since(queue.latest());
        if !head.is_empty() {
            bail!("queue returned {} items past its own head", head.len());
        }
        state.correlator.probe().context("correlation engine")?;
        Ok(())
    })
    .await
    .context("health probe task")?
}

/// Boot C → B → D → A → E → F. Tasks already started keep running until
/// `cancel` fires; callers cancel it when this returns an error.
pub async fn boot(
    config: &Config,
    registry: &mut StartupRegistry,
    cancel: &CancellationToken,
) -> Result<Running> {
    let mut tasks = Vec::new();

    // C: persistence
    let store = step(registry, "store", open_store(config.database_target()).await)?;
    let backend = match &config.database_url {
        Some(_) => "postgres".to_string(),
        None => config.db_path.display().to_string(),
    };
    registry.activate_with("store", backend);

    // B: queue and the cache that writes invalidate
    let queue = Arc::new(SequenceQueue::new(config.queue_cap));
    let cache = Arc::new(CorrelationCache::default());
    let recorder = Recorder::new(store.clone(), queue, cache.clone());
    registry.activate_with("queue", format!("cap {}", config.queue_cap));

    // D: turns
    let turns = Arc::new(TurnStore::new(store.clone()));
    registry.activate("turns");

    // A: sources
    let watcher = if config.watch {
        let started = watcher::spawn(config.watch_settings(), recorder.clone(), cancel.clone())
            .await
            .with_context(|| format!("watching {}", config.root_dir.display()));
        let started = step(registry, "watcher", started)?;
        registry.activate_with(
            "watcher",
            format!("{}, {} files primed", config.root_dir.display(), started.primed),
        );
        Some(started)
    } else {
        None
    };

    let monitor = ClipboardMonitor::new(config.enable_clipboard);
    if config.enable_clipboard {
        match clipboard::spawn(
            recorder.clone(),
            monitor.clone(),
            config.clipboard.clone(),
            cancel.clone(),
        ) {
            Some(task) => {
                tasks.push(("clipboard", task));
                registry.activate("clipboard");
            }
            None => registry.disable("clipboard", "no clipboard on this host"),
        }
    }

    match config.terminal.resolve_history_file() {
        Some(path) => {
            let started = terminal::spawn_tail(
                recorder.clone(),
                path.clone(),
                config.terminal.poll_interval,
                cancel.clone(),
            )
            .with_context(|| format!("tailing {}", path.display()));
            tasks.push(("terminal", step(registry, "terminal", started)?));
            registry.activate_with("terminal", path.display().to_string());
        }
        None => registry.disable("terminal", "no shell history file"),
    }

    tasks.push((
        "sweeper",
        prompts::spawn_sweeper(recorder.clone(), config.attribution_window(), cancel.clone()),
    ));
    registry.activate_with("sweeper", format!("{}s", config.attribution_window_secs));

    // E: interface
    let labeler = Labeler::new(config.labeling.endpoint.clone(), config.labeling.timeout);
    let labeler = step(registry, "labeling", labeler)?;
    if labeler.has_endpoint() {
        registry.activate("labeling");
    }
    let state = AppState {
        correlator: Correlator::new(store.clone(), cache),
        analytics: Analytics::new(store.clone()),
        turns,
        clipboard: monitor,
        labeler,
        request_timeout: config.request_timeout(),
        shutdown: cancel.clone(),
        recorder,
    };
    let listener = step(registry, "api", api::bind(config.bind_addr()).await)?;
    step(registry, "api", health_probe(&state).await)?;
    registry.activate_with("api", config.bind_addr().to_string());

    // F: backups
    if let Some(task) = crate::backup::spawn(store, config.backup.clone(), cancel.clone()) {
        tasks.push(("backup", task));
        registry.activate_with(
            "backup",
            format!(
                "every {}h into {}",
                config.backup.interval.as_secs() / 3600,
                config.backup.dir.display()
            ),
        );
    }

    Ok(Running {
        state,
        listener,
        watcher,
        tasks,
    })
}

impl Running {
    /// Serve until Ctrl-C or `cancel`, then stop every task
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        let Running {
            state,
            listener,
            watcher,
            tasks,
        } = self;
        let mut server = tokio::spawn(api::start_server(listener, state));

        let early = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => tracing::info!("shutdown requested"),
                    Err(e) => tracing::error!(error = %e, "cannot listen for Ctrl-C, shutting down"),
                }
                None
            }
            _ = cancel.cancelled() => None,
            joined = &mut server => Some(joined),
        };
        cancel.cancel();

        let served = match early {
            Some(joined) => joined,
            None => server.await,
        };
        drop(watcher);
        for (name, task) in tasks {
            match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
                Ok(Ok(())) => tracing::debug!(task = name, "stopped"),
                Ok(Err(e)) => tracing::warn!(task = name, error = %e, "task ended abnormally"),
                Err(_) => tracing::warn!(task = name, "task did not stop in time"),
            }
        }
        served.context("HTTP server task")??;
        tracing::info!("shutdown complete");
        Ok(())
    }
}

/// Boot, print the banner, serve until shutdown
pub async fn run(config: Config) -> Result<()> {
    let cancel = CancellationToken::new();
    let mut registry = StartupRegistry::from_config(&config);

    let running = match boot(&config, &mut registry, &cancel).await {
        Ok(running) => running,
        Err(e) => {
            cancel.cancel();
            startup::log_startup(&config, &registry);
            return Err(e.context("startup failed"));
        }
    };

    startup::print_startup(&config, &registry);
    startup::log_startup(&config, &registry);
    running.serve(cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::startup::FeatureStatus;

    fn config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::default();
        config.port = 0;
        config.db_path = dir.path().join("companion.db");
        config.root_dir = dir.path().join("src");
        config.watch = false;
        config.terminal.history_file = None;
        config
    }

    #[tokio::test]
    async fn test_boot_then_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.terminal.history_file = Some(dir.path().join("history"));
        std::fs::write(dir.path().join("history"), "ls\n").unwrap();

        let cancel = CancellationToken::new();
        let mut registry = StartupRegistry::from_config(&config);
        let running = boot(&config, &mut registry, &cancel).await.unwrap();

        assert_eq!(registry.get("store").unwrap().status, FeatureStatus::Active);
        assert_eq!(registry.get("api").unwrap().status, FeatureStatus::Active);
        assert_eq!(registry.get("terminal").unwrap().status, FeatureStatus::Active);
        assert!(!registry.get("watcher").unwrap().is_enabled());
        assert!(registry.failures().is_empty());
        health_probe(&running.state).await.unwrap();

        cancel.cancel();
        running.serve(cancel.clone()).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_watch_root_fails_boot() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.watch = true;

        let cancel = CancellationToken::new();
        let mut registry = StartupRegistry::from_config(&config);
        assert!(boot(&config, &mut registry, &cancel).await.is_err());
        assert!(matches!(
            registry.get("watcher").unwrap().status,
            FeatureStatus::Failed(_)
        ));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_missing_history_file_fails_boot() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.terminal.history_file = Some(dir.path().join("nope"));

        let cancel = CancellationToken::new();
        let mut registry = StartupRegistry::from_config(&config);
        assert!(boot(&config, &mut registry, &cancel).await.is_err());
        assert_eq!(registry.failures()[0].id, "terminal");
        cancel.cancel();
    }
}
