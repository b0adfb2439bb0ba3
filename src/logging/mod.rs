// Logging module - tracing subscriber setup
//
// Human-readable output goes to stdout. When file logging is enabled, a
// second layer writes JSON lines through a non-blocking rolling appender;
// the returned guard flushes it on drop, so main holds it until exit.
//
// Precedence: RUST_LOG env var > config file level > "info"

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogRotation, LoggingConfig};

/// Filter used when RUST_LOG is unset
pub fn default_filter(level: &str) -> String {
    format!("companion={level},tower_http=info,axum=info")
}

fn file_appender(config: &LoggingConfig) -> tracing_appender::rolling::RollingFileAppender {
    let (dir, prefix) = (&config.file_dir, &config.file_prefix);
    match config.file_rotation {
        LogRotation::Hourly => tracing_appender::rolling::hourly(dir, prefix),
        LogRotation::Daily => tracing_appender::rolling::daily(dir, prefix),
        LogRotation::Never => tracing_appender::rolling::never(dir, prefix),
    }
}

/// Install the global subscriber. Call once, before anything logs.
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(&config.level)));

    let (file_layer, guard) = if config.file_enabled {
        match std::fs::create_dir_all(&config.file_dir) {
            Ok(()) => {
                let (writer, guard) = tracing_appender::non_blocking(file_appender(config));
                let layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false)
                    .boxed();
                (Some(layer), Some(guard))
            }
            Err(e) => {
                // The subscriber is not up yet
                eprintln!(
                    "Warning: could not create log directory {}: {e}",
                    config.file_dir.display()
                );
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        let filter = default_filter("debug");
        assert_eq!(filter, "companion=debug,tower_http=info,axum=info");
        assert!(EnvFilter::try_new(filter).is_ok());
    }
}
