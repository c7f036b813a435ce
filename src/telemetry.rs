//! Logging setup
//!
//! Console output always; a daily-rolling log file when
//! `[logging] directory` is set. `RUST_LOG` overrides the configured level.

use crate::config::LoggingSettings;
use crate::error::Result;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Keeps the file writer alive; logs are flushed when it drops
pub struct TelemetryGuard {
    _file_guard: Option<WorkerGuard>,
    log_dir: Option<PathBuf>,
}

impl TelemetryGuard {
    pub fn log_dir(&self) -> Option<&PathBuf> {
        self.log_dir.as_ref()
    }
}

fn filter(settings: &LoggingSettings) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level))
}

/// Install the global subscriber
///
/// Calling this twice leaves the first subscriber in place.
pub fn init_tracing(settings: &LoggingSettings) -> Result<TelemetryGuard> {
    let console = tracing_subscriber::fmt::layer()
        .with_ansi(settings.ansi)
        .with_thread_names(true)
        .with_filter(filter(settings))
        .boxed();

    let mut layers = vec![console];
    let mut file_guard = None;

    if let Some(dir) = &settings.directory {
        std::fs::create_dir_all(dir)?;
        let appender = rolling::daily(dir, &settings.file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);

        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_filter(filter(settings))
                .boxed(),
        );
    }

    if tracing_subscriber::registry().with(layers).try_init().is_err() {
        tracing::debug!("Global subscriber already installed");
    }

    Ok(TelemetryGuard {
        _file_guard: file_guard,
        log_dir: settings.directory.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_logging_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let settings = LoggingSettings {
            directory: Some(dir.path().join("logs")),
            ..LoggingSettings::default()
        };

        let guard = init_tracing(&settings).unwrap();
        assert!(dir.path().join("logs").is_dir());
        assert_eq!(guard.log_dir(), Some(&dir.path().join("logs")));
    }
}
