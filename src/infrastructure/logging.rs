//! Tracing subscriber setup.
//!
//! Stdout output honors `RUST_LOG`; an optional log directory adds a
//! non-blocking JSON file appender for structured logs.

use anyhow::Result;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default level when `RUST_LOG` is unset.
    pub level: String,
    /// `"pretty"` or `"json"` stdout format.
    pub format: String,
    /// When set, daily-rotated JSON logs are written here too.
    pub log_dir: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            log_dir: None,
        }
    }
}

/// Initialize the global subscriber. The returned guard must be held for
/// the process lifetime so the file appender flushes on exit.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.level.parse()?)
        .from_env_lossy();

    if let Some(ref log_dir) = config.log_dir {
        let file_appender = rolling::daily(Path::new(log_dir), "taskbrew.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if config.format == "json" {
            let file_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true);
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(io::stdout)
                        .with_filter(env_filter),
                )
                .with(file_layer)
                .init();
        } else {
            let file_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true);
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stdout)
                        .with_filter(env_filter),
                )
                .with(file_layer)
                .init();
        }
        Ok(Some(guard))
    } else {
        if config.format == "json" {
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(io::stdout)
                        .with_filter(env_filter),
                )
                .init();
        } else {
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stdout)
                        .with_filter(env_filter),
                )
                .init();
        }
        Ok(None)
    }
}
