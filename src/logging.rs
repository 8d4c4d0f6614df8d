//! Structured logging setup (C11, ambient). Unchanged in spirit from the
//! teacher's `logging.rs`: a `tracing_subscriber::registry()` with an
//! `EnvFilter`, a rolling non-blocking file writer, and (in text mode) a
//! parallel stdout layer for local runs.

use crate::config::{AppConfig, LogRotation};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let file_appender = match config.rotation {
        LogRotation::Hourly => {
            tracing_appender::rolling::hourly(&config.log_dir, &config.log_file_prefix)
        }
        LogRotation::Daily => {
            tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix)
        }
        LogRotation::Never => {
            tracing_appender::rolling::never(&config.log_dir, &config.log_file_prefix)
        }
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let registry = tracing_subscriber::registry().with(filter);

    if config.use_json {
        let file_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).init();
    } else {
        let file_layer = fmt::layer()
            .with_target(false)
            .with_writer(non_blocking)
            .with_ansi(false);
        let stdout_layer = fmt::layer().with_target(false).with_ansi(true);
        registry.with(file_layer).with(stdout_layer).init();
    }

    guard
}
