// Local crates
use crate::helpers::load_config::LoggingConfig;

// External crates
use std::{
    io::{self, IsTerminal},
    panic,
};
use thiserror::Error;
use tracing::error;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{InitError, RollingFileAppender, Rotation},
};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    filter::EnvFilter,
    fmt::{self, time::UtcTime},
    prelude::*,
    registry::Registry,
    util::TryInitError,
};

const LOG_FILE_PREFIX: &str = "request-shipper";

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to create log file appender: {0}")]
    Appender(#[from] InitError),

    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level. Events go to stderr, as JSON when
/// requested, and to a daily rolling file when a log directory is set. The
/// returned guard must be kept alive for the file writer to flush.
pub fn init_tracing(logging: &LoggingConfig) -> Result<Option<WorkerGuard>, TracingError> {
    let default_level = if logging.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let stderr_layer = if logging.json {
        fmt::layer()
            .json()
            .with_writer(io::stderr)
            .with_target(false)
            .with_timer(UtcTime::rfc_3339())
            .boxed()
    } else {
        fmt::layer()
            .with_writer(io::stderr)
            .with_ansi(io::stderr().is_terminal())
            .with_target(false)
            .with_timer(UtcTime::rfc_3339())
            .boxed()
    };

    let (file_layer, guard) = match &logging.directory {
        Some(directory) => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(LOG_FILE_PREFIX)
                .filename_suffix("log")
                .build(directory)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(true)
                .with_target(false)
                .with_timer(UtcTime::rfc_3339());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    Registry::default()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .with(ErrorLayer::default())
        .try_init()?;

    Ok(guard)
}

pub fn init_panic_handler() {
    panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let msg = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("Unknown panic");

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            message = %msg,
            location = %location,
            "Application panicked!"
        );
    }));
}
