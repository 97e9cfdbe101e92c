//! Tracing setup.
//!
//! Logs always go to stderr, pretty or JSON. When a log directory is
//! configured, a daily rolling file receives the same events without ANSI
//! colors. `RUST_LOG` wins over the configured filter.

use std::io;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::{LogFormat, LoggingSection};

const LOG_FILE_PREFIX: &str = "conductor.log";

/// Keeps the file writer alive; dropping it flushes pending lines.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// The filter directive used when `RUST_LOG` is unset.
pub fn default_directive(section: &LoggingSection, verbose: bool) -> String {
    if verbose {
        return "info,conductor=debug".to_string();
    }
    section
        .filter
        .clone()
        .filter(|f| !f.trim().is_empty())
        .unwrap_or_else(|| "info".to_string())
}

pub fn init(section: &LoggingSection, verbose: bool) -> Result<LoggingGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(section, verbose)))
        .context("Invalid log filter")?;

    let stderr_layer = match section.format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(io::stderr)
            .boxed(),
    };

    let (file_layer, file_guard) = match &section.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = match section.format {
                LogFormat::Pretty => tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .boxed(),
                LogFormat::Json => tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .boxed(),
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
