//! Tracing subscriber setup: stderr plus an optional daily-rotated file.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use fleetlink_config::{LogFormat, LoggingSection};

use crate::cli::{GlobalOpts, LogFormatArg};

const LOG_FILE_PREFIX: &str = "fleetlink.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Keeps the file writer flushing until dropped.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins, then `-v`/`-q`, then `logging.level` from the config.
pub fn init(global: &GlobalOpts, section: &LoggingSection) -> LogGuard {
    let directive = level_directive(global.verbose, global.quiet, &section.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let format = match global.log_format {
        Some(LogFormatArg::Json) => LogFormat::Json,
        Some(LogFormatArg::Pretty) => LogFormat::Pretty,
        None => section.format,
    };

    let mut layers: Vec<BoxedLayer> = vec![stderr_layer(format)];
    let mut file_guard = None;
    let mut file_error = None;

    if let Some(dir) = global.log_dir.as_deref().or(section.directory.as_deref()) {
        match std::fs::create_dir_all(dir) {
            Ok(()) => {
                let (layer, guard) = file_layer(dir, format);
                layers.push(layer);
                file_guard = Some(guard);
            }
            Err(err) => file_error = Some(format!("log dir init failed for {}: {err}", dir.display())),
        }
    }

    Registry::default().with(layers).with(filter).init();

    if let Some(error) = file_error {
        tracing::warn!("{error}");
    }

    LogGuard { _file: file_guard }
}

fn level_directive(verbose: u8, quiet: bool, configured: &str) -> String {
    match (verbose, quiet) {
        (0, true) => "error".into(),
        (0, false) => configured.to_owned(),
        (1, _) => "info".into(),
        (2, _) => "debug".into(),
        _ => "trace".into(),
    }
}

fn stderr_layer(format: LogFormat) -> BoxedLayer {
    match format {
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_current_span(true),
        ),
    }
}

fn file_layer(dir: &Path, format: LogFormat) -> (BoxedLayer, WorkerGuard) {
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer: BoxedLayer = match format {
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_target(true)
                .with_thread_ids(true),
        ),
    };
    (layer, guard)
}
