//! Logging setup for confsync
//!
//! Console output goes to stderr at `info` (or `debug` with `-v`). With a
//! log directory, a detailed trace of the session is also written to
//! `{dir}/confsync-{session_id}.log`, where the session id is a UUID
//! generated at startup.

use std::path::{Path, PathBuf};

use tracing::Subscriber;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::status;

/// Session log file; keep alive for the duration of the program
pub struct SessionLog {
    pub path: PathBuf,
    _guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Console layer: log lines go through the status writer so they don't
/// clobber an active spinner
fn console_layer<S>(level: LevelFilter) -> impl Layer<S> + Send + Sync + 'static
where
    S: Subscriber + for<'a> LookupSpan<'a> + 'static,
{
    tracing_subscriber::fmt::layer()
        .with_writer(status::StatusWriter)
        .with_target(false)
        .with_filter(level)
}

/// Install the console layer and, if `log_dir` is given, the file layer.
///
/// # Errors
/// Returns an error if the log file cannot be created.
pub fn init(verbose: bool, log_dir: Option<&Path>) -> Result<Option<SessionLog>, InitError> {
    let console_level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let Some(dir) = log_dir else {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));
        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer(console_level))
            .init();
        return Ok(None);
    };

    let session_id = uuid::Uuid::new_v4();
    let prefix = format!("confsync-{session_id}");
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(&prefix)
        .filename_suffix("log")
        .build(dir)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    // File layer: detailed debug output
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::ENTER | FmtSpan::EXIT);

    let file_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("warn,confsync=trace,confsync_core=trace,confsync_transport=trace")
    });

    tracing_subscriber::registry()
        .with(file_filter)
        .with(file_layer)
        .with(console_layer(console_level))
        .init();

    Ok(Some(SessionLog {
        path: dir.join(format!("{prefix}.log")),
        _guard: guard,
    }))
}
