use crate::config::LogSettings;
use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Initialize the logging system with both file and stdout output
///
/// This sets up:
/// - Daily-rotated JSON file logging (when enabled in config)
/// - Stdout logging with colors
/// - Component-specific log targets
/// - Configurable log levels via RUST_LOG environment variable
///
/// # Log Targets
/// - `pool` - work pool admission and task execution
/// - `uploader` - per-file upload driver
/// - `remote` - protocol requests and responses
/// - `queue` - upload list dispatch and state changes
/// - `scanner` - periodic root scans
/// - `watcher` - filesystem events
/// - `index` - index store writes
/// - `credentials` - token refresh and storage
/// - `main` - application lifecycle
pub fn init_logging(settings: &LogSettings, log_dir: PathBuf) -> Result<LogGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.level.as_str()));

    let stdout_layer = fmt::layer()
        .compact()
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(true)
        .with_ansi(true)
        .with_filter(env_filter);

    let mut worker_guard = None;
    let file_layer = if settings.to_file {
        std::fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

        let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix("netdisk-backup")
            .filename_suffix("log")
            .max_log_files(settings.max_files)
            .build(&log_dir)
            .context("Failed to create file appender")?;

        // The guard MUST be kept alive for the entire application lifetime
        let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);
        worker_guard = Some(guard);

        let file_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(settings.level.as_str()));
        Some(
            fmt::layer()
                .json()
                .with_writer(non_blocking_file)
                .with_target(true)
                .with_thread_ids(true)
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_filter(file_filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to set global subscriber: {err}"))?;

    tracing::info!(
        target: "main",
        log_dir = %log_dir.display(),
        to_file = settings.to_file,
        "Logging system initialized"
    );

    Ok(LogGuard {
        _worker_guard: worker_guard,
    })
}

/// Guard that ensures logs are flushed before exit
pub struct LogGuard {
    _worker_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        tracing::info!(target: "main", "Flushing logs before shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogSettings;

    #[test]
    fn log_directory_is_created() {
        let temp_dir = tempfile::tempdir().unwrap();
        let log_dir = temp_dir.path().join("logs");
        let settings = LogSettings {
            to_file: true,
            ..Default::default()
        };

        // init_logging may fail if a global subscriber is already set by
        // another test; directory creation must still have happened.
        let _ = init_logging(&settings, log_dir.clone());
        assert!(log_dir.exists());
    }
}
