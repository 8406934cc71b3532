mod bufpool;
mod config;
mod credentials;
mod hasher;
mod index;
mod logging;
mod pool;
mod queue;
mod remote;
mod scanner;
#[cfg(test)]
mod tests;
mod uploader;
mod watcher;

use anyhow::{Context, Result};
use bufpool::BufferPool;
use config::AppConfig;
use credentials::CredentialStore;
use hasher::ChunkHasher;
use index::IndexDb;
use pool::{AdmissionMode, WorkPool};
use queue::{QueueConfig, UploadQueue};
use remote::RemoteClient;
use scanner::{ScanContext, ScannerManager};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uploader::progress::LogObserver;
use uploader::{Uploader, UploaderConfig};
use watcher::BackupWatcher;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load(&config_path).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // Keep the guard alive for the entire application lifetime
    let _log_guard = logging::init_logging(&config.log, config.log_dir())
        .context("Failed to initialize logging system")?;

    tracing::info!(target: "main", config = %config_path.display(), "Starting netdisk backup agent");

    let index = Arc::new(
        IndexDb::open(config.database_path()).context("Failed to open index database")?,
    );

    let creds = Arc::new(CredentialStore::new(&config.remote));
    if creds.access_token().await.is_err() {
        tracing::warn!(
            target: "main",
            authorize_url = %creds.authorize_url(),
            "No credentials loaded; visit the authorize URL and store a code to start uploading"
        );
    }

    let remote = Arc::new(
        RemoteClient::new(&config.remote, Arc::clone(&creds))
            .context("Failed to create remote client")?,
    );

    let bufs = BufferPool::with_defaults(config.upload.chunk_pool_capacity);
    let work_pool = WorkPool::new(
        config.upload.worker_count,
        config.upload.queue_size,
        if config.upload.slow_start {
            AdmissionMode::SlowStart
        } else {
            AdmissionMode::Full
        },
    );
    work_pool.start();

    let uploader = Arc::new(Uploader::new(
        Arc::clone(&remote),
        Arc::clone(&creds),
        Arc::clone(&work_pool),
        Arc::clone(&bufs),
        UploaderConfig {
            path_prefix: config.remote.path_prefix.clone(),
            max_retries: config.upload.max_retries,
            ..Default::default()
        },
    ));

    let root_token = CancellationToken::new();
    let queue = UploadQueue::new(
        QueueConfig {
            max_inflight: config.upload.max_inflight_files,
            ..Default::default()
        },
        uploader,
        Arc::clone(&index),
        Arc::new(LogObserver),
        &root_token,
    );
    queue.start();

    let scan_ctx = ScanContext {
        index: Arc::clone(&index),
        queue: Arc::clone(&queue),
        hasher: ChunkHasher::new(Arc::clone(&bufs)),
        limiter: Arc::new(Semaphore::new(config.scan.max_parallel.max(1))),
    };

    let manager = ScannerManager::new(
        scan_ctx.clone(),
        Duration::from_secs(config.scan.interval_secs.max(1)),
        &root_token,
    );
    manager.start().await.context("Failed to start scanner manager")?;

    let mut watchers = Vec::new();
    if config.scan.watch {
        for root in index.all_roots().context("Failed to load backup roots")? {
            // Single-file roots are covered by the periodic scan alone.
            if !root.is_dir {
                continue;
            }
            match BackupWatcher::start(
                std::path::Path::new(&root.abs_path),
                scan_ctx.clone(),
                &root_token,
                Duration::from_secs(2),
            ) {
                Ok(watcher) => watchers.push(watcher),
                Err(err) => {
                    tracing::warn!(
                        target: "main",
                        root = %root.abs_path,
                        error = %err,
                        "Failed to watch backup root"
                    );
                }
            }
        }
    }

    tracing::info!(
        target: "main",
        watchers = watchers.len(),
        "Backup agent running"
    );

    shutdown_signal().await;

    tracing::info!(target: "main", "Shutting down gracefully...");
    root_token.cancel();
    queue.shutdown();
    work_pool.stop();
    drop(watchers);

    // Give in-flight drivers a moment to observe the cancellation.
    tokio::time::sleep(Duration::from_millis(500)).await;
    tracing::info!(target: "main", "Shutdown complete");
    Ok(())
}

/// Wait for ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!(target: "main", "Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!(target: "main", "Received SIGTERM signal");
        },
    }
}
