//! Periodic reconciliation of backup roots against the file index.
//!
//! Each registered root gets a scanner that walks it recursively, digests
//! every regular file and decides whether an upload item is due. A
//! process-wide counting semaphore caps concurrent scan work; the slot is
//! released before descending into a subdirectory so deeply nested trees
//! cannot deadlock the limiter.

use crate::hasher::ChunkHasher;
use crate::index::{FileRecordUpdate, IndexDb, NewFileRecord, UploadStatus};
use crate::queue::UploadQueue;
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shared collaborators threaded through every scanner.
#[derive(Clone)]
pub struct ScanContext {
    pub index: Arc<IndexDb>,
    pub queue: Arc<UploadQueue>,
    pub hasher: ChunkHasher,
    pub limiter: Arc<Semaphore>,
}

pub struct Scanner {
    root: PathBuf,
    exclude_prefix: PathBuf,
    is_dir: bool,
    token: CancellationToken,
}

impl Scanner {
    /// Canonicalize `root` and record whether it is a directory. The
    /// exclude prefix (the root's parent) is what gets stripped from an
    /// absolute path to derive its server path.
    pub fn new(root: &Path, parent: &CancellationToken) -> io::Result<Self> {
        let root = std::fs::canonicalize(root)?;
        let meta = std::fs::metadata(&root)?;
        let exclude_prefix = root
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));

        Ok(Self {
            root,
            exclude_prefix,
            is_dir: meta.is_dir(),
            token: parent.child_token(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Server path for a file under this root: the absolute path with the
    /// exclude prefix stripped.
    pub fn server_path_for(&self, abs_path: &Path) -> String {
        match abs_path.strip_prefix(&self.exclude_prefix) {
            Ok(rel) => format!("/{}", rel.display()),
            Err(_) => abs_path.to_string_lossy().into_owned(),
        }
    }

    /// Walk the root once, reconciling every regular file with the index.
    pub async fn scan(&self, ctx: &ScanContext) {
        debug!(target: "scanner", root = %self.root.display(), "scan start");
        if self.is_dir {
            self.scan_dir(self.root.clone(), ctx).await;
        } else {
            let _permit = ctx.limiter.acquire().await.expect("scan limiter closed");
            self.reconcile_file(self.root.clone(), ctx).await;
        }
        debug!(target: "scanner", root = %self.root.display(), "scan end");
    }

    /// Scan a single subtree of this root (used by the filesystem watcher
    /// when a directory appears mid-flight).
    pub async fn scan_subtree(&self, dir: PathBuf, ctx: &ScanContext) {
        self.scan_dir(dir, ctx).await;
    }

    fn scan_dir<'a>(&'a self, dir: PathBuf, ctx: &'a ScanContext) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.token.is_cancelled() {
                return;
            }
            let permit = tokio::select! {
                _ = self.token.cancelled() => return,
                permit = ctx.limiter.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(target: "scanner", dir = %dir.display(), error = %err, "read dir failed");
                    return;
                }
            };

            let mut subdirs = Vec::new();
            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(target: "scanner", dir = %dir.display(), error = %err, "read entry failed");
                        break;
                    }
                };
                if self.token.is_cancelled() {
                    return;
                }
                match entry.file_type().await {
                    Ok(file_type) if file_type.is_dir() => subdirs.push(entry.path()),
                    Ok(file_type) if file_type.is_file() => {
                        self.reconcile_file(entry.path(), ctx).await;
                    }
                    // Symlinks and specials are not backed up
                    Ok(_) => {}
                    Err(err) => {
                        warn!(
                            target: "scanner",
                            path = %entry.path().display(),
                            error = %err,
                            "stat failed"
                        );
                    }
                }
            }

            // Free the slot before recursing so nesting depth can never
            // exhaust the limiter.
            drop(permit);
            for subdir in subdirs {
                if self.token.is_cancelled() {
                    return;
                }
                self.scan_dir(subdir, ctx).await;
            }
        })
    }

    async fn reconcile_file(&self, path: PathBuf, ctx: &ScanContext) {
        let digest = match ctx.hasher.file_digest(&path).await {
            Ok(digest) => digest,
            Err(err) => {
                warn!(target: "scanner", path = %path.display(), error = %err, "digest failed");
                String::new()
            }
        };
        let size = tokio::fs::metadata(&path)
            .await
            .map(|meta| meta.len() as i64)
            .unwrap_or(0);

        let abs_path = path.to_string_lossy().into_owned();
        let server_path = self.server_path_for(&path);

        let record = match ctx.index.file_by_abs_path(&abs_path) {
            Ok(record) => record,
            Err(err) => {
                warn!(target: "scanner", path = %abs_path, error = %err, "index lookup failed");
                None
            }
        };

        match record {
            None => {
                let record = NewFileRecord::new(abs_path.clone(), server_path.clone())
                    .with_size(size)
                    .with_md5(digest);
                if let Err(err) = ctx.index.upsert_file(&record) {
                    warn!(target: "scanner", path = %abs_path, error = %err, "index insert failed");
                    return;
                }
                ctx.queue.enqueue(path, server_path).await;
            }
            Some(record) => {
                if digest.is_empty() {
                    // Could not hash the file; queue it and let the driver
                    // surface the real error.
                    ctx.queue.enqueue(path, server_path).await;
                    return;
                }
                let settled = matches!(
                    record.upload_status,
                    UploadStatus::Uploaded | UploadStatus::Uploading | UploadStatus::WaitUploaded
                );
                if digest == record.md5 && record.upload_status == UploadStatus::Uploaded {
                    return;
                }
                if digest != record.md5 || !settled {
                    let update = FileRecordUpdate {
                        md5: Some(digest),
                        size: Some(size),
                        ..Default::default()
                    };
                    if let Err(err) = ctx.index.update_file(update, &abs_path) {
                        warn!(target: "scanner", path = %abs_path, error = %err, "index update failed");
                    }
                    ctx.queue.enqueue(path, server_path).await;
                }
            }
        }
    }
}

/// Owns the live set of scanners and reruns them on a fixed interval.
pub struct ScannerManager {
    scanners: Mutex<Vec<Arc<Scanner>>>,
    ctx: ScanContext,
    interval: Duration,
    token: CancellationToken,
}

impl ScannerManager {
    pub fn new(ctx: ScanContext, interval: Duration, parent: &CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            scanners: Mutex::new(Vec::new()),
            ctx,
            interval,
            token: parent.child_token(),
        })
    }

    /// Load the registered backup roots, build a scanner for each and start
    /// the rescan ticker.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let roots = self
            .ctx
            .index
            .all_roots()
            .context("failed to load backup roots")?;

        {
            let mut scanners = self.scanners.lock().await;
            for root in roots {
                match Scanner::new(Path::new(&root.abs_path), &self.token) {
                    Ok(scanner) => scanners.push(Arc::new(scanner)),
                    Err(err) => {
                        warn!(
                            target: "scanner",
                            root = %root.abs_path,
                            error = %err,
                            "failed to create scanner for backup root"
                        );
                    }
                }
            }
            info!(target: "scanner", roots = scanners.len(), "scanner manager started");
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.interval);
            // The first tick fires immediately; that is the startup scan.
            loop {
                tokio::select! {
                    _ = manager.token.cancelled() => break,
                    _ = ticker.tick() => manager.spawn_scans().await,
                }
            }
            debug!(target: "scanner", "scanner manager ticker exited");
        });

        Ok(())
    }

    async fn spawn_scans(&self) {
        let scanners = self.scanners.lock().await.clone();
        for scanner in scanners {
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                scanner.scan(&ctx).await;
            });
        }
    }

    /// Run every scanner once and wait for all of them to finish.
    pub async fn scan_all(&self) {
        let scanners = self.scanners.lock().await.clone();
        let mut handles = Vec::with_capacity(scanners.len());
        for scanner in scanners {
            let ctx = self.ctx.clone();
            handles.push(tokio::spawn(async move {
                scanner.scan(&ctx).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Register a new backup root and kick an immediate scan of it.
    pub async fn add_root(self: &Arc<Self>, path: &Path) -> Result<Arc<Scanner>> {
        let scanner = Arc::new(
            Scanner::new(path, &self.token)
                .with_context(|| format!("failed to create scanner for {}", path.display()))?,
        );
        self.ctx
            .index
            .add_root(&scanner.root().to_string_lossy(), scanner.is_dir())?;
        self.scanners.lock().await.push(Arc::clone(&scanner));

        let ctx = self.ctx.clone();
        let started = Arc::clone(&scanner);
        tokio::spawn(async move {
            started.scan(&ctx).await;
        });
        Ok(scanner)
    }

    /// Remove a backup root: cancel its scanner, cancel in-flight uploads
    /// under it and purge its index rows.
    pub async fn remove_root(&self, path: &Path) -> Result<()> {
        let target = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

        {
            let mut scanners = self.scanners.lock().await;
            if let Some(position) = scanners.iter().position(|s| s.root() == target) {
                scanners[position].cancel();
                scanners.remove(position);
            }
        }

        self.ctx.queue.clear_item_prefix(&target);
        self.ctx
            .index
            .remove_root(&target.to_string_lossy())
            .context("failed to purge index rows for removed root")?;
        info!(target: "scanner", root = %target.display(), "backup root removed");
        Ok(())
    }
}
