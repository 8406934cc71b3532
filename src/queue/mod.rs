//! Observable upload list: a waiting queue feeding a bounded in-flight set
//! of file-upload drivers, plus the cancel / clean / retry operations the
//! front end exposes. At most one item per absolute path is ever waiting or
//! uploading.

mod item;

pub use item::{ItemSnapshot, ItemState, UploadItem};

use crate::index::IndexDb;
use crate::uploader::progress::{ProgressObserver, percent_text};
use crate::uploader::{ProgressFn, Uploader};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Files driven to completion at the same time
    pub max_inflight: usize,
    /// Buffered capacity of the waiting queue
    pub wait_capacity: usize,
    /// How often observers are redrawn
    pub refresh_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_inflight: 5,
            wait_capacity: 100,
            refresh_interval: Duration::from_secs(1),
        }
    }
}

pub struct UploadQueue {
    config: QueueConfig,
    uploader: Arc<Uploader>,
    index: Arc<IndexDb>,
    observer: Arc<dyn ProgressObserver>,
    items: RwLock<Vec<Arc<UploadItem>>>,
    uploading: RwLock<Vec<Arc<UploadItem>>>,
    wait_tx: mpsc::Sender<Arc<UploadItem>>,
    inflight: Arc<Semaphore>,
    token: CancellationToken,
    pending: Mutex<Option<mpsc::Receiver<Arc<UploadItem>>>>,
}

impl UploadQueue {
    pub fn new(
        config: QueueConfig,
        uploader: Arc<Uploader>,
        index: Arc<IndexDb>,
        observer: Arc<dyn ProgressObserver>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let (wait_tx, wait_rx) = mpsc::channel(config.wait_capacity.max(1));
        let inflight = Arc::new(Semaphore::new(config.max_inflight.max(1)));

        Arc::new(Self {
            config,
            uploader,
            index,
            observer,
            items: RwLock::new(Vec::new()),
            uploading: RwLock::new(Vec::new()),
            wait_tx,
            inflight,
            token: parent.child_token(),
            pending: Mutex::new(Some(wait_rx)),
        })
    }

    /// Launch the dispatcher and the observer refresh ticker.
    pub fn start(self: &Arc<Self>) {
        let Some(wait_rx) = self.pending.lock().expect("queue channels poisoned").take() else {
            return;
        };

        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.dispatch(wait_rx).await });

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(queue.config.refresh_interval);
            loop {
                tokio::select! {
                    _ = queue.token.cancelled() => break,
                    _ = ticker.tick() => queue.observer.refresh(&queue.snapshot()),
                }
            }
        });

        info!(
            target: "queue",
            max_inflight = self.config.max_inflight,
            "upload queue started"
        );
    }

    pub(crate) fn root_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Add a file to the upload list. Returns `false` when an item for the
    /// same path is already waiting or uploading, or when the queue is shut
    /// down before the item could be enqueued.
    pub async fn enqueue(self: &Arc<Self>, abs_path: PathBuf, server_path: String) -> bool {
        {
            let items = self.items.read().expect("items poisoned");
            let duplicate = items.iter().any(|existing| {
                existing.abs_path() == abs_path
                    && matches!(
                        existing.state(),
                        ItemState::WaitUploaded | ItemState::Uploading
                    )
            });
            if duplicate {
                debug!(
                    target: "queue",
                    path = %abs_path.display(),
                    "skipping duplicate upload item"
                );
                return false;
            }
        }

        let item = UploadItem::new(abs_path, server_path, self);
        let accepted = tokio::select! {
            res = self.wait_tx.send(Arc::clone(&item)) => res.is_ok(),
            _ = self.token.cancelled() => false,
        };
        if !accepted {
            info!(
                target: "queue",
                path = %item.abs_path().display(),
                "abandoned upload item, queue shut down"
            );
            return false;
        }

        self.items
            .write()
            .expect("items poisoned")
            .push(Arc::clone(&item));
        self.persist_state(&item);
        true
    }

    /// Cancel one item and drop it from the visible list.
    pub fn cancel_item(&self, item: &Arc<UploadItem>) {
        item.cancel();
        self.persist_state(item);
        self.items
            .write()
            .expect("items poisoned")
            .retain(|existing| !Arc::ptr_eq(existing, item));
    }

    /// Drop every item currently in `state` from the visible list.
    pub fn clean_items(&self, state: ItemState) {
        self.items
            .write()
            .expect("items poisoned")
            .retain(|item| item.state() != state);
    }

    /// Cancel and drop every item whose path lives under `prefix`.
    pub fn clear_item_prefix(&self, prefix: &Path) {
        let mut items = self.items.write().expect("items poisoned");
        items.retain(|item| {
            if item.abs_path().starts_with(prefix) {
                item.cancel();
                self.persist_state(item);
                false
            } else {
                true
            }
        });
    }

    /// Re-arm every failed item with a fresh token and enqueue it again.
    /// The returned handle stops the re-enqueue loop mid-flight.
    pub fn retry_all(self: &Arc<Self>) -> CancellationToken {
        let handle = CancellationToken::new();
        let stop = handle.clone();
        let queue = Arc::clone(self);

        tokio::spawn(async move {
            let failed: Vec<_> = queue
                .items
                .read()
                .expect("items poisoned")
                .iter()
                .filter(|item| item.state() == ItemState::Failed)
                .cloned()
                .collect();

            for item in failed {
                item.rebind_token();
                item.set_state(ItemState::WaitUploaded);
                queue.persist_state(&item);
                tokio::select! {
                    res = queue.wait_tx.send(Arc::clone(&item)) => {
                        if res.is_err() {
                            break;
                        }
                    }
                    _ = stop.cancelled() => break,
                    _ = queue.token.cancelled() => break,
                }
            }
        });

        handle
    }

    pub fn snapshot(&self) -> Vec<ItemSnapshot> {
        self.items
            .read()
            .expect("items poisoned")
            .iter()
            .map(|item| item.snapshot())
            .collect()
    }

    pub fn inflight_count(&self) -> usize {
        self.uploading.read().expect("uploading poisoned").len()
    }

    async fn dispatch(self: Arc<Self>, mut wait_rx: mpsc::Receiver<Arc<UploadItem>>) {
        loop {
            let item = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                item = wait_rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            // The item may have been cancelled or re-armed while waiting.
            if item.state() != ItemState::WaitUploaded {
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                permit = Arc::clone(&self.inflight).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let queue = Arc::clone(&self);
            tokio::spawn(async move {
                queue.drive(item, permit).await;
            });
        }
        debug!(target: "queue", "upload dispatcher exited");
    }

    async fn drive(
        self: Arc<Self>,
        item: Arc<UploadItem>,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        self.uploading
            .write()
            .expect("uploading poisoned")
            .push(Arc::clone(&item));
        item.set_state(ItemState::Uploading);
        self.persist_state(&item);

        let token = item.token();
        let progress_item = Arc::clone(&item);
        let progress: ProgressFn = Arc::new(move |done, total| {
            progress_item.set_progress_text(percent_text(done, total));
        });

        let span = info_span!("upload", trace_id = %item.trace_id(), path = %item.abs_path().display());
        let result = self
            .uploader
            .upload(item.abs_path(), item.server_path(), token.clone(), progress)
            .instrument(span)
            .await;

        match result {
            Ok(response) => {
                item.set_state(ItemState::Uploaded);
                info!(
                    target: "queue",
                    trace_id = %item.trace_id(),
                    path = %item.abs_path().display(),
                    fs_id = response.fs_id,
                    "upload item finished"
                );
            }
            Err(err) if err.is_cancelled() || token.is_cancelled() => {
                item.set_state(ItemState::Canceled);
                info!(
                    target: "queue",
                    trace_id = %item.trace_id(),
                    path = %item.abs_path().display(),
                    "upload item cancelled"
                );
            }
            Err(err) => {
                item.set_state(ItemState::Failed);
                error!(
                    target: "queue",
                    trace_id = %item.trace_id(),
                    path = %item.abs_path().display(),
                    error = %err,
                    "upload item failed"
                );
            }
        }

        self.persist_state(&item);
        self.uploading
            .write()
            .expect("uploading poisoned")
            .retain(|existing| !Arc::ptr_eq(existing, &item));
        drop(permit);
    }

    /// Mirror the item state into the index row. Index failures are logged,
    /// never reverted.
    fn persist_state(&self, item: &Arc<UploadItem>) {
        let abs_path = item.abs_path().to_string_lossy().into_owned();
        if let Err(err) = self.index.set_status(&abs_path, item.state().as_status()) {
            warn!(
                target: "queue",
                path = %abs_path,
                error = %err,
                "failed to persist upload status"
            );
        }
    }
}
