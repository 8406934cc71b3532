//! One entry in the upload list, with its display state and cancellation
//! token. Items never outlive the list, so the back-reference is a `Weak`.

use crate::index::UploadStatus;
use crate::queue::UploadQueue;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, Weak};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Runtime state of an upload item. Transitions follow
/// WaitUploaded → Uploading → (Uploaded | Failed), with Canceled reachable
/// from anywhere via the item's token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    WaitUploaded,
    Uploading,
    Uploaded,
    Failed,
    Canceled,
}

impl ItemState {
    pub fn text(self) -> &'static str {
        match self {
            ItemState::WaitUploaded => "waiting",
            ItemState::Uploading => "uploading",
            ItemState::Uploaded => "uploaded",
            ItemState::Failed => "failed",
            ItemState::Canceled => "canceled",
        }
    }

    /// The index-store status this runtime state maps to.
    pub fn as_status(self) -> UploadStatus {
        match self {
            ItemState::WaitUploaded => UploadStatus::WaitUploaded,
            ItemState::Uploading => UploadStatus::Uploading,
            ItemState::Uploaded => UploadStatus::Uploaded,
            ItemState::Failed => UploadStatus::Failed,
            ItemState::Canceled => UploadStatus::Canceled,
        }
    }
}

/// What observers get to see of an item.
#[derive(Debug, Clone)]
pub struct ItemSnapshot {
    pub abs_path: PathBuf,
    pub server_path: String,
    pub state: ItemState,
    pub progress: String,
}

pub struct UploadItem {
    abs_path: PathBuf,
    server_path: String,
    trace_id: Uuid,
    state: RwLock<ItemState>,
    progress: RwLock<String>,
    token: RwLock<CancellationToken>,
    queue: Weak<UploadQueue>,
}

impl UploadItem {
    pub(crate) fn new(
        abs_path: PathBuf,
        server_path: String,
        queue: &Arc<UploadQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            abs_path,
            server_path,
            trace_id: Uuid::new_v4(),
            state: RwLock::new(ItemState::WaitUploaded),
            progress: RwLock::new(ItemState::WaitUploaded.text().to_string()),
            token: RwLock::new(queue.root_token().child_token()),
            queue: Arc::downgrade(queue),
        })
    }

    pub fn abs_path(&self) -> &Path {
        &self.abs_path
    }

    pub fn server_path(&self) -> &str {
        &self.server_path
    }

    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    pub fn state(&self) -> ItemState {
        *self.state.read().expect("item state poisoned")
    }

    /// Set the state and reset the progress text to that state's label.
    pub fn set_state(&self, state: ItemState) {
        *self.state.write().expect("item state poisoned") = state;
        *self.progress.write().expect("item progress poisoned") = state.text().to_string();
    }

    pub fn set_progress_text(&self, text: String) {
        *self.progress.write().expect("item progress poisoned") = text;
    }

    pub fn token(&self) -> CancellationToken {
        self.token.read().expect("item token poisoned").clone()
    }

    /// Cancel this item: mark it Canceled and fire its token so any
    /// in-flight driver and chunk tasks stop promptly.
    pub fn cancel(&self) {
        self.set_state(ItemState::Canceled);
        self.token.read().expect("item token poisoned").cancel();
    }

    /// Give the item a fresh token (child of its queue's root) so it can be
    /// driven again after a failure.
    pub(crate) fn rebind_token(&self) {
        let fresh = self
            .queue
            .upgrade()
            .map(|queue| queue.root_token().child_token())
            .unwrap_or_default();
        *self.token.write().expect("item token poisoned") = fresh;
    }

    pub fn snapshot(&self) -> ItemSnapshot {
        ItemSnapshot {
            abs_path: self.abs_path.clone(),
            server_path: self.server_path.clone(),
            state: self.state(),
            progress: self
                .progress
                .read()
                .expect("item progress poisoned")
                .clone(),
        }
    }
}
