//! Per-file upload driver.
//!
//! Orchestrates one file through the three-step protocol: build the block
//! list, reserve (with one refresh-and-retry when the access token has
//! expired), fan the missing chunks out into the shared work pool under a
//! task group, then commit once the barrier clears. A cancelled driver never
//! commits.

pub mod error;
pub mod progress;

use crate::bufpool::{BufferPool, FrozenChunk};
use crate::credentials::CredentialStore;
use crate::hasher::ChunkHasher;
use crate::pool::{Task, TaskGroup, WorkPool};
use crate::remote::RemoteClient;
use crate::remote::models::{
    CommitRequest, CommitResponse, ConflictPolicy, ReserveRequest, ReserveResponse, UploadMode,
};
use error::{UploadError, UploadResult};
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// First 256 KiB of the file, hashed as the reserve fast-path hint.
const SLICE_DIGEST_LEN: usize = 256 * 1024;

/// Callback invoked after each accepted chunk with (done, total).
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Remote directory all server paths are joined under
    pub path_prefix: String,
    /// Per-chunk retry budget
    pub max_retries: u32,
    pub rtype: ConflictPolicy,
    pub mode: UploadMode,
    pub is_revision: bool,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            path_prefix: "/".to_string(),
            max_retries: 3,
            rtype: ConflictPolicy::Overwrite,
            mode: UploadMode::Manual,
            is_revision: true,
        }
    }
}

pub struct Uploader {
    remote: Arc<RemoteClient>,
    creds: Arc<CredentialStore>,
    pool: Arc<WorkPool>,
    bufs: Arc<BufferPool>,
    hasher: ChunkHasher,
    config: UploaderConfig,
}

impl Uploader {
    pub fn new(
        remote: Arc<RemoteClient>,
        creds: Arc<CredentialStore>,
        pool: Arc<WorkPool>,
        bufs: Arc<BufferPool>,
        config: UploaderConfig,
    ) -> Self {
        let hasher = ChunkHasher::new(Arc::clone(&bufs));
        Self {
            remote,
            creds,
            pool,
            bufs,
            hasher,
            config,
        }
    }

    /// Drive one file to the remote. `server_path` is the path relative to
    /// the configured prefix; `token` cancels the whole upload including its
    /// chunk tasks; `progress` fires after every accepted chunk.
    pub async fn upload(
        &self,
        abs_path: &Path,
        server_path: &str,
        token: CancellationToken,
        progress: ProgressFn,
    ) -> UploadResult<CommitResponse> {
        let remote_path = join_server_path(&self.config.path_prefix, server_path);
        info!(
            target: "uploader",
            path = %abs_path.display(),
            server_path = %remote_path,
            "upload start"
        );

        let block_list = self.hasher.block_list(abs_path).await?;
        let size = tokio::fs::metadata(abs_path).await?.len();
        let content_md5 = self.hasher.file_digest(abs_path).await?;
        let slice_md5 = self.hasher.prefix_digest(abs_path, SLICE_DIGEST_LEN).await?;

        let reserve = self
            .reserve(&remote_path, size, &block_list, content_md5, slice_md5, &token)
            .await?;

        if reserve.already_exists() {
            info!(
                target: "uploader",
                path = %abs_path.display(),
                "file already present on remote, committing directly"
            );
            let total_chunks = block_list.len() as u64;
            progress(total_chunks, total_chunks);
            return self
                .commit(&remote_path, size, &block_list, &reserve.upload_id, &token)
                .await;
        }

        let mut missing = reserve.missing_seqs.clone();
        if missing.is_empty() {
            // The server wants at least one chunk even for an empty file.
            missing.push(0);
        }

        let group = TaskGroup::new(&token, missing.len());
        self.install_hooks(&group, progress);

        let result = self
            .send_chunks(abs_path, &remote_path, size, &reserve.upload_id, &missing, &group)
            .await;
        if let Err(err) = result {
            group.cancel();
            return Err(err);
        }

        group.wait().await?;
        if token.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let response = self
            .commit(&remote_path, size, &block_list, &reserve.upload_id, &token)
            .await?;
        info!(
            target: "uploader",
            path = %abs_path.display(),
            fs_id = response.fs_id,
            "upload success"
        );
        Ok(response)
    }

    /// Reserve the upload, refreshing the credentials once when the remote
    /// reports the access token expired. A failed refresh surfaces as an
    /// auth error and stops the upload.
    async fn reserve(
        &self,
        remote_path: &str,
        size: u64,
        block_list: &[String],
        content_md5: String,
        slice_md5: String,
        token: &CancellationToken,
    ) -> UploadResult<ReserveResponse> {
        let request = ReserveRequest {
            path: remote_path.to_string(),
            size,
            is_dir: false,
            block_list: block_list.to_vec(),
            rtype: self.config.rtype,
            content_md5: Some(content_md5),
            slice_md5: Some(slice_md5),
        };

        let mut refreshed = false;
        loop {
            let attempt = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(UploadError::Cancelled),
                res = self.remote.reserve(&request) => res,
            };
            match attempt {
                Ok(response) => return Ok(response),
                Err(UploadError::AuthExpired) if !refreshed => {
                    warn!(target: "uploader", path = %remote_path, "access token expired, refreshing");
                    self.creds.refresh_using_refresh_token().await?;
                    refreshed = true;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn install_hooks(&self, group: &Arc<TaskGroup>, progress: ProgressFn) {
        let total = group.total();
        let weak = Arc::downgrade(group);
        group.on_success(move |_task| {
            if let Some(group) = weak.upgrade() {
                progress(group.done_count(), total);
            }
        });

        let weak = Arc::downgrade(group);
        group.on_fail(move |task, err, pool| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(group) = weak.upgrade() else { return };
                if !err.is_retryable() {
                    group.fail(err);
                    return;
                }
                warn!(
                    target: "uploader",
                    task = %task.name(),
                    attempt = task.retry_count(),
                    error = %err,
                    "chunk task failed, retrying"
                );
                if let Err(retry_err) = task.retry(&pool).await {
                    group.fail(retry_err);
                }
            })
        });
    }

    /// Read every missing chunk through the buffer pool and submit one task
    /// per seq, then wait out the group barrier.
    async fn send_chunks(
        &self,
        abs_path: &Path,
        remote_path: &str,
        size: u64,
        upload_id: &str,
        missing: &[usize],
        group: &Arc<TaskGroup>,
    ) -> UploadResult<()> {
        let chunk_size = self.bufs.chunk_size() as u64;
        let mut file = File::open(abs_path).await?;

        for &seq in missing {
            let (offset, len) = chunk_span(size, chunk_size, seq);
            let mut buf = self.bufs.get().await;
            buf.truncate(len);
            if len > 0 {
                file.seek(SeekFrom::Start(offset)).await?;
                file.read_exact(&mut buf[..]).await?;
            }

            let payload = Arc::new(ChunkPayload {
                remote: Arc::clone(&self.remote),
                creds: Arc::clone(&self.creds),
                upload_id: upload_id.to_string(),
                server_path: remote_path.to_string(),
                seq,
                chunk: buf.freeze(),
            });
            let task = Task::new(
                group,
                format!("{remote_path}_{seq}"),
                self.config.max_retries,
                move |token| {
                    let payload = Arc::clone(&payload);
                    Box::pin(async move { payload.send(token).await })
                },
            );
            self.pool.submit(task).await?;
        }
        Ok(())
    }

    async fn commit(
        &self,
        remote_path: &str,
        size: u64,
        block_list: &[String],
        upload_id: &str,
        token: &CancellationToken,
    ) -> UploadResult<CommitResponse> {
        let request = CommitRequest {
            path: remote_path.to_string(),
            size,
            is_dir: false,
            block_list: block_list.to_vec(),
            upload_id: upload_id.to_string(),
            rtype: self.config.rtype,
            mode: self.config.mode,
            is_revision: self.config.is_revision,
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(UploadError::Cancelled),
            res = self.remote.commit(&request) => res,
        }
    }
}

/// One chunk's identity and borrowed buffer, shared across retry attempts.
struct ChunkPayload {
    remote: Arc<RemoteClient>,
    creds: Arc<CredentialStore>,
    upload_id: String,
    server_path: String,
    seq: usize,
    chunk: FrozenChunk,
}

impl ChunkPayload {
    async fn send(&self, token: CancellationToken) -> UploadResult<()> {
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(UploadError::Cancelled),
            res = self.remote.put_chunk(
                &self.upload_id,
                &self.server_path,
                self.seq,
                self.chunk.bytes(),
            ) => res,
        };
        match result {
            Ok(_md5) => Ok(()),
            Err(UploadError::AuthExpired) => {
                warn!(
                    target: "uploader",
                    path = %self.server_path,
                    seq = self.seq,
                    "chunk rejected for expired token, refreshing before retry"
                );
                // A failed refresh is terminal; otherwise the retry attempt
                // picks up the fresh token from the store.
                self.creds.refresh_using_refresh_token().await?;
                Err(UploadError::AuthExpired)
            }
            Err(err) => Err(err),
        }
    }
}

/// Byte range of chunk `seq` in a file of `size` bytes.
fn chunk_span(size: u64, chunk_size: u64, seq: usize) -> (u64, usize) {
    let offset = seq as u64 * chunk_size;
    let len = size.saturating_sub(offset).min(chunk_size) as usize;
    (offset, len)
}

fn join_server_path(prefix: &str, server_path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let rel = server_path.trim_start_matches('/');
    if rel.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}/{rel}")
    }
}
