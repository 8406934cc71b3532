//! Error types for the upload engine

use thiserror::Error;

/// Result type for upload operations
pub type UploadResult<T> = Result<T, UploadError>;

/// Upload error types
#[derive(Debug, Error)]
pub enum UploadError {
    /// Upload was cancelled
    #[error("upload cancelled")]
    Cancelled,

    /// The remote rejected the access token
    #[error("access token expired")]
    AuthExpired,

    /// Credentials are missing or a refresh was rejected
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The remote returned a non-zero errno other than auth-expired
    #[error("remote error (errno {errno})")]
    Server { errno: i64 },

    /// PutChunk returned a non-zero error_code
    #[error("chunk {seq} rejected (error_code {code})")]
    ChunkRejected { seq: usize, code: i64 },

    /// HTTP transport failed
    #[error("http request failed: {0}")]
    Http(String),

    /// Failed to read a local file
    #[error("local io error: {0}")]
    LocalIo(#[from] std::io::Error),

    /// Work pool no longer accepts tasks
    #[error("pool is stopped")]
    PoolStopped,

    /// A task exceeded its retry budget
    #[error("task {name} exceeded max retry times ({max_retry})")]
    RetryExhausted { name: String, max_retry: u32 },

    /// A worker panicked while running the task
    #[error("task panicked: {0}")]
    Panicked(String),

    /// Index store error
    #[error("index error: {0}")]
    Index(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl UploadError {
    /// Whether the per-chunk retry path should resubmit the task.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UploadError::Http(_)
                | UploadError::Server { .. }
                | UploadError::ChunkRejected { .. }
                | UploadError::AuthExpired
        )
    }

    /// Whether this error is due to cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, UploadError::Cancelled)
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self, UploadError::AuthExpired)
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        UploadError::Http(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(UploadError::Server { errno: 31363 }.is_retryable());
        assert!(UploadError::ChunkRejected { seq: 1, code: 9 }.is_retryable());
        assert!(UploadError::Http("timed out".into()).is_retryable());
        assert!(UploadError::AuthExpired.is_retryable());
    }

    #[test]
    fn terminal_errors_are_not_retryable() {
        assert!(!UploadError::Cancelled.is_retryable());
        assert!(!UploadError::Auth("refresh rejected".into()).is_retryable());
        assert!(
            !UploadError::LocalIo(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "gone"
            ))
            .is_retryable()
        );
        assert!(
            !UploadError::RetryExhausted {
                name: "t".into(),
                max_retry: 3
            }
            .is_retryable()
        );
    }
}
