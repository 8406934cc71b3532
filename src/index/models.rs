use serde::{Deserialize, Serialize};

/// Persistent upload state of a file. The value is what lands in the
/// `upload_status` column; `contentDigest` equality plus `Uploaded` is the
/// authoritative "already uploaded" signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadStatus {
    NotUploaded,
    WaitUploaded,
    Uploading,
    Uploaded,
    Failed,
    Canceled,
}

impl UploadStatus {
    pub fn code(self) -> i32 {
        match self {
            UploadStatus::NotUploaded => 0,
            UploadStatus::WaitUploaded => 1,
            UploadStatus::Uploading => 2,
            UploadStatus::Uploaded => 3,
            UploadStatus::Failed => 4,
            UploadStatus::Canceled => 5,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(UploadStatus::NotUploaded),
            1 => Some(UploadStatus::WaitUploaded),
            2 => Some(UploadStatus::Uploading),
            3 => Some(UploadStatus::Uploaded),
            4 => Some(UploadStatus::Failed),
            5 => Some(UploadStatus::Canceled),
            _ => None,
        }
    }

    /// Statuses that mean an upload is already queued or running.
    pub fn is_pending(self) -> bool {
        matches!(self, UploadStatus::WaitUploaded | UploadStatus::Uploading)
    }
}

/// One row of the `file_info` table, keyed by absolute path.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: i64,
    pub abs_path: String,
    pub server_path: String,
    pub size: i64,
    pub md5: String,
    pub upload_status: UploadStatus,
    pub create_time: i64,
    pub update_time: i64,
}

#[derive(Debug, Clone)]
pub struct NewFileRecord {
    pub abs_path: String,
    pub server_path: String,
    pub size: i64,
    pub md5: String,
    pub upload_status: UploadStatus,
}

impl NewFileRecord {
    pub fn new(abs_path: impl Into<String>, server_path: impl Into<String>) -> Self {
        Self {
            abs_path: abs_path.into(),
            server_path: server_path.into(),
            size: 0,
            md5: String::new(),
            upload_status: UploadStatus::NotUploaded,
        }
    }

    pub fn with_size(mut self, size: i64) -> Self {
        self.size = size;
        self
    }

    pub fn with_md5(mut self, md5: impl Into<String>) -> Self {
        self.md5 = md5.into();
        self
    }

    pub fn with_status(mut self, status: UploadStatus) -> Self {
        self.upload_status = status;
        self
    }
}

/// Partial update of a `file_info` row; unset fields keep their value.
#[derive(Debug, Clone, Default)]
pub struct FileRecordUpdate {
    pub server_path: Option<String>,
    pub size: Option<i64>,
    pub md5: Option<String>,
    pub upload_status: Option<UploadStatus>,
}

impl FileRecordUpdate {
    pub fn is_empty(&self) -> bool {
        self.server_path.is_none()
            && self.size.is_none()
            && self.md5.is_none()
            && self.upload_status.is_none()
    }

    pub fn status(status: UploadStatus) -> Self {
        Self {
            upload_status: Some(status),
            ..Default::default()
        }
    }
}

/// One registered backup root.
#[derive(Debug, Clone)]
pub struct BackupRoot {
    pub id: i64,
    pub abs_path: String,
    pub is_dir: bool,
    pub create_time: i64,
    pub update_time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for status in [
            UploadStatus::NotUploaded,
            UploadStatus::WaitUploaded,
            UploadStatus::Uploading,
            UploadStatus::Uploaded,
            UploadStatus::Failed,
            UploadStatus::Canceled,
        ] {
            assert_eq!(UploadStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(UploadStatus::from_code(42), None);
    }

    #[test]
    fn pending_statuses() {
        assert!(UploadStatus::WaitUploaded.is_pending());
        assert!(UploadStatus::Uploading.is_pending());
        assert!(!UploadStatus::Uploaded.is_pending());
        assert!(!UploadStatus::Failed.is_pending());
    }
}
