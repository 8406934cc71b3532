//! Wire types for the three-step chunked upload protocol.

use serde::{Deserialize, Serialize};

pub const ERRNO_SUCCESS: i64 = 0;
pub const ERRNO_ACCESS_TOKEN_INVALID: i64 = -6;

/// `return_type` values in the reserve response
pub const RETURN_TYPE_NEW: u8 = 1;
pub const RETURN_TYPE_EXISTS: u8 = 2;

/// What the remote should do when the server path already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// Fail the call on a name collision
    Error,
    /// Rename the uploaded file
    Rename,
    /// Rename only when the block list differs
    RenameOnDiff,
    /// Replace the existing file
    Overwrite,
}

impl ConflictPolicy {
    pub fn code(self) -> u8 {
        match self {
            ConflictPolicy::Error => 0,
            ConflictPolicy::Rename => 1,
            ConflictPolicy::RenameOnDiff => 2,
            ConflictPolicy::Overwrite => 3,
        }
    }
}

/// Upload mode reported to the remote on commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadMode {
    Manual,
    Batch,
    FileAutoBackup,
    AlbumAutoBackup,
    VideoAutoBackup,
}

impl UploadMode {
    pub fn code(self) -> u8 {
        match self {
            UploadMode::Manual => 1,
            UploadMode::Batch => 2,
            UploadMode::FileAutoBackup => 3,
            UploadMode::AlbumAutoBackup => 4,
            UploadMode::VideoAutoBackup => 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReserveRequest {
    /// Absolute server path
    pub path: String,
    /// File size in bytes
    pub size: u64,
    pub is_dir: bool,
    /// Per-chunk MD5 digests, lowercase hex
    pub block_list: Vec<String>,
    pub rtype: ConflictPolicy,
    /// Whole-file MD5, optional fast-path hint
    pub content_md5: Option<String>,
    /// MD5 of the first 256 KiB, optional fast-path hint
    pub slice_md5: Option<String>,
}

impl ReserveRequest {
    /// url-encoded form body fields
    pub fn form(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("path", self.path.clone()),
            ("size", self.size.to_string()),
            ("isdir", if self.is_dir { "1" } else { "0" }.to_string()),
            ("autoinit", "1".to_string()),
            ("rtype", self.rtype.code().to_string()),
            ("block_list", block_list_json(&self.block_list)),
        ];
        if let Some(md5) = &self.content_md5 {
            fields.push(("content-md5", md5.clone()));
        }
        if let Some(md5) = &self.slice_md5 {
            fields.push(("slice-md5", md5.clone()));
        }
        fields
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReserveResponse {
    #[serde(default)]
    pub errno: i64,
    #[serde(default)]
    pub path: String,
    #[serde(default, rename = "uploadid")]
    pub upload_id: String,
    /// 1 file is new on the remote, 2 file already exists
    #[serde(default)]
    pub return_type: u8,
    /// Chunk indexes the server still wants, 0-based
    #[serde(default, rename = "block_list")]
    pub missing_seqs: Vec<usize>,
}

impl ReserveResponse {
    pub fn already_exists(&self) -> bool {
        self.return_type == RETURN_TYPE_EXISTS
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkResponse {
    #[serde(default)]
    pub errno: i64,
    #[serde(default)]
    pub error_code: i64,
    #[serde(default)]
    pub md5: String,
}

#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    pub block_list: Vec<String>,
    pub upload_id: String,
    pub rtype: ConflictPolicy,
    pub mode: UploadMode,
    /// Keep previous versions of the file on the remote
    pub is_revision: bool,
}

impl CommitRequest {
    pub fn form(&self) -> Vec<(&'static str, String)> {
        vec![
            ("path", self.path.clone()),
            ("size", self.size.to_string()),
            ("isdir", if self.is_dir { "1" } else { "0" }.to_string()),
            ("block_list", block_list_json(&self.block_list)),
            ("uploadid", self.upload_id.clone()),
            ("rtype", self.rtype.code().to_string()),
            ("mode", self.mode.code().to_string()),
            (
                "is_revision",
                if self.is_revision { "1" } else { "0" }.to_string(),
            ),
        ]
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommitResponse {
    #[serde(default)]
    pub errno: i64,
    #[serde(default)]
    pub fs_id: i64,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub md5: String,
    #[serde(default)]
    pub server_filename: String,
    #[serde(default)]
    pub size: i64,
}

/// The remote wants the block list as a JSON array string inside the form.
fn block_list_json(blocks: &[String]) -> String {
    serde_json::to_string(blocks).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_form_encodes_block_list_as_json_array() {
        let req = ReserveRequest {
            path: "/apps/backup/a.bin".into(),
            size: 10 * 1024 * 1024,
            is_dir: false,
            block_list: vec!["aa".into(), "bb".into(), "cc".into()],
            rtype: ConflictPolicy::Overwrite,
            content_md5: None,
            slice_md5: None,
        };
        let form = req.form();

        let get = |key: &str| {
            form.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.as_str())
                .unwrap()
        };
        assert_eq!(get("block_list"), r#"["aa","bb","cc"]"#);
        assert_eq!(get("autoinit"), "1");
        assert_eq!(get("rtype"), "3");
        assert_eq!(get("isdir"), "0");
        assert!(!form.iter().any(|(k, _)| *k == "content-md5"));
    }

    #[test]
    fn reserve_form_includes_optional_digests() {
        let req = ReserveRequest {
            path: "/a".into(),
            size: 1,
            is_dir: false,
            block_list: vec!["aa".into()],
            rtype: ConflictPolicy::Overwrite,
            content_md5: Some("ff".into()),
            slice_md5: Some("ee".into()),
        };
        let form = req.form();
        assert!(form.contains(&("content-md5", "ff".to_string())));
        assert!(form.contains(&("slice-md5", "ee".to_string())));
    }

    #[test]
    fn reserve_response_parses_missing_seqs() {
        let body = r#"{"errno":0,"uploadid":"U1","return_type":1,"block_list":[0,1,2],"path":"/a"}"#;
        let resp: ReserveResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.upload_id, "U1");
        assert_eq!(resp.missing_seqs, vec![0, 1, 2]);
        assert_eq!(resp.return_type, RETURN_TYPE_NEW);
        assert!(!resp.already_exists());
    }

    #[test]
    fn reserve_response_detects_existing_file() {
        let body = r#"{"errno":0,"uploadid":"","return_type":2,"block_list":[]}"#;
        let resp: ReserveResponse = serde_json::from_str(body).unwrap();
        assert!(resp.already_exists());
        assert!(resp.missing_seqs.is_empty());
    }

    #[test]
    fn commit_form_carries_mode_and_revision() {
        let req = CommitRequest {
            path: "/a".into(),
            size: 0,
            is_dir: false,
            block_list: vec!["aa".into()],
            upload_id: "U1".into(),
            rtype: ConflictPolicy::Overwrite,
            mode: UploadMode::Manual,
            is_revision: true,
        };
        let form = req.form();
        assert!(form.contains(&("mode", "1".to_string())));
        assert!(form.contains(&("is_revision", "1".to_string())));
        assert!(form.contains(&("uploadid", "U1".to_string())));
    }

    #[test]
    fn commit_response_parses_fs_id() {
        let body = r#"{"errno":0,"fs_id":42,"path":"/a","md5":"aa"}"#;
        let resp: CommitResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.fs_id, 42);
    }

    #[test]
    fn chunk_response_parses_error_code() {
        let body = r#"{"errno":0,"error_code":31363,"md5":""}"#;
        let resp: ChunkResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.error_code, 31363);
    }
}
