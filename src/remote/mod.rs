//! Protocol client for the remote's three-step chunked upload:
//! reserve (`precreate`), chunk transfer (`upload`), commit (`create`).
//!
//! All three calls put the access token in the query string, send url-encoded
//! form bodies (multipart for chunk bytes) and report failure through a
//! numeric `errno` field: 0 is success, -6 means the access token expired,
//! anything else is a server error with the code preserved.

pub mod models;

use crate::config::RemoteConfig;
use crate::credentials::CredentialStore;
use crate::uploader::error::{UploadError, UploadResult};
use bytes::Bytes;
use models::{
    ChunkResponse, CommitRequest, CommitResponse, ERRNO_ACCESS_TOKEN_INVALID, ERRNO_SUCCESS,
    ReserveRequest, ReserveResponse,
};
use reqwest::multipart::{Form, Part};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct RemoteClient {
    http: reqwest::Client,
    api_base: String,
    data_base: String,
    creds: Arc<CredentialStore>,
}

impl RemoteClient {
    pub fn new(remote: &RemoteConfig, creds: Arc<CredentialStore>) -> UploadResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| UploadError::Other(format!("failed to build http client: {err}")))?;

        Ok(Self {
            http,
            api_base: remote.api_base.trim_end_matches('/').to_string(),
            data_base: remote.data_base.trim_end_matches('/').to_string(),
            creds,
        })
    }

    /// Reserve an upload: returns the upload id and the chunk indexes the
    /// server still wants. An empty `missing_seqs` together with
    /// `return_type = 2` means the file is already present and commit may be
    /// called directly.
    pub async fn reserve(&self, request: &ReserveRequest) -> UploadResult<ReserveResponse> {
        let token = self.creds.access_token().await?;
        let url = format!("{}/rest/2.0/xpan/file", self.api_base);

        debug!(
            target: "remote",
            path = %request.path,
            size = request.size,
            blocks = request.block_list.len(),
            "reserve start"
        );

        let response: ReserveResponse = self
            .http
            .post(&url)
            .query(&[("method", "precreate"), ("access_token", token.as_str())])
            .form(&request.form())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        check_errno(response.errno)?;
        info!(
            target: "remote",
            path = %request.path,
            upload_id = %response.upload_id,
            return_type = response.return_type,
            missing = response.missing_seqs.len(),
            "reserve done"
        );
        Ok(response)
    }

    /// Send one chunk verbatim as the `file` part of a multipart form.
    pub async fn put_chunk(
        &self,
        upload_id: &str,
        server_path: &str,
        seq: usize,
        body: Bytes,
    ) -> UploadResult<String> {
        let token = self.creds.access_token().await?;
        let url = format!("{}/rest/2.0/pcs/superfile2", self.data_base);
        let seq_str = seq.to_string();

        debug!(
            target: "remote",
            path = %server_path,
            seq,
            bytes = body.len(),
            "chunk upload start"
        );

        let length = body.len() as u64;
        let part = Part::stream_with_length(body, length).file_name(server_path.to_string());
        let form = Form::new().part("file", part);

        let response: ChunkResponse = self
            .http
            .post(&url)
            .query(&[
                ("method", "upload"),
                ("access_token", token.as_str()),
                ("type", "tmpfile"),
                ("path", server_path),
                ("uploadid", upload_id),
                ("partseq", seq_str.as_str()),
            ])
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        check_errno(response.errno)?;
        if response.error_code != ERRNO_SUCCESS {
            return Err(UploadError::ChunkRejected {
                seq,
                code: response.error_code,
            });
        }

        debug!(target: "remote", path = %server_path, seq, md5 = %response.md5, "chunk upload done");
        Ok(response.md5)
    }

    /// Finalize the upload; the server assembles the chunks into a file.
    pub async fn commit(&self, request: &CommitRequest) -> UploadResult<CommitResponse> {
        let token = self.creds.access_token().await?;
        let url = format!("{}/rest/2.0/xpan/file", self.api_base);

        let response: CommitResponse = self
            .http
            .post(&url)
            .query(&[("method", "create"), ("access_token", token.as_str())])
            .form(&request.form())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        check_errno(response.errno)?;
        info!(
            target: "remote",
            path = %response.path,
            fs_id = response.fs_id,
            "commit done"
        );
        Ok(response)
    }
}

fn check_errno(errno: i64) -> UploadResult<()> {
    match errno {
        ERRNO_SUCCESS => Ok(()),
        ERRNO_ACCESS_TOKEN_INVALID => Err(UploadError::AuthExpired),
        other => Err(UploadError::Server { errno: other }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_zero_is_ok() {
        assert!(check_errno(0).is_ok());
    }

    #[test]
    fn errno_minus_six_maps_to_auth_expired() {
        assert!(matches!(check_errno(-6), Err(UploadError::AuthExpired)));
    }

    #[test]
    fn other_errno_preserves_the_code() {
        match check_errno(31363) {
            Err(UploadError::Server { errno }) => assert_eq!(errno, 31363),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
