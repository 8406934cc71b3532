//! Access / refresh credential storage with atomic on-disk replacement.
//!
//! The credential file is JSON shaped as
//! `{"access_token": {"value", "start_time"}, "refresh_token": {...}}` and is
//! only ever replaced by writing a temp file next to it and renaming, so a
//! partial write is never observable. Concurrent refreshes are serialized
//! in-process; across processes the rename is last-writer-wins.

use crate::config::RemoteConfig;
use crate::uploader::error::{UploadError, UploadResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenEntry {
    pub value: String,
    pub start_time: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialFile {
    pub access_token: TokenEntry,
    pub refresh_token: TokenEntry,
}

/// Token endpoint response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

pub struct CredentialStore {
    path: PathBuf,
    oauth_base: String,
    app_key: String,
    app_secret: String,
    http: reqwest::Client,
    cached: RwLock<Option<CredentialFile>>,
    refresh_lock: Mutex<()>,
}

impl CredentialStore {
    /// Create a store bound to the configured credential file. A missing
    /// file is not an error; every token accessor reports `Auth` until a
    /// code exchange or an external write supplies one.
    pub fn new(remote: &RemoteConfig) -> Self {
        let cached = match Self::read_file(&remote.token_path) {
            Ok(file) => Some(file),
            Err(err) => {
                warn!(
                    target: "credentials",
                    path = %remote.token_path.display(),
                    error = %err,
                    "No usable credential file, starting unauthenticated"
                );
                None
            }
        };

        Self {
            path: remote.token_path.clone(),
            oauth_base: remote.oauth_base.clone(),
            app_key: remote.app_key.clone(),
            app_secret: remote.app_secret.clone(),
            http: reqwest::Client::new(),
            cached: RwLock::new(cached),
            refresh_lock: Mutex::new(()),
        }
    }

    /// URL the user opens to obtain an authorization code.
    pub fn authorize_url(&self) -> String {
        format!(
            "{}/oauth/2.0/authorize?response_type=code&client_id={}&redirect_uri=oob&scope=netdisk&display=popup",
            self.oauth_base, self.app_key
        )
    }

    pub async fn access_token(&self) -> UploadResult<String> {
        self.cached
            .read()
            .await
            .as_ref()
            .map(|c| c.access_token.value.clone())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| UploadError::Auth("no access token loaded".to_string()))
    }

    pub async fn refresh_token(&self) -> UploadResult<String> {
        self.cached
            .read()
            .await
            .as_ref()
            .map(|c| c.refresh_token.value.clone())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| UploadError::Auth("no refresh token loaded".to_string()))
    }

    /// Re-read the credential file from disk into the cache.
    pub async fn reload(&self) -> UploadResult<()> {
        let file = Self::read_file(&self.path)
            .map_err(|err| UploadError::Auth(format!("reload credential file: {err}")))?;
        *self.cached.write().await = Some(file);
        Ok(())
    }

    /// Exchange the refresh token for a fresh credential pair and persist it.
    pub async fn refresh_using_refresh_token(&self) -> UploadResult<()> {
        let _guard = self.refresh_lock.lock().await;
        let refresh_token = self.refresh_token().await?;

        let url = format!(
            "{}/oauth/2.0/token?grant_type=refresh_token&refresh_token={}&client_id={}&client_secret={}&scope=netdisk",
            self.oauth_base, refresh_token, self.app_key, self.app_secret
        );
        let token = self.request_token(&url).await?;
        self.store(&token.access_token, &token.refresh_token).await?;

        info!(
            target: "credentials",
            expires_in = token.expires_in,
            "access token refreshed from server"
        );
        Ok(())
    }

    /// Exchange an authorization code for the initial credential pair.
    pub async fn store_from_authorization_code(&self, code: &str) -> UploadResult<()> {
        let url = format!(
            "{}/oauth/2.0/token?grant_type=authorization_code&code={}&client_id={}&client_secret={}&redirect_uri=oob",
            self.oauth_base, code, self.app_key, self.app_secret
        );
        let token = self.request_token(&url).await?;
        self.store(&token.access_token, &token.refresh_token).await?;

        info!(target: "credentials", "access token obtained from authorization code");
        Ok(())
    }

    async fn request_token(&self, url: &str) -> UploadResult<TokenResponse> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| UploadError::Auth(format!("token endpoint request failed: {err}")))?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|err| UploadError::Auth(format!("token endpoint response invalid: {err}")))?;

        if let Some(error) = token.error.as_deref() {
            let detail = token.error_description.as_deref().unwrap_or("");
            return Err(UploadError::Auth(format!(
                "token endpoint rejected request: {error} {detail}"
            )));
        }
        if token.access_token.is_empty() {
            return Err(UploadError::Auth(
                "token endpoint returned no access token".to_string(),
            ));
        }
        Ok(token)
    }

    /// Write the credential file via temp-file + rename, then update the
    /// in-memory cache.
    async fn store(&self, access_token: &str, refresh_token: &str) -> UploadResult<()> {
        let now = Utc::now().format(TIME_FORMAT).to_string();
        let file = CredentialFile {
            access_token: TokenEntry {
                value: access_token.to_string(),
                start_time: now.clone(),
            },
            refresh_token: TokenEntry {
                value: refresh_token.to_string(),
                start_time: now,
            },
        };

        let data = serde_json::to_vec_pretty(&file)
            .map_err(|err| UploadError::Auth(format!("serialize credential file: {err}")))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| UploadError::Auth(format!("create credential dir: {err}")))?;
        }

        let mut temp = self.path.clone().into_os_string();
        temp.push("_temp");
        let temp = PathBuf::from(temp);

        fs::write(&temp, &data)
            .map_err(|err| UploadError::Auth(format!("write temp credential file: {err}")))?;
        fs::rename(&temp, &self.path)
            .map_err(|err| UploadError::Auth(format!("replace credential file: {err}")))?;

        *self.cached.write().await = Some(file);
        Ok(())
    }

    fn read_file(path: &PathBuf) -> std::io::Result<CredentialFile> {
        let data = fs::read(path)?;
        serde_json::from_slice(&data).map_err(std::io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteConfig;

    fn store_at(path: PathBuf) -> CredentialStore {
        let remote = RemoteConfig {
            app_key: "key".into(),
            app_secret: "secret".into(),
            token_path: path,
            ..Default::default()
        };
        CredentialStore::new(&remote)
    }

    #[tokio::test]
    async fn missing_file_reports_auth_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path().join("token.json"));
        assert!(matches!(
            store.access_token().await,
            Err(UploadError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn store_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        let store = store_at(path.clone());

        store.store("access-1", "refresh-1").await.unwrap();
        assert_eq!(store.access_token().await.unwrap(), "access-1");
        assert_eq!(store.refresh_token().await.unwrap(), "refresh-1");

        // A second store replaces the file atomically; no temp file remains.
        store.store("access-2", "refresh-2").await.unwrap();
        assert_eq!(store.access_token().await.unwrap(), "access-2");
        assert!(!dir.path().join("token.json_temp").exists());

        // A fresh store picks the file up from disk.
        let reopened = store_at(path);
        assert_eq!(reopened.access_token().await.unwrap(), "access-2");
    }

    #[tokio::test]
    async fn reload_picks_up_external_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        let store = store_at(path.clone());
        store.store("old", "old-refresh").await.unwrap();

        let other = store_at(path);
        other.store("new", "new-refresh").await.unwrap();

        store.reload().await.unwrap();
        assert_eq!(store.access_token().await.unwrap(), "new");
    }

    #[test]
    fn authorize_url_carries_the_app_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path().join("token.json"));
        let url = store.authorize_url();
        assert!(url.contains("client_id=key"));
        assert!(url.contains("response_type=code"));
    }
}
