use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("missing required config field `{0}`")]
    Missing(&'static str),
}

/// Log level configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Remote endpoint and application credentials.
///
/// The three base URLs default to the production service and exist mainly so
/// tests can point the client at a local server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub app_key: String,
    pub app_secret: String,
    /// Where the credential file lives
    pub token_path: PathBuf,
    /// Remote directory all server paths are joined under
    pub path_prefix: String,
    pub api_base: String,
    pub data_base: String,
    pub oauth_base: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            app_key: String::new(),
            app_secret: String::new(),
            token_path: PathBuf::new(),
            path_prefix: "/apps/backup".to_string(),
            api_base: "https://pan.baidu.com".to_string(),
            data_base: "https://d.pcs.baidu.com".to_string(),
            oauth_base: "https://openapi.baidu.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    /// Chunk workers shared by all in-flight files
    pub worker_count: usize,
    /// Bounded submit queue of the work pool
    pub queue_size: usize,
    /// Files driven to completion at the same time
    pub max_inflight_files: usize,
    /// Chunk buffers available process-wide
    pub chunk_pool_capacity: usize,
    /// Ramp worker admission instead of starting at full parallelism
    pub slow_start: bool,
    pub max_retries: u32,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            worker_count: 20,
            queue_size: 10,
            max_inflight_files: 5,
            chunk_pool_capacity: 64,
            slow_start: true,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Seconds between full rescans of every backup root
    pub interval_secs: u64,
    /// Cap on concurrent scan work across all scanners
    pub max_parallel: usize,
    /// Also watch roots for create/write events
    pub watch: bool,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            max_parallel: 200,
            watch: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: LogLevel,
    pub to_file: bool,
    pub dir: Option<PathBuf>,
    pub max_files: usize,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            to_file: true,
            dir: None,
            max_files: 5,
        }
    }
}

/// Application configuration stored as JSON
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub remote: RemoteConfig,
    pub upload: UploadSettings,
    pub scan: ScanSettings,
    pub log: LogSettings,
    pub database_path: Option<PathBuf>,
}

impl AppConfig {
    /// Default config file location (~/.netdisk-backup/config.json)
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".netdisk-backup")
            .join("config.json")
    }

    pub fn data_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".netdisk-backup")
    }

    /// Load configuration from `path`, using defaults for missing fields.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!(target: "config", path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config: AppConfig =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        tracing::info!(target: "config", path = %path.display(), "Loaded configuration from file");
        Ok(config)
    }

    /// Startup validation; a failure here is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote.app_key.is_empty() {
            return Err(ConfigError::Missing("remote.app_key"));
        }
        if self.remote.app_secret.is_empty() {
            return Err(ConfigError::Missing("remote.app_secret"));
        }
        if self.remote.token_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing("remote.token_path"));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("files.db"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log
            .dir
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_pick_slow_start_and_five_inflight() {
        let config = AppConfig::default();
        assert!(config.upload.slow_start);
        assert_eq!(config.upload.max_inflight_files, 5);
        assert_eq!(config.upload.max_retries, 3);
        assert_eq!(config.scan.interval_secs, 300);
    }

    #[test]
    fn load_with_missing_fields_uses_defaults() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "{{}}").unwrap();

        let config = AppConfig::load(temp_file.path()).unwrap();
        assert_eq!(config.upload.worker_count, 20);
    }

    #[test]
    fn load_overrides_selected_fields() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"{{"upload": {{"worker_count": 4}}, "remote": {{"app_key": "k"}}}}"#
        )
        .unwrap();

        let config = AppConfig::load(temp_file.path()).unwrap();
        assert_eq!(config.upload.worker_count, 4);
        assert_eq!(config.remote.app_key, "k");
        // Untouched sections keep defaults
        assert_eq!(config.upload.queue_size, 10);
    }

    #[test]
    fn load_nonexistent_file_uses_defaults() {
        let config = AppConfig::load(Path::new("/nonexistent/config.json")).unwrap();
        assert_eq!(config.scan.max_parallel, 200);
    }

    #[test]
    fn validate_requires_app_credentials() {
        let config = AppConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("remote.app_key"))
        ));

        let mut config = AppConfig::default();
        config.remote.app_key = "k".into();
        config.remote.app_secret = "s".into();
        config.remote.token_path = PathBuf::from("/tmp/token.json");
        assert!(config.validate().is_ok());
    }
}
