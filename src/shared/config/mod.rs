//! Application configuration module
//!
//! Configuration is assembled from three layers, later layers winning:
//! built-in defaults, an optional TOML file, then `VIRTOOL_*` environment
//! variables.
//!
//! ```toml
//! server_url = "ws://lab.example.org/ws"
//! server_id = "lab-1"
//! request_timeout_secs = 30
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Default WebSocket endpoint
pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:9950/ws";

/// Default server identifier, used to name the local database
pub const DEFAULT_SERVER_ID: &str = "local";

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_BACKOFF_BASE_SECS: u64 = 1;
const DEFAULT_BACKOFF_MAX_SECS: u64 = 60;
const DEFAULT_LOG_FILTER: &str = "virtool_sync=info";

/// Application configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// WebSocket URL of the server
    pub server_url: String,
    /// Server identifier; the local database is named `virtool-<server_id>`
    pub server_id: String,
    /// Directory holding the local database
    pub data_dir: PathBuf,
    /// How long a request may stay unanswered before it fails
    pub request_timeout: Duration,
    /// First reconnect delay
    pub backoff_base: Duration,
    /// Upper bound on reconnect delay
    pub backoff_max: Duration,
    /// `tracing-subscriber` filter directive used when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            server_id: DEFAULT_SERVER_ID.to_string(),
            data_dir: default_data_dir(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            backoff_base: Duration::from_secs(DEFAULT_BACKOFF_BASE_SECS),
            backoff_max: Duration::from_secs(DEFAULT_BACKOFF_MAX_SECS),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl AppConfig {
    /// Create a new AppConfigBuilder
    pub fn builder() -> AppConfigBuilder {
        AppConfigBuilder::default()
    }

    /// Defaults, then `path` (if given), then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Self::builder();
        if let Some(path) = path {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::Io(path.display().to_string(), e.to_string()))?;
            builder = builder.merge_toml(&text)?;
        }
        builder.merge_env(|key| std::env::var(key).ok())?.build()
    }

    /// Name of the local database, keyed by server
    pub fn database_name(&self) -> String {
        format!("virtool-{}", self.server_id)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.db", self.database_name()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.server_url.starts_with("ws://") || self.server_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidUrl(self.server_url.clone()));
        }
        if self.server_id.trim().is_empty() {
            return Err(ConfigError::MissingValue("server_id"));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("request_timeout_secs", "must be positive".into()));
        }
        if self.backoff_base > self.backoff_max {
            return Err(ConfigError::InvalidValue(
                "backoff_base_secs",
                "must not exceed backoff_max_secs".into(),
            ));
        }
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    let mut path = dirs::data_dir().unwrap_or_else(std::env::temp_dir);
    path.push("virtool");
    path
}

/// On-disk shape; every field optional
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    server_url: Option<String>,
    server_id: Option<String>,
    data_dir: Option<PathBuf>,
    request_timeout_secs: Option<u64>,
    backoff_base_secs: Option<u64>,
    backoff_max_secs: Option<u64>,
    log_filter: Option<String>,
}

/// Builder for AppConfig
#[derive(Debug, Default)]
pub struct AppConfigBuilder {
    server_url: Option<String>,
    server_id: Option<String>,
    data_dir: Option<PathBuf>,
    request_timeout: Option<Duration>,
    backoff_base: Option<Duration>,
    backoff_max: Option<Duration>,
    log_filter: Option<String>,
}

impl AppConfigBuilder {
    /// Set the server URL
    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = Some(url.into());
        self
    }

    pub fn server_id(mut self, id: impl Into<String>) -> Self {
        self.server_id = Some(id.into());
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = Some(base);
        self.backoff_max = Some(max);
        self
    }

    pub fn log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    /// Overlay values from a TOML document
    pub fn merge_toml(mut self, text: &str) -> Result<Self, ConfigError> {
        let file: FileConfig =
            toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if let Some(v) = file.server_url {
            self.server_url = Some(v);
        }
        if let Some(v) = file.server_id {
            self.server_id = Some(v);
        }
        if let Some(v) = file.data_dir {
            self.data_dir = Some(v);
        }
        if let Some(v) = file.request_timeout_secs {
            self.request_timeout = Some(Duration::from_secs(v));
        }
        if let Some(v) = file.backoff_base_secs {
            self.backoff_base = Some(Duration::from_secs(v));
        }
        if let Some(v) = file.backoff_max_secs {
            self.backoff_max = Some(Duration::from_secs(v));
        }
        if let Some(v) = file.log_filter {
            self.log_filter = Some(v);
        }
        Ok(self)
    }

    /// Overlay `VIRTOOL_*` variables read through `lookup`
    pub fn merge_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("VIRTOOL_SERVER_URL") {
            self.server_url = Some(v);
        }
        if let Some(v) = lookup("VIRTOOL_SERVER_ID") {
            self.server_id = Some(v);
        }
        if let Some(v) = lookup("VIRTOOL_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("VIRTOOL_REQUEST_TIMEOUT_SECS") {
            let secs = v.parse::<u64>().map_err(|_| {
                ConfigError::InvalidValue("VIRTOOL_REQUEST_TIMEOUT_SECS", v.clone())
            })?;
            self.request_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(v) = lookup("VIRTOOL_LOG") {
            self.log_filter = Some(v);
        }
        Ok(self)
    }

    /// Build the configuration
    pub fn build(self) -> Result<AppConfig, ConfigError> {
        let defaults = AppConfig::default();
        let config = AppConfig {
            server_url: self.server_url.unwrap_or(defaults.server_url),
            server_id: self.server_id.unwrap_or(defaults.server_id),
            data_dir: self.data_dir.unwrap_or(defaults.data_dir),
            request_timeout: self.request_timeout.unwrap_or(defaults.request_timeout),
            backoff_base: self.backoff_base.unwrap_or(defaults.backoff_base),
            backoff_max: self.backoff_max.unwrap_or(defaults.backoff_max),
            log_filter: self.log_filter.unwrap_or(defaults.log_filter),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("missing value: {0}")]
    MissingValue(&'static str),
    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
    #[error("could not parse config: {0}")]
    Parse(String),
    #[error("could not read {0}: {1}")]
    Io(String, String),
}
