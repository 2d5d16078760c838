//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/beacon/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/beacon/` (~/.config/beacon/)
//! - Data: `$XDG_DATA_HOME/beacon/` (~/.local/share/beacon/) for the upload queue
//! - State/Logs: `$XDG_STATE_HOME/beacon/` (~/.local/state/beacon/)
//!
//! ```toml
//! [server]
//! url = "https://analytics.example.com"
//! app_key = "0123456789abcdef"
//!
//! [upload]
//! protocol = "bulk"
//!
//! [storage]
//! backend = "file"
//! ```

use crate::error::{Error, Result};
use crate::types::DeviceMetrics;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Collector endpoint and credentials
    #[serde(default)]
    pub server: ServerConfig,

    /// Device fact overrides
    #[serde(default)]
    pub device: DeviceConfig,

    /// Session timing
    #[serde(default)]
    pub session: SessionConfig,

    /// Upload pipeline tuning
    #[serde(default)]
    pub upload: UploadConfig,

    /// Upload queue storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Collector endpoint configuration
#[derive(Debug, Deserialize, Default, Clone)]
pub struct ServerConfig {
    /// Collector base URL (e.g., `https://analytics.example.com`)
    pub url: Option<String>,

    /// Application key from the collector dashboard
    pub app_key: Option<String>,

    /// Shared secret for `checksum256` request signing
    pub salt: Option<String>,
}

impl ServerConfig {
    /// Check if both URL and app key are present
    pub fn is_ready(&self) -> bool {
        self.url.is_some() && self.app_key.is_some()
    }
}

/// Overrides for detected device facts
#[derive(Debug, Deserialize, Default, Clone)]
pub struct DeviceConfig {
    /// Fixed device id; generated and persisted when absent
    pub device_id: Option<String>,
    pub os: Option<String>,
    pub os_version: Option<String>,
    pub device: Option<String>,
    pub manufacturer: Option<String>,
    pub resolution: Option<String>,
    pub carrier: Option<String>,
    pub app_version: Option<String>,
    pub locale: Option<String>,
    pub orientation: Option<String>,
}

impl DeviceConfig {
    /// Detected metrics with configured values layered on top
    pub fn metrics(&self) -> DeviceMetrics {
        let detected = DeviceMetrics::detect();
        DeviceMetrics {
            os: self.os.clone().or(detected.os),
            os_version: self.os_version.clone().or(detected.os_version),
            device: self.device.clone().or(detected.device),
            manufacturer: self.manufacturer.clone().or(detected.manufacturer),
            resolution: self.resolution.clone().or(detected.resolution),
            carrier: self.carrier.clone().or(detected.carrier),
            app_version: self.app_version.clone().or(detected.app_version),
            locale: self.locale.clone().or(detected.locale),
            orientation: self.orientation.clone().or(detected.orientation),
        }
    }
}

/// Session timing configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Seconds between heartbeats
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Cap on the duration reported by one heartbeat
    #[serde(default = "default_max_heartbeat")]
    pub max_heartbeat_secs: u64,

    /// Breadcrumb lines kept for exception reports
    #[serde(default = "default_max_breadcrumbs")]
    pub max_breadcrumbs: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            max_heartbeat_secs: default_max_heartbeat(),
            max_breadcrumbs: default_max_breadcrumbs(),
        }
    }
}

impl SessionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

fn default_heartbeat_interval() -> u64 {
    60
}

fn default_max_heartbeat() -> u64 {
    120
}

fn default_max_breadcrumbs() -> usize {
    100
}

/// Wire protocol revision
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// One form-encoded request per call to `{url}/i`
    Legacy,
    /// JSON array of requests per call to `{url}/i/bulk`
    #[default]
    Bulk,
}

/// Upload pipeline configuration
#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    /// Wire protocol revision
    #[serde(default)]
    pub protocol: Protocol,

    /// HTTP request timeout in seconds
    #[serde(default = "default_upload_timeout")]
    pub timeout_secs: u64,

    /// Max network calls per drain before yielding to the next trigger
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,

    /// Events per `events` request
    #[serde(default = "default_max_events_per_request")]
    pub max_events_per_request: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::default(),
            timeout_secs: default_upload_timeout(),
            max_rounds: default_max_rounds(),
            max_events_per_request: default_max_events_per_request(),
        }
    }
}

fn default_upload_timeout() -> u64 {
    30
}

fn default_max_rounds() -> usize {
    64
}

fn default_max_events_per_request() -> usize {
    100
}

/// Queue storage backend
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// JSON files with `.backup` copies
    #[default]
    File,
    /// Single SQLite database
    Sqlite,
    /// Not persisted
    Memory,
}

/// Queue storage configuration
#[derive(Debug, Deserialize, Default, Clone)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Directory holding queue files; defaults to the XDG data dir
    pub dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Effective storage directory
    pub fn dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(Config::data_dir)
    }
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Reject a missing or whitespace-only server URL
pub fn validate_server_url(url: &str) -> Result<&str> {
    let url = url.trim();
    if url.is_empty() {
        return Err(Error::Config("invalid server url".to_string()));
    }
    Ok(url.trim_end_matches('/'))
}

/// Reject a missing or whitespace-only app key
pub fn validate_app_key(app_key: &str) -> Result<&str> {
    let app_key = app_key.trim();
    if app_key.is_empty() {
        return Err(Error::Config("invalid application key".to_string()));
    }
    Ok(app_key)
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.server.url {
            validate_server_url(url)?;
        }
        if let Some(app_key) = &self.server.app_key {
            validate_app_key(app_key)?;
        }
        if self.session.heartbeat_interval_secs == 0 {
            return Err(Error::Config(
                "session.heartbeat_interval_secs must be positive".to_string(),
            ));
        }
        if self.upload.max_rounds == 0 {
            return Err(Error::Config("upload.max_rounds must be positive".to_string()));
        }
        if self.upload.max_events_per_request == 0 {
            return Err(Error::Config(
                "upload.max_events_per_request must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/beacon/config.toml` (~/.config/beacon/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("beacon").join("config.toml")
    }

    /// Returns the data directory path (for the upload queue)
    ///
    /// `$XDG_DATA_HOME/beacon/` (~/.local/share/beacon/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("beacon")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/beacon/` (~/.local/state/beacon/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("beacon")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/beacon/beacon.log` (~/.local/state/beacon/beacon.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("beacon.log")
    }
}
