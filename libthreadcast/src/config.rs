//! Configuration management for Threadcast
//!
//! Every section has defaults, so a config file only needs the keys it
//! wants to override:
//!
//! ```toml
//! [database]
//! path = "~/.local/share/threadcast/threadcast.db"
//!
//! [storage]
//! root = "~/.local/share/threadcast/blobs"
//! public_base_url = "https://media.example.com"
//! signing_key = "change-me"
//!
//! [scheduler]
//! interval_secs = 60
//! grace_window_secs = 300
//!
//! [webdriver]
//! node_url = "http://selenium:4444"
//! preview_base_url = "http://threadcast-web"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub platforms: PlatformsConfig,
    pub webdriver: WebDriverConfig,
    pub media: MediaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/threadcast/threadcast.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory blobs are stored under
    pub root: String,
    /// Base URL the blob directory is served from, used for presigned URLs
    pub public_base_url: String,
    /// HMAC key for presigned URLs
    pub signing_key: String,
    pub presign_ttl_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: "~/.local/share/threadcast/blobs".to_string(),
            public_base_url: "http://localhost:8080/blobs".to_string(),
            signing_key: String::new(),
            presign_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_secs: u64,
    pub grace_window_secs: u64,
    pub media_jobs_interval_secs: u64,
    pub media_job_retention_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            grace_window_secs: 300,
            media_jobs_interval_secs: 60,
            media_job_retention_secs: 24 * 60 * 60,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn grace_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.grace_window_secs as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformsConfig {
    pub twitter_api_base: String,
    pub threads_api_base: String,
    /// Public AppView used to resolve quoted Bluesky posts
    pub bluesky_appview: String,
    /// Text-analysis service; the built-in extractor is used when unset
    pub text_analyzer_url: Option<String>,
    pub poll_interval_ms: u64,
    pub poll_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for PlatformsConfig {
    fn default() -> Self {
        Self {
            twitter_api_base: "https://api.x.com".to_string(),
            threads_api_base: "https://graph.threads.net/v1.0".to_string(),
            bluesky_appview: "https://public.api.bsky.app".to_string(),
            text_analyzer_url: None,
            poll_interval_ms: 2000,
            poll_timeout_secs: 300,
            request_timeout_secs: 60,
        }
    }
}

impl PlatformsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebDriverConfig {
    pub node_url: String,
    /// Site serving the `/quote/{platform}` preview pages
    pub preview_base_url: String,
    pub load_timeout_secs: u64,
}

impl Default for WebDriverConfig {
    fn default() -> Self {
        Self {
            node_url: "http://localhost:4444".to_string(),
            preview_base_url: "http://localhost:8080".to_string(),
            load_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub ffmpeg: String,
    pub ffprobe: String,
    /// TCP address accepting newline-separated "job ready" ids
    pub notify_addr: Option<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            notify_addr: None,
        }
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        Ok(config)
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("THREADCAST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("threadcast").join("config.toml"))
}
