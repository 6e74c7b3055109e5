use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppError, Result};

const CONFIG_PATH_ENV: &str = "COMIC_READER_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Owner of every comic this process reads and writes.
    #[serde(default = "default_user_id")]
    pub user_id: i64,

    /// IANA zone that decides where "today" starts.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default)]
    pub include_nsfw: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub read_queue: ReadQueueConfig,

    #[serde(default)]
    pub feeds: FeedConfig,
}

/// What `submit_read` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressurePolicy {
    /// Wait for the worker to make room.
    #[default]
    Block,
    /// Refuse the event and count it as dropped.
    Drop,
    /// Ignore `capacity` and let the queue grow.
    Unbounded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadQueueConfig {
    pub capacity: usize,
    pub policy: BackpressurePolicy,
    pub write_timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_backoff_millis: u64,
}

impl Default for ReadQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            policy: BackpressurePolicy::Block,
            write_timeout_secs: 5,
            max_attempts: 3,
            retry_backoff_millis: 250,
        }
    }
}

impl ReadQueueConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub user_agent: String,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Feeds fetched at once during a refresh.
    pub concurrency: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("comic-reader/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: 30,
            connect_timeout_secs: 10,
            concurrency: 5,
        }
    }
}

fn default_db_path() -> String {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("comic-reader");
    std::fs::create_dir_all(&data_dir).ok();
    data_dir.join("comics.db").to_string_lossy().to_string()
}

fn default_user_id() -> i64 {
    1
}

fn default_timezone() -> String {
    "America/Los_Angeles".to_string()
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            user_id: default_user_id(),
            timezone: default_timezone(),
            include_nsfw: false,
            log_level: default_log_level(),
            read_queue: ReadQueueConfig::default(),
            feeds: FeedConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Reads `path`, writing a default config there first if it is missing.
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str::<Config>(&content)?
        } else {
            let config = Config::default();
            config.save_to(path)?;
            config
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| AppError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("comic-reader")
            .join("config.toml")
    }

    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| AppError::Config(format!("invalid timezone '{}': {}", self.timezone, e)))
    }

    fn validate(&self) -> Result<()> {
        self.tz()?;
        if self.user_id <= 0 {
            return Err(AppError::Config(format!("user_id must be positive, got {}", self.user_id)));
        }
        if self.read_queue.policy != BackpressurePolicy::Unbounded && self.read_queue.capacity == 0 {
            return Err(AppError::Config("read_queue.capacity must be at least 1".to_string()));
        }
        if self.read_queue.max_attempts == 0 {
            return Err(AppError::Config("read_queue.max_attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}
