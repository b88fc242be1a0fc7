//! Configuration module for tributary.

use serde::Deserialize;
use std::path::Path;

use crate::{Result, TributaryError};

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL (`sqlite://...` or `postgres://...`).
    #[serde(default = "default_db_url")]
    pub url: String,
    /// Maximum number of pooled connections.
    #[serde(default = "default_db_max_connections")]
    pub max_connections: u32,
}

fn default_db_url() -> String {
    "sqlite://data/tributary.db".to_string()
}

fn default_db_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_db_url(),
            max_connections: default_db_max_connections(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/tributary.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Poller configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    /// Whether the background poller runs at all.
    #[serde(default = "default_poller_enabled")]
    pub enabled: bool,
    /// Seconds between ticks.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Maximum due feeds picked up per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Feeds processed in parallel within one tick.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    /// Minimum seconds between two manual refresh requests for a feed.
    #[serde(default = "default_manual_refresh_cooldown")]
    pub manual_refresh_cooldown_secs: u64,
}

fn default_poller_enabled() -> bool {
    true
}

fn default_tick_interval() -> u64 {
    10
}

fn default_batch_size() -> u32 {
    100
}

fn default_worker_concurrency() -> usize {
    1
}

fn default_manual_refresh_cooldown() -> u64 {
    600
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: default_poller_enabled(),
            tick_interval_secs: default_tick_interval(),
            batch_size: default_batch_size(),
            worker_concurrency: default_worker_concurrency(),
            manual_refresh_cooldown_secs: default_manual_refresh_cooldown(),
        }
    }
}

/// Feed fetcher configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FetcherConfig {
    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Total request timeout in seconds.
    #[serde(default = "default_total_timeout")]
    pub total_timeout_secs: u64,
    /// Maximum number of redirects.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    /// Maximum feed document size in bytes.
    #[serde(default = "default_max_feed_size")]
    pub max_feed_size_bytes: u64,
    /// Maximum entries considered per fetch.
    #[serde(default = "default_max_items")]
    pub max_items_per_feed: usize,
    /// User-Agent header sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Allow loopback/private hosts. Only meant for tests.
    #[serde(default)]
    pub allow_private_hosts: bool,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_total_timeout() -> u64 {
    30
}

fn default_max_redirects() -> usize {
    5
}

fn default_max_feed_size() -> u64 {
    5 * 1024 * 1024
}

fn default_max_items() -> usize {
    100
}

fn default_user_agent() -> String {
    format!("tributary/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            total_timeout_secs: default_total_timeout(),
            max_redirects: default_max_redirects(),
            max_feed_size_bytes: default_max_feed_size(),
            max_items_per_feed: default_max_items(),
            user_agent: default_user_agent(),
            allow_private_hosts: false,
        }
    }
}

/// Inline image handling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ImagesConfig {
    /// Maximum images handled per item, including the limit notice slot.
    #[serde(default = "default_max_images")]
    pub max_images_per_item: usize,
    /// Time budget shared by all image downloads of one item, in seconds.
    #[serde(default = "default_time_budget")]
    pub time_budget_secs: u64,
    /// Maximum size of a single image in bytes.
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: u64,
}

fn default_max_images() -> usize {
    20
}

fn default_time_budget() -> u64 {
    60
}

fn default_max_image_bytes() -> u64 {
    10 * 1024 * 1024
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            max_images_per_item: default_max_images(),
            time_budget_secs: default_time_budget(),
            max_image_bytes: default_max_image_bytes(),
        }
    }
}

/// Media storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    /// Directory holding stored media files.
    #[serde(default = "default_media_path")]
    pub storage_path: String,
    /// URL prefix under which stored media is served.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

fn default_media_path() -> String {
    "data/media".to_string()
}

fn default_public_base_url() -> String {
    "/media".to_string()
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            storage_path: default_media_path(),
            public_base_url: default_public_base_url(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Poller configuration.
    #[serde(default)]
    pub poller: PollerConfig,
    /// Fetcher configuration.
    #[serde(default)]
    pub fetcher: FetcherConfig,
    /// Image handling configuration.
    #[serde(default)]
    pub images: ImagesConfig,
    /// Media storage configuration.
    #[serde(default)]
    pub media: MediaConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(TributaryError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    ///
    /// A missing file yields the defaults.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = if path.as_ref().exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| TributaryError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `TRIBUTARY_DATABASE_URL`: Override the database URL
    /// - `TRIBUTARY_LOG_LEVEL`: Override the log level
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("TRIBUTARY_DATABASE_URL") {
            if !url.is_empty() {
                self.database.url = url;
            }
        }
        if let Ok(level) = std::env::var("TRIBUTARY_LOG_LEVEL") {
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.database.url.trim().is_empty() {
            return Err(TributaryError::Config("database.url must not be empty".into()));
        }
        if self.poller.tick_interval_secs == 0 {
            return Err(TributaryError::Config(
                "poller.tick_interval_secs must be greater than 0".into(),
            ));
        }
        if self.poller.batch_size == 0 {
            return Err(TributaryError::Config(
                "poller.batch_size must be greater than 0".into(),
            ));
        }
        if self.poller.worker_concurrency == 0 {
            return Err(TributaryError::Config(
                "poller.worker_concurrency must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.database.url, "sqlite://data/tributary.db");
        assert_eq!(config.database.max_connections, 5);

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.file, "logs/tributary.log");

        assert!(config.poller.enabled);
        assert_eq!(config.poller.tick_interval_secs, 10);
        assert_eq!(config.poller.batch_size, 100);
        assert_eq!(config.poller.worker_concurrency, 1);
        assert_eq!(config.poller.manual_refresh_cooldown_secs, 600);

        assert_eq!(config.fetcher.connect_timeout_secs, 10);
        assert_eq!(config.fetcher.total_timeout_secs, 30);
        assert_eq!(config.fetcher.max_redirects, 5);
        assert_eq!(config.fetcher.max_feed_size_bytes, 5 * 1024 * 1024);
        assert_eq!(config.fetcher.max_items_per_feed, 100);
        assert!(config.fetcher.user_agent.starts_with("tributary/"));
        assert!(!config.fetcher.allow_private_hosts);

        assert_eq!(config.images.max_images_per_item, 20);
        assert_eq!(config.images.time_budget_secs, 60);
        assert_eq!(config.images.max_image_bytes, 10 * 1024 * 1024);

        assert_eq!(config.media.storage_path, "data/media");
        assert_eq!(config.media.public_base_url, "/media");
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[database]
url = "postgres://localhost/tributary"
max_connections = 10

[logging]
level = "debug"
file = "custom/tributary.log"

[poller]
enabled = false
tick_interval_secs = 5
batch_size = 50
worker_concurrency = 4
manual_refresh_cooldown_secs = 120

[fetcher]
connect_timeout_secs = 3
total_timeout_secs = 15
max_redirects = 2
max_feed_size_bytes = 1048576
max_items_per_feed = 25
user_agent = "custom-agent"
allow_private_hosts = true

[images]
max_images_per_item = 5
time_budget_secs = 30
max_image_bytes = 2048

[media]
storage_path = "/var/lib/tributary/media"
public_base_url = "https://cdn.example.com/media"
"#;
        let config = Config::parse(toml).unwrap();

        assert_eq!(config.database.url, "postgres://localhost/tributary");
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.file, "custom/tributary.log");
        assert!(!config.poller.enabled);
        assert_eq!(config.poller.tick_interval_secs, 5);
        assert_eq!(config.poller.batch_size, 50);
        assert_eq!(config.poller.worker_concurrency, 4);
        assert_eq!(config.poller.manual_refresh_cooldown_secs, 120);
        assert_eq!(config.fetcher.connect_timeout_secs, 3);
        assert_eq!(config.fetcher.total_timeout_secs, 15);
        assert_eq!(config.fetcher.max_redirects, 2);
        assert_eq!(config.fetcher.max_feed_size_bytes, 1048576);
        assert_eq!(config.fetcher.max_items_per_feed, 25);
        assert_eq!(config.fetcher.user_agent, "custom-agent");
        assert!(config.fetcher.allow_private_hosts);
        assert_eq!(config.images.max_images_per_item, 5);
        assert_eq!(config.images.time_budget_secs, 30);
        assert_eq!(config.images.max_image_bytes, 2048);
        assert_eq!(config.media.storage_path, "/var/lib/tributary/media");
        assert_eq!(config.media.public_base_url, "https://cdn.example.com/media");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[poller]
tick_interval_secs = 30
"#;
        let config = Config::parse(toml).unwrap();

        assert_eq!(config.poller.tick_interval_secs, 30);
        assert_eq!(config.poller.batch_size, 100);
        assert_eq!(config.database.url, "sqlite://data/tributary.db");
    }

    #[test]
    fn test_parse_empty_config() {
        let config = Config::parse("").unwrap();

        assert_eq!(config.poller.tick_interval_secs, 10);
        assert_eq!(config.images.max_images_per_item, 20);
    }

    #[test]
    fn test_parse_invalid_config() {
        let toml = "this is not valid toml [[[";
        let result = Config::parse(toml);

        assert!(result.is_err());
        if let Err(TributaryError::Config(msg)) = result {
            assert!(msg.contains("config parse error"));
        } else {
            panic!("Expected Config error");
        }
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = Config::load("nonexistent.toml");

        assert!(result.is_err());
        assert!(matches!(result, Err(TributaryError::Io(_))));
    }

    #[test]
    fn test_load_with_env_missing_file_uses_defaults() {
        let config = Config::load_with_env("definitely-missing-tributary.toml").unwrap();
        assert_eq!(config.poller.batch_size, 100);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[poller]\nbatch_size = 7\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.poller.batch_size, 7);
    }

    #[test]
    fn test_apply_env_overrides() {
        let original_url = std::env::var("TRIBUTARY_DATABASE_URL").ok();
        let original_level = std::env::var("TRIBUTARY_LOG_LEVEL").ok();

        std::env::set_var("TRIBUTARY_DATABASE_URL", "sqlite://env.db");
        std::env::set_var("TRIBUTARY_LOG_LEVEL", "");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.database.url, "sqlite://env.db");
        // Empty values do not override
        assert_eq!(config.logging.level, "info");

        match original_url {
            Some(val) => std::env::set_var("TRIBUTARY_DATABASE_URL", val),
            None => std::env::remove_var("TRIBUTARY_DATABASE_URL"),
        }
        match original_level {
            Some(val) => std::env::set_var("TRIBUTARY_LOG_LEVEL", val),
            None => std::env::remove_var("TRIBUTARY_LOG_LEVEL"),
        }
    }

    #[test]
    fn test_validate_default() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_zero_tick_interval() {
        let mut config = Config::default();
        config.poller.tick_interval_secs = 0;

        let result = config.validate();
        if let Err(TributaryError::Config(msg)) = result {
            assert!(msg.contains("tick_interval_secs"));
        } else {
            panic!("Expected Config error");
        }
    }

    #[test]
    fn test_validate_zero_concurrency() {
        let mut config = Config::default();
        config.poller.worker_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_batch_size() {
        let mut config = Config::default();
        config.poller.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_database_url() {
        let mut config = Config::default();
        config.database.url = "  ".to_string();
        assert!(config.validate().is_err());
    }
}
