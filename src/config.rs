//! Configuration module for mailsink.

use serde::Deserialize;
use std::path::Path;

use crate::{MailsinkError, Result};

/// SMTP receiver configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    /// Host address to bind.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port number to listen on.
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    /// Domain announced in the greeting.
    #[serde(default = "default_domain")]
    pub domain: String,
    /// Maximum accepted message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Maximum recipients per transaction.
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,
    /// Maximum number of concurrent connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Read timeout in seconds for a single command line.
    #[serde(default = "default_smtp_timeout")]
    pub timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_smtp_port() -> u16 {
    1025
}

fn default_domain() -> String {
    "mailsink.local".to_string()
}

fn default_max_message_size() -> usize {
    10 * 1024 * 1024 // 10MB
}

fn default_max_recipients() -> usize {
    100
}

fn default_max_connections() -> usize {
    100
}

fn default_smtp_timeout() -> u64 {
    30
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_smtp_port(),
            domain: default_domain(),
            max_message_size: default_max_message_size(),
            max_recipients: default_max_recipients(),
            max_connections: default_max_connections(),
            timeout_secs: default_smtp_timeout(),
        }
    }
}

/// HTTP API configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Host address to bind.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port number for the API.
    #[serde(default = "default_http_port")]
    pub port: u16,
    /// CORS allowed origins (empty = any origin).
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_http_port() -> u16 {
    8080
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_http_port(),
            cors_origins: Vec::new(),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
    /// Try to enable the FTS5 full-text index.
    ///
    /// When false (or when FTS5 is unavailable) search falls back to
    /// substring matching.
    #[serde(default = "default_full_text_search")]
    pub full_text_search: bool,
    /// Seconds to wait for an in-flight write when closing.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_db_path() -> String {
    "data/mailsink.db".to_string()
}

fn default_full_text_search() -> bool {
    true
}

fn default_shutdown_grace() -> u64 {
    10
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            full_text_search: default_full_text_search(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

/// Retention policy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Whether the retention sweeper runs at all.
    #[serde(default = "default_retention_enabled")]
    pub enabled: bool,
    /// Maximum message age in hours (0 = unlimited).
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,
    /// Maximum number of stored messages (0 = unlimited).
    #[serde(default = "default_max_count")]
    pub max_count: u64,
    /// Interval between sweeps in seconds.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

fn default_retention_enabled() -> bool {
    true
}

fn default_max_age_hours() -> u64 {
    7 * 24 // 7 days
}

fn default_max_count() -> u64 {
    1000
}

fn default_cleanup_interval() -> u64 {
    3600 // 1 hour
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: default_retention_enabled(),
            max_age_hours: default_max_age_hours(),
            max_count: default_max_count(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

/// Event hub configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Outbound queue capacity per subscriber.
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
}

fn default_subscriber_capacity() -> usize {
    256
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: default_subscriber_capacity(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional path to a log file written in addition to stdout.
    #[serde(default)]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// SMTP receiver configuration.
    #[serde(default)]
    pub smtp: SmtpConfig,
    /// HTTP API configuration.
    #[serde(default)]
    pub http: HttpConfig,
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Retention configuration.
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Event hub configuration.
    #[serde(default)]
    pub hub: HubConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(MailsinkError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    ///
    /// A missing file yields the defaults (still subject to overrides).
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = if path.as_ref().exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| MailsinkError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `MAILSINK_SMTP_PORT`
    /// - `MAILSINK_HTTP_PORT`
    /// - `MAILSINK_DB_PATH`
    /// - `MAILSINK_LOG_LEVEL`
    /// - `MAILSINK_RETENTION_MAX_AGE_HOURS`
    /// - `MAILSINK_RETENTION_MAX_COUNT`
    ///
    /// Empty values are ignored.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(port) = env_parsed("MAILSINK_SMTP_PORT")? {
            self.smtp.port = port;
        }
        if let Some(port) = env_parsed("MAILSINK_HTTP_PORT")? {
            self.http.port = port;
        }
        if let Some(path) = env_value("MAILSINK_DB_PATH") {
            self.storage.path = path;
        }
        if let Some(level) = env_value("MAILSINK_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(hours) = env_parsed("MAILSINK_RETENTION_MAX_AGE_HOURS")? {
            self.retention.max_age_hours = hours;
        }
        if let Some(count) = env_parsed("MAILSINK_RETENTION_MAX_COUNT")? {
            self.retention.max_count = count;
        }
        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.smtp.port == 0 || self.http.port == 0 {
            return Err(MailsinkError::Config("ports must be non-zero".to_string()));
        }
        if self.smtp.max_message_size == 0 {
            return Err(MailsinkError::Config(
                "smtp.max_message_size must be positive".to_string(),
            ));
        }
        if self.smtp.max_connections == 0 {
            return Err(MailsinkError::Config(
                "smtp.max_connections must be positive".to_string(),
            ));
        }
        if self.retention.enabled && self.retention.cleanup_interval_secs == 0 {
            return Err(MailsinkError::Config(
                "retention.cleanup_interval_secs must be positive".to_string(),
            ));
        }
        if self.hub.subscriber_capacity == 0 {
            return Err(MailsinkError::Config(
                "hub.subscriber_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env_value(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| MailsinkError::Config(format!("{name} has an invalid value: {raw}"))),
        None => Ok(None),
    }
}
