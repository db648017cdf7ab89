//! Configuration management for postrelay
//!
//! This module handles loading and validating configuration from environment
//! variables and TOML files, and converting it into the settings each
//! component takes.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

use crate::error::{Error, Result};
use crate::listener::ListenerConfig;
use crate::scheduler::{SchedulerConfig, DEFAULT_TIMEZONE};
use crate::storage::PostgresConfig;
use crate::transport::GatewayConfig;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Scheduler configuration
    pub scheduler: SchedulerSettings,

    /// Cache configuration
    pub cache: CacheSettings,

    /// Retry sweep configuration
    pub retry: RetrySettings,

    /// Publisher configuration
    pub publisher: PublisherSettings,

    /// Database and change-notification configuration
    pub database: DatabaseSettings,

    /// Session gateway configuration
    pub transport: TransportSettings,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Scheduler-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Seconds between scheduler passes
    pub check_interval_secs: u64,

    /// Maximum distance in seconds between now and a slot
    pub tolerance_secs: u64,

    /// Seconds between handing consecutive due tasks off
    pub stagger_secs: u64,

    /// IANA time zone the slots are expressed in
    pub timezone: String,

    /// Seconds a task stays suppressed after triggering
    pub dedup_window_secs: u64,

    /// Age in seconds after which dedup entries are pruned
    pub dedup_prune_secs: u64,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheSettings {
    /// Content feed TTL in seconds
    pub content_ttl_secs: u64,

    /// Resolved peer TTL in seconds
    pub peer_ttl_secs: u64,

    /// Metadata refresh interval in seconds
    pub metadata_refresh_secs: u64,

    /// Most recent messages fetched per source
    pub fetch_limit: usize,
}

/// Retry sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    /// Seconds between sweeps
    pub interval_secs: u64,

    /// Failures after which an entry is dropped; unbounded when unset
    pub max_attempts: Option<u32>,
}

/// Publisher configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PublisherSettings {
    /// Pause between individually sent album items, in milliseconds
    pub album_pacing_ms: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseSettings {
    /// PostgreSQL connection string
    pub url: String,

    /// Maximum pool size
    pub pool_size: usize,

    /// Channel the change triggers notify on
    pub notify_channel: String,

    /// Seconds before the listener reconnects
    pub listen_reconnect_secs: u64,
}

/// Session gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportSettings {
    /// Gateway base URL
    pub gateway_url: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Live event poll interval in seconds
    pub event_poll_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

/// Parse `key` from the environment, falling back to `default`
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Connection URL from `DATABASE_URL` or the `DB_*` parts
fn database_url_from_env() -> String {
    if let Ok(url) = std::env::var("DATABASE_URL") {
        return url;
    }

    let user = std::env::var("DB_USER").unwrap_or_else(|_| String::from("botuser"));
    let pass = std::env::var("DB_PASS").unwrap_or_else(|_| String::from("botpass"));
    let host = std::env::var("DB_HOST").unwrap_or_else(|_| String::from("postgres"));
    let port = std::env::var("DB_PORT").unwrap_or_else(|_| String::from("5432"));
    let name = std::env::var("DB_NAME").unwrap_or_else(|_| String::from("bot_manager"));

    format!("postgresql://{user}:{pass}@{host}:{port}/{name}")
}

/// Time zone from `POSTRELAY_TIMEZONE`, then `TZ` when it names a zone
fn timezone_from_env() -> String {
    if let Ok(tz) = std::env::var("POSTRELAY_TIMEZONE") {
        return tz;
    }
    std::env::var("TZ")
        .ok()
        .filter(|tz| tz.parse::<Tz>().is_ok())
        .unwrap_or_else(|| DEFAULT_TIMEZONE.name().to_string())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let d = Self::default();

        let max_attempts = std::env::var("POSTRELAY_RETRY_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.trim().parse::<u32>().ok());

        Ok(Self {
            scheduler: SchedulerSettings {
                check_interval_secs: env_or("POSTRELAY_CHECK_INTERVAL", d.scheduler.check_interval_secs),
                tolerance_secs: env_or("POSTRELAY_TRIGGER_TOLERANCE", d.scheduler.tolerance_secs),
                stagger_secs: env_or("POSTRELAY_STAGGER", d.scheduler.stagger_secs),
                timezone: timezone_from_env(),
                dedup_window_secs: env_or("POSTRELAY_DEDUP_WINDOW", d.scheduler.dedup_window_secs),
                dedup_prune_secs: env_or("POSTRELAY_DEDUP_PRUNE", d.scheduler.dedup_prune_secs),
            },
            cache: CacheSettings {
                content_ttl_secs: env_or("POSTRELAY_CONTENT_TTL", d.cache.content_ttl_secs),
                peer_ttl_secs: env_or("POSTRELAY_PEER_TTL", d.cache.peer_ttl_secs),
                metadata_refresh_secs: env_or("POSTRELAY_METADATA_REFRESH", d.cache.metadata_refresh_secs),
                fetch_limit: env_or("POSTRELAY_FETCH_LIMIT", d.cache.fetch_limit),
            },
            retry: RetrySettings {
                interval_secs: env_or("POSTRELAY_RETRY_INTERVAL", d.retry.interval_secs),
                max_attempts,
            },
            publisher: PublisherSettings {
                album_pacing_ms: env_or("POSTRELAY_ALBUM_PACING_MS", d.publisher.album_pacing_ms),
            },
            database: DatabaseSettings {
                url: database_url_from_env(),
                pool_size: env_or("POSTRELAY_DB_POOL_SIZE", d.database.pool_size),
                notify_channel: std::env::var("POSTRELAY_NOTIFY_CHANNEL")
                    .unwrap_or(d.database.notify_channel),
                listen_reconnect_secs: env_or("POSTRELAY_LISTEN_RECONNECT", d.database.listen_reconnect_secs),
            },
            transport: TransportSettings {
                gateway_url: std::env::var("POSTRELAY_GATEWAY_URL").unwrap_or(d.transport.gateway_url),
                timeout_secs: env_or("POSTRELAY_GATEWAY_TIMEOUT", d.transport.timeout_secs),
                event_poll_secs: env_or("POSTRELAY_EVENT_POLL", d.transport.event_poll_secs),
            },
            logging: LoggingConfig {
                level: std::env::var("POSTRELAY_LOG_LEVEL").unwrap_or(d.logging.level),
                format: std::env::var("POSTRELAY_LOG_FORMAT").unwrap_or(d.logging.format),
            },
        })
    }

    /// Load configuration from a TOML file; missing keys take defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::with_source(format!("Failed to read config file: {}", path.display()), e)
        })?;

        toml::from_str(&content).map_err(|e| {
            Error::config(format!(
                "Failed to parse TOML config file {}: {e}",
                path.display()
            ))
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("scheduler.check_interval_secs", self.scheduler.check_interval_secs),
            ("scheduler.dedup_window_secs", self.scheduler.dedup_window_secs),
            ("scheduler.dedup_prune_secs", self.scheduler.dedup_prune_secs),
            ("cache.content_ttl_secs", self.cache.content_ttl_secs),
            ("cache.peer_ttl_secs", self.cache.peer_ttl_secs),
            ("cache.metadata_refresh_secs", self.cache.metadata_refresh_secs),
            ("retry.interval_secs", self.retry.interval_secs),
            ("transport.timeout_secs", self.transport.timeout_secs),
            ("transport.event_poll_secs", self.transport.event_poll_secs),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(Error::config(format!("{name} must be greater than 0")));
        }

        if self.cache.fetch_limit == 0 {
            return Err(Error::config("cache.fetch_limit must be greater than 0"));
        }

        if self.database.pool_size == 0 {
            return Err(Error::config("database.pool_size must be greater than 0"));
        }

        if self.retry.max_attempts == Some(0) {
            return Err(Error::config("retry.max_attempts must be greater than 0 when set"));
        }

        if self.database.url.trim().is_empty() {
            return Err(Error::config("database.url must not be empty"));
        }

        if self.transport.gateway_url.trim().is_empty() {
            return Err(Error::config("transport.gateway_url must not be empty"));
        }

        if !matches!(
            self.logging.level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(Error::config(format!(
                "logging.level must be one of trace, debug, info, warn, error, got '{}'",
                self.logging.level
            )));
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(Error::config(format!(
                "logging.format must be text or json, got '{}'",
                self.logging.format
            )));
        }

        self.scheduler_config()?.validate()?;
        Ok(())
    }

    /// Process time zone
    pub fn timezone(&self) -> Result<Tz> {
        Ok(SchedulerConfig::parse_timezone(&self.scheduler.timezone)?)
    }

    pub fn scheduler_config(&self) -> Result<SchedulerConfig> {
        Ok(SchedulerConfig {
            check_interval: Duration::from_secs(self.scheduler.check_interval_secs),
            tolerance: Duration::from_secs(self.scheduler.tolerance_secs),
            stagger: Duration::from_secs(self.scheduler.stagger_secs),
            timezone: self.timezone()?,
        })
    }

    #[must_use]
    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.scheduler.dedup_window_secs)
    }

    #[must_use]
    pub fn dedup_prune_after(&self) -> Duration {
        Duration::from_secs(self.scheduler.dedup_prune_secs)
    }

    #[must_use]
    pub fn content_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.content_ttl_secs)
    }

    #[must_use]
    pub fn peer_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.peer_ttl_secs)
    }

    #[must_use]
    pub fn metadata_refresh(&self) -> Duration {
        Duration::from_secs(self.cache.metadata_refresh_secs)
    }

    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry.interval_secs)
    }

    #[must_use]
    pub fn album_pacing(&self) -> Duration {
        Duration::from_millis(self.publisher.album_pacing_ms)
    }

    pub fn postgres_config(&self) -> PostgresConfig {
        PostgresConfig::new(self.database.url.clone()).with_pool_size(self.database.pool_size)
    }

    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            database_url: self.database.url.clone(),
            channel: self.database.notify_channel.clone(),
            reconnect_delay: Duration::from_secs(self.database.listen_reconnect_secs),
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig::new(self.transport.gateway_url.clone())
            .with_timeout(Duration::from_secs(self.transport.timeout_secs))
            .with_event_poll_interval(Duration::from_secs(self.transport.event_poll_secs))
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            tolerance_secs: 25,
            stagger_secs: 2,
            timezone: DEFAULT_TIMEZONE.name().to_string(),
            dedup_window_secs: 60,
            dedup_prune_secs: 300,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            content_ttl_secs: 300,
            peer_ttl_secs: 3600,
            metadata_refresh_secs: 60,
            fetch_limit: crate::compose::DEFAULT_FETCH_LIMIT,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            interval_secs: 120,
            max_attempts: None,
        }
    }
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self { album_pacing_ms: 300 }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: PostgresConfig::default().database_url,
            pool_size: 8,
            notify_channel: String::from(crate::listener::DEFAULT_CHANNEL),
            listen_reconnect_secs: 2,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            gateway_url: String::from("http://localhost:8081"),
            timeout_secs: 30,
            event_poll_secs: 5,
        }
    }
}

impl LoggingConfig {
    /// Filter used when `RUST_LOG` is unset; `verbose` forces debug output
    pub fn filter_directive(&self, verbose: bool) -> String {
        if verbose {
            String::from("postrelay=debug,info")
        } else {
            format!("postrelay={},warn", self.level)
        }
    }

    /// Output format; an explicit command-line choice wins
    pub fn effective_format<'a>(&'a self, flag: Option<&'a str>) -> &'a str {
        flag.unwrap_or(&self.format)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scheduler: SchedulerSettings::default(),
            cache: CacheSettings::default(),
            retry: RetrySettings::default(),
            publisher: PublisherSettings::default(),
            database: DatabaseSettings::default(),
            transport: TransportSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}
