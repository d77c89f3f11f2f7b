//! Configuration management for rowqueue.
//!
//! Configuration can be built in code, loaded from a TOML file, or read from
//! `ROWQUEUE_*` environment variables. Durations are written as human-readable
//! strings such as `"30s"`, `"5m"`, `"1h"`, or `"7d"`.

use crate::{RowQueueError, events::DEFAULT_EVENT_BUFFER_SIZE, plans};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Module for serializing std::time::Duration as human-readable strings
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(D::Error::custom)
    }

    pub fn format_duration(duration: &Duration) -> String {
        let secs = duration.as_secs();
        if duration.subsec_millis() > 0 {
            format!("{}ms", duration.as_millis())
        } else if secs == 0 {
            "0s".to_string()
        } else if secs % 86400 == 0 {
            format!("{}d", secs / 86400)
        } else if secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{}s", secs)
        }
    }

    /// Parse a duration string like "500ms", "30s", "5m", "1h", "7d", or "90".
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();

        // bare numbers are seconds
        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Duration::from_secs(secs));
        }

        if let Some(millis) = s.strip_suffix("ms") {
            return millis
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| format!("Invalid number in duration: {}", millis));
        }

        if s.len() < 2 {
            return Err(format!("Invalid duration format: {}", s));
        }

        let (num_str, suffix) = s.split_at(s.len() - 1);
        let num: u64 = num_str
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

        let multiplier = match suffix {
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            "d" => 86400,
            _ => {
                return Err(format!(
                    "Invalid duration suffix: {}. Use ms, s, m, h, or d",
                    suffix
                ));
            }
        };
        num.checked_mul(multiplier)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("Duration out of range: {}", s))
    }
}

/// Same as `duration_secs`, for optional fields.
mod duration_secs_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => serializer.serialize_str(&super::duration_secs::format_duration(duration)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let s = Option::<String>::deserialize(deserializer)?;
        s.map(|s| super::duration_secs::parse_duration(&s).map_err(D::Error::custom))
            .transpose()
    }
}

/// Main configuration for a rowqueue instance.
///
/// # Examples
///
/// ```rust
/// use rowqueue::config::Config;
/// use std::time::Duration;
///
/// let config = Config::new()
///     .with_database_url("postgresql://localhost/jobs")
///     .with_schema("jobs")
///     .with_new_job_check_interval(Duration::from_millis(500));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// PostgreSQL schema that holds the queue tables
    pub schema: String,

    pub database: DatabaseConfig,

    pub worker: WorkerConfig,

    pub maintenance: MaintenanceConfig,

    pub events: EventsConfig,

    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema: "rowqueue".to_string(),
            database: DatabaseConfig::default(),
            worker: WorkerConfig::default(),
            maintenance: MaintenanceConfig::default(),
            events: EventsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database_url(mut self, url: &str) -> Self {
        self.database.url = url.to_string();
        self
    }

    pub fn with_pool_size(mut self, size: u32) -> Self {
        self.database.pool_size = size;
        self
    }

    pub fn with_schema(mut self, schema: &str) -> Self {
        self.schema = schema.to_string();
        self
    }

    pub fn with_new_job_check_interval(mut self, interval: Duration) -> Self {
        self.worker.new_job_check_interval = interval;
        self
    }

    /// Enable or disable the background supervisor
    pub fn with_maintenance(mut self, enabled: bool) -> Self {
        self.maintenance.enabled = enabled;
        self
    }

    pub fn with_monitor_state_interval(mut self, interval: Duration) -> Self {
        self.maintenance.monitor_state_interval = Some(interval);
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file(&self, path: &str) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("ROWQUEUE_DATABASE_URL") {
            config.database.url = url;
        }
        if let Ok(pool_size) = std::env::var("ROWQUEUE_DATABASE_POOL_SIZE") {
            config.database.pool_size = pool_size.parse().unwrap_or(config.database.pool_size);
        }
        if let Ok(name) = std::env::var("ROWQUEUE_APPLICATION_NAME") {
            config.database.application_name = name;
        }
        if let Ok(schema) = std::env::var("ROWQUEUE_SCHEMA") {
            config.schema = schema;
        }
        if let Ok(interval) = std::env::var("ROWQUEUE_NEW_JOB_CHECK_INTERVAL") {
            config.worker.new_job_check_interval =
                duration_secs::parse_duration(&interval).map_err(RowQueueError::Config)?;
        }
        if let Ok(enabled) = std::env::var("ROWQUEUE_MAINTENANCE_ENABLED") {
            config.maintenance.enabled = enabled.parse().unwrap_or(config.maintenance.enabled);
        }
        if let Ok(interval) = std::env::var("ROWQUEUE_MONITOR_STATE_INTERVAL") {
            config.maintenance.monitor_state_interval =
                Some(duration_secs::parse_duration(&interval).map_err(RowQueueError::Config)?);
        }
        if let Ok(buffer_size) = std::env::var("ROWQUEUE_EVENT_BUFFER_SIZE") {
            config.events.buffer_size = buffer_size.parse().unwrap_or(config.events.buffer_size);
        }
        if let Ok(level) = std::env::var("ROWQUEUE_LOG_LEVEL") {
            config.logging.level = level;
        }

        Ok(config)
    }

    /// Rejects settings the queue cannot run with.
    pub fn validate(&self) -> crate::Result<()> {
        plans::validate_schema_name(&self.schema)
            .map_err(|e| RowQueueError::Config(e.to_string()))?;

        if self.database.pool_size == 0 {
            return Err(RowQueueError::Config(
                "database.pool_size must be at least 1".to_string(),
            ));
        }
        if self.worker.new_job_check_interval < crate::options::MIN_NEW_JOB_CHECK_INTERVAL {
            return Err(RowQueueError::Config(format!(
                "worker.new_job_check_interval must be at least {:?}",
                crate::options::MIN_NEW_JOB_CHECK_INTERVAL
            )));
        }
        if self.events.buffer_size == 0 {
            return Err(RowQueueError::Config(
                "events.buffer_size must be at least 1".to_string(),
            ));
        }

        let maintenance = &self.maintenance;
        let intervals = [
            ("expire_check_interval", Some(maintenance.expire_check_interval)),
            ("archive_check_interval", Some(maintenance.archive_check_interval)),
            ("delete_check_interval", Some(maintenance.delete_check_interval)),
            ("monitor_state_interval", maintenance.monitor_state_interval),
        ];
        for (field, interval) in intervals {
            if interval.is_some_and(|interval| interval.is_zero()) {
                return Err(RowQueueError::Config(format!(
                    "maintenance.{} must be greater than zero",
                    field
                )));
            }
        }
        for (field, age) in [
            ("archive_completed_after", maintenance.archive_completed_after),
            ("delete_archived_after", maintenance.delete_archived_after),
        ] {
            if i32::try_from(age.as_secs()).is_err() {
                return Err(RowQueueError::Config(format!(
                    "maintenance.{} is too large",
                    field
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,

    /// Maximum number of pooled connections
    pub pool_size: u32,

    /// Reported to PostgreSQL as `application_name`
    pub application_name: String,

    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/rowqueue".to_string(),
            pool_size: 10,
            application_name: "rowqueue".to_string(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Default poll interval for subscriptions
    #[serde(with = "duration_secs")]
    pub new_job_check_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            new_job_check_interval: crate::options::DEFAULT_NEW_JOB_CHECK_INTERVAL,
        }
    }
}

/// Cadence and retention of the supervisor sweeps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Run the supervisor from `JobQueue::start`
    pub enabled: bool,

    #[serde(with = "duration_secs")]
    pub expire_check_interval: Duration,

    #[serde(with = "duration_secs")]
    pub archive_check_interval: Duration,

    /// Age after completion at which a job moves to the archive
    #[serde(with = "duration_secs")]
    pub archive_completed_after: Duration,

    #[serde(with = "duration_secs")]
    pub delete_check_interval: Duration,

    /// Age in the archive at which a job is deleted
    #[serde(with = "duration_secs")]
    pub delete_archived_after: Duration,

    /// Emit state counts on this cadence; off when unset
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "duration_secs_opt"
    )]
    pub monitor_state_interval: Option<Duration>,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            expire_check_interval: Duration::from_secs(60),
            archive_check_interval: Duration::from_secs(60 * 60),
            archive_completed_after: Duration::from_secs(60 * 60),
            delete_check_interval: Duration::from_secs(60 * 60),
            delete_archived_after: Duration::from_secs(7 * 24 * 60 * 60),
            monitor_state_interval: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    /// Capacity of each broadcast channel
    pub buffer_size: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
