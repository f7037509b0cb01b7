//! Process configuration, read once from the environment at startup.

use std::env;
use std::time::Duration;

use crate::error::{IndexerError, Result};
use crate::indexer::DeleteMode;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    pub brokers: Vec<String>,
    pub topic: String,
    pub partitions: u32,
    pub group: String,
    pub poll: Duration,
    pub lease_ttl: Duration,
    pub dead_letter_topic: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            brokers: vec!["redis://localhost:6379".to_string()],
            topic: "changes".to_string(),
            partitions: 4,
            group: "search-indexer".to_string(),
            poll: Duration::from_millis(5000),
            lease_ttl: Duration::from_millis(15000),
            dead_letter_topic: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexSettings {
    pub urls: Vec<String>,
    pub collection: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
    pub refresh_on_write: bool,
    /// Refresh the collection before a category fan-out so it matches
    /// documents written since the last refresh.
    pub refresh_before_fanout: bool,
    pub delete_mode: DeleteMode,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            urls: vec!["http://localhost:9200".to_string()],
            collection: "transactions".to_string(),
            username: None,
            password: None,
            timeout_secs: 30,
            refresh_on_write: false,
            refresh_before_fanout: true,
            delete_mode: DeleteMode::Overwrite,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub log: LogSettings,
    pub index: IndexSettings,
    pub retry: RetryPolicy,
    pub restart_delay: Duration,
    /// 0 disables the status server.
    pub status_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup. Unset or empty keys take
    /// their defaults; malformed values are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let log_defaults = LogSettings::default();
        let index_defaults = IndexSettings::default();

        let log = LogSettings {
            brokers: list(get("LOG_BROKERS"), log_defaults.brokers),
            topic: get("LOG_TOPIC").unwrap_or(log_defaults.topic),
            partitions: number(get("LOG_PARTITIONS"), "LOG_PARTITIONS", log_defaults.partitions)?,
            group: get("CONSUMER_GROUP").unwrap_or(log_defaults.group),
            poll: millis(get("LOG_POLL_MS"), "LOG_POLL_MS", log_defaults.poll)?,
            lease_ttl: millis(get("LEASE_TTL_MS"), "LEASE_TTL_MS", log_defaults.lease_ttl)?,
            dead_letter_topic: get("DEAD_LETTER_TOPIC"),
        };

        let delete_mode = match get("DELETE_MODE") {
            Some(raw) => DeleteMode::from_str(&raw).ok_or_else(|| {
                IndexerError::Config(format!(
                    "DELETE_MODE must be \"overwrite\" or \"merge-status\", got {:?}",
                    raw
                ))
            })?,
            None => index_defaults.delete_mode,
        };

        let index = IndexSettings {
            urls: list(get("INDEX_URLS"), index_defaults.urls),
            collection: get("INDEX_COLLECTION").unwrap_or(index_defaults.collection),
            username: get("INDEX_USERNAME"),
            password: get("INDEX_PASSWORD"),
            timeout_secs: number(
                get("INDEX_TIMEOUT_SECS"),
                "INDEX_TIMEOUT_SECS",
                index_defaults.timeout_secs,
            )?,
            refresh_on_write: flag(get("INDEX_REFRESH"), "INDEX_REFRESH", index_defaults.refresh_on_write)?,
            refresh_before_fanout: flag(
                get("INDEX_REFRESH_BEFORE_FANOUT"),
                "INDEX_REFRESH_BEFORE_FANOUT",
                index_defaults.refresh_before_fanout,
            )?,
            delete_mode,
        };

        let retry_defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: number(
                get("RETRY_MAX_ATTEMPTS"),
                "RETRY_MAX_ATTEMPTS",
                retry_defaults.max_attempts,
            )?,
            schedule: match get("RETRY_BACKOFF_MS") {
                Some(raw) => raw
                    .split(',')
                    .map(|part| {
                        part.trim().parse::<u64>().map(Duration::from_millis).map_err(|e| {
                            IndexerError::Config(format!(
                                "RETRY_BACKOFF_MS entry {:?} is not a number: {}",
                                part, e
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
                None => retry_defaults.schedule,
            },
        };

        let config = Self {
            log,
            index,
            retry,
            restart_delay: Duration::from_secs(number(
                get("PARTITION_RESTART_SECS"),
                "PARTITION_RESTART_SECS",
                10u64,
            )?),
            status_port: number(get("STATUS_PORT"), "STATUS_PORT", 8081u16)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.log.brokers.is_empty() {
            return Err(IndexerError::Config("LOG_BROKERS is empty".into()));
        }
        if self.index.urls.is_empty() {
            return Err(IndexerError::Config("INDEX_URLS is empty".into()));
        }
        if self.log.partitions == 0 {
            return Err(IndexerError::Config("LOG_PARTITIONS must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(IndexerError::Config("RETRY_MAX_ATTEMPTS must be at least 1".into()));
        }
        if self.retry.schedule.is_empty() {
            return Err(IndexerError::Config("RETRY_BACKOFF_MS is empty".into()));
        }
        // a lease must outlive one blocking read plus the renewal slack
        if self.log.lease_ttl <= self.log.poll * 2 {
            return Err(IndexerError::Config(format!(
                "LEASE_TTL_MS ({}) must be more than twice LOG_POLL_MS ({})",
                self.log.lease_ttl.as_millis(),
                self.log.poll.as_millis()
            )));
        }
        Ok(())
    }
}

fn list(raw: Option<String>, default: Vec<String>) -> Vec<String> {
    match raw {
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        None => default,
    }
}

fn number<T>(raw: Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| IndexerError::Config(format!("{} is not a valid number ({:?}): {}", key, raw, e))),
        None => Ok(default),
    }
}

fn millis(raw: Option<String>, key: &str, default: Duration) -> Result<Duration> {
    match raw {
        Some(_) => number(raw, key, 0u64).map(Duration::from_millis),
        None => Ok(default),
    }
}

fn flag(raw: Option<String>, key: &str, default: bool) -> Result<bool> {
    match raw.as_deref().map(str::trim) {
        Some("1") | Some("true") | Some("yes") => Ok(true),
        Some("0") | Some("false") | Some("no") => Ok(false),
        Some(other) => Err(IndexerError::Config(format!(
            "{} must be true or false, got {:?}",
            key, other
        ))),
        None => Ok(default),
    }
}
