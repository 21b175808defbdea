//! Service configuration loaded from environment variables.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::dispatcher::DispatcherConfig;
use crate::retry::RetryPolicy;

/// A configuration value that could not be used.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected 'text' or 'json', got '{other}'")),
        }
    }
}

/// Orchestrator configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` / `PORT`: admin HTTP bind address (default: `0.0.0.0:3000`)
/// - `DATABASE_URL`: PostgreSQL connection string; unset selects the in-memory store
/// - `DATABASE_MAX_CONNECTIONS`: pool size (default: `10`)
/// - `SAGA_QUEUE`: queue the saga consumes (default: `newsletter-sagas`)
/// - `LANE_COUNT`: ordering lanes (default: `5`)
/// - `PREFETCH_COUNT`: per-lane queue bound (default: `5`)
/// - `CONCURRENT_MESSAGE_LIMIT`: messages in flight across lanes (default: `20`)
/// - `RETRY_INTERVALS_MS`: comma-separated backoff steps (default: `1000,2000,5000`)
/// - `RETRY_LIMIT`: attempts per envelope before faulting (default: `7`)
/// - `SHUTDOWN_GRACE_SECS`: drain time for in-flight work (default: `30`)
/// - `ACTION_TIMEOUT_SECS`: time a step may take to answer (default: `300`)
/// - `OUTBOX_POLL_MS`: outbox relay poll interval (default: `1000`)
/// - `RUST_LOG`: tracing filter directive (default: `info`)
/// - `LOG_FORMAT`: `text` or `json` (default: `text`)
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub saga_queue: String,
    pub lane_count: usize,
    pub prefetch_count: usize,
    pub concurrent_message_limit: usize,
    pub retry_intervals: Vec<Duration>,
    pub retry_limit: u32,
    pub shutdown_grace: Duration,
    pub action_timeout: Duration,
    pub outbox_poll_interval: Duration,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            database_url: None,
            database_max_connections: 10,
            saga_queue: "newsletter-sagas".to_string(),
            lane_count: 5,
            prefetch_count: 5,
            concurrent_message_limit: 20,
            retry_intervals: vec![
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(5000),
            ],
            retry_limit: 7,
            shutdown_grace: Duration::from_secs(30),
            action_timeout: Duration::from_secs(300),
            outbox_poll_interval: Duration::from_millis(1000),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    ///
    /// Unset keys fall back to defaults; set but malformed keys are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse(&lookup, "PORT", defaults.port)?,
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            database_max_connections: positive(
                &lookup,
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,
            saga_queue: lookup("SAGA_QUEUE").unwrap_or(defaults.saga_queue),
            lane_count: positive(&lookup, "LANE_COUNT", defaults.lane_count)?,
            prefetch_count: positive(&lookup, "PREFETCH_COUNT", defaults.prefetch_count)?,
            concurrent_message_limit: positive(
                &lookup,
                "CONCURRENT_MESSAGE_LIMIT",
                defaults.concurrent_message_limit,
            )?,
            retry_intervals: match lookup("RETRY_INTERVALS_MS") {
                Some(raw) => parse_intervals(&raw)?,
                None => defaults.retry_intervals,
            },
            retry_limit: positive(&lookup, "RETRY_LIMIT", defaults.retry_limit)?,
            shutdown_grace: Duration::from_secs(parse(
                &lookup,
                "SHUTDOWN_GRACE_SECS",
                defaults.shutdown_grace.as_secs(),
            )?),
            action_timeout: Duration::from_secs(positive(
                &lookup,
                "ACTION_TIMEOUT_SECS",
                defaults.action_timeout.as_secs(),
            )?),
            outbox_poll_interval: Duration::from_millis(positive(
                &lookup,
                "OUTBOX_POLL_MS",
                defaults.outbox_poll_interval.as_millis() as u64,
            )?),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: parse(&lookup, "LOG_FORMAT", defaults.log_format)?,
        };

        if config.saga_queue.is_empty() {
            return Err(ConfigError::Invalid {
                key: "SAGA_QUEUE",
                value: String::new(),
                reason: "must not be empty".to_string(),
            });
        }

        Ok(config)
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_intervals.clone(), self.retry_limit)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            lane_count: self.lane_count,
            lane_capacity: self.prefetch_count,
            concurrency_limit: self.concurrent_message_limit,
        }
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn positive<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + Default + Display,
    T::Err: Display,
{
    let value = parse(lookup, key, default)?;
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn parse_intervals(raw: &str) -> Result<Vec<Duration>, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        key: "RETRY_INTERVALS_MS",
        value: raw.to_string(),
        reason,
    };

    let intervals = raw
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| invalid(e.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if intervals.is_empty() {
        return Err(invalid("no intervals given".to_string()));
    }
    Ok(intervals)
}
