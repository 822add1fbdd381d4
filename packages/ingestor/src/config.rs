//! Ingestor Configuration
//!
//! Deployment constants with environment overrides. Unset variables keep
//! their defaults; set-but-invalid variables are an error.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::client::ClientConfig;
use crate::queue::QueueConfig;
use crate::worker::{RetryPolicy, DEFAULT_WORKERS};

pub const ENV_API_BASE_URL: &str = "SMS_API_BASE_URL";
pub const ENV_API_ENDPOINT: &str = "SMS_API_ENDPOINT";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "SMS_CONNECT_TIMEOUT_MS";
pub const ENV_READ_TIMEOUT_MS: &str = "SMS_READ_TIMEOUT_MS";
pub const ENV_WRITE_TIMEOUT_MS: &str = "SMS_WRITE_TIMEOUT_MS";
pub const ENV_REDIS_URL: &str = "REDIS_URL";
pub const ENV_QUEUE_PREFIX: &str = "SMS_QUEUE_PREFIX";
pub const ENV_WORKERS: &str = "SMS_WORKERS";
pub const ENV_MAX_ATTEMPTS: &str = "SMS_MAX_ATTEMPTS";
pub const ENV_INITIAL_BACKOFF_MS: &str = "SMS_INITIAL_BACKOFF_MS";
pub const ENV_MAX_BACKOFF_MS: &str = "SMS_MAX_BACKOFF_MS";
pub const ENV_STORE_DIR: &str = "SMS_STORE_DIR";

/// Errors that can occur while reading configuration
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything needed to assemble an ingestor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestorConfig {
    pub client: ClientConfig,
    pub queue: QueueConfig,
    pub retry: RetryPolicy,
    /// Concurrent worker loops
    pub workers: usize,
    /// Result store directory; `None` uses the platform data directory
    pub store_dir: Option<PathBuf>,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            queue: QueueConfig::default(),
            retry: RetryPolicy::default(),
            workers: DEFAULT_WORKERS,
            store_dir: None,
        }
    }
}

impl IngestorConfig {
    /// Defaults overridden by process environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup(ENV_API_BASE_URL) {
            config.client.base_url = url;
        }
        if let Some(endpoint) = lookup(ENV_API_ENDPOINT) {
            config.client.endpoint = endpoint;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_CONNECT_TIMEOUT_MS)? {
            config.client.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_READ_TIMEOUT_MS)? {
            config.client.read_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_WRITE_TIMEOUT_MS)? {
            config.client.write_timeout = Duration::from_millis(ms);
        }

        if let Some(url) = lookup(ENV_REDIS_URL) {
            config.queue.redis_url = url;
        }
        if let Some(prefix) = lookup(ENV_QUEUE_PREFIX) {
            config.queue.key_prefix = prefix;
        }

        if let Some(workers) = parse_var::<usize>(&lookup, ENV_WORKERS)? {
            config.workers = workers;
        }
        if let Some(max) = parse_var::<u32>(&lookup, ENV_MAX_ATTEMPTS)? {
            config.retry.max_attempts = max;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_INITIAL_BACKOFF_MS)? {
            config.retry.initial_backoff_ms = ms;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_MAX_BACKOFF_MS)? {
            config.retry.max_backoff_ms = ms;
        }

        if let Some(dir) = lookup(ENV_STORE_DIR) {
            config.store_dir = Some(PathBuf::from(dir));
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(invalid(ENV_WORKERS, "0", "at least one worker is required"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid(ENV_MAX_ATTEMPTS, "0", "at least one attempt is required"));
        }
        if !self.client.endpoint.starts_with('/') {
            return Err(invalid(
                ENV_API_ENDPOINT,
                &self.client.endpoint,
                "endpoint must start with '/'",
            ));
        }
        Ok(())
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(name, &raw, &e.to_string())),
    }
}

fn invalid(name: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
