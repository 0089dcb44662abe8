//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. Sensitive values wrapped in secrecy::SecretString to prevent
//! log leaks.

use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::engine::DispatchConfig;
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    /// Webhook the sink posts payloads to. Required by `serve` only.
    pub sink_url: Option<SecretString>,
    /// Operator webhook for delivery failures. Unset means log-only.
    pub error_url: Option<SecretString>,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub error_backoff: Duration,
    pub max_retries: u32,
    pub auto_retry: bool,
    pub delivery_timeout: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self {
            database_url: SecretString::from(required_var(&lookup, "DATABASE_URL")?),
            sink_url: lookup("RELAYQ_SINK_URL").map(SecretString::from),
            error_url: lookup("RELAYQ_ERROR_URL").map(SecretString::from),
            poll_interval: Duration::from_secs(parsed_var(&lookup, "RELAYQ_POLL_INTERVAL_SECS", 10)?),
            batch_size: parsed_var(&lookup, "RELAYQ_BATCH_SIZE", 10)?,
            error_backoff: Duration::from_millis(parsed_var(&lookup, "RELAYQ_ERROR_BACKOFF_MS", 2000)?),
            max_retries: parsed_var(&lookup, "RELAYQ_MAX_RETRIES", 3)?,
            auto_retry: parsed_var(&lookup, "RELAYQ_AUTO_RETRY", true)?,
            delivery_timeout: Duration::from_secs(parsed_var(
                &lookup,
                "RELAYQ_DELIVERY_TIMEOUT_SECS",
                30,
            )?),
            otel_endpoint: lookup("OTEL_ENDPOINT"),
            log_level: lookup("RELAYQ_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Dispatch loop settings derived from this configuration.
    pub fn dispatch(&self) -> DispatchConfig {
        DispatchConfig {
            poll_interval: self.poll_interval,
            batch_size: self.batch_size,
            error_backoff: self.error_backoff,
            retry_sweep: self.auto_retry.then_some(self.max_retries),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("RELAYQ_BATCH_SIZE must be at least 1".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config(
                "RELAYQ_POLL_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }
        if self.error_backoff >= self.poll_interval {
            return Err(Error::Config(format!(
                "RELAYQ_ERROR_BACKOFF_MS ({}ms) must be shorter than the poll interval ({}ms)",
                self.error_backoff.as_millis(),
                self.poll_interval.as_millis()
            )));
        }
        Ok(())
    }
}

fn required_var<F>(lookup: &F, name: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid value for {name} ({raw:?}): {e}"))),
    }
}
