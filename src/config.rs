use anyhow::{bail, Context};
use dotenvy::dotenv;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::adapters::redis_queue;
use crate::services::outbox_relay::{self, RelayConfig};
use crate::services::transaction_processor::{self, ProcessorConfig};

const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => bail!("LOG_FORMAT must be 'text' or 'json', got '{}'", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub database_max_connections: u32,
    pub queue_name: String,
    pub queue_lease_timeout: Duration,
    pub outbox_batch_size: usize,
    pub outbox_poll_interval: Duration,
    pub processor_max_concurrency: usize,
    pub processor_max_retries: u32,
    pub processor_max_delivery_count: u32,
    pub processor_receive_wait: Duration,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok(); // Load .env file if present

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> anyhow::Result<String> {
            match lookup(key) {
                Some(value) if !value.trim().is_empty() => Ok(value),
                _ => bail!("{} must be set", key),
            }
        };

        let config = Config {
            database_url: required("DATABASE_URL")?,
            redis_url: required("REDIS_URL")?,
            database_max_connections: positive(
                &lookup,
                "DATABASE_MAX_CONNECTIONS",
                DEFAULT_DATABASE_MAX_CONNECTIONS,
            )?,
            queue_name: lookup("QUEUE_NAME")
                .filter(|q| !q.trim().is_empty())
                .unwrap_or_else(|| outbox_relay::DEFAULT_QUEUE_NAME.to_string()),
            queue_lease_timeout: Duration::from_secs(positive(
                &lookup,
                "QUEUE_LEASE_TIMEOUT_SECS",
                redis_queue::DEFAULT_LEASE_TIMEOUT.as_secs(),
            )?),
            outbox_batch_size: positive(
                &lookup,
                "OUTBOX_BATCH_SIZE",
                outbox_relay::DEFAULT_BATCH_SIZE,
            )?,
            outbox_poll_interval: Duration::from_millis(positive(
                &lookup,
                "OUTBOX_POLL_INTERVAL_MS",
                outbox_relay::DEFAULT_POLL_INTERVAL.as_millis() as u64,
            )?),
            processor_max_concurrency: positive(
                &lookup,
                "PROCESSOR_MAX_CONCURRENCY",
                transaction_processor::DEFAULT_MAX_CONCURRENCY,
            )?,
            processor_max_retries: positive(
                &lookup,
                "PROCESSOR_MAX_RETRIES",
                transaction_processor::DEFAULT_MAX_RETRIES,
            )?,
            processor_max_delivery_count: positive(
                &lookup,
                "PROCESSOR_MAX_DELIVERY_COUNT",
                transaction_processor::DEFAULT_MAX_DELIVERY_COUNT,
            )?,
            processor_receive_wait: Duration::from_millis(positive(
                &lookup,
                "PROCESSOR_RECEIVE_WAIT_MS",
                transaction_processor::DEFAULT_RECEIVE_WAIT.as_millis() as u64,
            )?),
            log_format: match lookup("LOG_FORMAT") {
                Some(value) => value.parse()?,
                None => LogFormat::Text,
            },
        };

        // Each in-flight message holds one connection; the relay needs one more.
        if config.database_max_connections as usize <= config.processor_max_concurrency {
            bail!(
                "DATABASE_MAX_CONNECTIONS ({}) must exceed PROCESSOR_MAX_CONCURRENCY ({})",
                config.database_max_connections,
                config.processor_max_concurrency
            );
        }

        Ok(config)
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            queue_name: self.queue_name.clone(),
            batch_size: self.outbox_batch_size,
            poll_interval: self.outbox_poll_interval,
        }
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            max_concurrency: self.processor_max_concurrency,
            max_retries: self.processor_max_retries,
            max_delivery_count: self.processor_max_delivery_count,
            receive_wait: self.processor_receive_wait,
        }
    }
}

fn positive<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Default + PartialEq,
    T::Err: Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };

    let value = raw
        .trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("{}", e))
        .with_context(|| format!("{} must be a positive integer, got '{}'", key, raw))?;

    if value == T::default() {
        bail!("{} must be greater than zero", key);
    }

    Ok(value)
}
