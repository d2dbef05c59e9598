use anyhow::Context;
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::broker::{ConsumerConfig, ProducerConfig};
use crate::services::event_publisher::{
    DEFAULT_EVENTS_TOPIC, STATUS_EVENTS_TOPIC, TRANSACTION_EVENTS_TOPIC,
};
use crate::services::{StatusConsumerSettings, TopicRoutes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    Memory,
    Postgres,
}

impl FromStr for BrokerBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(BrokerBackend::Memory),
            "postgres" => Ok(BrokerBackend::Postgres),
            other => anyhow::bail!(
                "BROKER_BACKEND must be 'memory' or 'postgres', got '{}'",
                other
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => anyhow::bail!("LOG_FORMAT must be 'pretty' or 'json', got '{}'", other),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub broker_backend: BrokerBackend,
    pub broker_partitions: i32,
    pub service_name: String,
    pub transaction_events_topic: String,
    pub status_events_topic: String,
    pub default_events_topic: String,
    pub consumer_group_id: String,
    pub poll_timeout_ms: u64,
    pub unknown_topic_backoff_ms: u64,
    pub consume_error_backoff_ms: u64,
    pub retry_backoff_ms: u64,
    pub processing_timeout_ms: u64,
    pub producer_retries: u32,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: 3000,
            database_url: None,
            database_max_connections: 5,
            broker_backend: BrokerBackend::Memory,
            broker_partitions: 3,
            service_name: "transaction-service".to_string(),
            transaction_events_topic: TRANSACTION_EVENTS_TOPIC.to_string(),
            status_events_topic: STATUS_EVENTS_TOPIC.to_string(),
            default_events_topic: DEFAULT_EVENTS_TOPIC.to_string(),
            consumer_group_id: "transaction-service-group".to_string(),
            poll_timeout_ms: 1_000,
            unknown_topic_backoff_ms: 5_000,
            consume_error_backoff_ms: 1_000,
            retry_backoff_ms: 5_000,
            processing_timeout_ms: 30_000,
            producer_retries: 3,
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok(); // Load .env file if present
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup. Unset keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let string = |key: &str, default: String| lookup(key).unwrap_or(default);

        let config = Config {
            server_port: parse_or(&lookup, "SERVER_PORT", defaults.server_port)?,
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            database_max_connections: parse_or(
                &lookup,
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,
            broker_backend: parse_or(&lookup, "BROKER_BACKEND", defaults.broker_backend)?,
            broker_partitions: parse_or(&lookup, "BROKER_PARTITIONS", defaults.broker_partitions)?,
            service_name: string("SERVICE_NAME", defaults.service_name),
            transaction_events_topic: string(
                "TRANSACTION_EVENTS_TOPIC",
                defaults.transaction_events_topic,
            ),
            status_events_topic: string("STATUS_EVENTS_TOPIC", defaults.status_events_topic),
            default_events_topic: string("DEFAULT_EVENTS_TOPIC", defaults.default_events_topic),
            consumer_group_id: string("CONSUMER_GROUP_ID", defaults.consumer_group_id),
            poll_timeout_ms: parse_or(&lookup, "POLL_TIMEOUT_MS", defaults.poll_timeout_ms)?,
            unknown_topic_backoff_ms: parse_or(
                &lookup,
                "UNKNOWN_TOPIC_BACKOFF_MS",
                defaults.unknown_topic_backoff_ms,
            )?,
            consume_error_backoff_ms: parse_or(
                &lookup,
                "CONSUME_ERROR_BACKOFF_MS",
                defaults.consume_error_backoff_ms,
            )?,
            retry_backoff_ms: parse_or(&lookup, "RETRY_BACKOFF_MS", defaults.retry_backoff_ms)?,
            processing_timeout_ms: parse_or(
                &lookup,
                "PROCESSING_TIMEOUT_MS",
                defaults.processing_timeout_ms,
            )?,
            producer_retries: parse_or(&lookup, "PRODUCER_RETRIES", defaults.producer_retries)?,
            log_format: parse_or(&lookup, "LOG_FORMAT", defaults.log_format)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.broker_backend == BrokerBackend::Postgres && self.database_url.is_none() {
            anyhow::bail!("BROKER_BACKEND=postgres requires DATABASE_URL");
        }
        if self.broker_partitions < 1 {
            anyhow::bail!("BROKER_PARTITIONS must be at least 1");
        }
        if self.poll_timeout_ms == 0 {
            anyhow::bail!("POLL_TIMEOUT_MS must be greater than 0");
        }
        if self.processing_timeout_ms == 0 {
            anyhow::bail!("PROCESSING_TIMEOUT_MS must be greater than 0");
        }
        Ok(())
    }

    pub fn topic_routes(&self) -> TopicRoutes {
        TopicRoutes::new(
            self.transaction_events_topic.clone(),
            self.status_events_topic.clone(),
            self.default_events_topic.clone(),
        )
    }

    pub fn producer_config(&self) -> ProducerConfig {
        ProducerConfig {
            client_id: self.service_name.clone(),
            retries: self.producer_retries,
            ..ProducerConfig::default()
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            group_id: self.consumer_group_id.clone(),
            client_id: format!("{}-consumer", self.service_name),
            ..ConsumerConfig::default()
        }
    }

    pub fn consumer_settings(&self) -> StatusConsumerSettings {
        StatusConsumerSettings {
            topic: self.status_events_topic.clone(),
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            unknown_topic_backoff: Duration::from_millis(self.unknown_topic_backoff_ms),
            consume_error_backoff: Duration::from_millis(self.consume_error_backoff_ms),
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            processing_timeout: Duration::from_millis(self.processing_timeout_ms),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| anyhow::anyhow!("{}", e))
            .with_context(|| format!("invalid value for {}: '{}'", key, raw)),
        _ => Ok(default),
    }
}
