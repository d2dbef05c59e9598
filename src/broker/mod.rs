//! # Broker
//!
//! Topic/partition message log with producer and consumer clients.
//!
//! Records are routed to a partition by key, so records sharing a key are
//! read back in append order. Consumers track their own position and commit
//! offsets explicitly; nothing is committed on their behalf.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::{InMemoryBroker, InMemoryConsumer};
pub use postgres::{PgBroker, PgConsumer};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("unknown topic or partition: {0}")]
    UnknownTopicOrPartition(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("broker transport error: {0}")]
    Transport(String),

    #[error("consumer is not subscribed to a topic")]
    NotSubscribed,

    #[error("client is closed")]
    Closed,

    #[error("invalid client configuration: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl BrokerError {
    /// Whether resending the same record may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BrokerError::Timeout(_) | BrokerError::Transport(_) | BrokerError::Database(_)
        )
    }
}

/// Out-of-band record metadata, readable without decoding the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProducerRecord {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub timestamp: DateTime<Utc>,
}

/// Sends an idempotent producer may have outstanding. A log remembers this
/// many recent sequences per producer for duplicate detection.
pub const MAX_IDEMPOTENT_IN_FLIGHT: usize = 5;

/// Producer identity attached to each record when idempotence is on. A
/// retried send reuses its sequence number, which lets the log drop the copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SequenceId {
    pub producer_id: Uuid,
    pub sequence: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acks {
    /// Acknowledged once the partition leader has the record.
    Leader,
    /// Acknowledged once every in-sync replica has the record.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReset {
    Earliest,
    Latest,
}

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub client_id: String,
    pub acks: Acks,
    pub enable_idempotence: bool,
    pub max_in_flight: usize,
    pub retries: u32,
    pub retry_backoff: Duration,
    pub request_timeout: Duration,
    pub message_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            client_id: "transaction-service".to_string(),
            acks: Acks::All,
            enable_idempotence: true,
            max_in_flight: 1,
            retries: 3,
            retry_backoff: Duration::from_millis(100),
            request_timeout: Duration::from_secs(5),
            message_timeout: Duration::from_secs(10),
        }
    }
}

impl ProducerConfig {
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.max_in_flight == 0 {
            return Err(BrokerError::Config("max_in_flight must be at least 1".into()));
        }
        if self.enable_idempotence && self.acks != Acks::All {
            return Err(BrokerError::Config("idempotence requires acks=all".into()));
        }
        if self.enable_idempotence && self.max_in_flight > MAX_IDEMPOTENT_IN_FLIGHT {
            return Err(BrokerError::Config(format!(
                "idempotence requires max_in_flight <= {}",
                MAX_IDEMPOTENT_IN_FLIGHT
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub group_id: String,
    pub client_id: String,
    pub auto_offset_reset: OffsetReset,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: "transaction-service-group".to_string(),
            client_id: "transaction-service-consumer".to_string(),
            auto_offset_reset: OffsetReset::Earliest,
        }
    }
}

/// Stable key → partition mapping.
pub fn partition_for_key(key: &str, partitions: i32) -> i32 {
    let partitions = partitions.max(1) as u32;
    (crc32fast::hash(key.as_bytes()) % partitions) as i32
}

#[async_trait]
pub trait MessageProducer: Send + Sync {
    /// Sends one record and waits for its acknowledgement.
    async fn send(&self, record: ProducerRecord) -> Result<DeliveryReport, BrokerError>;

    /// Waits for in-flight sends to finish.
    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError>;
}

/// Consumer side of the log. One consumer owns all partitions of its topic.
///
/// `poll` must be cancel-safe: dropping its future before it resolves must not
/// move the consumer's position.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError>;

    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumedMessage>, BrokerError>;

    /// Marks everything up to and including `message` as processed for the group.
    async fn commit(&mut self, message: &ConsumedMessage) -> Result<(), BrokerError>;

    /// Moves the read position of a partition, e.g. back to a message that
    /// must be redelivered.
    fn seek(&mut self, partition: i32, offset: i64);

    async fn close(&mut self) -> Result<(), BrokerError>;
}

/// The append side of a log backend.
#[async_trait]
pub trait LogTransport: Send + Sync {
    async fn append(
        &self,
        record: &ProducerRecord,
        sequence: Option<SequenceId>,
    ) -> Result<DeliveryReport, BrokerError>;
}

/// Producer over any [`LogTransport`] with bounded in-flight sends, retries and
/// optional idempotence.
pub struct Producer<T> {
    transport: T,
    config: ProducerConfig,
    producer_id: Uuid,
    next_sequence: AtomicI64,
    in_flight: Arc<Semaphore>,
}

impl<T: LogTransport> Producer<T> {
    pub fn new(transport: T, config: ProducerConfig) -> Result<Self, BrokerError> {
        config.validate()?;
        let in_flight = Arc::new(Semaphore::new(config.max_in_flight));
        Ok(Self {
            transport,
            config,
            producer_id: Uuid::new_v4(),
            next_sequence: AtomicI64::new(0),
            in_flight,
        })
    }

    async fn append_once(
        &self,
        record: &ProducerRecord,
        sequence: Option<SequenceId>,
    ) -> Result<DeliveryReport, BrokerError> {
        let request_timeout = self.config.request_timeout;
        match tokio::time::timeout(request_timeout, self.transport.append(record, sequence)).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout(request_timeout)),
        }
    }
}

#[async_trait]
impl<T: LogTransport> MessageProducer for Producer<T> {
    async fn send(&self, record: ProducerRecord) -> Result<DeliveryReport, BrokerError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| BrokerError::Closed)?;

        // Sequence numbers are taken under the permit so they reach the log in order.
        let sequence = self.config.enable_idempotence.then(|| SequenceId {
            producer_id: self.producer_id,
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
        });

        let deadline = Instant::now() + self.config.message_timeout;
        let mut attempt: u32 = 0;

        loop {
            match self.append_once(&record, sequence).await {
                Ok(report) => return Ok(report),
                Err(e)
                    if e.is_retriable()
                        && attempt < self.config.retries
                        && Instant::now() + self.config.retry_backoff < deadline =>
                {
                    attempt += 1;
                    tracing::warn!(
                        topic = %record.topic,
                        key = %record.key,
                        attempt,
                        error = %e,
                        "Send failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        let permits = self.config.max_in_flight as u32;
        match tokio::time::timeout(timeout, self.in_flight.acquire_many(permits)).await {
            Ok(Ok(_permits)) => Ok(()),
            Ok(Err(_)) => Err(BrokerError::Closed),
            Err(_) => Err(BrokerError::Timeout(timeout)),
        }
    }
}
