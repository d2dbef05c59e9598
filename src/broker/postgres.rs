//! Postgres-backed broker backend.
//!
//! Each partition is an append-only run of rows in `broker_messages`. Appends
//! to one partition are serialized with a transaction-scoped advisory lock;
//! consumer group offsets live in `broker_consumer_offsets`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction as SqlxTransaction};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::{
    partition_for_key, BrokerError, ConsumedMessage, ConsumerConfig, DeliveryReport, Headers,
    LogTransport, MessageConsumer, OffsetReset, Producer, ProducerConfig, ProducerRecord,
    SequenceId,
};

const FETCH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct PgBroker {
    pool: PgPool,
    partitions: i32,
}

impl PgBroker {
    pub fn new(pool: PgPool, partitions: i32) -> Self {
        Self {
            pool,
            partitions: partitions.max(1),
        }
    }

    pub fn producer(&self, config: ProducerConfig) -> Result<Producer<PgBroker>, BrokerError> {
        Producer::new(self.clone(), config)
    }

    pub fn consumer(&self, config: ConsumerConfig) -> PgConsumer {
        PgConsumer {
            pool: self.pool.clone(),
            config,
            topic: None,
            positions: HashMap::new(),
            next_partition: 0,
            closed: false,
        }
    }

    /// Registers a topic with the broker's partition count. Existing topics
    /// keep the partition count they were created with.
    pub async fn ensure_topic(&self, topic: &str) -> Result<(), BrokerError> {
        sqlx::query(
            "INSERT INTO broker_topics (name, partitions) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING",
        )
        .bind(topic)
        .bind(self.partitions)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

async fn find_sequence(
    tx: &mut SqlxTransaction<'_, Postgres>,
    sequence: SequenceId,
) -> Result<Option<DeliveryReport>, BrokerError> {
    let row: Option<(String, i32, i64)> = sqlx::query_as(
        "SELECT topic, partition, msg_offset FROM broker_messages WHERE producer_id = $1 AND sequence = $2",
    )
    .bind(sequence.producer_id)
    .bind(sequence.sequence)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(row.map(|(topic, partition, offset)| DeliveryReport {
        topic,
        partition,
        offset,
    }))
}

#[async_trait]
impl LogTransport for PgBroker {
    async fn append(
        &self,
        record: &ProducerRecord,
        sequence: Option<SequenceId>,
    ) -> Result<DeliveryReport, BrokerError> {
        self.ensure_topic(&record.topic).await?;

        let mut tx = self.pool.begin().await?;

        if let Some(seq) = sequence {
            if let Some(existing) = find_sequence(&mut tx, seq).await? {
                debug!(
                    topic = %existing.topic,
                    partition = existing.partition,
                    offset = existing.offset,
                    "Duplicate send suppressed"
                );
                return Ok(existing);
            }
        }

        let partitions: i32 =
            sqlx::query_scalar("SELECT partitions FROM broker_topics WHERE name = $1")
                .bind(&record.topic)
                .fetch_one(&mut *tx)
                .await?;
        let partition = partition_for_key(&record.key, partitions);

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1), $2)")
            .bind(&record.topic)
            .bind(partition)
            .execute(&mut *tx)
            .await?;

        let offset: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(msg_offset) + 1, 0) FROM broker_messages WHERE topic = $1 AND partition = $2",
        )
        .bind(&record.topic)
        .bind(partition)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO broker_messages (
                topic, partition, msg_offset, msg_key, payload, headers, producer_id, sequence
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&record.topic)
        .bind(partition)
        .bind(offset)
        .bind(&record.key)
        .bind(&record.payload)
        .bind(Json(&record.headers))
        .bind(sequence.map(|s| s.producer_id))
        .bind(sequence.map(|s| s.sequence))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(DeliveryReport {
            topic: record.topic.clone(),
            partition,
            offset,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    topic: String,
    partition: i32,
    msg_offset: i64,
    msg_key: Option<String>,
    payload: Vec<u8>,
    headers: Json<Headers>,
    created_at: DateTime<Utc>,
}

impl From<MessageRow> for ConsumedMessage {
    fn from(row: MessageRow) -> Self {
        ConsumedMessage {
            topic: row.topic,
            partition: row.partition,
            offset: row.msg_offset,
            key: row.msg_key,
            payload: row.payload,
            headers: row.headers.0,
            timestamp: row.created_at,
        }
    }
}

pub struct PgConsumer {
    pool: PgPool,
    config: ConsumerConfig,
    topic: Option<String>,
    positions: HashMap<i32, i64>,
    next_partition: i32,
    closed: bool,
}

impl PgConsumer {
    async fn initial_position(&self, topic: &str, partition: i32) -> Result<i64, BrokerError> {
        let committed: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT committed_offset FROM broker_consumer_offsets
            WHERE group_id = $1 AND topic = $2 AND partition = $3
            "#,
        )
        .bind(&self.config.group_id)
        .bind(topic)
        .bind(partition)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(offset) = committed {
            return Ok(offset);
        }

        match self.config.auto_offset_reset {
            OffsetReset::Earliest => Ok(0),
            OffsetReset::Latest => {
                let end: i64 = sqlx::query_scalar(
                    "SELECT COALESCE(MAX(msg_offset) + 1, 0) FROM broker_messages WHERE topic = $1 AND partition = $2",
                )
                .bind(topic)
                .bind(partition)
                .fetch_one(&self.pool)
                .await?;
                Ok(end)
            }
        }
    }

    /// One pass over all partitions. Positions only move after a row has been
    /// read, so dropping this future part way leaves them untouched.
    async fn fetch_next(&mut self, topic: &str) -> Result<Option<ConsumedMessage>, BrokerError> {
        let partitions: Option<i32> =
            sqlx::query_scalar("SELECT partitions FROM broker_topics WHERE name = $1")
                .bind(topic)
                .fetch_optional(&self.pool)
                .await?;
        let partitions =
            partitions.ok_or_else(|| BrokerError::UnknownTopicOrPartition(topic.to_string()))?;

        for step in 0..partitions {
            let partition = (self.next_partition + step) % partitions;
            let position = match self.positions.get(&partition) {
                Some(position) => *position,
                None => {
                    let position = self.initial_position(topic, partition).await?;
                    self.positions.insert(partition, position);
                    position
                }
            };

            let row = sqlx::query_as::<_, MessageRow>(
                r#"
                SELECT topic, partition, msg_offset, msg_key, payload, headers, created_at
                FROM broker_messages
                WHERE topic = $1 AND partition = $2 AND msg_offset >= $3
                ORDER BY msg_offset ASC
                LIMIT 1
                "#,
            )
            .bind(topic)
            .bind(partition)
            .bind(position)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = row {
                self.positions.insert(partition, row.msg_offset + 1);
                self.next_partition = (partition + 1) % partitions;
                return Ok(Some(row.into()));
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl MessageConsumer for PgConsumer {
    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        self.topic = Some(topic.to_string());
        self.positions.clear();
        self.next_partition = 0;
        debug!(topic, group_id = %self.config.group_id, "Subscribed");
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumedMessage>, BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        let topic = self.topic.clone().ok_or(BrokerError::NotSubscribed)?;
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(message) = self.fetch_next(&topic).await? {
                return Ok(Some(message));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(FETCH_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn commit(&mut self, message: &ConsumedMessage) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        sqlx::query(
            r#"
            INSERT INTO broker_consumer_offsets (group_id, topic, partition, committed_offset, committed_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (group_id, topic, partition)
            DO UPDATE SET committed_offset = EXCLUDED.committed_offset, committed_at = NOW()
            "#,
        )
        .bind(&self.config.group_id)
        .bind(&message.topic)
        .bind(message.partition)
        .bind(message.offset + 1)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn seek(&mut self, partition: i32, offset: i64) {
        self.positions.insert(partition, offset);
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.closed = true;
        self.topic = None;
        self.positions.clear();
        Ok(())
    }
}
