//! In-process broker backend.
//!
//! Keeps every topic as a vector of partition logs behind one mutex and wakes
//! pollers through a [`Notify`]. Suitable for single-process deployments and
//! tests; records do not survive a restart.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::{
    partition_for_key, BrokerError, ConsumedMessage, ConsumerConfig, DeliveryReport,
    LogTransport, MessageConsumer, OffsetReset, Producer, ProducerConfig, ProducerRecord,
    SequenceId, MAX_IDEMPOTENT_IN_FLIGHT,
};

pub const DEFAULT_PARTITIONS: i32 = 3;

#[derive(Default)]
struct State {
    topics: HashMap<String, Vec<Vec<ConsumedMessage>>>,
    committed: HashMap<(String, String, i32), i64>,
    /// Most recent acknowledged sequences per producer, oldest first.
    delivered: HashMap<Uuid, VecDeque<(i64, DeliveryReport)>>,
    lost_acks: u32,
    failing_polls: u32,
}

impl State {
    fn find_delivered(&self, seq: SequenceId) -> Option<DeliveryReport> {
        self.delivered
            .get(&seq.producer_id)?
            .iter()
            .find(|(sequence, _)| *sequence == seq.sequence)
            .map(|(_, report)| report.clone())
    }

    fn remember_delivered(&mut self, seq: SequenceId, report: DeliveryReport) {
        let recent = self.delivered.entry(seq.producer_id).or_default();
        recent.push_back((seq.sequence, report));
        while recent.len() > MAX_IDEMPOTENT_IN_FLIGHT {
            recent.pop_front();
        }
    }
}

struct Inner {
    state: Mutex<State>,
    appended: Notify,
    partitions: i32,
}

/// Shared handle to an in-process broker. Clones see the same logs.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

impl InMemoryBroker {
    pub fn new(partitions: i32) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                appended: Notify::new(),
                partitions: partitions.max(1),
            }),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, BrokerError> {
        self.inner
            .state
            .lock()
            .map_err(|_| BrokerError::Transport("broker state poisoned".into()))
    }

    pub fn producer(
        &self,
        config: ProducerConfig,
    ) -> Result<Producer<InMemoryBroker>, BrokerError> {
        Producer::new(self.clone(), config)
    }

    pub fn consumer(&self, config: ConsumerConfig) -> InMemoryConsumer {
        InMemoryConsumer {
            broker: self.clone(),
            config,
            topic: None,
            positions: HashMap::new(),
            next_partition: 0,
            closed: false,
        }
    }

    /// Creates a topic if it does not exist yet. Topics are also created on
    /// first append.
    pub fn create_topic(&self, topic: &str) -> Result<(), BrokerError> {
        let partitions = self.inner.partitions as usize;
        self.state()?
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions]);
        Ok(())
    }

    pub fn topic_exists(&self, topic: &str) -> bool {
        self.state()
            .map(|state| state.topics.contains_key(topic))
            .unwrap_or(false)
    }

    /// All records of a topic, partition by partition.
    pub fn messages(&self, topic: &str) -> Vec<ConsumedMessage> {
        self.state()
            .map(|state| {
                state
                    .topics
                    .get(topic)
                    .map(|partitions| partitions.iter().flatten().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn committed_offset(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state().ok().and_then(|state| {
            state
                .committed
                .get(&(group_id.to_string(), topic.to_string(), partition))
                .copied()
        })
    }

    /// The next `count` appends are stored but answered with a transport
    /// error, as if the acknowledgement was lost on the way back.
    pub fn lose_next_acks(&self, count: u32) {
        if let Ok(mut state) = self.state() {
            state.lost_acks = count;
        }
    }

    /// The next `count` polls fail with a transport error.
    pub fn fail_next_polls(&self, count: u32) {
        if let Ok(mut state) = self.state() {
            state.failing_polls = count;
        }
    }
}

#[async_trait]
impl LogTransport for InMemoryBroker {
    async fn append(
        &self,
        record: &ProducerRecord,
        sequence: Option<SequenceId>,
    ) -> Result<DeliveryReport, BrokerError> {
        let partitions = self.inner.partitions;
        let report = {
            let mut state = self.state()?;

            if let Some(existing) = sequence.and_then(|seq| state.find_delivered(seq)) {
                debug!(
                    topic = %existing.topic,
                    partition = existing.partition,
                    offset = existing.offset,
                    "Duplicate send suppressed"
                );
                return Ok(existing);
            }

            let partition = partition_for_key(&record.key, partitions);
            let log = state
                .topics
                .entry(record.topic.clone())
                .or_insert_with(|| vec![Vec::new(); partitions as usize]);
            let entries = &mut log[partition as usize];
            let offset = entries.len() as i64;

            entries.push(ConsumedMessage {
                topic: record.topic.clone(),
                partition,
                offset,
                key: Some(record.key.clone()),
                payload: record.payload.clone(),
                headers: record.headers.clone(),
                timestamp: Utc::now(),
            });

            let report = DeliveryReport {
                topic: record.topic.clone(),
                partition,
                offset,
            };
            if let Some(seq) = sequence {
                state.remember_delivered(seq, report.clone());
            }

            if state.lost_acks > 0 {
                state.lost_acks -= 1;
                drop(state);
                self.inner.appended.notify_waiters();
                return Err(BrokerError::Transport("acknowledgement lost".into()));
            }
            report
        };

        self.inner.appended.notify_waiters();
        Ok(report)
    }
}

pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    config: ConsumerConfig,
    topic: Option<String>,
    positions: HashMap<i32, i64>,
    next_partition: usize,
    closed: bool,
}

impl InMemoryConsumer {
    fn next_available(&mut self) -> Result<Option<ConsumedMessage>, BrokerError> {
        let topic = self.topic.clone().ok_or(BrokerError::NotSubscribed)?;
        let mut state = self.broker.state()?;

        if state.failing_polls > 0 {
            state.failing_polls -= 1;
            return Err(BrokerError::Transport("injected poll failure".into()));
        }

        let partition_count = match state.topics.get(&topic) {
            Some(partitions) => partitions.len(),
            None => return Err(BrokerError::UnknownTopicOrPartition(topic)),
        };

        for step in 0..partition_count {
            let partition = (self.next_partition + step) % partition_count;
            let key = (self.config.group_id.clone(), topic.clone(), partition as i32);
            let committed = state.committed.get(&key).copied();
            let log = &state.topics[&topic][partition];

            let position = *self
                .positions
                .entry(partition as i32)
                .or_insert_with(|| match (committed, self.config.auto_offset_reset) {
                    (Some(offset), _) => offset,
                    (None, OffsetReset::Earliest) => 0,
                    (None, OffsetReset::Latest) => log.len() as i64,
                });

            if let Some(message) = log.get(position as usize) {
                let message = message.clone();
                self.positions.insert(partition as i32, position + 1);
                self.next_partition = (partition + 1) % partition_count;
                return Ok(Some(message));
            }
        }

        Ok(None)
    }
}

#[async_trait]
impl MessageConsumer for InMemoryConsumer {
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

        let broker = self.broker.clone();
        let deadline = Instant::now() + timeout;

        loop {
            // Register for wake-ups before looking, so an append in between is not missed.
            let appended = broker.inner.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if let Some(message) = self.next_available()? {
                return Ok(Some(message));
            }

            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self, message: &ConsumedMessage) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        let key = (
            self.config.group_id.clone(),
            message.topic.clone(),
            message.partition,
        );
        self.broker.state()?.committed.insert(key, message.offset + 1);
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
