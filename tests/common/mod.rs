#![allow(dead_code)]

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use transaction_service::adapters::InMemoryTransactionRepository;
use transaction_service::broker::{
    DeliveryReport, Headers, InMemoryBroker, MessageProducer, ProducerConfig, ProducerRecord,
};
use transaction_service::config::Config;
use transaction_service::domain::{Transaction, TransactionStatus};
use transaction_service::ports::{
    RepositoryError, RepositoryResult, StatusChange, TransactionRepository,
};
use transaction_service::startup::{Broker, Components};

pub const STATUS_TOPIC: &str = "transaction-status-events";
pub const GROUP_ID: &str = "transaction-service-group";

/// In-memory store that records every call made to it.
#[derive(Default)]
pub struct RecordingRepository {
    inner: InMemoryTransactionRepository,
    pub adds: AtomicUsize,
    pub lookups: Mutex<Vec<Uuid>>,
    pub updates: Mutex<Vec<(Uuid, TransactionStatus, Option<String>)>>,
    pub fail_adds: AtomicBool,
    pub fail_updates: AtomicBool,
    /// Milliseconds each `update_status` call sleeps before writing.
    pub update_delay_ms: AtomicU64,
}

impl RecordingRepository {
    pub fn lookups_of(&self, id: Uuid) -> usize {
        self.lookups.lock().unwrap().iter().filter(|l| **l == id).count()
    }

    pub fn updates(&self) -> Vec<(Uuid, TransactionStatus, Option<String>)> {
        self.updates.lock().unwrap().clone()
    }

    pub async fn status_of(&self, id: Uuid) -> Option<TransactionStatus> {
        self.inner
            .get_by_external_id(id)
            .await
            .unwrap()
            .map(|tx| tx.status())
    }

    /// Stores a pending transaction directly, bypassing the call counters.
    pub async fn seed_pending(&self) -> Uuid {
        let tx = Transaction::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            1,
            "120.00".parse().unwrap(),
            TransactionStatus::Pending,
        );
        self.inner.add(&tx).await.unwrap();
        tx.external_id()
    }
}

#[async_trait]
impl TransactionRepository for RecordingRepository {
    async fn add(&self, tx: &Transaction) -> RepositoryResult<()> {
        self.adds.fetch_add(1, Ordering::SeqCst);
        if self.fail_adds.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable("store is down".to_string()));
        }
        self.inner.add(tx).await
    }

    async fn get_by_external_id(&self, id: Uuid) -> RepositoryResult<Option<Transaction>> {
        self.lookups.lock().unwrap().push(id);
        self.inner.get_by_external_id(id).await
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: TransactionStatus,
        reason: Option<&str>,
    ) -> RepositoryResult<StatusChange> {
        self.updates
            .lock()
            .unwrap()
            .push((id, status, reason.map(str::to_string)));
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable("store is down".to_string()));
        }
        let delay = self.update_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.update_status(id, status, reason).await
    }

    async fn status_history(&self, id: Uuid) -> RepositoryResult<Vec<StatusChange>> {
        self.inner.status_history(id).await
    }
}

pub struct Harness {
    pub broker: InMemoryBroker,
    pub repository: Arc<RecordingRepository>,
    pub components: Components,
}

/// Consumer timings short enough for tests.
pub fn fast_config() -> Config {
    Config {
        poll_timeout_ms: 20,
        unknown_topic_backoff_ms: 20,
        consume_error_backoff_ms: 20,
        retry_backoff_ms: 20,
        processing_timeout_ms: 1_000,
        ..Config::default()
    }
}

pub async fn harness_with(config: Config) -> Harness {
    let broker = InMemoryBroker::new(config.broker_partitions);
    let repository = Arc::new(RecordingRepository::default());
    let components = Components::assemble(
        config,
        None,
        repository.clone(),
        Broker::Memory(broker.clone()),
    )
    .await
    .unwrap();

    Harness {
        broker,
        repository,
        components,
    }
}

pub async fn harness() -> Harness {
    harness_with(fast_config()).await
}

/// Appends a raw decision payload to the status topic, keyed by `key`.
pub async fn send_raw(broker: &InMemoryBroker, key: Uuid, payload: &str) -> DeliveryReport {
    let producer = broker.producer(ProducerConfig::default()).unwrap();
    producer
        .send(ProducerRecord {
            topic: STATUS_TOPIC.to_string(),
            key: key.to_string(),
            payload: payload.as_bytes().to_vec(),
            headers: Headers::new(),
        })
        .await
        .unwrap()
}

pub fn decision_json(id: Uuid, status: &str, reason: Option<&str>) -> String {
    serde_json::json!({
        "transactionId": id,
        "status": status,
        "reason": reason,
        "processedAt": "2024-05-01T12:00:00Z",
        "source": "fraud-service",
    })
    .to_string()
}

/// Polls `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
