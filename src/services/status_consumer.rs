//! Long-running consumer of status decision events.
//!
//! Messages are handled one at a time and committed only after the decision
//! has been applied, skipped as undecodable, or rejected as carrying an
//! unknown status. Any other failure leaves the message uncommitted and
//! rewinds the consumer onto it, so the next poll after `retry_backoff`
//! redelivers it.
//!
//! ```text
//! Subscribing -> Polling <-> Processing <-> Committing
//!                   \-> Draining -> Closed   (on shutdown)
//! ```

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerError, ConsumedMessage, MessageConsumer};
use crate::domain::TransactionStatusDecision;
use crate::ports::StatusChange;
use crate::services::event_publisher::STATUS_EVENTS_TOPIC;
use crate::services::status_update::StatusUpdateHandler;

#[derive(Debug, Clone)]
pub struct StatusConsumerSettings {
    pub topic: String,
    pub poll_timeout: Duration,
    pub unknown_topic_backoff: Duration,
    pub consume_error_backoff: Duration,
    pub retry_backoff: Duration,
    pub processing_timeout: Duration,
}

impl Default for StatusConsumerSettings {
    fn default() -> Self {
        Self {
            topic: STATUS_EVENTS_TOPIC.to_string(),
            poll_timeout: Duration::from_secs(1),
            unknown_topic_backoff: Duration::from_secs(5),
            consume_error_backoff: Duration::from_secs(1),
            retry_backoff: Duration::from_secs(5),
            processing_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Subscribing,
    Polling,
    Processing,
    Committing,
    Draining,
    Closed,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Subscribing => "subscribing",
            ConsumerState::Polling => "polling",
            ConsumerState::Processing => "processing",
            ConsumerState::Committing => "committing",
            ConsumerState::Draining => "draining",
            ConsumerState::Closed => "closed",
        }
    }

    pub fn is_running(&self) -> bool {
        !matches!(self, ConsumerState::Draining | ConsumerState::Closed)
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one consumed message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    /// The decision was applied; commit.
    Applied(StatusChange),
    /// The message can never be applied; commit so it is not seen again.
    Discarded,
    /// A transient failure; do not commit, redeliver later.
    Deferred,
}

pub struct StatusEventConsumer {
    consumer: Box<dyn MessageConsumer>,
    handler: Arc<StatusUpdateHandler>,
    settings: StatusConsumerSettings,
    state: watch::Sender<ConsumerState>,
}

impl StatusEventConsumer {
    pub fn new(
        consumer: Box<dyn MessageConsumer>,
        handler: Arc<StatusUpdateHandler>,
        settings: StatusConsumerSettings,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Subscribing);
        Self {
            consumer,
            handler,
            settings,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }

    /// Runs on a background task until `shutdown` is cancelled or
    /// [`ConsumerHandle::stop`] is called.
    pub fn spawn(self, shutdown: &CancellationToken) -> ConsumerHandle {
        let token = shutdown.child_token();
        let state = self.state();
        let task = tokio::spawn(self.run(token.clone()));
        ConsumerHandle { token, state, task }
    }

    /// Consumes until `shutdown` is cancelled, then closes the subscription.
    /// A message already being processed is finished first.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            topic = %self.settings.topic,
            "Status event consumer starting"
        );

        if self.subscribe(&shutdown).await {
            self.consume(&shutdown).await;
        }

        self.set_state(ConsumerState::Draining);
        if let Err(e) = self.consumer.close().await {
            warn!(error = %e, "Failed to close consumer cleanly");
        }
        self.set_state(ConsumerState::Closed);
        info!("Status event consumer stopped");
    }

    async fn subscribe(&mut self, shutdown: &CancellationToken) -> bool {
        self.set_state(ConsumerState::Subscribing);
        loop {
            match self.consumer.subscribe(&self.settings.topic).await {
                Ok(()) => {
                    info!(topic = %self.settings.topic, "Subscribed to status events");
                    return true;
                }
                Err(e) => {
                    error!(topic = %self.settings.topic, error = %e, "Subscribe failed");
                    if !wait(self.settings.consume_error_backoff, shutdown).await {
                        return false;
                    }
                }
            }
        }
    }

    async fn consume(&mut self, shutdown: &CancellationToken) {
        loop {
            self.set_state(ConsumerState::Polling);

            let poll_timeout = self.settings.poll_timeout;
            let polled = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                polled = self.consumer.poll(poll_timeout) => polled,
            };

            match polled {
                Ok(None) => {}
                Ok(Some(message)) => self.handle(message, shutdown).await,
                Err(BrokerError::UnknownTopicOrPartition(topic)) => {
                    warn!(
                        topic = %topic,
                        backoff_ms = self.settings.unknown_topic_backoff.as_millis() as u64,
                        "Topic not available yet"
                    );
                    if !wait(self.settings.unknown_topic_backoff, shutdown).await {
                        break;
                    }
                }
                Err(BrokerError::Closed) => {
                    error!("Consumer closed underneath the poll loop");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Error consuming status events");
                    if !wait(self.settings.consume_error_backoff, shutdown).await {
                        break;
                    }
                }
            }
        }
    }

    async fn handle(&mut self, message: ConsumedMessage, shutdown: &CancellationToken) {
        self.set_state(ConsumerState::Processing);

        match self.process(&message).await {
            MessageOutcome::Applied(_) | MessageOutcome::Discarded => {
                self.set_state(ConsumerState::Committing);
                if let Err(e) = self.consumer.commit(&message).await {
                    error!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "Commit failed, message may be redelivered"
                    );
                }
            }
            MessageOutcome::Deferred => {
                self.consumer.seek(message.partition, message.offset);
                wait(self.settings.retry_backoff, shutdown).await;
            }
        }
    }

    /// Decodes one message and applies its decision.
    pub async fn process(&self, message: &ConsumedMessage) -> MessageOutcome {
        let decision = match TransactionStatusDecision::decode(&message.payload) {
            Ok(decision) => decision,
            Err(e) => {
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Skipping undecodable message"
                );
                return MessageOutcome::Discarded;
            }
        };

        debug!(
            transaction_id = %decision.transaction_id,
            status = %decision.status,
            source = %decision.source,
            offset = message.offset,
            "Processing status decision"
        );

        let applied = tokio::time::timeout(
            self.settings.processing_timeout,
            self.handler.apply_decision(
                decision.transaction_id,
                &decision.status,
                decision.reason.as_deref(),
            ),
        )
        .await;

        match applied {
            Ok(Ok(change)) => MessageOutcome::Applied(change),
            Ok(Err(e)) if e.is_permanent() => {
                warn!(
                    transaction_id = %decision.transaction_id,
                    offset = message.offset,
                    error = %e,
                    "Discarding decision that can never apply"
                );
                MessageOutcome::Discarded
            }
            Ok(Err(e)) => {
                warn!(
                    transaction_id = %decision.transaction_id,
                    offset = message.offset,
                    error = %e,
                    "Decision not applied, will retry"
                );
                MessageOutcome::Deferred
            }
            Err(_) => {
                warn!(
                    transaction_id = %decision.transaction_id,
                    offset = message.offset,
                    timeout_ms = self.settings.processing_timeout.as_millis() as u64,
                    "Decision processing timed out, will retry"
                );
                MessageOutcome::Deferred
            }
        }
    }
}

/// Sleeps for `duration`. Returns false if `shutdown` fired first.
async fn wait(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Handle to a spawned [`StatusEventConsumer`].
pub struct ConsumerHandle {
    token: CancellationToken,
    state: watch::Receiver<ConsumerState>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConsumerState> {
        self.state.clone()
    }

    /// Signals shutdown and waits for the consumer to close.
    pub async fn stop(self) -> Result<(), JoinError> {
        self.token.cancel();
        self.task.await
    }

    /// Waits for the consumer to exit on its own, e.g. after the parent
    /// token was cancelled.
    pub async fn join(self) -> Result<(), JoinError> {
        self.task.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryTransactionRepository;
    use crate::broker::{ConsumerConfig, Headers, InMemoryBroker};
    use crate::domain::{Transaction, TransactionStatus};
    use crate::ports::TransactionRepository;
    use bigdecimal::BigDecimal;
    use chrono::Utc;
    use uuid::Uuid;

    fn message(payload: &str) -> ConsumedMessage {
        ConsumedMessage {
            topic: STATUS_EVENTS_TOPIC.to_string(),
            partition: 0,
            offset: 7,
            key: None,
            payload: payload.as_bytes().to_vec(),
            headers: Headers::new(),
            timestamp: Utc::now(),
        }
    }

    async fn consumer_with_transaction(
    ) -> (StatusEventConsumer, InMemoryTransactionRepository, Uuid) {
        let repo = InMemoryTransactionRepository::new();
        let tx = Transaction::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            1,
            BigDecimal::from(10),
            TransactionStatus::Pending,
        );
        let id = tx.external_id();
        repo.add(&tx).await.unwrap();

        let broker = InMemoryBroker::new(1);
        let consumer = StatusEventConsumer::new(
            Box::new(broker.consumer(ConsumerConfig::default())),
            Arc::new(StatusUpdateHandler::new(Arc::new(repo.clone()))),
            StatusConsumerSettings::default(),
        );
        (consumer, repo, id)
    }

    #[tokio::test]
    async fn test_process_applies_decision() {
        let (consumer, repo, id) = consumer_with_transaction().await;
        let payload = format!(
            r#"{{"TransactionId":"{}","STATUS":"approved","processedAt":"2024-01-01T00:00:00Z","source":"fraud"}}"#,
            id
        );

        let outcome = consumer.process(&message(&payload)).await;

        assert!(matches!(
            outcome,
            MessageOutcome::Applied(ref c) if c.new_status == TransactionStatus::Approved
        ));
        let stored = repo.get_by_external_id(id).await.unwrap().unwrap();
        assert_eq!(stored.status(), TransactionStatus::Approved);
    }

    #[tokio::test]
    async fn test_process_discards_poison_message() {
        let (consumer, _repo, _id) = consumer_with_transaction().await;
        assert_eq!(consumer.process(&message("not json")).await, MessageOutcome::Discarded);
        assert_eq!(consumer.process(&message("[1,2]")).await, MessageOutcome::Discarded);
    }

    #[tokio::test]
    async fn test_process_discards_invalid_status() {
        let (consumer, repo, id) = consumer_with_transaction().await;
        let payload = format!(r#"{{"transactionId":"{}","status":"Frozen","source":"fraud"}}"#, id);

        assert_eq!(consumer.process(&message(&payload)).await, MessageOutcome::Discarded);
        let stored = repo.get_by_external_id(id).await.unwrap().unwrap();
        assert_eq!(stored.status(), TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn test_process_defers_unknown_transaction() {
        let (consumer, _repo, _id) = consumer_with_transaction().await;
        let payload = format!(
            r#"{{"transactionId":"{}","status":"approved","source":"fraud"}}"#,
            Uuid::new_v4()
        );

        assert_eq!(consumer.process(&message(&payload)).await, MessageOutcome::Deferred);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(ConsumerState::Polling.to_string(), "polling");
        assert!(ConsumerState::Committing.is_running());
        assert!(!ConsumerState::Draining.is_running());
        assert_eq!(
            serde_json::to_value(ConsumerState::Closed).unwrap(),
            serde_json::json!("closed")
        );
    }

    #[tokio::test]
    async fn test_stop_closes_idle_consumer() {
        let (consumer, _repo, _id) = consumer_with_transaction().await;
        let shutdown = CancellationToken::new();
        let handle = consumer.spawn(&shutdown);

        let mut state = handle.state_receiver();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s != ConsumerState::Subscribing),
        )
        .await
        .unwrap()
        .unwrap();

        let state = handle.state_receiver();
        handle.stop().await.unwrap();
        assert_eq!(*state.borrow(), ConsumerState::Closed);
        assert!(!shutdown.is_cancelled());
    }
}
