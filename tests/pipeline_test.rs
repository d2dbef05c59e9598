mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use common::{
    decision_json, eventually, fast_config, harness, harness_with, send_raw, RecordingRepository,
    GROUP_ID, STATUS_TOPIC,
};
use transaction_service::broker::{ConsumerConfig, InMemoryBroker};
use transaction_service::config::Config;
use transaction_service::domain::{DomainEvent, TransactionStatus, TransactionStatusDecision};
use transaction_service::ports::TransactionRepository;
use transaction_service::services::{
    ConsumerState, EventPublisher, StatusEventConsumer, StatusUpdateHandler,
};
use transaction_service::use_cases::CreateTransaction;

#[tokio::test]
async fn test_create_stores_then_announces_transaction() {
    let h = harness().await;
    let commands = h.components.command_handler();

    let id = commands
        .create(CreateTransaction {
            source_account_id: Uuid::new_v4(),
            target_account_id: Uuid::new_v4(),
            transfer_type_id: 1,
            value: "120.00".parse().unwrap(),
            status: None,
        })
        .await
        .unwrap();

    assert_eq!(h.repository.adds.load(Ordering::SeqCst), 1);
    assert_eq!(h.repository.status_of(id).await, Some(TransactionStatus::Pending));

    let events = h.broker.messages("transaction-events");
    assert_eq!(events.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&events[0].payload).unwrap();
    assert_eq!(body["eventType"], "transaction.created");
    assert_eq!(body["transactionExternalId"], id.to_string());
    assert_eq!(body["status"], "Pending");
    assert_eq!(events[0].headers.get("event-type"), Some("transaction.created"));
    assert_eq!(events[0].key.as_deref(), Some(id.to_string().as_str()));
}

#[tokio::test]
async fn test_store_failure_publishes_nothing() {
    let h = harness().await;
    h.repository.fail_adds.store(true, Ordering::SeqCst);

    let result = h
        .components
        .command_handler()
        .create(CreateTransaction {
            source_account_id: Uuid::new_v4(),
            target_account_id: Uuid::new_v4(),
            transfer_type_id: 2,
            value: "5".parse().unwrap(),
            status: None,
        })
        .await;

    assert!(result.is_err());
    assert!(h.broker.messages("transaction-events").is_empty());
}

#[tokio::test]
async fn test_rejected_decision_is_applied_once_and_committed() {
    let h = harness().await;
    let id = h.repository.seed_pending().await;
    let shutdown = CancellationToken::new();
    let consumer = h.components.status_consumer().spawn(&shutdown);

    let report = send_raw(&h.broker, id, &decision_json(id, "Rejected", Some("fraud"))).await;

    let broker = h.broker.clone();
    let (partition, next_offset) = (report.partition, report.offset + 1);
    eventually("decision committed", || {
        let broker = broker.clone();
        async move {
            broker.committed_offset(GROUP_ID, STATUS_TOPIC, partition) == Some(next_offset)
        }
    })
    .await;

    assert_eq!(
        h.repository.updates(),
        vec![(id, TransactionStatus::Rejected, Some("fraud".to_string()))]
    );
    assert_eq!(h.repository.status_of(id).await, Some(TransactionStatus::Rejected));

    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_transaction_is_retried_without_commit() {
    let h = harness().await;
    let shutdown = CancellationToken::new();
    let consumer = h.components.status_consumer().spawn(&shutdown);

    let missing = Uuid::new_v4();
    let report = send_raw(&h.broker, missing, &decision_json(missing, "approved", None)).await;

    let repository = h.repository.clone();
    eventually("message redelivered", || {
        let repository = repository.clone();
        async move { repository.lookups_of(missing) >= 3 }
    })
    .await;

    assert_eq!(h.broker.committed_offset(GROUP_ID, STATUS_TOPIC, report.partition), None);
    assert!(h.repository.updates().is_empty());
    assert!(consumer.state().is_running());

    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn test_undecodable_message_is_skipped() {
    let h = harness().await;
    let id = h.repository.seed_pending().await;
    let shutdown = CancellationToken::new();
    let consumer = h.components.status_consumer().spawn(&shutdown);

    send_raw(&h.broker, id, "{not json").await;
    let report = send_raw(&h.broker, id, &decision_json(id, "approved", None)).await;

    let repository = h.repository.clone();
    eventually("status approved", || {
        let repository = repository.clone();
        async move { repository.status_of(id).await == Some(TransactionStatus::Approved) }
    })
    .await;

    let broker = h.broker.clone();
    let partition = report.partition;
    eventually("both messages committed", || {
        let broker = broker.clone();
        async move { broker.committed_offset(GROUP_ID, STATUS_TOPIC, partition) == Some(2) }
    })
    .await;

    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn test_invalid_status_is_committed_without_mutation() {
    let h = harness().await;
    let id = h.repository.seed_pending().await;
    let shutdown = CancellationToken::new();
    let consumer = h.components.status_consumer().spawn(&shutdown);

    let report = send_raw(&h.broker, id, &decision_json(id, "Processing", None)).await;

    let broker = h.broker.clone();
    let partition = report.partition;
    eventually("invalid decision committed", || {
        let broker = broker.clone();
        async move { broker.committed_offset(GROUP_ID, STATUS_TOPIC, partition) == Some(1) }
    })
    .await;

    assert!(h.repository.updates().is_empty());
    assert_eq!(h.repository.status_of(id).await, Some(TransactionStatus::Pending));

    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_decision_leaves_same_status() {
    let h = harness().await;
    let id = h.repository.seed_pending().await;
    let shutdown = CancellationToken::new();
    let consumer = h.components.status_consumer().spawn(&shutdown);

    send_raw(&h.broker, id, &decision_json(id, "APPROVED", None)).await;
    let report = send_raw(&h.broker, id, &decision_json(id, "approved", None)).await;

    let broker = h.broker.clone();
    let partition = report.partition;
    eventually("both decisions committed", || {
        let broker = broker.clone();
        async move { broker.committed_offset(GROUP_ID, STATUS_TOPIC, partition) == Some(2) }
    })
    .await;

    assert_eq!(h.repository.status_of(id).await, Some(TransactionStatus::Approved));
    assert_eq!(h.repository.updates().len(), 2);

    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn test_created_transaction_reconciled_through_published_decision() {
    let h = harness().await;
    let shutdown = CancellationToken::new();
    let consumer = h.components.status_consumer().spawn(&shutdown);

    let id = h
        .components
        .command_handler()
        .create(CreateTransaction {
            source_account_id: Uuid::new_v4(),
            target_account_id: Uuid::new_v4(),
            transfer_type_id: 1,
            value: "42.10".parse().unwrap(),
            status: None,
        })
        .await
        .unwrap();

    let decision = DomainEvent::status_decision(TransactionStatusDecision {
        transaction_id: id,
        status: "Rejected".to_string(),
        reason: Some("velocity limit".to_string()),
        processed_at: chrono::Utc::now(),
        source: "fraud-service".to_string(),
    });
    h.components.publisher.publish(&decision).await.unwrap();

    let repository = h.repository.clone();
    eventually("status rejected", || {
        let repository = repository.clone();
        async move { repository.status_of(id).await == Some(TransactionStatus::Rejected) }
    })
    .await;

    let history = h.components.repository.status_history(id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].reason.as_deref(), Some("velocity limit"));

    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn test_parent_shutdown_closes_consumer() {
    let h = harness().await;
    let shutdown = CancellationToken::new();
    let consumer = h.components.status_consumer().spawn(&shutdown);
    let mut state = consumer.state_receiver();

    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConsumerState::Polling),
    )
    .await
    .unwrap()
    .unwrap();

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), consumer.join())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(*state.borrow(), ConsumerState::Closed);
}

#[tokio::test]
async fn test_consumer_recovers_from_broker_errors() {
    let h = harness().await;
    let id = h.repository.seed_pending().await;
    h.broker.fail_next_polls(3);

    let shutdown = CancellationToken::new();
    let consumer = h.components.status_consumer().spawn(&shutdown);
    send_raw(&h.broker, id, &decision_json(id, "rejected", None)).await;

    let repository = h.repository.clone();
    eventually("status rejected after poll failures", || {
        let repository = repository.clone();
        async move { repository.status_of(id).await == Some(TransactionStatus::Rejected) }
    })
    .await;

    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn test_consumer_waits_for_missing_topic() {
    // A broker with no topics yet; the status topic appears on first send.
    let broker = InMemoryBroker::new(1);
    let repository = Arc::new(RecordingRepository::default());
    let id = repository.seed_pending().await;

    let consumer = StatusEventConsumer::new(
        Box::new(broker.consumer(ConsumerConfig {
            group_id: GROUP_ID.to_string(),
            ..ConsumerConfig::default()
        })),
        Arc::new(StatusUpdateHandler::new(repository.clone())),
        fast_config().consumer_settings(),
    );
    let shutdown = CancellationToken::new();
    let consumer = consumer.spawn(&shutdown);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!broker.topic_exists(STATUS_TOPIC));
    assert!(consumer.state().is_running());

    send_raw(&broker, id, &decision_json(id, "approved", None)).await;

    let watched = repository.clone();
    eventually("decision applied once topic exists", || {
        let repository = watched.clone();
        async move { repository.status_of(id).await == Some(TransactionStatus::Approved) }
    })
    .await;

    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn test_store_failure_leaves_decision_uncommitted() {
    let h = harness().await;
    let id = h.repository.seed_pending().await;
    h.repository.fail_updates.store(true, Ordering::SeqCst);

    let shutdown = CancellationToken::new();
    let consumer = h.components.status_consumer().spawn(&shutdown);
    let report = send_raw(&h.broker, id, &decision_json(id, "rejected", None)).await;

    let repository = h.repository.clone();
    eventually("update retried", || {
        let repository = repository.clone();
        async move { repository.updates().len() >= 3 }
    })
    .await;
    assert_eq!(h.broker.committed_offset(GROUP_ID, STATUS_TOPIC, report.partition), None);
    assert_eq!(h.repository.status_of(id).await, Some(TransactionStatus::Pending));

    h.repository.fail_updates.store(false, Ordering::SeqCst);

    let broker = h.broker.clone();
    let (partition, next_offset) = (report.partition, report.offset + 1);
    eventually("decision committed after store recovers", || {
        let broker = broker.clone();
        async move {
            broker.committed_offset(GROUP_ID, STATUS_TOPIC, partition) == Some(next_offset)
        }
    })
    .await;
    assert_eq!(h.repository.status_of(id).await, Some(TransactionStatus::Rejected));

    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn test_slow_update_is_retried_after_processing_timeout() {
    let h = harness_with(Config {
        processing_timeout_ms: 50,
        ..fast_config()
    })
    .await;
    let id = h.repository.seed_pending().await;
    h.repository.update_delay_ms.store(500, Ordering::SeqCst);

    let shutdown = CancellationToken::new();
    let consumer = h.components.status_consumer().spawn(&shutdown);
    let report = send_raw(&h.broker, id, &decision_json(id, "approved", None)).await;

    let repository = h.repository.clone();
    eventually("timed-out update retried", || {
        let repository = repository.clone();
        async move { repository.updates().len() >= 2 }
    })
    .await;
    assert_eq!(h.broker.committed_offset(GROUP_ID, STATUS_TOPIC, report.partition), None);
    assert_eq!(h.repository.status_of(id).await, Some(TransactionStatus::Pending));

    h.repository.update_delay_ms.store(0, Ordering::SeqCst);

    let broker = h.broker.clone();
    let (partition, next_offset) = (report.partition, report.offset + 1);
    eventually("decision committed once updates are fast", || {
        let broker = broker.clone();
        async move {
            broker.committed_offset(GROUP_ID, STATUS_TOPIC, partition) == Some(next_offset)
        }
    })
    .await;
    assert_eq!(h.repository.status_of(id).await, Some(TransactionStatus::Approved));

    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_finishes_in_flight_decision() {
    let h = harness().await;
    let id = h.repository.seed_pending().await;
    h.repository.update_delay_ms.store(300, Ordering::SeqCst);

    let shutdown = CancellationToken::new();
    let consumer = h.components.status_consumer().spawn(&shutdown);
    let report = send_raw(&h.broker, id, &decision_json(id, "rejected", Some("fraud"))).await;

    let repository = h.repository.clone();
    eventually("update in progress", || {
        let repository = repository.clone();
        async move { repository.updates().len() == 1 }
    })
    .await;
    assert_eq!(consumer.state(), ConsumerState::Processing);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), consumer.join())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(h.repository.status_of(id).await, Some(TransactionStatus::Rejected));
    assert_eq!(
        h.broker.committed_offset(GROUP_ID, STATUS_TOPIC, report.partition),
        Some(report.offset + 1)
    );
    assert_eq!(h.repository.updates().len(), 1);
}
