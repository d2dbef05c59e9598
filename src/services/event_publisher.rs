//! Serializes domain events and hands them to the broker producer.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::broker::{BrokerError, DeliveryReport, Headers, MessageProducer, ProducerRecord};
use crate::domain::events::{TRANSACTION_CREATED, TRANSACTION_STATUS_DECIDED};
use crate::domain::DomainEvent;

pub const HEADER_EVENT_TYPE: &str = "event-type";
pub const HEADER_EVENT_ID: &str = "event-id";
pub const HEADER_OCCURRED_AT: &str = "occurred-at";
pub const HEADER_SOURCE_SERVICE: &str = "source-service";

pub const TRANSACTION_EVENTS_TOPIC: &str = "transaction-events";
pub const STATUS_EVENTS_TOPIC: &str = "transaction-status-events";
pub const DEFAULT_EVENTS_TOPIC: &str = "default-events";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to deliver event to {topic}: {source}")]
    Delivery {
        topic: String,
        #[source]
        source: BrokerError,
    },
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &DomainEvent) -> Result<DeliveryReport, PublishError>;
}

/// Event type → topic table. Unmapped types go to the fallback topic.
#[derive(Debug, Clone)]
pub struct TopicRoutes {
    routes: HashMap<&'static str, String>,
    fallback: String,
}

impl Default for TopicRoutes {
    fn default() -> Self {
        Self::new(
            TRANSACTION_EVENTS_TOPIC,
            STATUS_EVENTS_TOPIC,
            DEFAULT_EVENTS_TOPIC,
        )
    }
}

impl TopicRoutes {
    pub fn new(
        transaction_events: impl Into<String>,
        status_events: impl Into<String>,
        fallback: impl Into<String>,
    ) -> Self {
        let mut routes = HashMap::new();
        routes.insert(TRANSACTION_CREATED, transaction_events.into());
        routes.insert(TRANSACTION_STATUS_DECIDED, status_events.into());
        Self {
            routes,
            fallback: fallback.into(),
        }
    }

    /// Routes with no entries; every event goes to `fallback`.
    pub fn fallback_only(fallback: impl Into<String>) -> Self {
        Self {
            routes: HashMap::new(),
            fallback: fallback.into(),
        }
    }

    pub fn topic_for(&self, event_type: &str) -> &str {
        match self.routes.get(event_type) {
            Some(topic) => topic,
            None => {
                warn!(
                    event_type,
                    topic = %self.fallback,
                    "No topic mapped for event type, using fallback"
                );
                &self.fallback
            }
        }
    }
}

pub struct BrokerEventPublisher {
    producer: Arc<dyn MessageProducer>,
    routes: TopicRoutes,
    source_service: String,
}

impl BrokerEventPublisher {
    pub fn new(
        producer: Arc<dyn MessageProducer>,
        routes: TopicRoutes,
        source_service: impl Into<String>,
    ) -> Self {
        Self {
            producer,
            routes,
            source_service: source_service.into(),
        }
    }

    fn record_for(&self, event: &DomainEvent) -> Result<ProducerRecord, PublishError> {
        let payload = serde_json::to_vec(event)?;

        let mut headers = Headers::new();
        headers.insert(HEADER_EVENT_TYPE, event.event_type());
        headers.insert(HEADER_EVENT_ID, event.id().to_string());
        headers.insert(HEADER_OCCURRED_AT, event.occurred_at().to_rfc3339());
        headers.insert(HEADER_SOURCE_SERVICE, self.source_service.as_str());

        Ok(ProducerRecord {
            topic: self.routes.topic_for(event.event_type()).to_string(),
            key: event.partition_key(),
            payload,
            headers,
        })
    }
}

#[async_trait]
impl EventPublisher for BrokerEventPublisher {
    async fn publish(&self, event: &DomainEvent) -> Result<DeliveryReport, PublishError> {
        let record = self.record_for(event).map_err(|e| {
            error!(event_id = %event.id(), error = %e, "Failed to encode event");
            e
        })?;
        let topic = record.topic.clone();

        match self.producer.send(record).await {
            Ok(report) => {
                debug!(
                    event_id = %event.id(),
                    event_type = event.event_type(),
                    topic = %report.topic,
                    partition = report.partition,
                    offset = report.offset,
                    "Event published"
                );
                Ok(report)
            }
            Err(source) => {
                error!(
                    event_id = %event.id(),
                    event_type = event.event_type(),
                    topic = %topic,
                    error = %source,
                    "Failed to publish event"
                );
                Err(PublishError::Delivery { topic, source })
            }
        }
    }
}
