//! Domain events exchanged with the fraud-analysis side over the broker.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use super::transaction::{Transaction, TransactionStatus};

pub const TRANSACTION_CREATED: &str = "transaction.created";
pub const TRANSACTION_STATUS_DECIDED: &str = "transaction.status.decided";

/// Envelope shared by every event: identity, timestamp and the tagged payload.
///
/// Serialized flat, e.g. `{"id", "occurredAt", "eventType", ...payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    id: Uuid,
    occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType")]
pub enum EventPayload {
    #[serde(rename = "transaction.created")]
    TransactionCreated(TransactionCreated),
    #[serde(rename = "transaction.status.decided")]
    TransactionStatusDecision(TransactionStatusDecision),
}

/// Snapshot of a transaction at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionCreated {
    pub transaction_external_id: Uuid,
    pub source_account_id: Uuid,
    pub target_account_id: Uuid,
    pub transfer_type_id: i32,
    pub value: BigDecimal,
    pub status: TransactionStatus,
}

/// A status asserted by the fraud system. `status` is free text and is only
/// interpreted by the status update handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionStatusDecision {
    pub transaction_id: Uuid,
    pub status: String,
    pub reason: Option<String>,
    pub processed_at: DateTime<Utc>,
    pub source: String,
}

impl DomainEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            payload,
        }
    }

    pub fn transaction_created(tx: &Transaction) -> Self {
        Self::new(EventPayload::TransactionCreated(TransactionCreated {
            transaction_external_id: tx.external_id(),
            source_account_id: tx.source_account_id(),
            target_account_id: tx.target_account_id(),
            transfer_type_id: tx.transfer_type_id(),
            value: tx.value().clone(),
            status: tx.status(),
        }))
    }

    pub fn status_decision(decision: TransactionStatusDecision) -> Self {
        Self::new(EventPayload::TransactionStatusDecision(decision))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub fn event_type(&self) -> &'static str {
        match self.payload {
            EventPayload::TransactionCreated(_) => TRANSACTION_CREATED,
            EventPayload::TransactionStatusDecision(_) => TRANSACTION_STATUS_DECIDED,
        }
    }

    /// The transaction this event is about, if any.
    pub fn transaction_id(&self) -> Option<Uuid> {
        match &self.payload {
            EventPayload::TransactionCreated(created) => Some(created.transaction_external_id),
            EventPayload::TransactionStatusDecision(decision) => Some(decision.transaction_id),
        }
    }

    /// Key used to route the event to a partition. Events about the same
    /// transaction share a key and therefore a partition.
    pub fn partition_key(&self) -> String {
        self.transaction_id().unwrap_or(self.id).to_string()
    }
}

#[derive(Debug, Error)]
pub enum DecisionDecodeError {
    #[error("malformed decision payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("decision payload must be a JSON object")]
    NotAnObject,
}

/// Wire shape of a decision after key normalisation. Field names are the
/// lowercased camelCase names.
#[derive(Deserialize)]
struct RawDecision {
    #[serde(rename = "transactionid")]
    transaction_id: Uuid,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(rename = "processedat", default)]
    processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    source: Option<String>,
}

impl TransactionStatusDecision {
    /// Decodes a decision message, matching field names case-insensitively.
    ///
    /// A missing or null `status` decodes to an empty string so that the
    /// handler reports it as an invalid status. A missing `processedAt` is
    /// stamped with the decode time.
    pub fn decode(payload: &[u8]) -> Result<Self, DecisionDecodeError> {
        let Value::Object(fields) = serde_json::from_slice::<Value>(payload)? else {
            return Err(DecisionDecodeError::NotAnObject);
        };

        let normalized: Map<String, Value> = fields
            .into_iter()
            .map(|(key, value)| (key.to_ascii_lowercase(), value))
            .collect();

        let raw: RawDecision = serde_json::from_value(Value::Object(normalized))?;

        Ok(Self {
            transaction_id: raw.transaction_id,
            status: raw.status.unwrap_or_default(),
            reason: raw.reason,
            processed_at: raw.processed_at.unwrap_or_else(Utc::now),
            source: raw.source.unwrap_or_default(),
        })
    }
}
