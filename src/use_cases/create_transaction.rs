//! Create transaction use case.
//! Persists a new transaction, then announces it with a `transaction.created` event.

use bigdecimal::BigDecimal;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use crate::domain::{DomainEvent, Transaction, TransactionStatus};
use crate::ports::{RepositoryError, TransactionRepository};
use crate::services::event_publisher::{EventPublisher, PublishError};
use crate::validation::{
    validate_account_id, validate_positive_value, validate_value_precision, ValidationError,
    VALUE_SCALE,
};

/// Input for the CreateTransaction use case.
#[derive(Debug, Clone)]
pub struct CreateTransaction {
    pub source_account_id: Uuid,
    pub target_account_id: Uuid,
    pub transfer_type_id: i32,
    pub value: BigDecimal,
    /// Defaults to `Pending`.
    pub status: Option<TransactionStatus>,
}

#[derive(Debug, Error)]
pub enum CreateTransactionError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("failed to store transaction: {0}")]
    Store(#[from] RepositoryError),

    /// The transaction is stored but its creation event was not delivered.
    #[error("transaction {transaction_id} was stored but not announced: {source}")]
    Unannounced {
        transaction_id: Uuid,
        #[source]
        source: PublishError,
    },
}

pub struct TransactionCommandHandler {
    repository: Arc<dyn TransactionRepository>,
    publisher: Arc<dyn EventPublisher>,
}

impl TransactionCommandHandler {
    pub fn new(
        repository: Arc<dyn TransactionRepository>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            repository,
            publisher,
        }
    }

    pub async fn create(&self, input: CreateTransaction) -> Result<Uuid, CreateTransactionError> {
        validate_account_id("sourceAccountId", &input.source_account_id)?;
        validate_account_id("targetAccountId", &input.target_account_id)?;
        validate_positive_value(&input.value)?;
        validate_value_precision(&input.value)?;

        // Same scale as the stored column, so the event matches the row.
        let tx = Transaction::new(
            input.source_account_id,
            input.target_account_id,
            input.transfer_type_id,
            input.value.with_scale(VALUE_SCALE),
            input.status.unwrap_or_default(),
        );
        let transaction_id = tx.external_id();

        self.repository.add(&tx).await?;

        let event = DomainEvent::transaction_created(&tx);
        if let Err(source) = self.publisher.publish(&event).await {
            error!(
                transaction_id = %transaction_id,
                event_id = %event.id(),
                error = %source,
                "Transaction stored but creation event was not published"
            );
            return Err(CreateTransactionError::Unannounced {
                transaction_id,
                source,
            });
        }

        info!(
            transaction_id = %transaction_id,
            transfer_type_id = tx.transfer_type_id(),
            "Transaction created"
        );
        Ok(transaction_id)
    }
}
