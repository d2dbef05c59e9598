//! Applies externally decided statuses to stored transactions.

use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{InvalidStatus, TransactionStatus};
use crate::ports::{RepositoryError, StatusChange, TransactionRepository};

#[derive(Debug, Error)]
pub enum StatusUpdateError {
    #[error("transaction {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    InvalidStatus(#[from] InvalidStatus),

    #[error("store failure: {0}")]
    Store(RepositoryError),
}

impl StatusUpdateError {
    /// Permanent failures will not succeed on redelivery.
    pub fn is_permanent(&self) -> bool {
        matches!(self, StatusUpdateError::InvalidStatus(_))
    }
}

impl From<RepositoryError> for StatusUpdateError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(id) => StatusUpdateError::NotFound(id),
            other => StatusUpdateError::Store(other),
        }
    }
}

pub struct StatusUpdateHandler {
    repository: Arc<dyn TransactionRepository>,
}

impl StatusUpdateHandler {
    pub fn new(repository: Arc<dyn TransactionRepository>) -> Self {
        Self { repository }
    }

    /// Sets the status of `transaction_id` to the status named by
    /// `status_text`. The name is matched case-insensitively; numeric codes
    /// are not accepted. Re-applying the current status succeeds and leaves
    /// the transaction unchanged.
    pub async fn apply_decision(
        &self,
        transaction_id: Uuid,
        status_text: &str,
        reason: Option<&str>,
    ) -> Result<StatusChange, StatusUpdateError> {
        let current = self
            .repository
            .get_by_external_id(transaction_id)
            .await?
            .ok_or(StatusUpdateError::NotFound(transaction_id))?;

        let status: TransactionStatus = status_text.parse()?;

        if current.status().is_terminal() && current.status() != status {
            warn!(
                transaction_id = %transaction_id,
                from = %current.status(),
                to = %status,
                "Overwriting a terminal status"
            );
        }

        let change = self
            .repository
            .update_status(transaction_id, status, reason)
            .await?;

        info!(
            transaction_id = %transaction_id,
            from = %change.previous_status,
            to = %change.new_status,
            reason = reason.unwrap_or(""),
            "Transaction status updated"
        );

        Ok(change)
    }
}
