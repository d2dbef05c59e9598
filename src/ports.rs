//! Ports the application layer depends on. Adapters implement them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{Transaction, TransactionStatus};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("transaction {0} not found")]
    NotFound(Uuid),

    #[error("transaction {0} already exists")]
    Duplicate(Uuid),

    #[error("unrecognised status code {0} in storage")]
    UnknownStatusCode(i16),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// One recorded status overwrite, including the reason given by the decider.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub transaction_id: Uuid,
    pub previous_status: TransactionStatus,
    pub new_status: TransactionStatus,
    pub reason: Option<String>,
    pub changed_at: DateTime<Utc>,
}

/// Durable transaction storage.
///
/// `add` and `update_status` must be durable before they return `Ok`.
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    async fn add(&self, tx: &Transaction) -> RepositoryResult<()>;

    async fn get_by_external_id(&self, id: Uuid) -> RepositoryResult<Option<Transaction>>;

    /// Overwrites the status of one transaction and records the change with
    /// its reason. Returns `NotFound` when no such transaction exists.
    async fn update_status(
        &self,
        id: Uuid,
        status: TransactionStatus,
        reason: Option<&str>,
    ) -> RepositoryResult<StatusChange>;

    /// Status changes for a transaction, oldest first.
    async fn status_history(&self, id: Uuid) -> RepositoryResult<Vec<StatusChange>>;
}
