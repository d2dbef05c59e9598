//! In-memory implementation of TransactionRepository.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{Transaction, TransactionStatus};
use crate::ports::{RepositoryError, RepositoryResult, StatusChange, TransactionRepository};

#[derive(Default)]
struct State {
    transactions: HashMap<Uuid, Transaction>,
    history: HashMap<Uuid, Vec<StatusChange>>,
}

/// A thread-safe in-memory transaction store.
///
/// Status updates and their history entries are written under one lock, so
/// readers never see one without the other. Used when no `DATABASE_URL` is
/// configured and in tests.
#[derive(Default, Clone)]
pub struct InMemoryTransactionRepository {
    state: Arc<RwLock<State>>,
}

impl InMemoryTransactionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.transactions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TransactionRepository for InMemoryTransactionRepository {
    async fn add(&self, tx: &Transaction) -> RepositoryResult<()> {
        let mut state = self.state.write().await;
        if state.transactions.contains_key(&tx.external_id()) {
            return Err(RepositoryError::Duplicate(tx.external_id()));
        }
        state.transactions.insert(tx.external_id(), tx.clone());
        Ok(())
    }

    async fn get_by_external_id(&self, id: Uuid) -> RepositoryResult<Option<Transaction>> {
        Ok(self.state.read().await.transactions.get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: TransactionStatus,
        reason: Option<&str>,
    ) -> RepositoryResult<StatusChange> {
        let mut state = self.state.write().await;
        let current = state
            .transactions
            .remove(&id)
            .ok_or(RepositoryError::NotFound(id))?;

        let change = StatusChange {
            transaction_id: id,
            previous_status: current.status(),
            new_status: status,
            reason: reason.map(str::to_string),
            changed_at: Utc::now(),
        };

        state.transactions.insert(id, current.with_status(status));
        state.history.entry(id).or_default().push(change.clone());
        Ok(change)
    }

    async fn status_history(&self, id: Uuid) -> RepositoryResult<Vec<StatusChange>> {
        Ok(self
            .state
            .read()
            .await
            .history
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }
}
