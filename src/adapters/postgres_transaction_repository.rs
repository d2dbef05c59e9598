//! Postgres implementation of TransactionRepository.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::audit::{AuditLog, FieldUpdate, ENTITY_TRANSACTION};
use crate::domain::{Transaction, TransactionStatus};
use crate::ports::{RepositoryError, RepositoryResult, StatusChange, TransactionRepository};
use crate::validation::VALUE_SCALE;

const ACTOR: &str = "transaction-service";

/// Postgres-backed transaction repository.
#[derive(Clone)]
pub struct PostgresTransactionRepository {
    pool: PgPool,
}

impl PostgresTransactionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_insert_error(err: sqlx::Error, id: Uuid) -> RepositoryError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Duplicate(id),
        _ => RepositoryError::from(err),
    }
}

fn decode_status(code: i16) -> RepositoryResult<TransactionStatus> {
    TransactionStatus::from_code(code).ok_or(RepositoryError::UnknownStatusCode(code))
}

/// Audit values hold the status name as a JSON string.
fn status_from_audit(value: Option<Value>) -> Option<TransactionStatus> {
    value
        .as_ref()
        .and_then(Value::as_str)
        .and_then(|name| name.parse().ok())
}

#[async_trait]
impl TransactionRepository for PostgresTransactionRepository {
    async fn add(&self, tx: &Transaction) -> RepositoryResult<()> {
        let mut db_tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO transactions (
                external_id, source_account_id, target_account_id,
                transfer_type_id, value, status, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(tx.external_id())
        .bind(tx.source_account_id())
        .bind(tx.target_account_id())
        .bind(tx.transfer_type_id())
        .bind(tx.value())
        .bind(tx.status().code())
        .bind(tx.created_at())
        .execute(&mut *db_tx)
        .await
        .map_err(|e| map_insert_error(e, tx.external_id()))?;

        AuditLog::log_creation(
            &mut db_tx,
            tx.external_id(),
            ENTITY_TRANSACTION,
            json!({
                "source_account_id": tx.source_account_id(),
                "target_account_id": tx.target_account_id(),
                "transfer_type_id": tx.transfer_type_id(),
                "value": tx.value().to_string(),
                "status": tx.status().as_str(),
            }),
            ACTOR,
        )
        .await?;

        db_tx.commit().await?;
        Ok(())
    }

    async fn get_by_external_id(&self, id: Uuid) -> RepositoryResult<Option<Transaction>> {
        let row = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT external_id, source_account_id, target_account_id,
                   transfer_type_id, value, status, created_at
            FROM transactions
            WHERE external_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TransactionRow::into_domain).transpose()
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: TransactionStatus,
        reason: Option<&str>,
    ) -> RepositoryResult<StatusChange> {
        let mut db_tx = self.pool.begin().await?;

        // Row lock keeps the previous status and the overwrite consistent.
        let previous: Option<i16> = sqlx::query_scalar(
            "SELECT status FROM transactions WHERE external_id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *db_tx)
        .await?;

        let Some(previous) = previous else {
            return Err(RepositoryError::NotFound(id));
        };
        let previous = decode_status(previous)?;

        sqlx::query("UPDATE transactions SET status = $1 WHERE external_id = $2")
            .bind(status.code())
            .bind(id)
            .execute(&mut *db_tx)
            .await?;

        let changed_at = Utc::now();
        AuditLog::log_field_update(
            &mut db_tx,
            FieldUpdate {
                entity_id: id,
                entity_type: ENTITY_TRANSACTION,
                field: "status",
                old_val: json!(previous.as_str()),
                new_val: json!(status.as_str()),
                reason,
                actor: ACTOR,
                at: changed_at,
            },
        )
        .await?;

        db_tx.commit().await?;

        Ok(StatusChange {
            transaction_id: id,
            previous_status: previous,
            new_status: status,
            reason: reason.map(str::to_string),
            changed_at,
        })
    }

    async fn status_history(&self, id: Uuid) -> RepositoryResult<Vec<StatusChange>> {
        type HistoryRow = (Option<Value>, Option<Value>, Option<String>, DateTime<Utc>);
        let rows = sqlx::query_as::<_, HistoryRow>(
            r#"
            SELECT old_val, new_val, reason, timestamp
            FROM audit_logs
            WHERE entity_id = $1 AND entity_type = $2 AND field_name = 'status'
            ORDER BY timestamp ASC
            "#,
        )
        .bind(id)
        .bind(ENTITY_TRANSACTION)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(old_val, new_val, reason, changed_at)| {
                Some(StatusChange {
                    transaction_id: id,
                    previous_status: status_from_audit(old_val)?,
                    new_status: status_from_audit(new_val)?,
                    reason,
                    changed_at,
                })
            })
            .collect())
    }
}

/// Internal row type for SQLx. Not exposed outside the adapter.
#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    external_id: Uuid,
    source_account_id: Uuid,
    target_account_id: Uuid,
    transfer_type_id: i32,
    value: BigDecimal,
    status: i16,
    created_at: DateTime<Utc>,
}

impl TransactionRow {
    fn into_domain(self) -> RepositoryResult<Transaction> {
        Ok(Transaction::rehydrate(
            self.external_id,
            self.source_account_id,
            self.target_account_id,
            self.transfer_type_id,
            // NUMERIC decodes with a base-10000 scale, e.g. 10.1000.
            self.value.with_scale(VALUE_SCALE),
            decode_status(self.status)?,
            self.created_at,
        ))
    }
}
