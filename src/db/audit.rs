use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Postgres, Result, Transaction as SqlxTransaction};
use uuid::Uuid;

pub const ENTITY_TRANSACTION: &str = "transaction";

pub const ACTION_CREATED: &str = "created";
pub const ACTION_UPDATED: &str = "updated";

/// A single field overwrite to be recorded.
#[derive(Debug)]
pub struct FieldUpdate<'a> {
    pub entity_id: Uuid,
    pub entity_type: &'a str,
    pub field: &'a str,
    pub old_val: Value,
    pub new_val: Value,
    pub reason: Option<&'a str>,
    pub actor: &'a str,
    pub at: DateTime<Utc>,
}

/// Append-only audit trail written inside the caller's database transaction.
pub struct AuditLog;

impl AuditLog {
    pub async fn log_creation(
        executor: &mut SqlxTransaction<'_, Postgres>,
        entity_id: Uuid,
        entity_type: &str,
        new_val: Value,
        actor: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (id, entity_id, entity_type, action, new_val, actor)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entity_id)
        .bind(entity_type)
        .bind(ACTION_CREATED)
        .bind(new_val)
        .bind(actor)
        .execute(&mut **executor)
        .await?;

        Ok(())
    }

    pub async fn log_field_update(
        executor: &mut SqlxTransaction<'_, Postgres>,
        update: FieldUpdate<'_>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (
                id, entity_id, entity_type, action, field_name,
                old_val, new_val, reason, actor, timestamp
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(update.entity_id)
        .bind(update.entity_type)
        .bind(ACTION_UPDATED)
        .bind(update.field)
        .bind(update.old_val)
        .bind(update.new_val)
        .bind(update.reason)
        .bind(update.actor)
        .bind(update.at)
        .execute(&mut **executor)
        .await?;

        Ok(())
    }
}
