//! Transaction domain entity.
//! Framework-agnostic representation of a transfer request and its status.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle status of a transaction. Stored as its integer code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl TransactionStatus {
    pub const ALL: [TransactionStatus; 3] = [
        TransactionStatus::Pending,
        TransactionStatus::Approved,
        TransactionStatus::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "Pending",
            TransactionStatus::Approved => "Approved",
            TransactionStatus::Rejected => "Rejected",
        }
    }

    pub fn code(&self) -> i16 {
        match self {
            TransactionStatus::Pending => 1,
            TransactionStatus::Approved => 2,
            TransactionStatus::Rejected => 3,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.code() == code)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status text that does not name a member of [`TransactionStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transaction status: {0:?}")]
pub struct InvalidStatus(pub String);

impl FromStr for TransactionStatus {
    type Err = InvalidStatus;

    /// Case-insensitive match on the status name. Numeric codes are rejected.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let wanted = raw.trim();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| InvalidStatus(raw.to_string()))
    }
}

/// Known transfer type codes. The stored code is not restricted to these.
pub const TRANSFER_TYPE_TRANSFER: i32 = 1;
pub const TRANSFER_TYPE_PAYMENT: i32 = 2;

/// Domain entity representing a transfer between two accounts.
///
/// Fields are read-only outside the store; the only mutation the system
/// performs is a status overwrite, which goes through
/// [`TransactionRepository::update_status`](crate::ports::TransactionRepository::update_status).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    #[serde(rename = "transactionExternalId")]
    external_id: Uuid,
    source_account_id: Uuid,
    target_account_id: Uuid,
    transfer_type_id: i32,
    value: BigDecimal,
    status: TransactionStatus,
    created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(
        source_account_id: Uuid,
        target_account_id: Uuid,
        transfer_type_id: i32,
        value: BigDecimal,
        status: TransactionStatus,
    ) -> Self {
        Self {
            external_id: Uuid::new_v4(),
            source_account_id,
            target_account_id,
            transfer_type_id,
            value,
            status,
            created_at: Utc::now(),
        }
    }

    /// Rebuilds an entity from its stored representation.
    pub(crate) fn rehydrate(
        external_id: Uuid,
        source_account_id: Uuid,
        target_account_id: Uuid,
        transfer_type_id: i32,
        value: BigDecimal,
        status: TransactionStatus,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            external_id,
            source_account_id,
            target_account_id,
            transfer_type_id,
            value,
            status,
            created_at,
        }
    }

    pub(crate) fn with_status(mut self, status: TransactionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn external_id(&self) -> Uuid {
        self.external_id
    }

    pub fn source_account_id(&self) -> Uuid {
        self.source_account_id
    }

    pub fn target_account_id(&self) -> Uuid {
        self.target_account_id
    }

    pub fn transfer_type_id(&self) -> i32 {
        self.transfer_type_id
    }

    pub fn value(&self) -> &BigDecimal {
        &self.value
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
