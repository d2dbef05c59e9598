pub mod events;
pub mod transaction;

pub use events::{DomainEvent, EventPayload, TransactionCreated, TransactionStatusDecision};
pub use transaction::{InvalidStatus, Transaction, TransactionStatus};
