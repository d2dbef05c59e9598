use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use uuid::Uuid;

use crate::handlers::ApiResponse;
use crate::ports::RepositoryError;
use crate::use_cases::CreateTransactionError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Store(#[from] RepositoryError),

    #[error("Transaction {transaction_id} was stored but its creation event was not published: {reason}")]
    Unannounced { transaction_id: Uuid, reason: String },
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Store(_) | AppError::Unannounced { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "Invalid transaction request",
            AppError::BadRequest(_) => "Malformed request body",
            AppError::NotFound(_) => "Resource not found",
            AppError::Store(_) => "Failed to access transaction storage",
            AppError::Unannounced { .. } => "Transaction stored but not announced",
        }
    }
}

impl From<CreateTransactionError> for AppError {
    fn from(err: CreateTransactionError) -> Self {
        match err {
            CreateTransactionError::Validation(e) => AppError::Validation(e.to_string()),
            CreateTransactionError::Store(e) => AppError::Store(e),
            CreateTransactionError::Unannounced {
                transaction_id,
                source,
            } => AppError::Unannounced {
                transaction_id,
                reason: source.to_string(),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "Request failed");
        }

        let data = match &self {
            AppError::Unannounced { transaction_id, .. } => Some(*transaction_id),
            _ => None,
        };
        // Storage details (tables, constraints) stay in the log.
        let detail = match &self {
            AppError::Store(_) => "Storage error".to_string(),
            _ => self.to_string(),
        };
        let body = ApiResponse::failure(data, self.message(), detail);

        (status, Json(body)).into_response()
    }
}
