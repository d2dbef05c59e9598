use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use bigdecimal::BigDecimal;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::handlers::ApiResponse;
use crate::use_cases::CreateTransaction;
use crate::AppState;

/// Body of `POST /transactions`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransactionRequest {
    pub source_account_id: Uuid,
    pub target_account_id: Uuid,
    pub transfer_type_id: i32,
    pub value: BigDecimal,
}

impl From<CreateTransactionRequest> for CreateTransaction {
    fn from(req: CreateTransactionRequest) -> Self {
        CreateTransaction {
            source_account_id: req.source_account_id,
            target_account_id: req.target_account_id,
            transfer_type_id: req.transfer_type_id,
            value: req.value,
            status: None,
        }
    }
}

fn transaction_id(path: Result<Path<Uuid>, PathRejection>) -> Result<Uuid, AppError> {
    path.map(|Path(id)| id)
        .map_err(|rejection| AppError::BadRequest(rejection.body_text()))
}

pub async fn create_transaction(
    State(state): State<AppState>,
    payload: Result<Json<CreateTransactionRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(payload) = payload.map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;

    let id = state.commands.create(payload.into()).await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(id, "Transaction created")),
    ))
}

pub async fn get_transaction(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<impl IntoResponse, AppError> {
    let id = transaction_id(path)?;
    let tx = state
        .repository
        .get_by_external_id(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Transaction {} not found", id)))?;

    Ok(Json(ApiResponse::success(tx, "Transaction found")))
}

pub async fn get_status_history(
    State(state): State<AppState>,
    path: Result<Path<Uuid>, PathRejection>,
) -> Result<impl IntoResponse, AppError> {
    let id = transaction_id(path)?;
    if state.repository.get_by_external_id(id).await?.is_none() {
        return Err(AppError::NotFound(format!("Transaction {} not found", id)));
    }

    let history = state.repository.status_history(id).await?;
    Ok(Json(ApiResponse::success(history, "Status history")))
}
