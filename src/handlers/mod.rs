pub mod transactions;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::health::check_health;
use crate::AppState;

/// Envelope shared by every JSON response.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: String,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: message.into(),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(data: Option<T>, message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            data,
            message: message.into(),
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let report = check_health(&state.health_checkers, state.start_time).await;

    // 503 only when a critical dependency (the database) is down.
    let status_code = if report.is_unhealthy() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (status_code, Json(report))
}
