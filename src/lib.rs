pub mod adapters;
pub mod broker;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod ports;
pub mod services;
pub mod startup;
pub mod telemetry;
pub mod use_cases;
pub mod validation;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Instant;

use crate::health::DependencyChecker;
use crate::middleware::request_logger_middleware;
use crate::ports::TransactionRepository;
use crate::use_cases::TransactionCommandHandler;

#[derive(Clone)]
pub struct AppState {
    pub commands: Arc<TransactionCommandHandler>,
    pub repository: Arc<dyn TransactionRepository>,
    pub health_checkers: Arc<Vec<Arc<dyn DependencyChecker>>>,
    pub start_time: Instant,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/transactions",
            post(handlers::transactions::create_transaction),
        )
        .route("/transactions/:id", get(handlers::transactions::get_transaction))
        .route(
            "/transactions/:id/history",
            get(handlers::transactions::get_status_history),
        )
        .layer(axum::middleware::from_fn(request_logger_middleware))
        .with_state(state)
}
