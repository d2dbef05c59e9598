use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::timeout;

use crate::services::ConsumerState;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: BTreeMap<String, DependencyStatus>,
}

impl HealthResponse {
    pub fn is_unhealthy(&self) -> bool {
        self.status == "unhealthy"
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencyStatus {
    Healthy { status: String, latency_ms: u64 },
    Unhealthy { status: String, error: String },
}

#[async_trait]
pub trait DependencyChecker: Send + Sync {
    fn name(&self) -> &'static str;

    /// A failing critical dependency makes the whole service unhealthy;
    /// others only degrade it.
    fn is_critical(&self) -> bool;

    async fn check(&self) -> DependencyStatus;
}

pub struct PostgresChecker {
    pool: sqlx::PgPool,
}

impl PostgresChecker {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DependencyChecker for PostgresChecker {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn is_critical(&self) -> bool {
        true
    }

    async fn check(&self) -> DependencyStatus {
        let start = Instant::now();
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => DependencyStatus::Healthy {
                status: "healthy".to_string(),
                latency_ms: start.elapsed().as_millis() as u64,
            },
            Err(e) => DependencyStatus::Unhealthy {
                status: "unhealthy".to_string(),
                error: e.to_string(),
            },
        }
    }
}

/// Reports the state of the status event consumer.
pub struct ConsumerChecker {
    state: watch::Receiver<ConsumerState>,
}

impl ConsumerChecker {
    pub fn new(state: watch::Receiver<ConsumerState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl DependencyChecker for ConsumerChecker {
    fn name(&self) -> &'static str {
        "status_consumer"
    }

    fn is_critical(&self) -> bool {
        false
    }

    async fn check(&self) -> DependencyStatus {
        let state = *self.state.borrow();
        if state.is_running() {
            DependencyStatus::Healthy {
                status: state.to_string(),
                latency_ms: 0,
            }
        } else {
            DependencyStatus::Unhealthy {
                status: state.to_string(),
                error: "consumer is not running".to_string(),
            }
        }
    }
}

pub async fn check_health(
    checkers: &[Arc<dyn DependencyChecker>],
    start_time: Instant,
) -> HealthResponse {
    let mut dependencies = BTreeMap::new();
    let mut has_critical_failure = false;
    let mut has_non_critical_failure = false;

    for checker in checkers {
        let status = timeout(CHECK_TIMEOUT, checker.check())
            .await
            .unwrap_or_else(|_| DependencyStatus::Unhealthy {
                status: "unhealthy".to_string(),
                error: "timeout".to_string(),
            });

        if matches!(status, DependencyStatus::Unhealthy { .. }) {
            if checker.is_critical() {
                has_critical_failure = true;
            } else {
                has_non_critical_failure = true;
            }
        }
        dependencies.insert(checker.name().to_string(), status);
    }

    let status = if has_critical_failure {
        "unhealthy"
    } else if has_non_critical_failure {
        "degraded"
    } else {
        "healthy"
    };

    HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: start_time.elapsed().as_secs(),
        dependencies,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        name: &'static str,
        critical: bool,
        healthy: bool,
    }

    #[async_trait]
    impl DependencyChecker for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        fn is_critical(&self) -> bool {
            self.critical
        }

        async fn check(&self) -> DependencyStatus {
            if self.healthy {
                DependencyStatus::Healthy {
                    status: "healthy".to_string(),
                    latency_ms: 1,
                }
            } else {
                DependencyStatus::Unhealthy {
                    status: "unhealthy".to_string(),
                    error: "down".to_string(),
                }
            }
        }
    }

    fn checker(name: &'static str, critical: bool, healthy: bool) -> Arc<dyn DependencyChecker> {
        Arc::new(Fixed {
            name,
            critical,
            healthy,
        })
    }

    #[tokio::test]
    async fn test_all_healthy() {
        let report = check_health(
            &[checker("postgres", true, true), checker("status_consumer", false, true)],
            Instant::now(),
        )
        .await;
        assert_eq!(report.status, "healthy");
        assert_eq!(report.dependencies.len(), 2);
    }

    #[tokio::test]
    async fn test_non_critical_failure_degrades() {
        let report = check_health(
            &[checker("postgres", true, true), checker("status_consumer", false, false)],
            Instant::now(),
        )
        .await;
        assert_eq!(report.status, "degraded");
        assert!(!report.is_unhealthy());
    }

    #[tokio::test]
    async fn test_critical_failure_is_unhealthy() {
        let report = check_health(&[checker("postgres", true, false)], Instant::now()).await;
        assert!(report.is_unhealthy());
    }

    #[tokio::test]
    async fn test_consumer_checker_reports_state() {
        let (tx, rx) = watch::channel(ConsumerState::Polling);
        let checker = ConsumerChecker::new(rx);
        assert!(matches!(
            checker.check().await,
            DependencyStatus::Healthy { ref status, .. } if status == "polling"
        ));

        tx.send_replace(ConsumerState::Closed);
        assert!(matches!(
            checker.check().await,
            DependencyStatus::Unhealthy { ref status, .. } if status == "closed"
        ));
    }
}
