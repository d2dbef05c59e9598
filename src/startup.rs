//! Wires configuration into concrete stores, broker clients and services.

use anyhow::{Context, Result};
use sqlx::PgPool;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapters::{InMemoryTransactionRepository, PostgresTransactionRepository};
use crate::broker::{
    BrokerError, ConsumerConfig, InMemoryBroker, MessageConsumer, MessageProducer, PgBroker,
    ProducerConfig,
};
use crate::config::{BrokerBackend, Config};
use crate::health::{ConsumerChecker, DependencyChecker, PostgresChecker};
use crate::ports::TransactionRepository;
use crate::services::{
    BrokerEventPublisher, ConsumerHandle, ConsumerState, EventPublisher, StatusEventConsumer,
    StatusUpdateHandler,
};
use crate::use_cases::TransactionCommandHandler;
use crate::{create_app, AppState};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// The configured broker backend.
#[derive(Clone)]
pub enum Broker {
    Memory(InMemoryBroker),
    Postgres(PgBroker),
}

impl Broker {
    pub fn producer(
        &self,
        config: ProducerConfig,
    ) -> Result<Arc<dyn MessageProducer>, BrokerError> {
        Ok(match self {
            Broker::Memory(broker) => Arc::new(broker.producer(config)?),
            Broker::Postgres(broker) => Arc::new(broker.producer(config)?),
        })
    }

    pub fn consumer(&self, config: ConsumerConfig) -> Box<dyn MessageConsumer> {
        match self {
            Broker::Memory(broker) => Box::new(broker.consumer(config)),
            Broker::Postgres(broker) => Box::new(broker.consumer(config)),
        }
    }

    pub async fn ensure_topics(&self, topics: &[&str]) -> Result<(), BrokerError> {
        for topic in topics {
            match self {
                Broker::Memory(broker) => broker.create_topic(topic)?,
                Broker::Postgres(broker) => broker.ensure_topic(topic).await?,
            }
        }
        Ok(())
    }
}

/// Everything a process needs, built once at startup and shared by reference.
pub struct Components {
    pub config: Config,
    pub pool: Option<PgPool>,
    pub repository: Arc<dyn TransactionRepository>,
    pub broker: Broker,
    pub producer: Arc<dyn MessageProducer>,
    pub publisher: Arc<dyn EventPublisher>,
}

impl Components {
    /// Connects to the database when one is configured, runs migrations and
    /// picks the store and broker backends.
    pub async fn build(config: Config) -> Result<Self> {
        let pool = match &config.database_url {
            Some(url) => {
                let pool = crate::db::create_pool(url, config.database_max_connections)
                    .await
                    .context("Failed to connect to database")?;
                crate::db::run_migrations(&pool).await?;
                Some(pool)
            }
            None => {
                warn!("DATABASE_URL not set, transactions are kept in memory");
                None
            }
        };

        let repository: Arc<dyn TransactionRepository> = match &pool {
            Some(pool) => Arc::new(PostgresTransactionRepository::new(pool.clone())),
            None => Arc::new(InMemoryTransactionRepository::new()),
        };

        let broker = match (config.broker_backend, &pool) {
            (BrokerBackend::Postgres, Some(pool)) => {
                Broker::Postgres(PgBroker::new(pool.clone(), config.broker_partitions))
            }
            (BrokerBackend::Postgres, None) => {
                anyhow::bail!("BROKER_BACKEND=postgres requires DATABASE_URL")
            }
            (BrokerBackend::Memory, _) => {
                Broker::Memory(InMemoryBroker::new(config.broker_partitions))
            }
        };

        Self::assemble(config, pool, repository, broker).await
    }

    /// Builds components around an existing store and broker.
    pub async fn assemble(
        config: Config,
        pool: Option<PgPool>,
        repository: Arc<dyn TransactionRepository>,
        broker: Broker,
    ) -> Result<Self> {
        broker
            .ensure_topics(&[
                config.transaction_events_topic.as_str(),
                config.status_events_topic.as_str(),
                config.default_events_topic.as_str(),
            ])
            .await?;

        let producer = broker.producer(config.producer_config())?;
        let publisher: Arc<dyn EventPublisher> = Arc::new(BrokerEventPublisher::new(
            producer.clone(),
            config.topic_routes(),
            config.service_name.clone(),
        ));

        let backend = match broker {
            Broker::Memory(_) => "memory",
            Broker::Postgres(_) => "postgres",
        };
        info!(
            broker = backend,
            store = if pool.is_some() { "postgres" } else { "memory" },
            "Components initialized"
        );

        Ok(Self {
            config,
            pool,
            repository,
            broker,
            producer,
            publisher,
        })
    }

    pub fn command_handler(&self) -> Arc<TransactionCommandHandler> {
        Arc::new(TransactionCommandHandler::new(
            self.repository.clone(),
            self.publisher.clone(),
        ))
    }

    pub fn status_consumer(&self) -> StatusEventConsumer {
        StatusEventConsumer::new(
            self.broker.consumer(self.config.consumer_config()),
            Arc::new(StatusUpdateHandler::new(self.repository.clone())),
            self.config.consumer_settings(),
        )
    }

    pub fn app_state(&self, consumer_state: watch::Receiver<ConsumerState>) -> AppState {
        let mut checkers: Vec<Arc<dyn DependencyChecker>> =
            vec![Arc::new(ConsumerChecker::new(consumer_state))];
        if let Some(pool) = &self.pool {
            checkers.push(Arc::new(PostgresChecker::new(pool.clone())));
        }

        AppState {
            commands: self.command_handler(),
            repository: self.repository.clone(),
            health_checkers: Arc::new(checkers),
            start_time: Instant::now(),
        }
    }

    /// Waits for in-flight sends before the process exits.
    pub async fn flush(&self) {
        if let Err(e) = self.producer.flush(FLUSH_TIMEOUT).await {
            warn!(error = %e, "Producer flush did not complete");
        }
    }
}

/// Runs the HTTP server and the status consumer until `shutdown` fires.
pub async fn serve(components: Components, shutdown: CancellationToken) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], components.config.server_port));
    let server = axum::Server::try_bind(&addr).with_context(|| format!("Failed to bind {}", addr))?;
    info!("listening on {}", addr);

    let consumer = components.status_consumer().spawn(&shutdown);
    let app = create_app(components.app_state(consumer.state_receiver()));

    let server_shutdown = shutdown.clone();
    let served = server
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await;

    // The server may also stop on its own error; take the consumer down with it.
    shutdown.cancel();
    stop_consumer(consumer).await;
    components.flush().await;

    served.context("HTTP server failed")?;
    info!("Server stopped");
    Ok(())
}

/// Runs only the status consumer until `shutdown` fires.
pub async fn work(components: Components, shutdown: CancellationToken) -> Result<()> {
    let consumer = components.status_consumer().spawn(&shutdown);
    shutdown.cancelled().await;
    stop_consumer(consumer).await;
    components.flush().await;
    Ok(())
}

async fn stop_consumer(consumer: ConsumerHandle) {
    if let Err(e) = consumer.stop().await {
        warn!(error = %e, "Status consumer task ended abnormally");
    }
}

pub struct ValidationReport {
    pub environment: bool,
    pub database: Option<bool>,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.environment && self.database.unwrap_or(true)
    }

    pub fn print(&self) {
        println!("\n=== Startup Validation Report ===");
        println!("Environment Variables: {}", status(Some(self.environment)));
        println!("Database Connectivity: {}", status(self.database));

        if !self.errors.is_empty() {
            println!("\nErrors:");
            for error in &self.errors {
                println!("  ❌ {}", error);
            }
        }

        println!("\nOverall Status: {}", if self.is_valid() { "✅ PASS" } else { "❌ FAIL" });
        println!("=================================\n");
    }
}

fn status(ok: Option<bool>) -> &'static str {
    match ok {
        Some(true) => "✅ OK",
        Some(false) => "❌ FAIL",
        None => "➖ SKIPPED",
    }
}

pub async fn validate_environment(config: &Config) -> ValidationReport {
    let mut report = ValidationReport {
        environment: true,
        database: None,
        errors: Vec::new(),
    };

    if let Err(e) = validate_env_vars(config) {
        report.environment = false;
        report.errors.push(format!("Environment: {}", e));
    }

    if let Some(url) = &config.database_url {
        match validate_database(url).await {
            Ok(()) => report.database = Some(true),
            Err(e) => {
                report.database = Some(false);
                report.errors.push(format!("Database: {:#}", e));
            }
        }
    }

    report
}

fn validate_env_vars(config: &Config) -> Result<()> {
    if config.server_port == 0 {
        anyhow::bail!("SERVER_PORT must be greater than 0");
    }
    if config.status_events_topic.trim().is_empty() {
        anyhow::bail!("STATUS_EVENTS_TOPIC is empty");
    }
    if config.transaction_events_topic.trim().is_empty() {
        anyhow::bail!("TRANSACTION_EVENTS_TOPIC is empty");
    }
    config
        .producer_config()
        .validate()
        .context("Producer configuration is invalid")?;
    Ok(())
}

async fn validate_database(url: &str) -> Result<()> {
    let pool = crate::db::create_pool(url, 1)
        .await
        .context("Failed to connect to database")?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .context("Database did not answer")?;

    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations")
        .fetch_one(&pool)
        .await
        .context("Failed to check migrations table")?;

    if applied == 0 {
        anyhow::bail!("No migrations applied");
    }

    Ok(())
}
