use chrono::Utc;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use transaction_service::config::{BrokerBackend, Config};
use transaction_service::domain::{DomainEvent, TransactionStatusDecision};
use transaction_service::services::EventPublisher;
use transaction_service::startup::{validate_environment, Components};

#[derive(Parser)]
#[command(name = "transaction-service")]
#[command(
    about = "Transaction service - records transfers and reconciles fraud decisions",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server and the status consumer (default)
    Serve,

    /// Run only the status consumer
    Worker,

    /// Publish a status decision, standing in for the fraud system
    Decide {
        /// Transaction UUID
        #[arg(value_name = "TX_ID")]
        transaction_id: Uuid,

        /// Decided status, e.g. approved or rejected
        #[arg(value_name = "STATUS")]
        status: String,

        /// Reason recorded with the status change
        #[arg(short, long)]
        reason: Option<String>,

        /// Source tag carried by the event
        #[arg(short, long, default_value = "cli")]
        source: String,
    },

    /// Database management commands
    #[command(subcommand)]
    Db(DbCommands),

    /// Configuration validation
    Config,
}

#[derive(Subcommand)]
pub enum DbCommands {
    /// Run database migrations
    Migrate,
}

pub async fn handle_decide(
    config: Config,
    transaction_id: Uuid,
    status: String,
    reason: Option<String>,
    source: String,
) -> anyhow::Result<()> {
    if config.broker_backend != BrokerBackend::Postgres {
        anyhow::bail!(
            "decide needs a broker shared with the running service; set BROKER_BACKEND=postgres"
        );
    }

    let components = Components::build(config).await?;
    let event = DomainEvent::status_decision(TransactionStatusDecision {
        transaction_id,
        status,
        reason,
        processed_at: Utc::now(),
        source,
    });

    let report = components.publisher.publish(&event).await?;
    components.flush().await;

    tracing::info!(
        transaction_id = %transaction_id,
        topic = %report.topic,
        partition = report.partition,
        offset = report.offset,
        "Decision published"
    );
    println!(
        "✓ Decision for {} published to {}[{}]@{}",
        transaction_id, report.topic, report.partition, report.offset
    );
    Ok(())
}

pub async fn handle_db_migrate(config: &Config) -> anyhow::Result<()> {
    let Some(url) = &config.database_url else {
        anyhow::bail!("DATABASE_URL is required to run migrations");
    };

    let pool = transaction_service::db::create_pool(url, 1).await?;

    tracing::info!("Running database migrations...");
    transaction_service::db::run_migrations(&pool).await?;

    println!("✓ Database migrations completed");
    Ok(())
}

pub async fn handle_config_validate(config: &Config) -> anyhow::Result<()> {
    tracing::info!("Validating configuration...");

    println!("Configuration:");
    println!("  Server Port: {}", config.server_port);
    println!(
        "  Database URL: {}",
        config
            .database_url
            .as_deref()
            .map(mask_password)
            .unwrap_or_else(|| "(not set, in-memory store)".to_string())
    );
    println!("  Broker Backend: {:?}", config.broker_backend);
    println!("  Broker Partitions: {}", config.broker_partitions);
    println!("  Transaction Events Topic: {}", config.transaction_events_topic);
    println!("  Status Events Topic: {}", config.status_events_topic);
    println!("  Consumer Group: {}", config.consumer_group_id);

    let report = validate_environment(config).await;
    report.print();

    if !report.is_valid() {
        anyhow::bail!("Configuration is invalid");
    }

    tracing::info!("Configuration is valid");
    println!("✓ Configuration is valid");
    Ok(())
}

fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.rfind('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            if let Some(slash_pos) = url[..colon_pos].rfind("//") {
                let prefix = &url[..slash_pos + 2];
                let user = &url[slash_pos + 2..colon_pos];
                let suffix = &url[at_pos..];
                return format!("{}{}:****{}", prefix, user, suffix);
            }
        }
    }
    url.to_string()
}
