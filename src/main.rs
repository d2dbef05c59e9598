mod cli;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use cli::{Cli, Commands, DbCommands};
use transaction_service::config::Config;
use transaction_service::startup::{self, Components};
use transaction_service::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    telemetry::init_tracing(config.log_format)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let shutdown = shutdown_on_signal();
            let components = Components::build(config).await?;
            startup::serve(components, shutdown).await
        }
        Commands::Worker => {
            let shutdown = shutdown_on_signal();
            let components = Components::build(config).await?;
            startup::work(components, shutdown).await
        }
        Commands::Decide {
            transaction_id,
            status,
            reason,
            source,
        } => cli::handle_decide(config, transaction_id, status, reason, source).await,
        Commands::Db(DbCommands::Migrate) => cli::handle_db_migrate(&config).await,
        Commands::Config => cli::handle_config_validate(&config).await,
    }
}

/// Returns a token cancelled on Ctrl+C or SIGTERM.
fn shutdown_on_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        tracing::info!("Shutdown signal received");
        trigger.cancel();
    });

    token
}
