mod cli;
mod startup;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Commands, DbCommands, DlqCommands, RunMode, TenantCommands, TxCommands};
use transaction_pipeline::config::{Config, LogFormat};
use transaction_pipeline::error::AppError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    // Setup logging
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cli::handle_run(&config, RunMode::All).await,
        Commands::Relay => cli::handle_run(&config, RunMode::Relay).await,
        Commands::Process => cli::handle_run(&config, RunMode::Process).await,
        Commands::Ingest { file } => cli::handle_ingest(&config, &file).await,
        Commands::Tx(TxCommands::Show {
            tenant,
            transaction_id,
        }) => cli::handle_tx_show(&config, tenant, &transaction_id).await,
        Commands::Tenant(TenantCommands::Upsert {
            id,
            name,
            daily_limit,
            review_threshold,
        }) => cli::handle_tenant_upsert(&config, id, &name, daily_limit, review_threshold).await,
        Commands::Summary {
            tenant,
            merchant,
            date,
        } => cli::handle_summary(&config, tenant, &merchant, date).await,
        Commands::Dlq(DlqCommands::List { limit }) => cli::handle_dlq_list(&config, limit).await,
        Commands::Db(DbCommands::Migrate) => cli::handle_db_migrate(&config).await,
        Commands::Config => cli::handle_config_validate(&config),
        Commands::Check => cli::handle_check(&config).await,
    };

    if let Err(e) = &result {
        if e.downcast_ref::<AppError>().is_some_and(AppError::is_transient) {
            tracing::warn!("Command failed with a transient error; it is safe to retry");
        }
    }

    result
}
