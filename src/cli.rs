use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use transaction_pipeline::adapters::{PostgresStore, RedisQueue};
use transaction_pipeline::config::Config;
use transaction_pipeline::db;
use transaction_pipeline::domain::{AggregateKey, Tenant};
use transaction_pipeline::error::AppError;
use transaction_pipeline::ports::TransactionStore;
use transaction_pipeline::shutdown::Shutdown;
use transaction_pipeline::use_cases::{IngestBatch, IngestCommand};
use transaction_pipeline::Pipeline;

#[derive(Parser)]
#[command(name = "transaction-pipeline")]
#[command(about = "Transaction Pipeline - outbox relay and transaction processor", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the outbox relay and the transaction processor (default)
    Run,

    /// Run only the outbox relay
    Relay,

    /// Run only the transaction processor
    Process,

    /// Ingest a JSON batch file
    Ingest {
        #[arg(value_name = "FILE")]
        file: String,
    },

    /// Transaction commands
    #[command(subcommand)]
    Tx(TxCommands),

    /// Tenant commands
    #[command(subcommand)]
    Tenant(TenantCommands),

    /// Show a merchant's daily aggregate
    Summary {
        #[arg(long)]
        tenant: Uuid,
        #[arg(long)]
        merchant: String,
        /// Business date (YYYY-MM-DD)
        #[arg(long)]
        date: NaiveDate,
    },

    /// Dead-letter queue commands
    #[command(subcommand)]
    Dlq(DlqCommands),

    /// Database management commands
    #[command(subcommand)]
    Db(DbCommands),

    /// Configuration validation
    Config,

    /// Check connectivity to Postgres and Redis
    Check,
}

#[derive(Subcommand)]
pub enum TxCommands {
    /// Show a transaction by tenant and transaction id
    Show {
        #[arg(long)]
        tenant: Uuid,
        #[arg(value_name = "TRANSACTION_ID")]
        transaction_id: String,
    },
}

#[derive(Subcommand)]
pub enum TenantCommands {
    /// Create or update a tenant
    Upsert {
        #[arg(long)]
        id: Uuid,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "100000")]
        daily_limit: BigDecimal,
        #[arg(long, default_value = "10000")]
        review_threshold: BigDecimal,
    },
}

#[derive(Subcommand)]
pub enum DlqCommands {
    /// List the most recent dead-lettered messages
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
pub enum DbCommands {
    /// Run database migrations
    Migrate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    All,
    Relay,
    Process,
}

async fn connect_store(config: &Config) -> anyhow::Result<PostgresStore> {
    let pool = db::create_pool(config).await?;
    Ok(PostgresStore::new(pool))
}

pub async fn handle_run(config: &Config, mode: RunMode) -> anyhow::Result<()> {
    let pool = db::create_pool(config).await?;
    db::migrate(&pool).await?;

    let store = PostgresStore::new(pool);
    let queue = RedisQueue::connect(&config.redis_url, config.queue_name.clone())
        .await?
        .with_lease_timeout(config.queue_lease_timeout);

    let pipeline = Pipeline::new(
        store,
        queue.clone(),
        queue.clone(),
        config.relay_config(),
        config.processor_config(),
    );
    let metrics = pipeline.metrics.clone();

    let (trigger, shutdown) = Shutdown::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown signal received");
                trigger.trigger();
            }
            Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    // Leases of crashed consumers are reclaimed once they expire.
    let recovery = (mode != RunMode::Relay).then(|| {
        let queue = queue.clone();
        let shutdown = shutdown.clone();
        let interval = config.queue_lease_timeout / 2;
        tokio::spawn(async move { queue.run_recovery(interval, shutdown).await })
    });

    match mode {
        RunMode::All => pipeline.run(shutdown).await,
        RunMode::Relay => pipeline.relay.run(shutdown).await,
        RunMode::Process => pipeline.processor.run(shutdown).await,
    }

    if let Some(recovery) = recovery {
        if let Err(e) = recovery.await {
            tracing::error!("Lease recovery task failed: {}", e);
        }
    }

    for (name, value) in metrics.snapshot().named() {
        tracing::info!("{} = {}", name, value);
    }

    Ok(())
}

pub async fn handle_ingest(config: &Config, file: &str) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(Path::new(file))?;
    let command: IngestCommand = serde_json::from_str(&raw)?;

    let store = connect_store(config).await?;
    let outcome = IngestBatch::new(Arc::new(store))
        .execute(command)
        .await
        .map_err(AppError::from)?;

    println!("✓ Batch {} ingested", outcome.batch_id);
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    Ok(())
}

pub async fn handle_tx_show(config: &Config, tenant_id: Uuid, transaction_id: &str) -> anyhow::Result<()> {
    let store = connect_store(config).await?;

    let Some(tx) = store
        .find_transaction(tenant_id, transaction_id)
        .await
        .map_err(AppError::from)?
    else {
        return Err(AppError::NotFound(format!(
            "transaction {} for tenant {}",
            transaction_id, tenant_id
        ))
        .into());
    };

    println!("Transaction {}:", tx.transaction_id);
    println!("  Merchant:  {}", tx.merchant_id);
    println!("  Type:      {}", tx.transaction_type);
    println!("  Amount:    {} {}", tx.amount, tx.currency);
    println!("  Status:    {}", tx.status);
    println!("  Occurred:  {}", tx.occurred_at);
    if let Some(original) = &tx.original_transaction_id {
        println!("  Original:  {}", original);
    }
    if let Some(reason) = &tx.rejection_reason {
        println!("  Reason:    {}", reason);
    }
    if let Some(processed_at) = tx.processed_at {
        println!("  Processed: {}", processed_at);
    }

    Ok(())
}

pub async fn handle_tenant_upsert(
    config: &Config,
    id: Uuid,
    name: &str,
    daily_limit: BigDecimal,
    review_threshold: BigDecimal,
) -> anyhow::Result<()> {
    let store = connect_store(config).await?;
    let tenant = Tenant::new(id, name).with_limits(daily_limit, review_threshold);
    store.upsert_tenant(&tenant).await?;

    tracing::info!("Tenant {} saved", id);
    println!("✓ Tenant {} saved", id);

    Ok(())
}

pub async fn handle_summary(
    config: &Config,
    tenant_id: Uuid,
    merchant_id: &str,
    date: NaiveDate,
) -> anyhow::Result<()> {
    let store = connect_store(config).await?;
    let key = AggregateKey::new(tenant_id, merchant_id, date);

    match store.find_aggregate(&key).await? {
        Some(aggregate) => {
            println!("Merchant {} on {}:", aggregate.merchant_id, aggregate.date);
            println!("  Total:        {}", aggregate.total_amount);
            println!("  Transactions: {}", aggregate.transaction_count);
            println!("  Updated:      {}", aggregate.last_calculated_at);
            println!("  Version:      {}", aggregate.version);
        }
        None => println!("No purchases recorded for merchant {} on {}", merchant_id, date),
    }

    Ok(())
}

pub async fn handle_dlq_list(config: &Config, limit: usize) -> anyhow::Result<()> {
    let queue = RedisQueue::connect(&config.redis_url, config.queue_name.clone())
        .await
        .map_err(AppError::from)?;
    let records = queue.dead_letters(limit).await.map_err(AppError::from)?;

    if records.is_empty() {
        println!("No dead-lettered messages");
        return Ok(());
    }

    println!("{:<38} {:<26} {:<9} {:<20}", "Message", "Reason", "Attempts", "Dead-lettered");
    println!("{}", "-".repeat(95));
    for record in records {
        println!(
            "{:<38} {:<26} {:<9} {:<20}",
            record.id,
            record.reason,
            record.delivery_count,
            record.dead_lettered_at.format("%Y-%m-%d %H:%M:%S")
        );
        println!("    {}", record.description);
    }

    Ok(())
}

pub async fn handle_db_migrate(config: &Config) -> anyhow::Result<()> {
    let pool = db::create_pool(config).await?;

    tracing::info!("Running database migrations...");
    db::migrate(&pool).await?;

    println!("✓ Database migrations completed");

    Ok(())
}

pub fn handle_config_validate(config: &Config) -> anyhow::Result<()> {
    tracing::info!("Validating configuration...");

    println!("Configuration:");
    println!("  Database URL: {}", mask_password(&config.database_url));
    println!("  Redis URL: {}", mask_password(&config.redis_url));
    println!("  Queue: {}", config.queue_name);
    println!("  Outbox batch size: {}", config.outbox_batch_size);
    println!("  Outbox poll interval: {:?}", config.outbox_poll_interval);
    println!("  Processor concurrency: {}", config.processor_max_concurrency);
    println!("  Processor retries: {}", config.processor_max_retries);
    println!("  Max delivery count: {}", config.processor_max_delivery_count);
    println!("  Queue lease timeout: {:?}", config.queue_lease_timeout);

    tracing::info!("Configuration is valid");
    println!("✓ Configuration is valid");

    Ok(())
}

pub async fn handle_check(config: &Config) -> anyhow::Result<()> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect_lazy(&config.database_url)?;

    let report = crate::startup::validate_environment(config, &pool).await;
    report.print();

    if !report.is_valid() {
        anyhow::bail!("Startup validation failed");
    }

    Ok(())
}

fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.rfind('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            if let Some(slash_pos) = url[..colon_pos].rfind("//") {
                let prefix = &url[..slash_pos + 2];
                let user_start = slash_pos + 2;
                let user = &url[user_start..colon_pos];
                let suffix = &url[at_pos..];
                return format!("{}{}:****{}", prefix, user, suffix);
            }
        }
    }
    url.to_string()
}
