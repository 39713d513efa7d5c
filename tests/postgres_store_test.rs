//! Runs against a real database when `DATABASE_URL` is set; otherwise each test is skipped.

mod common;

use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use common::*;
use transaction_pipeline::adapters::{InMemoryQueue, PostgresStore};
use transaction_pipeline::db;
use transaction_pipeline::domain::{
    MerchantDailyAggregate, OutboxRecord, Tenant, TransactionMessage, TransactionRecord,
    TransactionStatus, TransactionType,
};
use transaction_pipeline::metrics::PipelineMetrics;
use transaction_pipeline::ports::{
    MessageConsumer, MessagePublisher, OutboxStore, StoreError, TransactionLookup,
    TransactionStore, UnitOfWork,
};
use transaction_pipeline::rules::RuleEngine;
use transaction_pipeline::services::{ProcessOutcome, ProcessorConfig, TransactionProcessor};
use transaction_pipeline::shutdown::Shutdown;

async fn setup() -> Option<(PostgresStore, Uuid)> {
    let database_url = database_url()?;
    let pool = PgPool::connect(&database_url).await.expect("Failed to connect to test DB");
    Some(seeded(pool).await)
}

fn database_url() -> Option<String> {
    match std::env::var("DATABASE_URL") {
        Ok(v) => Some(v),
        Err(_) => {
            println!("Skipping Postgres store test: DATABASE_URL not set");
            None
        }
    }
}

async fn seeded(pool: PgPool) -> (PostgresStore, Uuid) {
    db::migrate(&pool).await.expect("Failed to run migrations");

    let store = PostgresStore::new(pool);
    let tenant_id = Uuid::new_v4();
    store
        .upsert_tenant(&Tenant::new(tenant_id, "Acme"))
        .await
        .expect("Failed to insert tenant");
    (store, tenant_id)
}

fn entry(message: &TransactionMessage) -> (TransactionRecord, OutboxRecord) {
    let payload = message.to_payload().unwrap();
    (
        TransactionRecord::received(message),
        OutboxRecord::new(message.tenant_id, message.transaction_id.clone(), payload),
    )
}

#[tokio::test]
async fn test_insert_with_outbox_round_trips() {
    let Some((store, tenant_id)) = setup().await else { return };
    let message = purchase(tenant_id, "TX-1", "125.50");

    store.insert_with_outbox(vec![entry(&message)]).await.unwrap();

    let stored = store.find_transaction(tenant_id, "TX-1").await.unwrap().unwrap();
    assert_eq!(stored.status, TransactionStatus::Received);
    assert_eq!(stored.amount, amount("125.50"));
    assert_eq!(stored.merchant_id, MERCHANT);
    assert_eq!(
        store.find_transaction_type(tenant_id, "TX-1").await.unwrap(),
        Some(TransactionType::Purchase)
    );
    assert!(store.exists_by_transaction_id(tenant_id, "TX-1").await.unwrap());

    let tenant = store.find_tenant(tenant_id).await.unwrap().unwrap();
    assert_eq!(tenant.daily_merchant_limit, amount("100000"));
}

#[tokio::test]
async fn test_duplicate_insert_writes_nothing() {
    let Some((store, tenant_id)) = setup().await else { return };
    store
        .insert_with_outbox(vec![entry(&purchase(tenant_id, "TX-1", "10"))])
        .await
        .unwrap();

    let err = store
        .insert_with_outbox(vec![
            entry(&purchase(tenant_id, "TX-2", "10")),
            entry(&purchase(tenant_id, "TX-1", "10")),
        ])
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::Duplicate(_)));
    assert!(store.find_transaction(tenant_id, "TX-2").await.unwrap().is_none());
}

#[tokio::test]
async fn test_mark_published_hides_records_from_fetch() {
    let Some((store, tenant_id)) = setup().await else { return };
    store
        .insert_with_outbox(vec![
            entry(&purchase(tenant_id, "TX-1", "10")),
            entry(&purchase(tenant_id, "TX-2", "10")),
        ])
        .await
        .unwrap();

    let mine: Vec<_> = store
        .fetch_unpublished(10_000)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.tenant_id == tenant_id)
        .collect();
    assert_eq!(mine.len(), 2);

    let ids: Vec<Uuid> = mine.iter().map(|r| r.id).collect();
    store.mark_published(&ids, Utc::now()).await.unwrap();

    let remaining = store
        .fetch_unpublished(10_000)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.tenant_id == tenant_id)
        .count();
    assert_eq!(remaining, 0);
}

#[tokio::test]
async fn test_status_guard_rejects_stale_writer() {
    let Some((store, tenant_id)) = setup().await else { return };
    store
        .insert_with_outbox(vec![entry(&purchase(tenant_id, "TX-1", "10"))])
        .await
        .unwrap();
    let mut record = store.find_transaction(tenant_id, "TX-1").await.unwrap().unwrap();
    record.begin_processing().unwrap();

    let mut first = store.begin().await.unwrap();
    first.save_transaction(&record, TransactionStatus::Received).await.unwrap();
    first.commit().await.unwrap();

    let mut second = store.begin().await.unwrap();
    let err = second
        .save_transaction(&record, TransactionStatus::Received)
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    second.rollback().await.unwrap();
}

#[tokio::test]
async fn test_aggregate_version_check_detects_lost_update() {
    let Some((store, tenant_id)) = setup().await else { return };
    let key = aggregate_key(tenant_id);

    let mut first = store.begin().await.unwrap();
    let mut second = store.begin().await.unwrap();
    assert!(first.load_aggregate(&key).await.unwrap().is_none());
    assert!(second.load_aggregate(&key).await.unwrap().is_none());

    let mut created = MerchantDailyAggregate::open(&key);
    created.record_purchase(&amount("10"), Utc::now());
    first.save_aggregate(&created).await.unwrap();
    first.commit().await.unwrap();

    let mut racing = MerchantDailyAggregate::open(&key);
    racing.record_purchase(&amount("20"), Utc::now());
    let err = second.save_aggregate(&racing).await.unwrap_err();
    assert!(err.is_conflict());
    second.rollback().await.unwrap();

    let mut current = store.find_aggregate(&key).await.unwrap().unwrap();
    assert_eq!(current.version, 1);
    current.record_purchase(&amount("5"), Utc::now());

    let mut third = store.begin().await.unwrap();
    third.save_aggregate(&current).await.unwrap();
    third.commit().await.unwrap();

    // Same stale version again.
    let mut fourth = store.begin().await.unwrap();
    let err = fourth.save_aggregate(&current).await.unwrap_err();
    assert!(err.is_conflict());
    fourth.rollback().await.unwrap();

    let stored = store.find_aggregate(&key).await.unwrap().unwrap();
    assert_eq!(stored.total_amount, amount("15"));
    assert_eq!(stored.transaction_count, 2);
    assert_eq!(stored.version, 2);
}

#[tokio::test]
async fn test_reject_with_error_only_touches_open_transactions() {
    let Some((store, tenant_id)) = setup().await else { return };
    store
        .insert_with_outbox(vec![entry(&purchase(tenant_id, "TX-1", "10"))])
        .await
        .unwrap();

    assert!(store.reject_with_error(tenant_id, "TX-1", "boom").await.unwrap());
    let rejected = store.find_transaction(tenant_id, "TX-1").await.unwrap().unwrap();
    assert_eq!(rejected.status, TransactionStatus::Rejected);
    assert_eq!(rejected.rejection_reason.as_deref(), Some("Processing error: boom"));

    assert!(!store.reject_with_error(tenant_id, "TX-1", "again").await.unwrap());
    assert!(!store.reject_with_error(tenant_id, "TX-MISSING", "boom").await.unwrap());
}

#[tokio::test]
async fn test_refund_is_processed_on_a_single_connection_pool() {
    let Some(database_url) = database_url() else { return };
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(2))
        .connect(&database_url)
        .await
        .expect("Failed to connect to test DB");
    let (store, tenant_id) = seeded(pool).await;

    let purchase_tx = purchase(tenant_id, "P-1", "80");
    let refund_tx = refund(tenant_id, "R-1", "80", Some("P-1"));
    store
        .insert_with_outbox(vec![entry(&purchase_tx), entry(&refund_tx)])
        .await
        .unwrap();

    let queue = InMemoryQueue::new();
    let consumer = queue.consumer(QUEUE);
    let processor = TransactionProcessor::new(
        Arc::new(store.clone()),
        Arc::new(consumer.clone()),
        RuleEngine::standard(),
        ProcessorConfig::default(),
        Arc::new(PipelineMetrics::new()),
    );
    let (_trigger, shutdown) = Shutdown::channel();

    for message in [&purchase_tx, &refund_tx] {
        queue
            .publish(QUEUE, &message.to_payload().unwrap(), "application/json")
            .await
            .unwrap();
        let leased = consumer.receive(Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(
            processor.process_message(&leased, &shutdown).await,
            ProcessOutcome::Applied(TransactionStatus::Processed)
        );
    }

    let stored = store.find_transaction(tenant_id, "R-1").await.unwrap().unwrap();
    assert_eq!(stored.status, TransactionStatus::Processed);
    assert!(queue.dead_letters().await.is_empty());
}

#[tokio::test]
async fn test_unit_of_work_reads_transaction_type_on_its_own_connection() {
    let Some(database_url) = database_url() else { return };
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(2))
        .connect(&database_url)
        .await
        .expect("Failed to connect to test DB");
    let (store, tenant_id) = seeded(pool).await;
    store
        .insert_with_outbox(vec![entry(&purchase(tenant_id, "TX-1", "10"))])
        .await
        .unwrap();

    let mut uow = store.begin().await.unwrap();
    assert_eq!(
        uow.find_transaction_type(tenant_id, "TX-1").await.unwrap(),
        Some(TransactionType::Purchase)
    );
    assert_eq!(uow.find_transaction_type(tenant_id, "TX-2").await.unwrap(), None);
    uow.rollback().await.unwrap();
}
