#![allow(dead_code)]

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use transaction_pipeline::adapters::{InMemoryConsumer, InMemoryQueue, InMemoryStore};
use transaction_pipeline::domain::{
    AggregateKey, MerchantDailyAggregate, OutboxRecord, Tenant, TransactionMessage,
    TransactionRecord, TransactionStatus, TransactionType,
};
use transaction_pipeline::metrics::PipelineMetrics;
use transaction_pipeline::ports::{
    MessageConsumer, MessagePublisher, QueueError, QueueResult, StoreError, StoreResult,
    TransactionLookup, TransactionStore, UnitOfWork,
};
use transaction_pipeline::rules::RuleEngine;
use transaction_pipeline::services::{ProcessOutcome, ProcessorConfig, TransactionProcessor};
use transaction_pipeline::shutdown::Shutdown;

pub const QUEUE: &str = "transactions-ingest";
pub const MERCHANT: &str = "M-100";

pub fn business_day() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

pub fn amount(value: &str) -> BigDecimal {
    value.parse().unwrap()
}

pub fn message(tenant_id: Uuid, transaction_id: &str, kind: TransactionType, value: &str) -> TransactionMessage {
    TransactionMessage {
        tenant_id,
        transaction_id: transaction_id.to_string(),
        merchant_id: MERCHANT.to_string(),
        amount: amount(value),
        currency: "USD".to_string(),
        transaction_type: kind,
        original_transaction_id: None,
        occurred_at: business_day(),
        metadata: None,
        batch_id: None,
        correlation_id: None,
    }
}

pub fn purchase(tenant_id: Uuid, transaction_id: &str, value: &str) -> TransactionMessage {
    message(tenant_id, transaction_id, TransactionType::Purchase, value)
}

pub fn refund(tenant_id: Uuid, transaction_id: &str, value: &str, original: Option<&str>) -> TransactionMessage {
    let mut refund = message(tenant_id, transaction_id, TransactionType::Refund, value);
    refund.original_transaction_id = original.map(str::to_string);
    refund
}

pub fn aggregate_key(tenant_id: Uuid) -> AggregateKey {
    AggregateKey::new(tenant_id, MERCHANT, business_day().date_naive())
}

/// Store wrapper that injects commit conflicts or hard failures.
#[derive(Clone)]
pub struct FaultyStore {
    inner: InMemoryStore,
    conflicts_remaining: Arc<AtomicU32>,
    fail_begin: Arc<AtomicBool>,
    pool_exhausted: Arc<AtomicBool>,
    begins: Arc<AtomicU32>,
}

impl FaultyStore {
    pub fn new(inner: InMemoryStore) -> Self {
        Self {
            inner,
            conflicts_remaining: Arc::new(AtomicU32::new(0)),
            fail_begin: Arc::new(AtomicBool::new(false)),
            pool_exhausted: Arc::new(AtomicBool::new(false)),
            begins: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn conflict_next_commits(&self, count: u32) {
        self.conflicts_remaining.store(count, Ordering::SeqCst);
    }

    pub fn fail_begin(&self) {
        self.fail_begin.store(true, Ordering::SeqCst);
    }

    /// Pooled reads time out from now on; units of work keep their own connection.
    pub fn exhaust_pool(&self) {
        self.pool_exhausted.store(true, Ordering::SeqCst);
    }

    pub fn begins(&self) -> u32 {
        self.begins.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionLookup for FaultyStore {
    async fn find_transaction_type(&self, tenant_id: Uuid, transaction_id: &str) -> StoreResult<Option<TransactionType>> {
        if self.pool_exhausted.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.find_transaction_type(tenant_id, transaction_id).await
    }
}

#[async_trait]
impl TransactionStore for FaultyStore {
    async fn find_transaction(&self, tenant_id: Uuid, transaction_id: &str) -> StoreResult<Option<TransactionRecord>> {
        self.inner.find_transaction(tenant_id, transaction_id).await
    }

    async fn find_tenant(&self, tenant_id: Uuid) -> StoreResult<Option<Tenant>> {
        self.inner.find_tenant(tenant_id).await
    }

    async fn find_aggregate(&self, key: &AggregateKey) -> StoreResult<Option<MerchantDailyAggregate>> {
        self.inner.find_aggregate(key).await
    }

    async fn insert_with_outbox(&self, entries: Vec<(TransactionRecord, OutboxRecord)>) -> StoreResult<()> {
        self.inner.insert_with_outbox(entries).await
    }

    async fn reject_with_error(&self, tenant_id: Uuid, transaction_id: &str, detail: &str) -> StoreResult<bool> {
        self.inner.reject_with_error(tenant_id, transaction_id, detail).await
    }

    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        if self.fail_begin.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        let inner = self.inner.begin().await?;
        Ok(Box::new(FaultyUnitOfWork {
            inner,
            conflicts_remaining: self.conflicts_remaining.clone(),
        }))
    }
}

struct FaultyUnitOfWork {
    inner: Box<dyn UnitOfWork>,
    conflicts_remaining: Arc<AtomicU32>,
}

#[async_trait]
impl UnitOfWork for FaultyUnitOfWork {
    async fn save_transaction(&mut self, record: &TransactionRecord, expected: TransactionStatus) -> StoreResult<()> {
        self.inner.save_transaction(record, expected).await
    }

    async fn find_transaction_type(&mut self, tenant_id: Uuid, transaction_id: &str) -> StoreResult<Option<TransactionType>> {
        self.inner.find_transaction_type(tenant_id, transaction_id).await
    }

    async fn load_aggregate(&mut self, key: &AggregateKey) -> StoreResult<Option<MerchantDailyAggregate>> {
        self.inner.load_aggregate(key).await
    }

    async fn save_aggregate(&mut self, aggregate: &MerchantDailyAggregate) -> StoreResult<()> {
        self.inner.save_aggregate(aggregate).await
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let injected = self
            .conflicts_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            self.inner.rollback().await?;
            return Err(StoreError::Conflict("injected version mismatch".to_string()));
        }
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.inner.rollback().await
    }
}

/// Publisher that fails for payloads mentioning a given transaction id.
pub struct FlakyPublisher {
    pub inner: InMemoryQueue,
    pub poisoned_transaction_id: String,
}

#[async_trait]
impl MessagePublisher for FlakyPublisher {
    async fn publish(&self, queue: &str, payload: &str, content_type: &str) -> QueueResult<()> {
        if payload.contains(&format!("\"{}\"", self.poisoned_transaction_id)) {
            let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "broker unavailable");
            return Err(QueueError::Redis(redis::RedisError::from(io)));
        }
        self.inner.publish(queue, payload, content_type).await
    }
}

/// In-memory processor harness around any store.
pub struct Harness<S> {
    pub store: S,
    pub queue: InMemoryQueue,
    pub consumer: InMemoryConsumer,
    pub processor: Arc<TransactionProcessor>,
    pub metrics: Arc<PipelineMetrics>,
    pub tenant_id: Uuid,
}

impl Harness<InMemoryStore> {
    pub async fn new() -> Self {
        let store = InMemoryStore::new();
        Self::with_store(store.clone(), store, ProcessorConfig::default()).await
    }
}

impl<S> Harness<S>
where
    S: TransactionStore + Clone + 'static,
{
    /// `seed` must share state with `store`; it receives the default tenant.
    pub async fn with_store(store: S, seed: InMemoryStore, config: ProcessorConfig) -> Self {
        let tenant_id = Uuid::new_v4();
        seed.upsert_tenant(Tenant::new(tenant_id, "Acme")).await;

        let queue = InMemoryQueue::new();
        let consumer = queue.consumer(QUEUE);
        let metrics = Arc::new(PipelineMetrics::new());

        let processor = TransactionProcessor::new(
            Arc::new(store.clone()),
            Arc::new(consumer.clone()),
            RuleEngine::standard(),
            config,
            metrics.clone(),
        );

        Self {
            store,
            queue,
            consumer,
            processor: Arc::new(processor),
            metrics,
            tenant_id,
        }
    }

    /// Stores the transaction in `Received` with an outbox record and enqueues its payload.
    pub async fn accept(&self, message: &TransactionMessage) {
        let payload = message.to_payload().unwrap();
        let record = TransactionRecord::received(message);
        let outbox = OutboxRecord::new(message.tenant_id, message.transaction_id.clone(), payload.clone());
        self.store.insert_with_outbox(vec![(record, outbox)]).await.unwrap();
        self.queue.publish(QUEUE, &payload, "application/json").await.unwrap();
    }

    /// Receives and processes exactly one message.
    pub async fn deliver(&self) -> ProcessOutcome {
        let (_trigger, shutdown) = Shutdown::channel();
        let message = self
            .consumer
            .receive(Duration::from_millis(100))
            .await
            .unwrap()
            .expect("a message should be waiting");
        self.processor.process_message(&message, &shutdown).await
    }

    pub async fn status_of(&self, transaction_id: &str) -> TransactionRecord {
        self.store
            .find_transaction(self.tenant_id, transaction_id)
            .await
            .unwrap()
            .expect("transaction should exist")
    }

    pub async fn aggregate(&self) -> Option<MerchantDailyAggregate> {
        self.store.find_aggregate(&aggregate_key(self.tenant_id)).await.unwrap()
    }
}
