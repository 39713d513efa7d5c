//! Port traits the pipeline depends on. Adapters live in `crate::adapters`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    AggregateKey, MerchantDailyAggregate, OutboxRecord, Tenant, TransactionRecord,
    TransactionStatus, TransactionType,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Optimistic concurrency check failed. Safe to retry from a fresh read.
    #[error("Concurrency conflict: {0}")]
    Conflict(String),

    #[error("Duplicate key: {0}")]
    Duplicate(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Pooled read capability used by ingest.
#[async_trait]
pub trait TransactionLookup: Send + Sync {
    async fn find_transaction_type(
        &self,
        tenant_id: Uuid,
        transaction_id: &str,
    ) -> StoreResult<Option<TransactionType>>;

    async fn exists_by_transaction_id(&self, tenant_id: Uuid, transaction_id: &str) -> StoreResult<bool> {
        Ok(self
            .find_transaction_type(tenant_id, transaction_id)
            .await?
            .is_some())
    }
}

#[async_trait]
pub trait TransactionStore: TransactionLookup {
    async fn find_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: &str,
    ) -> StoreResult<Option<TransactionRecord>>;

    async fn find_tenant(&self, tenant_id: Uuid) -> StoreResult<Option<Tenant>>;

    async fn find_aggregate(&self, key: &AggregateKey) -> StoreResult<Option<MerchantDailyAggregate>>;

    /// Inserts transactions together with their outbox records in one atomic commit.
    async fn insert_with_outbox(&self, entries: Vec<(TransactionRecord, OutboxRecord)>) -> StoreResult<()>;

    /// Best-effort compensating write outside any unit of work.
    /// Returns `false` when the transaction is missing or already final.
    async fn reject_with_error(
        &self,
        tenant_id: Uuid,
        transaction_id: &str,
        detail: &str,
    ) -> StoreResult<bool>;

    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>>;
}

/// One atomic store transaction. Dropping it without committing rolls it back.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Persists `record`, guarded on the stored status still being `expected`.
    async fn save_transaction(
        &mut self,
        record: &TransactionRecord,
        expected: TransactionStatus,
    ) -> StoreResult<()>;

    /// Reads on this unit of work's own connection, so no second pooled connection is needed.
    async fn find_transaction_type(
        &mut self,
        tenant_id: Uuid,
        transaction_id: &str,
    ) -> StoreResult<Option<TransactionType>>;

    async fn load_aggregate(&mut self, key: &AggregateKey) -> StoreResult<Option<MerchantDailyAggregate>>;

    /// Compare-and-swap on `aggregate.version` (insert when it is `0`).
    async fn save_aggregate(&mut self, aggregate: &MerchantDailyAggregate) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;

    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Reads the rule engine performs while a unit of work is open.
#[async_trait]
pub trait ScopedLookup: Send {
    async fn find_transaction_type(
        &mut self,
        tenant_id: Uuid,
        transaction_id: &str,
    ) -> StoreResult<Option<TransactionType>>;
}

#[async_trait]
impl ScopedLookup for Box<dyn UnitOfWork> {
    async fn find_transaction_type(
        &mut self,
        tenant_id: Uuid,
        transaction_id: &str,
    ) -> StoreResult<Option<TransactionType>> {
        UnitOfWork::find_transaction_type(&mut **self, tenant_id, transaction_id).await
    }
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Oldest-first page of unpublished records.
    async fn fetch_unpublished(&self, limit: usize) -> StoreResult<Vec<OutboxRecord>>;

    async fn mark_published(&self, ids: &[Uuid], at: DateTime<Utc>) -> StoreResult<()>;
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Malformed envelope: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Message {0} is not leased by this consumer")]
    UnknownMessage(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// A message leased from the queue until it is completed, abandoned or dead-lettered.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub message_id: Uuid,
    pub body: String,
    pub content_type: String,
    /// 1 on first delivery.
    pub delivery_count: u32,
    /// Adapter-specific handle identifying the lease.
    pub lock_token: String,
}

#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, queue: &str, payload: &str, content_type: &str) -> QueueResult<()>;
}

#[async_trait]
pub trait MessageConsumer: Send + Sync {
    /// Waits up to `wait` for a message. `None` when nothing arrived.
    async fn receive(&self, wait: Duration) -> QueueResult<Option<ReceivedMessage>>;

    async fn complete(&self, message: &ReceivedMessage) -> QueueResult<()>;

    /// Releases the lease so the message is redelivered.
    async fn abandon(&self, message: &ReceivedMessage) -> QueueResult<()>;

    async fn dead_letter(&self, message: &ReceivedMessage, reason: &str, description: &str) -> QueueResult<()>;
}
