//! In-memory implementation of the store ports.
//!
//! Writes made through a unit of work are staged and validated at commit against the committed
//! state, so concurrent units of work observe the same optimistic-concurrency conflicts the
//! Postgres adapter reports.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::{
    AggregateKey, MerchantDailyAggregate, OutboxRecord, Tenant, TransactionRecord,
    TransactionStatus, TransactionType,
};
use crate::ports::{
    OutboxStore, StoreError, StoreResult, TransactionLookup, TransactionStore, UnitOfWork,
};

type TransactionKey = (Uuid, String);

#[derive(Default)]
struct MemoryState {
    tenants: HashMap<Uuid, Tenant>,
    transactions: HashMap<TransactionKey, TransactionRecord>,
    outbox: Vec<OutboxRecord>,
    aggregates: HashMap<AggregateKey, MerchantDailyAggregate>,
}

/// A thread-safe in-memory store shared by clones.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert_tenant(&self, tenant: Tenant) {
        self.state.write().await.tenants.insert(tenant.id, tenant);
    }

    /// Appends an outbox record without a matching transaction write.
    pub async fn insert_outbox(&self, record: OutboxRecord) {
        self.state.write().await.outbox.push(record);
    }

    pub async fn outbox(&self) -> Vec<OutboxRecord> {
        self.state.read().await.outbox.clone()
    }
}

#[async_trait]
impl TransactionLookup for InMemoryStore {
    async fn find_transaction_type(
        &self,
        tenant_id: Uuid,
        transaction_id: &str,
    ) -> StoreResult<Option<TransactionType>> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .get(&(tenant_id, transaction_id.to_string()))
            .map(|record| record.transaction_type))
    }
}

#[async_trait]
impl TransactionStore for InMemoryStore {
    async fn find_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: &str,
    ) -> StoreResult<Option<TransactionRecord>> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .get(&(tenant_id, transaction_id.to_string()))
            .cloned())
    }

    async fn find_tenant(&self, tenant_id: Uuid) -> StoreResult<Option<Tenant>> {
        Ok(self.state.read().await.tenants.get(&tenant_id).cloned())
    }

    async fn find_aggregate(&self, key: &AggregateKey) -> StoreResult<Option<MerchantDailyAggregate>> {
        Ok(self.state.read().await.aggregates.get(key).cloned())
    }

    async fn insert_with_outbox(&self, entries: Vec<(TransactionRecord, OutboxRecord)>) -> StoreResult<()> {
        let mut state = self.state.write().await;

        for (record, _) in &entries {
            let key = (record.tenant_id, record.transaction_id.clone());
            if state.transactions.contains_key(&key) {
                return Err(StoreError::Duplicate(record.transaction_id.clone()));
            }
        }

        for (record, outbox) in entries {
            state
                .transactions
                .insert((record.tenant_id, record.transaction_id.clone()), record);
            state.outbox.push(outbox);
        }

        Ok(())
    }

    async fn reject_with_error(
        &self,
        tenant_id: Uuid,
        transaction_id: &str,
        detail: &str,
    ) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        match state
            .transactions
            .get_mut(&(tenant_id, transaction_id.to_string()))
        {
            Some(record) => Ok(record.reject_with_error(detail).is_ok()),
            None => Ok(false),
        }
    }

    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>> {
        Ok(Box::new(InMemoryUnitOfWork {
            state: self.state.clone(),
            transactions: HashMap::new(),
            aggregates: HashMap::new(),
        }))
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn fetch_unpublished(&self, limit: usize) -> StoreResult<Vec<OutboxRecord>> {
        let state = self.state.read().await;
        let mut pending: Vec<OutboxRecord> = state
            .outbox
            .iter()
            .filter(|record| !record.published)
            .cloned()
            .collect();
        pending.sort_by_key(|record| record.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_published(&self, ids: &[Uuid], at: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.state.write().await;
        for record in state.outbox.iter_mut().filter(|r| ids.contains(&r.id)) {
            record.mark_published(at);
        }
        Ok(())
    }
}

pub struct InMemoryUnitOfWork {
    state: Arc<RwLock<MemoryState>>,
    /// Staged record plus the committed status it was guarded on.
    transactions: HashMap<TransactionKey, (TransactionStatus, TransactionRecord)>,
    aggregates: HashMap<AggregateKey, MerchantDailyAggregate>,
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn save_transaction(
        &mut self,
        record: &TransactionRecord,
        expected: TransactionStatus,
    ) -> StoreResult<()> {
        let key = (record.tenant_id, record.transaction_id.clone());

        if let Some((_, staged)) = self.transactions.get_mut(&key) {
            if staged.status != expected {
                return Err(StoreError::Conflict(format!(
                    "transaction {} is {} in this unit of work, expected {}",
                    record.transaction_id, staged.status, expected
                )));
            }
            *staged = record.clone();
            return Ok(());
        }

        let committed = {
            let state = self.state.read().await;
            state.transactions.get(&key).map(|r| r.status)
        };
        match committed {
            Some(status) if status == expected => {
                self.transactions.insert(key, (expected, record.clone()));
                Ok(())
            }
            Some(status) => Err(StoreError::Conflict(format!(
                "transaction {} is {}, expected {}",
                record.transaction_id, status, expected
            ))),
            None => Err(StoreError::Corrupt(format!(
                "transaction {} does not exist",
                record.transaction_id
            ))),
        }
    }

    async fn find_transaction_type(
        &mut self,
        tenant_id: Uuid,
        transaction_id: &str,
    ) -> StoreResult<Option<TransactionType>> {
        let key = (tenant_id, transaction_id.to_string());
        if let Some((_, staged)) = self.transactions.get(&key) {
            return Ok(Some(staged.transaction_type));
        }
        Ok(self
            .state
            .read()
            .await
            .transactions
            .get(&key)
            .map(|record| record.transaction_type))
    }

    async fn load_aggregate(&mut self, key: &AggregateKey) -> StoreResult<Option<MerchantDailyAggregate>> {
        if let Some(staged) = self.aggregates.get(key) {
            return Ok(Some(staged.clone()));
        }
        Ok(self.state.read().await.aggregates.get(key).cloned())
    }

    async fn save_aggregate(&mut self, aggregate: &MerchantDailyAggregate) -> StoreResult<()> {
        self.aggregates.insert(aggregate.key(), aggregate.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let this = *self;
        let mut state = this.state.write().await;

        for (key, (expected, _)) in &this.transactions {
            let current = state.transactions.get(key).map(|r| r.status);
            if current != Some(*expected) {
                return Err(StoreError::Conflict(format!(
                    "transaction {} changed since it was read",
                    key.1
                )));
            }
        }

        for (key, staged) in &this.aggregates {
            let current = state.aggregates.get(key).map(|a| a.version).unwrap_or(0);
            if current != staged.version {
                return Err(StoreError::Conflict(format!(
                    "aggregate {}/{} version {} != {}",
                    key.merchant_id, key.date, current, staged.version
                )));
            }
        }

        for (key, (_, record)) in this.transactions {
            state.transactions.insert(key, record);
        }
        for (key, mut aggregate) in this.aggregates {
            aggregate.version += 1;
            state.aggregates.insert(key, aggregate);
        }

        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}
