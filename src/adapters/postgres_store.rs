//! Postgres implementation of the store ports.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::domain::{
    AggregateKey, MerchantDailyAggregate, OutboxRecord, Tenant, TransactionRecord,
    TransactionStatus, TransactionType,
};
use crate::ports::{
    OutboxStore, StoreError, StoreResult, TransactionLookup, TransactionStore, UnitOfWork,
};

const UNIQUE_VIOLATION: &str = "23505";
const SERIALIZATION_FAILURE: &str = "40001";

/// Postgres-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn upsert_tenant(&self, tenant: &Tenant) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tenants (id, name, is_active, daily_merchant_limit, high_value_threshold)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                is_active = EXCLUDED.is_active,
                daily_merchant_limit = EXCLUDED.daily_merchant_limit,
                high_value_threshold = EXCLUDED.high_value_threshold
            "#,
        )
        .bind(tenant.id)
        .bind(&tenant.name)
        .bind(tenant.is_active)
        .bind(&tenant.daily_merchant_limit)
        .bind(&tenant.high_value_threshold)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn count_unpublished(&self) -> StoreResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM outbox_messages WHERE published = FALSE")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

/// Unique violations become `Duplicate`; serialization failures become `Conflict`.
fn map_write_error(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        match db.code().as_deref() {
            Some(UNIQUE_VIOLATION) => return StoreError::Duplicate(db.message().to_string()),
            Some(SERIALIZATION_FAILURE) => return StoreError::Conflict(db.message().to_string()),
            _ => {}
        }
    }
    StoreError::Database(e)
}

/// Inside a unit of work any key race is a concurrency conflict.
fn map_uow_error(e: sqlx::Error) -> StoreError {
    match map_write_error(e) {
        StoreError::Duplicate(msg) => StoreError::Conflict(msg),
        other => other,
    }
}

#[async_trait]
impl TransactionLookup for PostgresStore {
    async fn find_transaction_type(
        &self,
        tenant_id: Uuid,
        transaction_id: &str,
    ) -> StoreResult<Option<TransactionType>> {
        let value: Option<String> = sqlx::query_scalar(
            "SELECT transaction_type FROM transactions WHERE tenant_id = $1 AND transaction_id = $2",
        )
        .bind(tenant_id)
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        value
            .map(|v| v.parse::<TransactionType>().map_err(StoreError::Corrupt))
            .transpose()
    }
}

#[async_trait]
impl TransactionStore for PostgresStore {
    async fn find_transaction(
        &self,
        tenant_id: Uuid,
        transaction_id: &str,
    ) -> StoreResult<Option<TransactionRecord>> {
        let row = sqlx::query_as::<_, TransactionRow>(
            "SELECT * FROM transactions WHERE tenant_id = $1 AND transaction_id = $2",
        )
        .bind(tenant_id)
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TransactionRow::into_domain).transpose()
    }

    async fn find_tenant(&self, tenant_id: Uuid) -> StoreResult<Option<Tenant>> {
        let row = sqlx::query_as::<_, TenantRow>("SELECT * FROM tenants WHERE id = $1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(TenantRow::into_domain))
    }

    async fn find_aggregate(&self, key: &AggregateKey) -> StoreResult<Option<MerchantDailyAggregate>> {
        let row = sqlx::query_as::<_, AggregateRow>(
            "SELECT * FROM merchant_daily_aggregates WHERE tenant_id = $1 AND merchant_id = $2 AND date = $3",
        )
        .bind(key.tenant_id)
        .bind(&key.merchant_id)
        .bind(key.date)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(AggregateRow::into_domain))
    }

    async fn insert_with_outbox(&self, entries: Vec<(TransactionRecord, OutboxRecord)>) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        for (record, outbox) in &entries {
            sqlx::query(
                r#"
                INSERT INTO transactions (
                    id, tenant_id, transaction_id, merchant_id, amount, currency,
                    transaction_type, original_transaction_id, status, occurred_at,
                    metadata, batch_id, rejection_reason, processed_at, created_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                "#,
            )
            .bind(record.id)
            .bind(record.tenant_id)
            .bind(&record.transaction_id)
            .bind(&record.merchant_id)
            .bind(&record.amount)
            .bind(&record.currency)
            .bind(record.transaction_type.as_str())
            .bind(&record.original_transaction_id)
            .bind(record.status.as_str())
            .bind(record.occurred_at)
            .bind(&record.metadata)
            .bind(record.batch_id)
            .bind(&record.rejection_reason)
            .bind(record.processed_at)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(map_write_error)?;

            sqlx::query(
                r#"
                INSERT INTO outbox_messages (id, tenant_id, transaction_id, payload, published, published_at, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(outbox.id)
            .bind(outbox.tenant_id)
            .bind(&outbox.transaction_id)
            .bind(&outbox.payload)
            .bind(outbox.published)
            .bind(outbox.published_at)
            .bind(outbox.created_at)
            .execute(&mut *tx)
            .await
            .map_err(map_write_error)?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn reject_with_error(
        &self,
        tenant_id: Uuid,
        transaction_id: &str,
        detail: &str,
    ) -> StoreResult<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET status = $1, rejection_reason = $2, processed_at = $3, updated_at = $3
            WHERE tenant_id = $4 AND transaction_id = $5 AND status IN ('Received', 'Processing')
            "#,
        )
        .bind(TransactionStatus::Rejected.as_str())
        .bind(format!("Processing error: {}", detail))
        .bind(now)
        .bind(tenant_id)
        .bind(transaction_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn begin(&self) -> StoreResult<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresUnitOfWork { tx }))
    }
}

#[async_trait]
impl OutboxStore for PostgresStore {
    async fn fetch_unpublished(&self, limit: usize) -> StoreResult<Vec<OutboxRecord>> {
        let rows = sqlx::query_as::<_, OutboxRow>(
            "SELECT * FROM outbox_messages WHERE published = FALSE ORDER BY created_at ASC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(OutboxRow::into_domain).collect())
    }

    async fn mark_published(&self, ids: &[Uuid], at: DateTime<Utc>) -> StoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }

        sqlx::query("UPDATE outbox_messages SET published = TRUE, published_at = $1 WHERE id = ANY($2)")
            .bind(at)
            .bind(ids)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

pub struct PostgresUnitOfWork {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PostgresUnitOfWork {
    async fn save_transaction(
        &mut self,
        record: &TransactionRecord,
        expected: TransactionStatus,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET status = $1, rejection_reason = $2, processed_at = $3, updated_at = $4
            WHERE tenant_id = $5 AND transaction_id = $6 AND status = $7
            "#,
        )
        .bind(record.status.as_str())
        .bind(&record.rejection_reason)
        .bind(record.processed_at)
        .bind(record.updated_at)
        .bind(record.tenant_id)
        .bind(&record.transaction_id)
        .bind(expected.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(map_uow_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "transaction {} is no longer {}",
                record.transaction_id, expected
            )));
        }

        Ok(())
    }

    async fn find_transaction_type(
        &mut self,
        tenant_id: Uuid,
        transaction_id: &str,
    ) -> StoreResult<Option<TransactionType>> {
        let value: Option<String> = sqlx::query_scalar(
            "SELECT transaction_type FROM transactions WHERE tenant_id = $1 AND transaction_id = $2",
        )
        .bind(tenant_id)
        .bind(transaction_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_uow_error)?;

        value
            .map(|v| v.parse::<TransactionType>().map_err(StoreError::Corrupt))
            .transpose()
    }

    async fn load_aggregate(&mut self, key: &AggregateKey) -> StoreResult<Option<MerchantDailyAggregate>> {
        let row = sqlx::query_as::<_, AggregateRow>(
            "SELECT * FROM merchant_daily_aggregates WHERE tenant_id = $1 AND merchant_id = $2 AND date = $3",
        )
        .bind(key.tenant_id)
        .bind(&key.merchant_id)
        .bind(key.date)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_uow_error)?;

        Ok(row.map(AggregateRow::into_domain))
    }

    async fn save_aggregate(&mut self, aggregate: &MerchantDailyAggregate) -> StoreResult<()> {
        let outcome = if aggregate.is_new() {
            sqlx::query(
                r#"
                INSERT INTO merchant_daily_aggregates (
                    id, tenant_id, merchant_id, date, total_amount, transaction_count,
                    last_calculated_at, version
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, 1)
                ON CONFLICT (tenant_id, merchant_id, date) DO NOTHING
                "#,
            )
            .bind(aggregate.id)
            .bind(aggregate.tenant_id)
            .bind(&aggregate.merchant_id)
            .bind(aggregate.date)
            .bind(&aggregate.total_amount)
            .bind(aggregate.transaction_count)
            .bind(aggregate.last_calculated_at)
            .execute(&mut *self.tx)
            .await
        } else {
            sqlx::query(
                r#"
                UPDATE merchant_daily_aggregates
                SET total_amount = $1, transaction_count = $2, last_calculated_at = $3, version = version + 1
                WHERE id = $4 AND version = $5
                "#,
            )
            .bind(&aggregate.total_amount)
            .bind(aggregate.transaction_count)
            .bind(aggregate.last_calculated_at)
            .bind(aggregate.id)
            .bind(aggregate.version)
            .execute(&mut *self.tx)
            .await
        };
        let result = outcome.map_err(map_uow_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "aggregate {}/{} changed since version {}",
                aggregate.merchant_id, aggregate.date, aggregate.version
            )));
        }

        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await.map_err(map_uow_error)
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// Internal row types for SQLx. Not exposed outside the adapter.
#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    tenant_id: Uuid,
    transaction_id: String,
    merchant_id: String,
    amount: BigDecimal,
    currency: String,
    transaction_type: String,
    original_transaction_id: Option<String>,
    status: String,
    occurred_at: DateTime<Utc>,
    metadata: Option<serde_json::Value>,
    batch_id: Option<Uuid>,
    rejection_reason: Option<String>,
    processed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TransactionRow {
    fn into_domain(self) -> StoreResult<TransactionRecord> {
        Ok(TransactionRecord {
            id: self.id,
            tenant_id: self.tenant_id,
            transaction_id: self.transaction_id,
            merchant_id: self.merchant_id,
            amount: self.amount,
            currency: self.currency,
            transaction_type: self.transaction_type.parse().map_err(StoreError::Corrupt)?,
            original_transaction_id: self.original_transaction_id,
            status: self.status.parse().map_err(StoreError::Corrupt)?,
            occurred_at: self.occurred_at,
            metadata: self.metadata,
            batch_id: self.batch_id,
            rejection_reason: self.rejection_reason,
            processed_at: self.processed_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TenantRow {
    id: Uuid,
    name: String,
    is_active: bool,
    daily_merchant_limit: BigDecimal,
    high_value_threshold: BigDecimal,
}

impl TenantRow {
    fn into_domain(self) -> Tenant {
        Tenant {
            id: self.id,
            name: self.name,
            is_active: self.is_active,
            daily_merchant_limit: self.daily_merchant_limit,
            high_value_threshold: self.high_value_threshold,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OutboxRow {
    id: Uuid,
    tenant_id: Uuid,
    transaction_id: String,
    payload: String,
    published: bool,
    published_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl OutboxRow {
    fn into_domain(self) -> OutboxRecord {
        OutboxRecord {
            id: self.id,
            tenant_id: self.tenant_id,
            transaction_id: self.transaction_id,
            payload: self.payload,
            published: self.published,
            published_at: self.published_at,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AggregateRow {
    id: Uuid,
    tenant_id: Uuid,
    merchant_id: String,
    date: NaiveDate,
    total_amount: BigDecimal,
    transaction_count: i64,
    last_calculated_at: DateTime<Utc>,
    version: i64,
}

impl AggregateRow {
    fn into_domain(self) -> MerchantDailyAggregate {
        MerchantDailyAggregate {
            id: self.id,
            tenant_id: self.tenant_id,
            merchant_id: self.merchant_id,
            date: self.date,
            total_amount: self.total_amount,
            transaction_count: self.transaction_count,
            last_calculated_at: self.last_calculated_at,
            version: self.version,
        }
    }
}
