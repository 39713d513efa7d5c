//! Per-merchant daily purchase aggregate guarded by an optimistic version token.

use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AggregateKey {
    pub tenant_id: Uuid,
    pub merchant_id: String,
    pub date: NaiveDate,
}

impl AggregateKey {
    pub fn new(tenant_id: Uuid, merchant_id: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            tenant_id,
            merchant_id: merchant_id.into(),
            date,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MerchantDailyAggregate {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub merchant_id: String,
    pub date: NaiveDate,
    pub total_amount: BigDecimal,
    pub transaction_count: i64,
    pub last_calculated_at: DateTime<Utc>,
    /// Version read from the store. `0` means the row does not exist yet.
    pub version: i64,
}

impl MerchantDailyAggregate {
    /// An empty aggregate that has never been persisted.
    pub fn open(key: &AggregateKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: key.tenant_id,
            merchant_id: key.merchant_id.clone(),
            date: key.date,
            total_amount: BigDecimal::from(0),
            transaction_count: 0,
            last_calculated_at: Utc::now(),
            version: 0,
        }
    }

    pub fn key(&self) -> AggregateKey {
        AggregateKey::new(self.tenant_id, self.merchant_id.clone(), self.date)
    }

    pub fn is_new(&self) -> bool {
        self.version == 0
    }

    /// Adds one completed purchase. The version is left untouched: the store bumps it on a successful
    /// compare-and-swap.
    pub fn record_purchase(&mut self, amount: &BigDecimal, at: DateTime<Utc>) {
        self.total_amount = &self.total_amount + amount;
        self.transaction_count += 1;
        self.last_calculated_at = at;
    }
}
