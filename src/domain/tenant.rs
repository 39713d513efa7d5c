use bigdecimal::BigDecimal;
use uuid::Uuid;

pub const DEFAULT_DAILY_MERCHANT_LIMIT: i64 = 100_000;
pub const DEFAULT_HIGH_VALUE_THRESHOLD: i64 = 10_000;

/// Per-tenant policy, read-only to the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub is_active: bool,
    pub daily_merchant_limit: BigDecimal,
    pub high_value_threshold: BigDecimal,
}

impl Tenant {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            is_active: true,
            daily_merchant_limit: BigDecimal::from(DEFAULT_DAILY_MERCHANT_LIMIT),
            high_value_threshold: BigDecimal::from(DEFAULT_HIGH_VALUE_THRESHOLD),
        }
    }

    pub fn with_limits(mut self, daily_merchant_limit: BigDecimal, high_value_threshold: BigDecimal) -> Self {
        self.daily_merchant_limit = daily_merchant_limit;
        self.high_value_threshold = high_value_threshold;
        self
    }
}
