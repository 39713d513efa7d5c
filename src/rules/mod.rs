//! Ordered, fail-fast business rule evaluation.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use crate::domain::{RuleDecision, Tenant, TransactionRecord};
use crate::ports::{ScopedLookup, StoreError};

pub mod standard;

pub use standard::{
    DailyMerchantLimit, HighValueReview, NegativePurchaseAmount, RefundRequiresOriginalPurchase,
};

/// Inputs visible to every rule.
pub struct RuleContext<'a> {
    pub transaction: &'a TransactionRecord,
    pub tenant: &'a Tenant,
    /// Merchant's purchase total for the transaction's business date, excluding this transaction.
    pub current_daily_total: &'a BigDecimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleResult {
    pub rule: &'static str,
    pub is_valid: bool,
    pub message: Option<String>,
    pub requires_review: bool,
}

impl RuleResult {
    pub fn success(rule: &'static str) -> Self {
        Self {
            rule,
            is_valid: true,
            message: None,
            requires_review: false,
        }
    }

    pub fn failure(rule: &'static str, message: impl Into<String>) -> Self {
        Self {
            rule,
            is_valid: false,
            message: Some(message.into()),
            requires_review: false,
        }
    }

    pub fn needs_review(rule: &'static str, message: impl Into<String>) -> Self {
        Self {
            rule,
            is_valid: true,
            message: Some(message.into()),
            requires_review: true,
        }
    }
}

#[async_trait]
pub trait BusinessRule: Send + Sync {
    fn name(&self) -> &'static str;

    async fn evaluate(
        &self,
        ctx: &RuleContext<'_>,
        lookup: &mut dyn ScopedLookup,
    ) -> Result<RuleResult, StoreError>;
}

pub struct RuleEngine {
    rules: Vec<Box<dyn BusinessRule>>,
}

impl RuleEngine {
    pub fn new(rules: Vec<Box<dyn BusinessRule>>) -> Self {
        Self { rules }
    }

    /// The production rule set, in evaluation order.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(NegativePurchaseAmount),
            Box::new(RefundRequiresOriginalPurchase),
            Box::new(DailyMerchantLimit),
            Box::new(HighValueReview),
        ])
    }

    /// Runs rules in order and stops after the first failure. Review flags do not stop evaluation.
    /// Lookups go through `lookup`, normally the caller's open unit of work.
    pub async fn evaluate(
        &self,
        lookup: &mut dyn ScopedLookup,
        transaction: &TransactionRecord,
        tenant: &Tenant,
        current_daily_total: &BigDecimal,
    ) -> Result<Vec<RuleResult>, StoreError> {
        let ctx = RuleContext {
            transaction,
            tenant,
            current_daily_total,
        };

        let mut results = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            let result = rule.evaluate(&ctx, &mut *lookup).await?;
            let failed = !result.is_valid;
            results.push(result);
            if failed {
                break;
            }
        }

        Ok(results)
    }
}

impl RuleDecision {
    /// First failure rejects; otherwise the first review flag sends the transaction to review.
    pub fn from_results(results: &[RuleResult]) -> Self {
        if let Some(failed) = results.iter().find(|r| !r.is_valid) {
            return RuleDecision::Rejected(reason_of(failed));
        }
        if let Some(flagged) = results.iter().find(|r| r.requires_review) {
            return RuleDecision::Review(reason_of(flagged));
        }
        RuleDecision::Approved
    }
}

fn reason_of(result: &RuleResult) -> String {
    result
        .message
        .clone()
        .unwrap_or_else(|| result.rule.to_string())
}
