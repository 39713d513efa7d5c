use async_trait::async_trait;
use bigdecimal::BigDecimal;

use super::{BusinessRule, RuleContext, RuleResult};
use crate::domain::TransactionType;
use crate::ports::{ScopedLookup, StoreError};

pub struct NegativePurchaseAmount;

#[async_trait]
impl BusinessRule for NegativePurchaseAmount {
    fn name(&self) -> &'static str {
        "NegativePurchaseAmount"
    }

    async fn evaluate(
        &self,
        ctx: &RuleContext<'_>,
        _lookup: &mut dyn ScopedLookup,
    ) -> Result<RuleResult, StoreError> {
        let tx = ctx.transaction;
        if tx.is_purchase() && tx.amount < BigDecimal::from(0) {
            return Ok(RuleResult::failure(
                self.name(),
                "PURCHASE amount cannot be negative",
            ));
        }
        Ok(RuleResult::success(self.name()))
    }
}

/// Refunds must point at an existing purchase of the same tenant.
pub struct RefundRequiresOriginalPurchase;

#[async_trait]
impl BusinessRule for RefundRequiresOriginalPurchase {
    fn name(&self) -> &'static str {
        "RefundRequiresOriginalPurchase"
    }

    async fn evaluate(
        &self,
        ctx: &RuleContext<'_>,
        lookup: &mut dyn ScopedLookup,
    ) -> Result<RuleResult, StoreError> {
        let tx = ctx.transaction;
        if tx.transaction_type != TransactionType::Refund {
            return Ok(RuleResult::success(self.name()));
        }

        let original_id = match tx.original_transaction_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id,
            _ => {
                return Ok(RuleResult::failure(
                    self.name(),
                    "REFUND must reference an original transaction",
                ))
            }
        };

        match lookup.find_transaction_type(tx.tenant_id, original_id).await? {
            None => Ok(RuleResult::failure(
                self.name(),
                format!("Original PURCHASE transaction '{}' not found", original_id),
            )),
            Some(TransactionType::Purchase) => Ok(RuleResult::success(self.name())),
            Some(_) => Ok(RuleResult::failure(
                self.name(),
                "REFUND must reference a PURCHASE transaction",
            )),
        }
    }
}

pub struct DailyMerchantLimit;

#[async_trait]
impl BusinessRule for DailyMerchantLimit {
    fn name(&self) -> &'static str {
        "DailyMerchantLimit"
    }

    async fn evaluate(
        &self,
        ctx: &RuleContext<'_>,
        _lookup: &mut dyn ScopedLookup,
    ) -> Result<RuleResult, StoreError> {
        let tx = ctx.transaction;
        if !tx.is_purchase() {
            return Ok(RuleResult::success(self.name()));
        }

        let limit = &ctx.tenant.daily_merchant_limit;
        let projected = ctx.current_daily_total + &tx.amount;
        if &projected > limit {
            return Ok(RuleResult::failure(
                self.name(),
                format!(
                    "Daily merchant limit of {} would be exceeded. Current total: {}, Transaction: {}",
                    limit, ctx.current_daily_total, tx.amount
                ),
            ));
        }
        Ok(RuleResult::success(self.name()))
    }
}

pub struct HighValueReview;

#[async_trait]
impl BusinessRule for HighValueReview {
    fn name(&self) -> &'static str {
        "HighValueReview"
    }

    async fn evaluate(
        &self,
        ctx: &RuleContext<'_>,
        _lookup: &mut dyn ScopedLookup,
    ) -> Result<RuleResult, StoreError> {
        let tx = ctx.transaction;
        let threshold = &ctx.tenant.high_value_threshold;
        if &tx.amount > threshold {
            return Ok(RuleResult::needs_review(
                self.name(),
                format!(
                    "Transaction amount {} exceeds review threshold of {}",
                    tx.amount, threshold
                ),
            ));
        }
        Ok(RuleResult::success(self.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RuleDecision, Tenant, TransactionMessage, TransactionRecord};
    use crate::ports::StoreResult;
    use crate::rules::RuleEngine;
    use chrono::Utc;
    use std::collections::HashMap;
    use uuid::Uuid;

    #[derive(Default)]
    struct CountingLookup {
        known: HashMap<String, TransactionType>,
        calls: usize,
    }

    #[async_trait]
    impl ScopedLookup for CountingLookup {
        async fn find_transaction_type(
            &mut self,
            _tenant_id: Uuid,
            transaction_id: &str,
        ) -> StoreResult<Option<TransactionType>> {
            self.calls += 1;
            Ok(self.known.get(transaction_id).copied())
        }
    }

    fn tx(kind: TransactionType, amount: &str, original: Option<&str>) -> TransactionRecord {
        TransactionRecord::received(&TransactionMessage {
            tenant_id: Uuid::new_v4(),
            transaction_id: "TX-1".to_string(),
            merchant_id: "M-1".to_string(),
            amount: amount.parse().unwrap(),
            currency: "USD".to_string(),
            transaction_type: kind,
            original_transaction_id: original.map(str::to_string),
            occurred_at: Utc::now(),
            metadata: None,
            batch_id: None,
            correlation_id: None,
        })
    }

    fn lookup_with(known: &[(&str, TransactionType)]) -> CountingLookup {
        CountingLookup {
            known: known.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            calls: 0,
        }
    }

    async fn decide(lookup: &mut CountingLookup, record: &TransactionRecord, current: i64) -> RuleDecision {
        let tenant = Tenant::new(record.tenant_id, "Acme");
        let results = RuleEngine::standard()
            .evaluate(lookup, record, &tenant, &BigDecimal::from(current))
            .await
            .unwrap();
        RuleDecision::from_results(&results)
    }

    #[tokio::test]
    async fn test_negative_purchase_short_circuits_refund_lookup() {
        let mut lookup = lookup_with(&[]);
        let record = tx(TransactionType::Purchase, "-5", None);
        let tenant = Tenant::new(record.tenant_id, "Acme");

        let results = RuleEngine::standard()
            .evaluate(&mut lookup, &record, &tenant, &BigDecimal::from(0))
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].rule, "NegativePurchaseAmount");
        assert_eq!(lookup.calls, 0);
    }

    #[tokio::test]
    async fn test_refund_without_original_is_rejected_without_lookup() {
        let mut lookup = lookup_with(&[]);
        let record = tx(TransactionType::Refund, "10", None);

        assert_eq!(
            decide(&mut lookup, &record, 0).await,
            RuleDecision::Rejected("REFUND must reference an original transaction".to_string())
        );
        assert_eq!(lookup.calls, 0);
    }

    #[tokio::test]
    async fn test_refund_of_unknown_original_is_rejected() {
        let mut lookup = lookup_with(&[]);
        let record = tx(TransactionType::Refund, "10", Some("TX-0"));

        assert_eq!(
            decide(&mut lookup, &record, 0).await,
            RuleDecision::Rejected("Original PURCHASE transaction 'TX-0' not found".to_string())
        );
    }

    #[tokio::test]
    async fn test_refund_of_refund_is_rejected() {
        let mut lookup = lookup_with(&[("TX-0", TransactionType::Refund)]);
        let record = tx(TransactionType::Refund, "10", Some("TX-0"));

        assert_eq!(
            decide(&mut lookup, &record, 0).await,
            RuleDecision::Rejected("REFUND must reference a PURCHASE transaction".to_string())
        );
    }

    #[tokio::test]
    async fn test_refund_of_purchase_is_approved() {
        let mut lookup = lookup_with(&[("TX-0", TransactionType::Purchase)]);
        let record = tx(TransactionType::Refund, "10", Some("TX-0"));

        assert_eq!(decide(&mut lookup, &record, 0).await, RuleDecision::Approved);
        assert_eq!(lookup.calls, 1);
    }

    #[tokio::test]
    async fn test_daily_limit_breach_message() {
        let mut lookup = lookup_with(&[]);
        let record = tx(TransactionType::Purchase, "10000", None);

        assert_eq!(
            decide(&mut lookup, &record, 95000).await,
            RuleDecision::Rejected(
                "Daily merchant limit of 100000 would be exceeded. Current total: 95000, Transaction: 10000"
                    .to_string()
            )
        );
    }

    #[tokio::test]
    async fn test_daily_limit_allows_exact_limit() {
        let mut lookup = lookup_with(&[]);
        let record = tx(TransactionType::Purchase, "5000", None);
        assert_eq!(decide(&mut lookup, &record, 95000).await, RuleDecision::Approved);
    }

    #[tokio::test]
    async fn test_daily_limit_ignores_refunds() {
        let mut lookup = lookup_with(&[("TX-0", TransactionType::Purchase)]);
        let record = tx(TransactionType::Refund, "9000", Some("TX-0"));
        assert_eq!(decide(&mut lookup, &record, 99000).await, RuleDecision::Approved);
    }

    #[tokio::test]
    async fn test_high_value_goes_to_review() {
        let mut lookup = lookup_with(&[]);
        let record = tx(TransactionType::Purchase, "15000", None);

        assert_eq!(
            decide(&mut lookup, &record, 0).await,
            RuleDecision::Review(
                "Transaction amount 15000 exceeds review threshold of 10000".to_string()
            )
        );
    }

    #[tokio::test]
    async fn test_threshold_itself_does_not_need_review() {
        let mut lookup = lookup_with(&[]);
        let record = tx(TransactionType::Purchase, "10000", None);
        assert_eq!(decide(&mut lookup, &record, 0).await, RuleDecision::Approved);
    }
}
