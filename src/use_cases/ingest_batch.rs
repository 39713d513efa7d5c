//! Ingest batch use case.
//! Validates a batch of transactions and stores the accepted ones with their outbox records.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::domain::{OutboxRecord, TransactionMessage, TransactionRecord, TransactionType};
use crate::ports::{StoreError, TransactionLookup, TransactionStore};
use crate::validation::{self, ValidationError, MERCHANT_ID_MAX_LEN, TRANSACTION_ID_MAX_LEN};

pub const DUPLICATE_TRANSACTION_ID: &str = "Duplicate transaction ID";

/// One transaction as submitted by a producer.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionItem {
    pub transaction_id: String,
    pub merchant_id: String,
    pub amount: BigDecimal,
    pub currency: String,
    #[serde(rename = "type")]
    pub transaction_type: String,
    #[serde(default)]
    pub original_transaction_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestCommand {
    pub tenant_id: Uuid,
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub transactions: Vec<TransactionItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRejection {
    pub transaction_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub batch_id: Uuid,
    pub correlation_id: Option<String>,
    pub accepted: usize,
    pub rejected: Vec<ItemRejection>,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Tenant {0} not found")]
    TenantNotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to serialize outbox payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Validates one item and returns its parsed type.
pub fn validate_item(item: &TransactionItem) -> Result<TransactionType, ValidationError> {
    validation::validate_identifier("transactionId", &item.transaction_id, TRANSACTION_ID_MAX_LEN)?;
    validation::validate_identifier("merchantId", &item.merchant_id, MERCHANT_ID_MAX_LEN)?;
    validation::validate_currency(&item.currency)?;

    let transaction_type: TransactionType = item
        .transaction_type
        .parse()
        .map_err(|_| ValidationError::new("type", "must be one of: PURCHASE, REFUND, REVERSAL"))?;

    if transaction_type == TransactionType::Refund {
        let original = item.original_transaction_id.as_deref().unwrap_or_default();
        validation::validate_required("originalTransactionId", original)?;
        validation::validate_max_len("originalTransactionId", original, TRANSACTION_ID_MAX_LEN)?;
    }

    Ok(transaction_type)
}

/// Use case for ingesting a batch.
pub struct IngestBatch {
    store: Arc<dyn TransactionStore>,
}

impl IngestBatch {
    pub fn new(store: Arc<dyn TransactionStore>) -> Self {
        Self { store }
    }

    pub async fn execute(&self, command: IngestCommand) -> Result<IngestOutcome, IngestError> {
        if self.store.find_tenant(command.tenant_id).await?.is_none() {
            return Err(IngestError::TenantNotFound(command.tenant_id));
        }

        let batch_id = Uuid::new_v4();
        let mut rejected = Vec::new();
        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(command.transactions.len());

        for item in command.transactions {
            let transaction_type = match validate_item(&item) {
                Ok(transaction_type) => transaction_type,
                Err(e) => {
                    rejected.push(ItemRejection {
                        transaction_id: item.transaction_id,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            if !seen.insert(item.transaction_id.clone())
                || self
                    .store
                    .exists_by_transaction_id(command.tenant_id, &item.transaction_id)
                    .await?
            {
                rejected.push(ItemRejection {
                    transaction_id: item.transaction_id,
                    error: DUPLICATE_TRANSACTION_ID.to_string(),
                });
                continue;
            }

            let message = TransactionMessage {
                tenant_id: command.tenant_id,
                transaction_id: item.transaction_id,
                merchant_id: item.merchant_id,
                amount: item.amount,
                currency: validation::sanitize_string(&item.currency).to_ascii_uppercase(),
                transaction_type,
                original_transaction_id: item.original_transaction_id,
                occurred_at: item.occurred_at,
                metadata: item.metadata,
                batch_id: Some(batch_id),
                correlation_id: command.correlation_id.clone(),
            };

            let record = TransactionRecord::received(&message);
            let outbox = OutboxRecord::new(command.tenant_id, message.transaction_id.clone(), message.to_payload()?);
            entries.push((record, outbox));
        }

        let accepted = entries.len();
        if accepted > 0 {
            self.store.insert_with_outbox(entries).await?;
        }

        info!(
            "Ingested batch {} for tenant {}: {} accepted, {} rejected",
            batch_id,
            command.tenant_id,
            accepted,
            rejected.len()
        );

        Ok(IngestOutcome {
            batch_id,
            correlation_id: command.correlation_id,
            accepted,
            rejected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryStore;
    use crate::domain::{Tenant, TransactionStatus};
    use crate::ports::OutboxStore;

    fn item(id: &str, kind: &str) -> TransactionItem {
        TransactionItem {
            transaction_id: id.to_string(),
            merchant_id: "M-1".to_string(),
            amount: BigDecimal::from(100),
            currency: "usd".to_string(),
            transaction_type: kind.to_string(),
            original_transaction_id: None,
            occurred_at: Utc::now(),
            metadata: None,
        }
    }

    async fn store_with_tenant() -> (InMemoryStore, Uuid) {
        let store = InMemoryStore::new();
        let tenant_id = Uuid::new_v4();
        store.upsert_tenant(Tenant::new(tenant_id, "Acme")).await;
        (store, tenant_id)
    }

    #[tokio::test]
    async fn test_accepts_valid_items_with_outbox_records() {
        let (store, tenant_id) = store_with_tenant().await;
        let ingest = IngestBatch::new(Arc::new(store.clone()));

        let outcome = ingest
            .execute(IngestCommand {
                tenant_id,
                correlation_id: Some("corr-1".to_string()),
                transactions: vec![item("TX-1", "purchase"), item("TX-2", "PURCHASE")],
            })
            .await
            .unwrap();

        assert_eq!(outcome.accepted, 2);
        assert!(outcome.rejected.is_empty());

        let stored = store.find_transaction(tenant_id, "TX-1").await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Received);
        assert_eq!(stored.currency, "USD");
        assert_eq!(stored.batch_id, Some(outcome.batch_id));

        let outbox = store.fetch_unpublished(10).await.unwrap();
        assert_eq!(outbox.len(), 2);
        let payload = TransactionMessage::from_payload(&outbox[0].payload).unwrap();
        assert_eq!(payload.correlation_id.as_deref(), Some("corr-1"));
    }

    #[tokio::test]
    async fn test_rejects_duplicates_per_item() {
        let (store, tenant_id) = store_with_tenant().await;
        let ingest = IngestBatch::new(Arc::new(store.clone()));

        ingest
            .execute(IngestCommand {
                tenant_id,
                correlation_id: None,
                transactions: vec![item("TX-1", "PURCHASE")],
            })
            .await
            .unwrap();

        let outcome = ingest
            .execute(IngestCommand {
                tenant_id,
                correlation_id: None,
                transactions: vec![
                    item("TX-1", "PURCHASE"),
                    item("TX-2", "PURCHASE"),
                    item("TX-2", "PURCHASE"),
                ],
            })
            .await
            .unwrap();

        assert_eq!(outcome.accepted, 1);
        assert_eq!(
            outcome.rejected,
            vec![
                ItemRejection {
                    transaction_id: "TX-1".to_string(),
                    error: DUPLICATE_TRANSACTION_ID.to_string()
                },
                ItemRejection {
                    transaction_id: "TX-2".to_string(),
                    error: DUPLICATE_TRANSACTION_ID.to_string()
                },
            ]
        );
        assert_eq!(store.outbox().await.len(), 2);
    }

    #[tokio::test]
    async fn test_rejects_invalid_items() {
        let (store, tenant_id) = store_with_tenant().await;
        let ingest = IngestBatch::new(Arc::new(store));

        let mut bad_currency = item("TX-1", "PURCHASE");
        bad_currency.currency = "DOLLARS".to_string();
        let refund_without_original = item("TX-2", "REFUND");
        let unknown_type = item("TX-3", "CHARGEBACK");

        let outcome = ingest
            .execute(IngestCommand {
                tenant_id,
                correlation_id: None,
                transactions: vec![bad_currency, refund_without_original, unknown_type],
            })
            .await
            .unwrap();

        assert_eq!(outcome.accepted, 0);
        assert_eq!(outcome.rejected.len(), 3);
        assert!(outcome.rejected[0].error.starts_with("currency"));
        assert!(outcome.rejected[1].error.starts_with("originalTransactionId"));
        assert!(outcome.rejected[2].error.starts_with("type"));
    }

    #[tokio::test]
    async fn test_unknown_tenant() {
        let ingest = IngestBatch::new(Arc::new(InMemoryStore::new()));
        let tenant_id = Uuid::new_v4();

        let err = ingest
            .execute(IngestCommand {
                tenant_id,
                correlation_id: None,
                transactions: vec![item("TX-1", "PURCHASE")],
            })
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::TenantNotFound(id) if id == tenant_id));
    }
}
